use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use rusqlite::{
    params, Connection, DatabaseName, OpenFlags, OptionalExtension, TransactionBehavior,
};
use scan_history_core::{
    date_from_millis, date_to_millis, is_digit_only, BarcodeFormat, ExportRecord, HistoryError,
    Listing, NewRecord, normalize_name, Page, Record, RecordId, RecordRepository, SaveOutcome, SavePolicy,
};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

pub const LATEST_SCHEMA_VERSION: i64 = 2;

const RECORDS_EXPORT_FILE: &str = "records.ndjson";
const MANIFEST_FILE: &str = "manifest.json";

const CREATE_SCHEMA_MIGRATIONS_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_migrations (
  version INTEGER PRIMARY KEY,
  applied_at TEXT NOT NULL
);
";

const MIGRATION_001_SQL: &str = r"
CREATE TABLE IF NOT EXISTS codes (
  id INTEGER PRIMARY KEY AUTOINCREMENT,
  format TEXT NOT NULL,
  text TEXT NOT NULL,
  date INTEGER NOT NULL,
  isFavorite INTEGER NOT NULL DEFAULT 0 CHECK (isFavorite IN (0, 1))
);

CREATE INDEX IF NOT EXISTS idx_codes_date_id ON codes(date DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_codes_natural_key ON codes(format, text);
CREATE INDEX IF NOT EXISTS idx_codes_favorite ON codes(isFavorite);
";

const MIGRATION_002_SQL: &str = r"
ALTER TABLE codes ADD COLUMN name TEXT;
";

const RECORD_COLUMNS: &str = "id, format, text, date, isFavorite, name";

/// One forward-only, additive schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationStep {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
}

pub const MIGRATIONS: &[MigrationStep] = &[
    MigrationStep { version: 1, description: "create codes table", sql: MIGRATION_001_SQL },
    MigrationStep { version: 2, description: "add nullable codes.name", sql: MIGRATION_002_SQL },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Missing or failed migration step; fatal at open time.
    Schema,
    /// I/O, constraint or decoding failure of a single operation.
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("schema error: {0}")]
    Schema(String),
    #[error("{context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{context}: {source}")]
    Encode {
        context: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("corrupt record row: {0}")]
    Corrupt(String),
    #[error(transparent)]
    History(#[from] HistoryError),
}

impl StoreError {
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Schema(_) => ErrorKind::Schema,
            _ => ErrorKind::Storage,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(source: rusqlite::Error) -> Self {
        Self::Sqlite { context: "sqlite operation failed".to_string(), source }
    }
}

pub type Result<T, E = StoreError> = std::result::Result<T, E>;

/// Error sources that can carry a context message into [`StoreError`].
trait StoreErrorSource {
    fn into_store_error(self, context: String) -> StoreError;
}

impl StoreErrorSource for rusqlite::Error {
    fn into_store_error(self, context: String) -> StoreError {
        StoreError::Sqlite { context, source: self }
    }
}

impl StoreErrorSource for std::io::Error {
    fn into_store_error(self, context: String) -> StoreError {
        StoreError::Io { context, source: self }
    }
}

impl StoreErrorSource for serde_json::Error {
    fn into_store_error(self, context: String) -> StoreError {
        StoreError::Encode { context, source: self }
    }
}

trait StoreContext<T> {
    fn context(self, context: &str) -> Result<T>;

    fn with_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: StoreErrorSource> StoreContext<T> for std::result::Result<T, E> {
    fn context(self, context: &str) -> Result<T> {
        self.map_err(|source| source.into_store_error(context.to_string()))
    }

    fn with_context<F>(self, context: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|source| source.into_store_error(context()))
    }
}

pub struct SqliteStore {
    conn: Connection,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaStatus {
    pub current_version: i64,
    pub target_version: i64,
    pub pending_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
}

impl SchemaStatus {
    /// Status of a file whose schema is at `current_version`.
    #[must_use]
    pub fn at_version(current_version: i64, inferred_from_legacy: bool) -> Self {
        let pending_versions = if current_version < LATEST_SCHEMA_VERSION {
            ((current_version + 1)..=LATEST_SCHEMA_VERSION).collect::<Vec<_>>()
        } else {
            Vec::new()
        };

        Self {
            current_version,
            target_version: LATEST_SCHEMA_VERSION,
            pending_versions,
            inferred_from_legacy,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportFileDigest {
    pub path: String,
    pub sha256: String,
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ExportManifest {
    pub schema_version: i64,
    pub exported_at: String,
    pub files: Vec<ExportFileDigest>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IntegrityReport {
    pub quick_check_ok: bool,
    pub quick_check_message: String,
    pub record_count: u64,
    pub schema_status: SchemaStatus,
}

impl SqliteStore {
    /// Open a `SQLite` history file and configure required runtime pragmas.
    ///
    /// The schema is not touched; call [`SqliteStore::migrate`] before issuing queries.
    ///
    /// # Errors
    /// Returns an error when the database cannot be opened or pragmas cannot be applied.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
             PRAGMA journal_mode = WAL;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open an existing history file for inspection without creating it.
    ///
    /// The journal mode is left as found on disk.
    ///
    /// # Errors
    /// Returns an error when the file does not exist or cannot be opened.
    pub fn open_existing(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_URI
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .with_context(|| format!("failed to open existing sqlite database at {}", path.display()))?;

        conn.execute_batch("PRAGMA busy_timeout = 5000;")
            .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn })
    }

    /// Open a history file and bring it to [`LATEST_SCHEMA_VERSION`].
    ///
    /// # Errors
    /// Returns [`StoreError::Schema`] when a migration step is missing or fails, or a
    /// storage error when the file cannot be opened.
    pub fn open_migrated(path: &Path) -> Result<Self> {
        let mut store = Self::open(path)?;
        store.migrate()?;
        Ok(store)
    }

    /// Report current and target schema versions plus pending migrations.
    ///
    /// Read-only: nothing is created or recorded.
    ///
    /// # Errors
    /// Returns an error when schema metadata cannot be read.
    pub fn schema_status(&self) -> Result<SchemaStatus> {
        let (current_version, inferred_from_legacy) = detect_effective_schema_version(&self.conn)?;
        Ok(SchemaStatus::at_version(current_version, inferred_from_legacy))
    }

    /// Apply all forward migrations up to the latest supported schema version.
    ///
    /// # Errors
    /// Returns [`StoreError::Schema`] when a step is missing, fails, or the file is newer
    /// than this build.
    pub fn migrate(&mut self) -> Result<()> {
        self.migrate_to(LATEST_SCHEMA_VERSION)
    }

    /// Apply forward migrations up to `target`.
    ///
    /// # Errors
    /// Returns [`StoreError::Schema`] when a step is missing, fails, or the file is newer
    /// than `target`.
    pub fn migrate_to(&mut self, target: i64) -> Result<()> {
        apply_migrations(&mut self.conn, MIGRATIONS, target)
    }

    fn codes(&self) -> Codes<'_> {
        Codes::new(&self.conn)
    }

    /// List one page of history, newest first.
    ///
    /// # Errors
    /// Returns an error when the page is invalid or rows cannot be read.
    pub fn list_all(&self, page: Page) -> Result<Vec<Record>> {
        self.codes().list_page(Listing::All, page)
    }

    /// List one page of favorite records, newest first.
    ///
    /// # Errors
    /// Returns an error when the page is invalid or rows cannot be read.
    pub fn list_favorites(&self, page: Page) -> Result<Vec<Record>> {
        self.codes().list_page(Listing::Favorites, page)
    }

    /// # Errors
    /// Returns an error when the page is invalid or rows cannot be read.
    pub fn list_page(&self, listing: Listing, page: Page) -> Result<Vec<Record>> {
        self.codes().list_page(listing, page)
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self, listing: Listing) -> Result<u64> {
        self.codes().count(listing)
    }

    /// Every record as `(date, format, text)`, newest first.
    ///
    /// # Errors
    /// Returns an error when rows cannot be read or decoded.
    pub fn list_for_export(&self) -> Result<Vec<ExportRecord>> {
        self.codes().list_for_export()
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get(&self, id: RecordId) -> Result<Option<Record>> {
        self.codes().get(id)
    }

    /// Exact, case-sensitive lookup; the highest id wins when the key repeats.
    ///
    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find_by_natural_key(&self, format: BarcodeFormat, text: &str) -> Result<Option<Record>> {
        self.codes().find_by_natural_key(format, text)
    }

    /// # Errors
    /// Returns an error when the date is out of range or the write fails.
    pub fn insert(&mut self, record: &NewRecord) -> Result<RecordId> {
        self.codes().insert(record)
    }

    /// Remove one record. Returns `false` when the id was absent.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_by_id(&mut self, id: RecordId) -> Result<bool> {
        self.codes().delete_by_id(id)
    }

    /// Remove every record and return how many were removed. Ids are not reused afterwards.
    ///
    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete_all(&mut self) -> Result<u64> {
        self.codes().delete_all()
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn last_record_id(&self) -> Result<Option<RecordId>> {
        self.codes().last_record_id()
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn last_record_text(&self) -> Result<Option<String>> {
        self.codes().last_record_text()
    }

    /// Rewrite `text` in place. Returns `false` when the id was absent.
    ///
    /// # Errors
    /// Returns an error when the update fails.
    pub fn update_text(&mut self, id: RecordId, text: &str) -> Result<bool> {
        self.codes().update_text(id, text)
    }

    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_favorite(&mut self, id: RecordId, is_favorite: bool) -> Result<bool> {
        self.codes().set_favorite(id, is_favorite)
    }

    /// # Errors
    /// Returns an error when the name is blank or the update fails.
    pub fn set_name(&mut self, id: RecordId, name: Option<&str>) -> Result<bool> {
        self.codes().set_name(id, name)
    }

    /// Whether the last record is digit-only and would absorb the next save.
    ///
    /// A read failure is logged and reported as `false`.
    #[must_use]
    pub fn is_last_record_numeric(&self) -> bool {
        match self.codes().last_record_text() {
            Ok(text) => text.is_some_and(|text| is_digit_only(&text)),
            Err(err) => {
                tracing::warn!(error = %err, "last record text unreadable; treating as not numeric");
                false
            }
        }
    }

    /// Persist one incoming record according to `policy`.
    ///
    /// The lookup and the resulting write run inside a single `IMMEDIATE` transaction,
    /// so no other writer can interleave between them.
    ///
    /// # Errors
    /// Returns an error when the transaction or the chosen write fails.
    pub fn save(&mut self, record: &NewRecord, policy: &SavePolicy) -> Result<SaveOutcome> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start save transaction")?;
        let outcome = policy.apply(&Codes::new(&tx), record)?;
        tx.commit().context("failed to commit save transaction")?;

        tracing::debug!(
            outcome = outcome.as_str(),
            id = %outcome.id(),
            format = %record.format,
            "record saved"
        );
        Ok(outcome)
    }

    /// Export every record as NDJSON plus a manifest carrying its digest.
    ///
    /// # Errors
    /// Returns an error when export files cannot be created, written, or serialized.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create export directory {}", out_dir.display()))?;

        let records = self.list_for_export()?;
        let records_path = out_dir.join(RECORDS_EXPORT_FILE);
        let (sha256, count) = write_ndjson_file(&records_path, &records)?;

        let manifest = ExportManifest {
            schema_version: LATEST_SCHEMA_VERSION,
            exported_at: now_rfc3339()?,
            files: vec![ExportFileDigest {
                path: RECORDS_EXPORT_FILE.to_string(),
                sha256,
                records: count,
            }],
        };

        let manifest_path = out_dir.join(MANIFEST_FILE);
        let manifest_json =
            serde_json::to_vec_pretty(&manifest).context("failed to serialize export manifest")?;
        fs::write(&manifest_path, manifest_json).with_context(|| {
            format!("failed to write export manifest {}", manifest_path.display())
        })?;

        tracing::info!(records = count, dir = %out_dir.display(), "export snapshot written");
        Ok(manifest)
    }

    /// Create a `SQLite` backup file of the current main database.
    ///
    /// # Errors
    /// Returns an error when backup directories cannot be created or backup fails.
    pub fn backup_database(&self, out_file: &Path) -> Result<()> {
        if let Some(parent) = out_file.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create parent directory for backup file {}", out_file.display())
            })?;
        }

        self.conn
            .backup(DatabaseName::Main, out_file, None)
            .with_context(|| format!("failed to create sqlite backup at {}", out_file.display()))
    }

    /// Restore this database from a `SQLite` backup file, then migrate to latest.
    ///
    /// # Errors
    /// Returns an error when the backup file is missing, restore fails, or migrations fail.
    pub fn restore_database(&mut self, in_file: &Path) -> Result<()> {
        if !in_file.exists() {
            return Err(StoreError::Io {
                context: format!("backup file does not exist: {}", in_file.display()),
                source: std::io::Error::from(std::io::ErrorKind::NotFound),
            });
        }

        self.conn
            .restore(DatabaseName::Main, in_file, None::<fn(rusqlite::backup::Progress)>)
            .with_context(|| {
                format!("failed to restore sqlite backup from {}", in_file.display())
            })?;

        self.migrate()
    }

    /// Run quick-check and schema status health checks.
    ///
    /// # Errors
    /// Returns an error when any check query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        let quick_check_message: String = self
            .conn
            .query_row("PRAGMA quick_check", [], |row| row.get::<_, String>(0))
            .context("failed to run PRAGMA quick_check")?;

        let schema_status = self.schema_status()?;
        let record_count = if schema_status.current_version >= 1 {
            self.count(Listing::All)?
        } else {
            0
        };

        Ok(IntegrityReport {
            quick_check_ok: quick_check_message == "ok",
            quick_check_message,
            record_count,
            schema_status,
        })
    }
}

/// Queries over the `codes` table, bound to a connection or an open transaction.
struct Codes<'c> {
    conn: &'c Connection,
}

#[derive(Debug)]
struct RawRecord {
    id: i64,
    format: String,
    text: String,
    date: i64,
    is_favorite: bool,
    name: Option<String>,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            format: row.get(1)?,
            text: row.get(2)?,
            date: row.get(3)?,
            is_favorite: row.get(4)?,
            name: row.get(5)?,
        })
    }

    fn into_record(self) -> Result<Record> {
        let format = BarcodeFormat::parse(&self.format).ok_or_else(|| {
            StoreError::Corrupt(format!("record {} has unknown format {}", self.id, self.format))
        })?;
        let date = date_from_millis(self.date).map_err(|err| {
            StoreError::Corrupt(format!("record {} has invalid date: {err}", self.id))
        })?;

        Ok(Record {
            id: RecordId(self.id),
            format,
            text: self.text,
            date,
            is_favorite: self.is_favorite,
            name: self.name,
        })
    }
}

impl<'c> Codes<'c> {
    fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    fn listing_filter(listing: Listing) -> &'static str {
        match listing {
            Listing::All => "",
            Listing::Favorites => "WHERE isFavorite = 1",
        }
    }

    fn list_page(&self, listing: Listing, page: Page) -> Result<Vec<Record>> {
        page.validate()?;
        let offset = i64::try_from(page.offset).map_err(|_| {
            HistoryError::Validation(format!("page offset {} is out of range", page.offset))
        })?;

        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM codes {} ORDER BY date DESC, id DESC LIMIT ?1 OFFSET ?2",
            Self::listing_filter(listing)
        );
        let mut stmt = self.conn.prepare(&query).context("failed to prepare listing query")?;
        let rows = stmt
            .query_map(params![i64::from(page.limit), offset], RawRecord::from_row)
            .with_context(|| format!("failed to list {} records", listing.as_str()))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }

    fn count(&self, listing: Listing) -> Result<u64> {
        let query = format!("SELECT COUNT(*) FROM codes {}", Self::listing_filter(listing));
        let count = self
            .conn
            .query_row(&query, [], |row| row.get::<_, i64>(0))
            .with_context(|| format!("failed to count {} records", listing.as_str()))?;
        u64::try_from(count).map_err(|_| StoreError::Corrupt(format!("negative row count {count}")))
    }

    fn list_for_export(&self) -> Result<Vec<ExportRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT date, format, text FROM codes ORDER BY date DESC, id DESC")
            .context("failed to prepare export query")?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
            })
            .context("failed to read export rows")?;

        let mut records = Vec::new();
        for row in rows {
            let (date, format_raw, text) = row?;
            let format = BarcodeFormat::parse(&format_raw).ok_or_else(|| {
                StoreError::Corrupt(format!("export row has unknown format {format_raw}"))
            })?;
            let date = date_from_millis(date)
                .map_err(|err| StoreError::Corrupt(format!("export row has invalid date: {err}")))?;
            records.push(ExportRecord { date, format, text });
        }
        Ok(records)
    }

    fn get(&self, id: RecordId) -> Result<Option<Record>> {
        let query = format!("SELECT {RECORD_COLUMNS} FROM codes WHERE id = ?1");
        self.conn
            .query_row(&query, params![id.0], RawRecord::from_row)
            .optional()
            .with_context(|| format!("failed to load record {id}"))?
            .map(RawRecord::into_record)
            .transpose()
    }

    fn delete_by_id(&self, id: RecordId) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM codes WHERE id = ?1", params![id.0])
            .with_context(|| format!("failed to delete record {id}"))?;
        Ok(removed > 0)
    }

    fn delete_all(&self) -> Result<u64> {
        let removed = self.conn.execute("DELETE FROM codes", []).context("failed to clear history")?;
        tracing::info!(removed, "history cleared");
        Ok(u64::try_from(removed).unwrap_or(u64::MAX))
    }

    fn set_favorite(&self, id: RecordId, is_favorite: bool) -> Result<bool> {
        let updated = self
            .conn
            .execute("UPDATE codes SET isFavorite = ?1 WHERE id = ?2", params![is_favorite, id.0])
            .with_context(|| format!("failed to update favorite flag of record {id}"))?;
        Ok(updated > 0)
    }

    fn set_name(&self, id: RecordId, name: Option<&str>) -> Result<bool> {
        let updated = self
            .conn
            .execute(
                "UPDATE codes SET name = ?1 WHERE id = ?2",
                params![normalize_name(name), id.0],
            )
            .with_context(|| format!("failed to rename record {id}"))?;
        Ok(updated > 0)
    }
}

impl RecordRepository for Codes<'_> {
    type Error = StoreError;

    fn find_by_natural_key(&self, format: BarcodeFormat, text: &str) -> Result<Option<Record>> {
        let query = format!(
            "SELECT {RECORD_COLUMNS} FROM codes WHERE format = ?1 AND text = ?2
             ORDER BY id DESC LIMIT 1"
        );
        self.conn
            .query_row(&query, params![format.as_str(), text], RawRecord::from_row)
            .optional()
            .context("failed to look up record by natural key")?
            .map(RawRecord::into_record)
            .transpose()
    }

    fn last_record_id(&self) -> Result<Option<RecordId>> {
        let id = self
            .conn
            .query_row("SELECT id FROM codes ORDER BY date DESC, id DESC LIMIT 1", [], |row| {
                row.get::<_, i64>(0)
            })
            .optional()
            .context("failed to read last record id")?;
        Ok(id.map(RecordId))
    }

    fn last_record_text(&self) -> Result<Option<String>> {
        self.conn
            .query_row("SELECT text FROM codes ORDER BY date DESC, id DESC LIMIT 1", [], |row| {
                row.get::<_, String>(0)
            })
            .optional()
            .context("failed to read last record text")
    }

    fn insert(&self, record: &NewRecord) -> Result<RecordId> {
        self.conn
            .execute(
                "INSERT INTO codes(format, text, date, isFavorite, name)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.format.as_str(),
                    record.text,
                    date_to_millis(record.date)?,
                    record.is_favorite,
                    record.display_name(),
                ],
            )
            .context("failed to insert record")?;
        Ok(RecordId(self.conn.last_insert_rowid()))
    }

    fn update_text(&self, id: RecordId, text: &str) -> Result<bool> {
        let updated = self
            .conn
            .execute("UPDATE codes SET text = ?1 WHERE id = ?2", params![text, id.0])
            .with_context(|| format!("failed to update text of record {id}"))?;
        Ok(updated > 0)
    }
}

fn apply_migrations(conn: &mut Connection, steps: &[MigrationStep], target: i64) -> Result<()> {
    conn.execute_batch(CREATE_SCHEMA_MIGRATIONS_SQL)
        .context("failed to apply schema_migrations table")?;

    let mut version = current_schema_version(conn)?;
    if version == 0 {
        version = bootstrap_schema_version(conn)?;
    }

    if version > target {
        return Err(StoreError::Schema(format!(
            "database schema version {version} is newer than supported version {target}"
        )));
    }

    let pending = ((version + 1)..=target)
        .map(|next| {
            steps.iter().find(|step| step.version == next).ok_or_else(|| {
                StoreError::Schema(format!(
                    "no migration step registered for version {next} (on disk: {version}, target: {target})"
                ))
            })
        })
        .collect::<Result<Vec<_>>>()?;

    for step in pending {
        let tx = conn
            .transaction()
            .with_context(|| format!("failed to start migration v{} transaction", step.version))?;
        tx.execute_batch(step.sql).map_err(|err| {
            StoreError::Schema(format!(
                "migration v{} ({}) failed: {err}",
                step.version, step.description
            ))
        })?;
        record_schema_version(&tx, step.version)?;
        tx.commit().with_context(|| format!("failed to commit migration v{}", step.version))?;

        tracing::info!(version = step.version, description = step.description, "applied schema migration");
    }

    Ok(())
}

fn bootstrap_schema_version(conn: &Connection) -> Result<i64> {
    let (version, inferred) = detect_effective_schema_version(conn)?;
    if inferred {
        // Table predates version bookkeeping; record what its shape proves.
        for applied in 1..=version {
            record_schema_version(conn, applied)?;
        }
        tracing::info!(version, "inferred schema version from legacy table shape");
    }
    Ok(version)
}

fn table_exists(conn: &Connection, table_name: &str) -> Result<bool> {
    let exists = conn
        .query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            params![table_name],
            |row| row.get::<_, i64>(0),
        )
        .with_context(|| format!("failed to check if table exists: {table_name}"))?;
    Ok(exists == 1)
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> Result<bool> {
    if !table_exists(conn, table)? {
        return Ok(false);
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info({table})"))
        .with_context(|| format!("failed to inspect table_info for {table}"))?;
    let mut rows = stmt.query([])?;

    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }

    Ok(false)
}

fn current_schema_version(conn: &Connection) -> Result<i64> {
    if !table_exists(conn, "schema_migrations")? {
        return Ok(0);
    }

    conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_migrations", [], |row| {
        row.get::<_, i64>(0)
    })
    .context("failed to read current schema version")
}

fn detect_effective_schema_version(conn: &Connection) -> Result<(i64, bool)> {
    let recorded = current_schema_version(conn)?;
    if recorded > 0 {
        return Ok((recorded, false));
    }

    if !table_exists(conn, "codes")? {
        return Ok((0, false));
    }

    for column in ["id", "format", "text", "date", "isFavorite"] {
        if !table_has_column(conn, "codes", column)? {
            return Err(StoreError::Schema(format!(
                "database schema is invalid: codes table has no {column} column"
            )));
        }
    }

    if table_has_column(conn, "codes", "name")? {
        return Ok((2, true));
    }

    Ok((1, true))
}

fn record_schema_version(conn: &Connection, version: i64) -> Result<()> {
    let now = now_rfc3339()?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
        params![version, now],
    )
    .with_context(|| format!("failed to record migration version {version}"))?;
    Ok(())
}

fn now_rfc3339() -> Result<String> {
    OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339).map_err(
        |err| StoreError::Io {
            context: "failed to format RFC3339 timestamp".to_string(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, err),
        },
    )
}

fn write_ndjson_file<T: Serialize>(path: &Path, values: &[T]) -> Result<(String, usize)> {
    let file = File::create(path)
        .with_context(|| format!("failed to create export file {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    let mut hasher = Sha256::new();

    for value in values {
        let line = serde_json::to_string(value).context("failed to serialize NDJSON row")?;
        writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .with_context(|| format!("failed to write export file {}", path.display()))?;
        hasher.update(line.as_bytes());
        hasher.update(b"\n");
    }

    writer.flush().with_context(|| format!("failed to flush export file {}", path.display()))?;

    Ok((format!("{:x}", hasher.finalize()), values.len()))
}
