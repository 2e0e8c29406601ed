use std::collections::BTreeSet;
use std::fs;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use parking_lot::{MappedMutexGuard, Mutex, MutexGuard};
use scan_history_core::{
    BarcodeFormat, ContinuationTemplate, ExportRecord, Listing, NewRecord, Page, Record, RecordId,
    SaveOutcome, SavePolicy, DEFAULT_PAGE_SIZE,
};
use scan_history_store_sqlite::{ExportManifest, IntegrityReport, SchemaStatus, SqliteStore};
use serde::{Deserialize, Serialize};

pub const DEFAULT_DB_PATH: &str = "./scan_history.sqlite3";

const IN_MEMORY_PATH: &str = ":memory:";

static CLAIMED_PATHS: Mutex<BTreeSet<PathBuf>> = parking_lot::const_mutex(BTreeSet::new());

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HistoryConfig {
    pub db_path: PathBuf,
    pub skip_duplicates: bool,
    pub continuation_template: ContinuationTemplate,
    pub page_size: u32,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            skip_duplicates: false,
            continuation_template: ContinuationTemplate::default(),
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

impl HistoryConfig {
    #[must_use]
    pub fn with_db_path(mut self, db_path: impl Into<PathBuf>) -> Self {
        self.db_path = db_path.into();
        self
    }

    /// Load configuration from a YAML file. Missing keys keep their defaults.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or fails validation.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let body = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&body)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when `page_size` is zero.
    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 {
            return Err(anyhow!("page_size MUST be >= 1"));
        }
        Ok(())
    }

    #[must_use]
    pub fn policy(&self) -> SavePolicy {
        SavePolicy::new(self.skip_duplicates, self.continuation_template.clone())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitRequest {
    pub format: BarcodeFormat,
    pub text: String,
    #[serde(default)]
    pub favorite: bool,
    #[serde(default)]
    pub name: Option<String>,
    /// Overrides the configured duplicate handling for this one write.
    #[serde(default)]
    pub skip_duplicates: Option<bool>,
}

impl SubmitRequest {
    #[must_use]
    pub fn new(format: BarcodeFormat, text: impl Into<String>) -> Self {
        Self { format, text: text.into(), favorite: false, name: None, skip_duplicates: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MigrateResult {
    pub dry_run: bool,
    pub current_version: i64,
    pub target_version: i64,
    pub would_apply_versions: Vec<i64>,
    pub inferred_from_legacy: bool,
    pub after_version: Option<i64>,
    pub up_to_date: Option<bool>,
}

/// Inspect schema status of a history file without migrating it.
///
/// A missing file reports version 0 and is not created.
///
/// # Errors
/// Returns an error when a live [`ScanHistory`] owns the file, or the `SQLite` database
/// cannot be opened or queried.
pub fn schema_status(db_path: &Path) -> Result<SchemaStatus> {
    let _claim = claim_path(db_path)?;
    read_schema_status(db_path)
}

/// Apply pending migrations, or return planned versions for dry-run mode.
///
/// A dry run never creates or writes the file.
///
/// # Errors
/// Returns an error when a live [`ScanHistory`] owns the file, or migration planning or
/// execution fails.
pub fn migrate(db_path: &Path, dry_run: bool) -> Result<MigrateResult> {
    let _claim = claim_path(db_path)?;
    let before = read_schema_status(db_path)?;
    if dry_run {
        return Ok(MigrateResult {
            dry_run: true,
            current_version: before.current_version,
            target_version: before.target_version,
            would_apply_versions: before.pending_versions,
            inferred_from_legacy: before.inferred_from_legacy,
            after_version: None,
            up_to_date: None,
        });
    }

    let planned_versions = before.pending_versions;
    let mut store = SqliteStore::open(db_path)?;
    store.migrate()?;
    let after = store.schema_status()?;
    Ok(MigrateResult {
        dry_run: false,
        current_version: before.current_version,
        target_version: before.target_version,
        would_apply_versions: planned_versions,
        inferred_from_legacy: before.inferred_from_legacy,
        after_version: Some(after.current_version),
        up_to_date: Some(after.pending_versions.is_empty()),
    })
}

fn read_schema_status(db_path: &Path) -> Result<SchemaStatus> {
    if db_path == Path::new(IN_MEMORY_PATH) {
        return Ok(SqliteStore::open(db_path)?.schema_status()?);
    }
    if !db_path.exists() {
        return Ok(SchemaStatus::at_version(0, false));
    }

    let store = SqliteStore::open_existing(db_path)?;
    Ok(store.schema_status()?)
}

/// Exclusive access to the history store, released on drop.
pub struct StoreLease<'a> {
    inner: MappedMutexGuard<'a, SqliteStore>,
}

impl Deref for StoreLease<'_> {
    type Target = SqliteStore;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl DerefMut for StoreLease<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

/// Owned handle to one scan history file.
///
/// At most one handle per file exists in a process at a time. The connection is opened
/// and migrated on first use and kept until [`ScanHistory::close`] or drop.
pub struct ScanHistory {
    config: HistoryConfig,
    policy: SavePolicy,
    store: Mutex<Option<SqliteStore>>,
    claim: Option<PathClaim>,
}

impl std::fmt::Debug for ScanHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanHistory")
            .field("config", &self.config)
            .field("claim", &self.claim)
            .finish_non_exhaustive()
    }
}

impl ScanHistory {
    /// Claim the configured history file for this process.
    ///
    /// # Errors
    /// Returns an error when the configuration is invalid or another live handle already
    /// owns the same file.
    pub fn open(config: HistoryConfig) -> Result<Self> {
        config.validate()?;
        let claim = claim_path(&config.db_path)?;
        let policy = config.policy();
        Ok(Self { config, policy, store: Mutex::new(None), claim })
    }

    #[must_use]
    pub fn config(&self) -> &HistoryConfig {
        &self.config
    }

    /// Lease the store, opening and migrating it on first use.
    ///
    /// # Errors
    /// Returns an error when the file cannot be opened or its schema cannot be brought
    /// up to date.
    pub fn acquire(&self) -> Result<StoreLease<'_>> {
        let mut guard = self.store.lock();
        if guard.is_none() {
            let store = SqliteStore::open_migrated(&self.config.db_path).with_context(|| {
                format!("failed to open history store {}", self.config.db_path.display())
            })?;
            tracing::info!(path = %self.config.db_path.display(), "history store opened");
            *guard = Some(store);
        }

        MutexGuard::try_map(guard, Option::as_mut)
            .map(|inner| StoreLease { inner })
            .map_err(|_| anyhow!("history store is not open"))
    }

    /// Run `f` while holding the store lease.
    ///
    /// # Errors
    /// Returns an error when acquisition fails or `f` fails.
    pub fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut SqliteStore) -> Result<T>,
    {
        let mut lease = self.acquire()?;
        f(&mut lease)
    }

    /// Release the connection and the file claim.
    pub fn close(self) {
        if self.store.lock().take().is_some() {
            tracing::debug!(path = %self.config.db_path.display(), "history store closed");
        }
    }

    /// Persist one decoded code according to the configured policy.
    ///
    /// # Errors
    /// Returns an error when the record is invalid or the write fails.
    pub fn submit(&self, request: SubmitRequest) -> Result<SaveOutcome> {
        let policy = match request.skip_duplicates {
            Some(skip) if skip != self.policy.skip_duplicates => {
                self.policy.clone().with_skip_duplicates(skip)
            }
            _ => self.policy.clone(),
        };
        let record = NewRecord::new(request.format, request.text)
            .favorite(request.favorite)
            .named(request.name);

        self.with_store(|store| {
            store.save(&record, &policy).context("failed to save scanned code")
        })
    }

    /// # Errors
    /// Returns an error when the page is invalid or rows cannot be read.
    pub fn history_page(&self, page: Page) -> Result<Vec<Record>> {
        self.with_store(|store| Ok(store.list_all(page)?))
    }

    /// # Errors
    /// Returns an error when the page is invalid or rows cannot be read.
    pub fn favorites_page(&self, page: Page) -> Result<Vec<Record>> {
        self.with_store(|store| Ok(store.list_favorites(page)?))
    }

    /// Lazily walk `listing` in pages of the configured size.
    #[must_use]
    pub fn pages(&self, listing: Listing) -> HistoryPages<'_> {
        HistoryPages {
            history: self,
            listing,
            next: Some(Page::first(self.config.page_size)),
        }
    }

    /// # Errors
    /// Returns an error when the count query fails.
    pub fn count(&self, listing: Listing) -> Result<u64> {
        self.with_store(|store| Ok(store.count(listing)?))
    }

    /// # Errors
    /// Returns an error when rows cannot be read.
    pub fn export(&self) -> Result<Vec<ExportRecord>> {
        self.with_store(|store| store.list_for_export().context("failed to load history for export"))
    }

    /// # Errors
    /// Returns an error when snapshot files cannot be written.
    pub fn export_snapshot(&self, out_dir: &Path) -> Result<ExportManifest> {
        self.with_store(|store| Ok(store.export_snapshot(out_dir)?))
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn delete(&self, id: RecordId) -> Result<bool> {
        self.with_store(|store| Ok(store.delete_by_id(id)?))
    }

    /// # Errors
    /// Returns an error when the delete fails.
    pub fn clear_all(&self) -> Result<u64> {
        self.with_store(|store| Ok(store.delete_all()?))
    }

    /// # Errors
    /// Returns an error when the update fails.
    pub fn set_favorite(&self, id: RecordId, is_favorite: bool) -> Result<bool> {
        self.with_store(|store| Ok(store.set_favorite(id, is_favorite)?))
    }

    /// # Errors
    /// Returns an error when the name is blank or the update fails.
    pub fn rename(&self, id: RecordId, name: Option<&str>) -> Result<bool> {
        self.with_store(|store| Ok(store.set_name(id, name)?))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn find(&self, format: BarcodeFormat, text: &str) -> Result<Option<Record>> {
        self.with_store(|store| Ok(store.find_by_natural_key(format, text)?))
    }

    /// # Errors
    /// Returns an error when the lookup fails.
    pub fn get(&self, id: RecordId) -> Result<Option<Record>> {
        self.with_store(|store| Ok(store.get(id)?))
    }

    /// Whether the next submit would be merged into the last record.
    ///
    /// # Errors
    /// Returns an error when the store cannot be opened.
    pub fn awaiting_continuation(&self) -> Result<bool> {
        self.with_store(|store| Ok(store.is_last_record_numeric()))
    }

    /// # Errors
    /// Returns an error when the backup fails.
    pub fn backup(&self, out_file: &Path) -> Result<()> {
        self.with_store(|store| Ok(store.backup_database(out_file)?))
    }

    /// # Errors
    /// Returns an error when the restore or the follow-up migration fails.
    pub fn restore(&self, in_file: &Path) -> Result<SchemaStatus> {
        self.with_store(|store| {
            store.restore_database(in_file)?;
            Ok(store.schema_status()?)
        })
    }

    /// # Errors
    /// Returns an error when an integrity query fails.
    pub fn integrity_check(&self) -> Result<IntegrityReport> {
        self.with_store(|store| Ok(store.integrity_check()?))
    }
}

/// Iterator over consecutive pages of one listing.
///
/// Each page is read when requested. Iteration ends after an empty or short page, or
/// after the first error.
pub struct HistoryPages<'a> {
    history: &'a ScanHistory,
    listing: Listing,
    next: Option<Page>,
}

impl Iterator for HistoryPages<'_> {
    type Item = Result<Vec<Record>>;

    fn next(&mut self) -> Option<Self::Item> {
        let page = self.next.take()?;
        let result = match self.listing {
            Listing::All => self.history.history_page(page),
            Listing::Favorites => self.history.favorites_page(page),
        };

        match result {
            Ok(records) if records.is_empty() => None,
            Ok(records) => {
                if records.len() >= usize::try_from(page.limit).unwrap_or(usize::MAX) {
                    self.next = Some(page.next());
                }
                Some(Ok(records))
            }
            Err(err) => Some(Err(err)),
        }
    }
}

fn registry_key(path: &Path) -> Result<PathBuf> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir().context("failed to resolve working directory")?.join(path)
    };

    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => match parent.canonicalize() {
            Ok(parent) => Ok(parent.join(name)),
            Err(_) => Ok(absolute),
        },
        _ => Ok(absolute),
    }
}

/// Registry entry for one history file; removed on drop.
#[derive(Debug)]
struct PathClaim {
    key: PathBuf,
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        CLAIMED_PATHS.lock().remove(&self.key);
    }
}

fn claim_path(path: &Path) -> Result<Option<PathClaim>> {
    if path == Path::new(IN_MEMORY_PATH) {
        return Ok(None);
    }

    let key = registry_key(path)?;
    let mut claimed = CLAIMED_PATHS.lock();
    if !claimed.insert(key.clone()) {
        return Err(anyhow!("history file {} is already open in this process", key.display()));
    }
    Ok(Some(PathClaim { key }))
}
