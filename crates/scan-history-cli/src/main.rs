use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use scan_history_api::{HistoryConfig, ScanHistory, SubmitRequest};
use scan_history_core::{BarcodeFormat, ContinuationTemplate, Listing, Page, RecordId};
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "SCANHIST_LOG";
const DEFAULT_LOG_FILTER: &str = "warn";

#[derive(Debug, Parser)]
#[command(name = "scanhist")]
#[command(about = "Scanned code history CLI")]
struct Cli {
    /// History database file; overrides `db_path` from the config file.
    #[arg(long)]
    db: Option<PathBuf>,

    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    skip_duplicates: Option<bool>,

    #[arg(long, value_parser = parse_template)]
    continuation_template: Option<ContinuationTemplate>,

    #[arg(long)]
    page_size: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
    Export {
        #[command(subcommand)]
        command: ExportCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    Backup(DbBackupArgs),
    Restore(DbRestoreArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbBackupArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct DbRestoreArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Save(SaveArgs),
    List(ListArgs),
    Get(IdArgs),
    Find(FindArgs),
    Delete(IdArgs),
    Clear,
    Favorite(FavoriteArgs),
    Rename(RenameArgs),
}

#[derive(Debug, Args)]
struct SaveArgs {
    #[arg(long, value_parser = parse_format)]
    format: BarcodeFormat,
    #[arg(long)]
    text: String,
    #[arg(long, default_value_t = false)]
    favorite: bool,
    #[arg(long)]
    name: Option<String>,
    /// Overrides the configured duplicate handling for this write.
    #[arg(long)]
    skip_duplicates: Option<bool>,
}

#[derive(Debug, Args)]
struct ListArgs {
    #[arg(long, default_value_t = false)]
    favorites: bool,
    #[arg(long, default_value_t = 0)]
    offset: u64,
    /// Defaults to the configured page size.
    #[arg(long)]
    limit: Option<u32>,
    /// Walk every page instead of returning one window.
    #[arg(long, default_value_t = false, conflicts_with_all = ["offset", "limit"])]
    all: bool,
}

#[derive(Debug, Args)]
struct IdArgs {
    #[arg(long)]
    id: i64,
}

#[derive(Debug, Args)]
struct FindArgs {
    #[arg(long, value_parser = parse_format)]
    format: BarcodeFormat,
    #[arg(long)]
    text: String,
}

#[derive(Debug, Args)]
struct FavoriteArgs {
    #[arg(long)]
    id: i64,
    /// Clear the flag instead of setting it.
    #[arg(long, default_value_t = false)]
    off: bool,
}

#[derive(Debug, Args)]
struct RenameArgs {
    #[arg(long)]
    id: i64,
    /// New display name; omit to clear it.
    #[arg(long)]
    name: Option<String>,
}

#[derive(Debug, Subcommand)]
enum ExportCommand {
    Json(ExportJsonArgs),
    Snapshot(ExportSnapshotArgs),
}

#[derive(Debug, Args)]
struct ExportJsonArgs {
    /// Write the document to a file instead of stdout.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ExportSnapshotArgs {
    #[arg(long)]
    out: PathBuf,
}

fn parse_format(value: &str) -> Result<BarcodeFormat, String> {
    value.parse::<BarcodeFormat>().map_err(|err| err.to_string())
}

fn parse_template(value: &str) -> Result<ContinuationTemplate, String> {
    ContinuationTemplate::parse(value).map_err(|err| err.to_string())
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn resolve_config(cli: &Cli) -> Result<HistoryConfig> {
    let mut config = match cli.config.as_deref() {
        Some(path) => HistoryConfig::from_yaml_file(path)?,
        None => HistoryConfig::default(),
    };

    if let Some(db) = &cli.db {
        config.db_path.clone_from(db);
    }
    if let Some(skip) = cli.skip_duplicates {
        config.skip_duplicates = skip;
    }
    if let Some(template) = &cli.continuation_template {
        config.continuation_template = template.clone();
    }
    if let Some(page_size) = cli.page_size {
        config.page_size = page_size;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = resolve_config(&cli)?;
    tracing::debug!(db = %config.db_path.display(), "configuration resolved");

    match cli.command {
        Command::Db { command } => run_db(command, config),
        Command::Record { command } => {
            let history = ScanHistory::open(config)?;
            run_record(command, &history)
        }
        Command::Export { command } => {
            let history = ScanHistory::open(config)?;
            run_export(command, &history)
        }
    }
}

fn run_db(command: DbCommand, config: HistoryConfig) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => {
            let status = scan_history_api::schema_status(&config.db_path)?;
            emit_json(serde_json::json!({
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions,
                "up_to_date": status.pending_versions.is_empty(),
                "inferred_from_legacy": status.inferred_from_legacy
            }))
        }
        DbCommand::Migrate(args) => {
            let result = scan_history_api::migrate(&config.db_path, args.dry_run)?;
            emit_json(serde_json::to_value(&result).context("failed to serialize migrate result")?)
        }
        DbCommand::Backup(args) => {
            let history = ScanHistory::open(config)?;
            history.backup(&args.out)?;
            emit_json(serde_json::json!({
                "backup_path": args.out,
                "status": "ok"
            }))
        }
        DbCommand::Restore(args) => {
            let history = ScanHistory::open(config)?;
            let status = history.restore(&args.input)?;
            emit_json(serde_json::json!({
                "restored_from": args.input,
                "current_version": status.current_version,
                "target_version": status.target_version,
                "pending_versions": status.pending_versions
            }))
        }
        DbCommand::IntegrityCheck => {
            let history = ScanHistory::open(config)?;
            let report = history.integrity_check()?;
            emit_json(serde_json::to_value(&report).context("failed to serialize integrity report")?)
        }
    }
}

fn run_record(command: RecordCommand, history: &ScanHistory) -> Result<()> {
    match command {
        RecordCommand::Save(args) => {
            let outcome = history.submit(SubmitRequest {
                format: args.format,
                text: args.text,
                favorite: args.favorite,
                name: args.name,
                skip_duplicates: args.skip_duplicates,
            })?;
            let record = history.get(outcome.id())?;
            emit_json(serde_json::json!({
                "outcome": outcome.as_str(),
                "id": outcome.id(),
                "record": record
            }))
        }
        RecordCommand::List(args) => run_record_list(&args, history),
        RecordCommand::Get(args) => {
            let id = RecordId(args.id);
            let record = history.get(id)?.ok_or_else(|| anyhow!("record {id} not found"))?;
            emit_json(serde_json::to_value(&record).context("failed to serialize record")?)
        }
        RecordCommand::Find(args) => {
            let record = history.find(args.format, &args.text)?;
            emit_json(serde_json::json!({
                "found": record.is_some(),
                "record": record
            }))
        }
        RecordCommand::Delete(args) => {
            let deleted = history.delete(RecordId(args.id))?;
            emit_json(serde_json::json!({ "id": args.id, "deleted": deleted }))
        }
        RecordCommand::Clear => {
            let removed = history.clear_all()?;
            emit_json(serde_json::json!({ "removed": removed }))
        }
        RecordCommand::Favorite(args) => {
            let updated = history.set_favorite(RecordId(args.id), !args.off)?;
            emit_json(serde_json::json!({
                "id": args.id,
                "is_favorite": !args.off,
                "updated": updated
            }))
        }
        RecordCommand::Rename(args) => {
            let updated = history.rename(RecordId(args.id), args.name.as_deref())?;
            emit_json(serde_json::json!({
                "id": args.id,
                "name": args.name,
                "updated": updated
            }))
        }
    }
}

fn run_record_list(args: &ListArgs, history: &ScanHistory) -> Result<()> {
    let listing = if args.favorites { Listing::Favorites } else { Listing::All };

    let records = if args.all {
        let mut records = Vec::new();
        for page in history.pages(listing) {
            records.extend(page?);
        }
        records
    } else {
        let page = Page::new(args.offset, args.limit.unwrap_or(history.config().page_size))?;
        match listing {
            Listing::All => history.history_page(page)?,
            Listing::Favorites => history.favorites_page(page)?,
        }
    };

    emit_json(serde_json::json!({
        "listing": listing.as_str(),
        "total": history.count(listing)?,
        "count": records.len(),
        "records": records
    }))
}

fn run_export(command: ExportCommand, history: &ScanHistory) -> Result<()> {
    match command {
        ExportCommand::Json(args) => {
            let records = history.export()?;
            let count = records.len();
            let document = serde_json::json!({
                "count": count,
                "records": records
            });

            match args.out {
                Some(path) => {
                    let body = serde_json::to_vec_pretty(&document)
                        .context("failed to serialize export document")?;
                    fs::write(&path, body).with_context(|| {
                        format!("failed to write export document {}", path.display())
                    })?;
                    emit_json(serde_json::json!({
                        "export_path": path,
                        "count": count
                    }))
                }
                None => emit_json(document),
            }
        }
        ExportCommand::Snapshot(args) => {
            let manifest = history.export_snapshot(&args.out)?;
            emit_json(serde_json::json!({
                "export_dir": args.out,
                "manifest": manifest
            }))
        }
    }
}
