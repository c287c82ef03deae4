use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use todosync::config::{Config, expand_home};
use todosync::extract::extract_items;
use todosync::markdown::parse_document;
use todosync::reconcile::BODY_DATE_FORMAT;
use todosync::record::{CalendarRecord, TaskStatus, listing_order};
use todosync::storage::{DirRecordStore, RecordStore};
use todosync::{Reconciler, SyncOptions, UntaggedPolicy, UuidGenerator};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "todosync",
    about = "Sync a Markdown checklist with a directory of iCalendar tasks",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Configuration file (JSON). Defaults to ~/.todosync.json when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Reconcile the checklist with the calendar directory and write both sides.
    Sync(SyncArgs),

    /// Print the checklist items found in the document.
    Items(ItemsArgs),

    /// List the tasks stored in the calendar directory.
    Print(PrintArgs),
}

#[derive(Debug, Args)]
struct SyncArgs {
    /// Markdown checklist to sync.
    #[arg(long)]
    document: Option<PathBuf>,
    /// Directory holding one .ics file per task.
    #[arg(long)]
    calendar: Option<PathBuf>,
    /// Print the patched document instead of writing anything.
    #[arg(long)]
    dry_run: bool,
    /// How items without a tag are matched.
    #[arg(long, value_enum)]
    untagged: Option<UntaggedPolicy>,
}

#[derive(Debug, Args)]
struct ItemsArgs {
    /// Markdown checklist to read.
    #[arg(long)]
    document: Option<PathBuf>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct PrintArgs {
    /// Directory holding one .ics file per task.
    #[arg(long)]
    calendar: Option<PathBuf>,
    /// Include completed tasks.
    #[arg(long)]
    all: bool,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let config = Config::load(cli.config.as_deref())?;
    match cli.command {
        Commands::Sync(args) => handle_sync(args, &config),
        Commands::Items(args) => handle_items(args, &config),
        Commands::Print(args) => handle_print(args, &config),
    }
}

/// `RUST_LOG` wins unless `--verbose` asks for debug output.
fn init_tracing(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn handle_sync(args: SyncArgs, config: &Config) -> Result<()> {
    let SyncArgs {
        document,
        calendar,
        dry_run,
        untagged,
    } = args;
    let document = resolve_path(document, config.document.as_deref(), "document")?;
    let calendar = resolve_path(calendar, config.calendar.as_deref(), "calendar")?;
    let policy = untagged.or(config.untagged).unwrap_or_default();

    let reconciler = Reconciler::new(config.zone()?, Utc::now()).untagged(policy);
    let store = DirRecordStore::new(calendar);
    let options = SyncOptions { document, dry_run };
    let report = todosync::sync(&options, &reconciler, &store, &mut UuidGenerator)?;

    if dry_run {
        print!("{}", report.document);
        for name in &report.records_written {
            eprintln!("would write {}", store.root().join(name).display());
        }
    } else {
        println!(
            "{} items, {} edits, {} created, {} records written, {} unchanged",
            report.items,
            report.edits,
            report.created,
            report.records_written.len(),
            report.records_unchanged
        );
    }
    Ok(())
}

fn handle_items(args: ItemsArgs, config: &Config) -> Result<()> {
    let ItemsArgs { document, json } = args;
    let path = resolve_path(document, config.document.as_deref(), "document")?;
    let source = fs::read_to_string(&path).with_context(|| format!("reading {:?}", path))?;
    let zone = config.zone()?;
    let items = extract_items(&parse_document(&source), &source, zone);

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
        return Ok(());
    }
    for item in &items {
        let due = item
            .starts_on
            .map(|at| zone.format(at, BODY_DATE_FORMAT))
            .unwrap_or_else(|| "-".repeat(16));
        let tag = item.tag.as_ref().map(ToString::to_string).unwrap_or_default();
        println!(
            "{} {} [{}] {} {}",
            TaskStatus::from_checked(item.checked).checkbox(),
            due,
            item.category,
            item.summary.replace('\n', " / "),
            tag
        );
    }
    Ok(())
}

fn handle_print(args: PrintArgs, config: &Config) -> Result<()> {
    let PrintArgs {
        calendar,
        all,
        json,
    } = args;
    let calendar = resolve_path(calendar, config.calendar.as_deref(), "calendar")?;
    let zone = config.zone()?;
    let store = DirRecordStore::new(calendar);
    let records = visible_records(
        store.load_all()?.into_iter().map(|s| s.record).collect(),
        all,
    );

    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    for record in &records {
        let status = record.status.as_ref().map_or("[ ]", TaskStatus::checkbox);
        let due = record
            .due
            .map(|at| zone.format(at, BODY_DATE_FORMAT))
            .unwrap_or_else(|| "-".repeat(16));
        let tag = record.tag().map(|t| t.to_string()).unwrap_or_default();
        println!(
            "{} {} [{}] {} {}",
            status,
            due,
            record.category.as_deref().unwrap_or_default(),
            record.summary.as_deref().unwrap_or_default().replace('\n', " / "),
            tag
        );
    }
    Ok(())
}

/// Sorted for listing; completed records are dropped unless `all`.
fn visible_records(mut records: Vec<CalendarRecord>, all: bool) -> Vec<CalendarRecord> {
    if !all {
        records.retain(|r| !r.status.as_ref().is_some_and(TaskStatus::is_completed));
    }
    records.sort_by(listing_order);
    records
}

/// Command-line value first, then the configuration file.
fn resolve_path(flag: Option<PathBuf>, configured: Option<&Path>, what: &str) -> Result<PathBuf> {
    flag.or_else(|| configured.map(Path::to_path_buf))
        .map(|path| expand_home(&path))
        .with_context(|| format!("no {what} given; pass --{what} or set \"{what}\" in the config file"))
}
