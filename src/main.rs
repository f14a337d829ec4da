use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand, ValueEnum};
use file_migrator_lib::{
    build_migrator,
    catalog::{Catalog, CatalogEntry},
    config::{resolve_config_path, Settings},
    control::MigrationControl,
    db,
    events::TracingSink,
    file_ops::{PlacementEngine, RetryPolicy},
    logging,
    migrator::{MigrationRun, RunStatus},
    verify, AppError, AppResult,
};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use tokio::signal;

const MAX_PRINTED_ERRORS: usize = 10;

#[derive(Parser)]
#[command(
    name = "file-migrator",
    version,
    about = "Move catalogued files into a YYYYMMDD partitioned layout"
)]
struct Cli {
    /// Settings file (defaults to $FILE_MIGRATOR_CONFIG, then config/settings.json)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Print machine readable JSON instead of a summary
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    #[command(about = "Migrate every unmoved file, batch by batch")]
    Migrate {
        #[arg(long, value_name = "N")]
        max_files: Option<u64>,
    },
    #[command(about = "Migrate a single batch of unmoved files")]
    MigrateBatch {
        #[arg(long, value_name = "N")]
        batch_size: Option<u32>,
    },
    #[command(about = "Migrate unmoved files registered within a date range")]
    MigrateRange {
        #[arg(long, value_name = "YYYY-MM-DD", value_parser = parse_date)]
        start_date: NaiveDate,
        #[arg(long, value_name = "YYYY-MM-DD", value_parser = parse_date)]
        end_date: NaiveDate,
    },
    #[command(about = "Show catalog and storage statistics")]
    Status,
    #[command(about = "Check that a sample of moved files exist and are non-empty")]
    Verify {
        #[arg(long, value_name = "N", default_value_t = 100)]
        sample_size: u32,
    },
    #[command(about = "Remove empty date directories")]
    Cleanup,
    #[command(about = "Check that the catalog is reachable")]
    TestConnection,
    #[command(about = "List catalog records or flat-layout files")]
    List {
        #[arg(long, value_enum, default_value_t = ListKind::Unmoved)]
        kind: ListKind,
        #[arg(long, value_name = "N", default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ListKind {
    Unmoved,
    Moved,
    /// Files present in the flat directory, whatever the catalog says
    Flat,
}

fn parse_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| format!("'{raw}' is not a YYYY-MM-DD date"))
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<i32> {
    let config_path = resolve_config_path(cli.config.clone());
    let settings = Settings::read(&config_path).map_err(AppError::from)?;
    if !matches!(cli.command, Command::TestConnection) {
        settings.validate().map_err(AppError::from)?;
    }
    let _log_guard = logging::init_logging(&settings.logging, cli.verbose)
        .context("initialize logging")?;
    tracing::debug!(
        target: "file_migrator",
        event = "config_loaded",
        path = %config_path.display()
    );

    match cli.command {
        Command::Migrate { max_files } => {
            let migrator = build_migrator(&settings).await?;
            let control = MigrationControl::new();
            let run = with_interrupt(&control, async {
                migrator.run_full(max_files, &mut TracingSink, &control).await
            })
            .await?;
            report_run(&run, cli.json)
        }
        Command::MigrateBatch { batch_size } => {
            let migrator = build_migrator(&settings).await?;
            let control = MigrationControl::new();
            let run = with_interrupt(&control, async {
                migrator
                    .run_single_batch(batch_size, &mut TracingSink, &control)
                    .await
            })
            .await?;
            report_run(&run, cli.json)
        }
        Command::MigrateRange {
            start_date,
            end_date,
        } => {
            let migrator = build_migrator(&settings).await?;
            let control = MigrationControl::new();
            let run = with_interrupt(&control, async {
                migrator
                    .run_range(start_date, end_date, &mut TracingSink, &control)
                    .await
            })
            .await?;
            report_run(&run, cli.json)
        }
        Command::Status => {
            let migrator = build_migrator(&settings).await?;
            let report = verify::status(migrator.catalog(), migrator.placement()).await?;
            if cli.json {
                print_json(&report)?;
            } else {
                print_status(&report);
            }
            Ok(0)
        }
        Command::Verify { sample_size } => {
            let migrator = build_migrator(&settings).await?;
            let report =
                verify::verify_sample(migrator.catalog(), migrator.placement(), sample_size)
                    .await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!("Verification");
                println!("  Checked:  {}", report.total_checked);
                println!("  Verified: {}", report.verified);
                println!("  Errors:   {}", report.errors);
                for issue in report.details.iter().take(MAX_PRINTED_ERRORS) {
                    println!("    {}: {}", issue.record_id, issue.reason);
                }
                print_remainder(report.details.len());
            }
            Ok(if report.is_clean() { 0 } else { 1 })
        }
        Command::Cleanup => {
            let placement = open_placement(&settings).await?;
            let removed = placement.prune_empty_date_dirs().await?;
            if cli.json {
                print_json(&serde_json::json!({ "removed_dirs": removed }))?;
            } else {
                println!("Removed {removed} empty date directories");
            }
            Ok(0)
        }
        Command::TestConnection => {
            let outcome = test_connection(&settings).await;
            if cli.json {
                print_json(&serde_json::json!({
                    "ok": outcome.is_ok(),
                    "error": outcome.as_ref().err(),
                }))?;
            } else {
                match &outcome {
                    Ok(()) => println!("Catalog connection OK ({})", settings.catalog.path.display()),
                    Err(err) => println!("Catalog connection failed: {err}"),
                }
            }
            Ok(if outcome.is_ok() { 0 } else { 1 })
        }
        Command::List { kind, limit } => {
            match kind {
                ListKind::Flat => {
                    let placement = open_placement(&settings).await?;
                    let names = placement.list_unmoved_files(limit as usize).await?;
                    if cli.json {
                        print_json(&names)?;
                    } else {
                        for name in &names {
                            println!("{name}");
                        }
                    }
                }
                ListKind::Unmoved | ListKind::Moved => {
                    let migrator = build_migrator(&settings).await?;
                    let entries = if kind == ListKind::Moved {
                        migrator.catalog().fetch_moved(limit).await?
                    } else {
                        migrator.catalog().fetch_unmoved(limit).await?
                    };
                    if cli.json {
                        print_json(&entries)?;
                    } else {
                        print_entries(&entries);
                    }
                }
            }
            Ok(0)
        }
    }
}

/// Drives `work` to completion; Ctrl+C asks the run to stop after the current record.
async fn with_interrupt<F, T>(control: &MigrationControl, work: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    tokio::pin!(work);
    loop {
        tokio::select! {
            result = &mut work => break result,
            signal = signal::ctrl_c() => {
                if let Err(err) = signal {
                    tracing::warn!(target: "file_migrator", event = "ctrl_c_unavailable", error = %err);
                    break work.await;
                }
                if !control.is_cancelled() {
                    eprintln!("Received interrupt. Finishing current file before exiting…");
                    control.cancel();
                }
            }
        }
    }
}

async fn open_placement(settings: &Settings) -> AppResult<PlacementEngine> {
    PlacementEngine::new(
        settings.paths.base.clone(),
        settings.paths.new_base.clone(),
        RetryPolicy {
            max_retries: settings.migrator.max_retries,
            delay: settings.migrator.retry_delay(),
        },
    )
    .await
}

async fn test_connection(settings: &Settings) -> AppResult<()> {
    let mut catalog_settings = settings.catalog.clone();
    catalog_settings.create_if_missing = false;
    let pool = db::open_pool(&catalog_settings).await?;
    let catalog = Catalog::new(pool.clone(), settings.catalog.table.clone())?;
    let result = catalog.ping().await;
    pool.close().await;
    result
}

fn report_run(run: &MigrationRun, json: bool) -> Result<i32> {
    if json {
        print_json(run)?;
    } else {
        print_run_summary(run);
    }
    Ok(exit_code(run))
}

fn exit_code(run: &MigrationRun) -> i32 {
    match run.status {
        RunStatus::Cancelled => 130,
        RunStatus::Completed if run.failed == 0 => 0,
        _ => 1,
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn format_status(status: RunStatus) -> &'static str {
    match status {
        RunStatus::Running => "running",
        RunStatus::Completed => "completed",
        RunStatus::Cancelled => "cancelled",
        RunStatus::Failed => "failed",
    }
}

fn print_run_summary(run: &MigrationRun) {
    println!("\nSummary ({})", format_status(run.status));
    println!("  Total:     {}", run.total);
    println!("  Processed: {}", run.processed);
    println!("  Succeeded: {}", run.succeeded);
    println!("  Failed:    {}", run.failed);
    println!("  Skipped:   {}", run.skipped);
    println!("  Batches:   {}", run.batch_count);
    println!("  Success:   {:.1}%", run.success_rate());
    println!(
        "  Elapsed:   {:.2}s",
        run.duration().num_milliseconds() as f64 / 1000.0
    );
    if let Some(err) = &run.fatal_error {
        println!("  Aborted:   {err}");
    }
    if !run.errors.is_empty() {
        println!("\nErrors:");
        for error in run.errors.iter().take(MAX_PRINTED_ERRORS) {
            println!(
                "  {} [{}] {}",
                error.record_id,
                error.kind.as_str(),
                error.error_message
            );
        }
        print_remainder(run.errors.len());
    }
}

fn print_remainder(len: usize) {
    if len > MAX_PRINTED_ERRORS {
        println!("  ... and {} more", len - MAX_PRINTED_ERRORS);
    }
}

fn print_status(report: &verify::StatusReport) {
    let stats = &report.catalog;
    let fmt_date = |d: Option<NaiveDate>| d.map_or_else(|| "-".to_string(), |d| d.to_string());
    println!("Catalog");
    println!("  Total:    {}", stats.total);
    println!("  Moved:    {}", stats.moved);
    println!("  Unmoved:  {}", stats.unmoved);
    println!("  Progress: {:.1}%", report.progress_percent);
    println!(
        "  Dates:    {} .. {}",
        fmt_date(stats.earliest_date),
        fmt_date(stats.latest_date)
    );
    if let (Some(first), Some(last)) = (stats.first_moved_at, stats.last_moved_at) {
        println!("  Moved at: {first} .. {last}");
    }
    let storage = &report.storage;
    println!("Storage");
    println!(
        "  Flat:        {} files, {} bytes",
        storage.flat_files, storage.flat_bytes
    );
    println!(
        "  Partitioned: {} files, {} bytes in {} date directories",
        storage.partitioned_files, storage.partitioned_bytes, storage.date_dirs
    );
}

fn print_entries(entries: &[CatalogEntry]) {
    if entries.is_empty() {
        println!("No records");
        return;
    }
    for entry in entries {
        match entry {
            CatalogEntry::Record(record) => {
                let moved_at = record
                    .moved_at
                    .map_or_else(String::new, |at| format!("  moved {at}"));
                println!(
                    "{}  {}  {}{}",
                    record.id, record.registered_date, record.filename, moved_at
                );
            }
            CatalogEntry::Invalid(invalid) => {
                println!("{}  {}  (invalid: {})", invalid.id, invalid.date_key, invalid.reason);
            }
        }
    }
}
