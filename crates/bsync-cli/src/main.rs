use std::path::PathBuf;

use anyhow::{Context, Result};
use bsync_reconcile::{parse_name_list, run_reconcile, ReconcileConfig, ReconcileOutcome};
use bsync_sync::{run_sync, SyncConfig};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "bsync")]
#[command(about = "Broker snapshot reconciliation and database sync")]
struct Cli {
    /// Emit logs as JSON lines (also BSYNC_LOG_JSON=1).
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Compute the retry roster from the extractor's execution log.
    Reconcile(ReconcileArgs),
    /// Ingest unprocessed snapshot bundles into the database.
    Sync(SyncArgs),
    /// Apply database migrations.
    Migrate {
        #[arg(long)]
        database_url: Option<String>,
    },
}

#[derive(Debug, Args, Default)]
struct ReconcileArgs {
    #[arg(long)]
    roster: Option<PathBuf>,
    #[arg(long)]
    log: Option<PathBuf>,
    #[arg(long)]
    output: Option<PathBuf>,
    /// Comma-separated unit names left out of the retry roster.
    #[arg(long)]
    exclude: Option<String>,
}

#[derive(Debug, Args, Default)]
struct SyncArgs {
    /// Run against an in-memory store and leave bundles in place.
    #[arg(long)]
    dry_run: bool,
    #[arg(long)]
    downloads_dir: Option<PathBuf>,
    #[arg(long)]
    reports_dir: Option<PathBuf>,
    #[arg(long)]
    database_url: Option<String>,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; real environment variables still apply.
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.log_json || env_flag("BSYNC_LOG_JSON"));

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Reconcile(args) => {
            let mut config = ReconcileConfig::from_env();
            if let Some(roster) = args.roster {
                config.roster_path = roster;
            }
            if let Some(log) = args.log {
                config.log_path = log;
            }
            if let Some(output) = args.output {
                config.retry_roster_path = output;
            }
            if let Some(exclude) = args.exclude {
                config.excluded_names = parse_name_list(&exclude);
            }

            let report = run_reconcile(&config).await?;
            match &report.outcome {
                ReconcileOutcome::Pending { retry } => println!(
                    "reconcile complete: {} of {} units pending, retry roster at {}",
                    retry.len(),
                    report.roster_size,
                    report.retry_roster_path.display()
                ),
                ReconcileOutcome::NothingToRetry => println!(
                    "reconcile complete: all {} units completed, nothing to retry",
                    report.roster_size
                ),
            }
        }
        Commands::Sync(args) => {
            let mut config = SyncConfig::from_env();
            config.dry_run = args.dry_run;
            if let Some(dir) = args.downloads_dir {
                config.downloads_dir = dir;
            }
            if let Some(dir) = args.reports_dir {
                config.reports_dir = Some(dir);
            }
            if let Some(url) = args.database_url {
                config.database_url = Some(url);
            }

            let summary = run_sync(config).await?;
            println!(
                "sync complete: run_id={} discovered={} processed={} skipped={} rows_written={} rejected={}",
                summary.run_id,
                summary.discovered,
                summary.processed,
                summary.skipped,
                summary.tables.written(),
                summary.rejected_records
            );
            for failure in &summary.failures {
                println!("  skipped {} ({}): {}", failure.file_name, failure.kind, failure.reason);
            }
            if let Some(path) = &summary.report_path {
                println!("  summary written to {}", path.display());
            }
        }
        Commands::Migrate { database_url } => {
            let url = database_url
                .or_else(|| SyncConfig::from_env().database_url)
                .context("DATABASE_URL (or DB_URL) is not set")?;
            bsync_sync::migrate(&url).await?;
            println!("migrations applied");
        }
    }

    Ok(())
}
