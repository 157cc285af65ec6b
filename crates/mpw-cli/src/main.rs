use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use mpw_sync::{LivenessStatus, SyncConfig, TargetFilter};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mpw-cli")]
#[command(about = "Marketplace price watch command-line interface")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Crawl the target list on an interval until interrupted.
    Run(RunArgs),
    /// Create or upgrade both database schemas.
    Migrate,
    /// Serve the read-only JSON API.
    Serve,
    /// Exit non-zero when the liveness file is stale or missing.
    Healthz,
    /// Print a markdown summary of recent sessions and events.
    Report {
        #[arg(long, default_value_t = 5)]
        limit: i64,
    },
}

#[derive(Debug, Args, Default)]
struct RunArgs {
    /// Seconds between cycle starts.
    #[arg(long)]
    interval: Option<u64>,
    /// One item per store, one cycle, then exit.
    #[arg(long)]
    debug: bool,
    /// Only targets whose name contains this text.
    #[arg(long)]
    item: Option<String>,
    /// Only targets whose store contains this text.
    #[arg(long)]
    store: Option<String>,
    #[arg(long)]
    targets: Option<PathBuf>,
}

impl RunArgs {
    fn apply(self, config: &mut SyncConfig) {
        if let Some(secs) = self.interval {
            config.interval = Duration::from_secs(secs);
        }
        if let Some(path) = self.targets {
            config.targets_path = path;
        }
        config.debug = self.debug;
        config.filter = TargetFilter {
            item: self.item,
            store: self.store,
        };
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    init_logging();
    let cli = Cli::parse();
    let mut config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            args.apply(&mut config);
            let summary = mpw_sync::run_from_config(&config).await?;
            println!(
                "scheduler stopped: cycles={} exit_reason={}",
                summary.cycles, summary.exit_reason
            );
        }
        Commands::Migrate => {
            let history = mpw_storage::HistoryStore::open(&config.history_db).await?;
            let added_history = history.init().await.context("migrating history store")?;
            let metrics = mpw_storage::MetricsStore::open(&config.metrics_db).await?;
            let added_metrics = metrics.init().await.context("migrating metrics store")?;
            println!("migrate complete: history_columns_added={added_history} metrics_columns_added={added_metrics}");
        }
        Commands::Serve => {
            mpw_web::serve_from_config(&config).await?;
        }
        Commands::Healthz => {
            let Some(path) = &config.liveness_file else {
                eprintln!("unhealthy: no liveness file configured");
                return Ok(ExitCode::FAILURE);
            };
            let max_age = config.max_liveness_age();
            let status = mpw_sync::check_liveness(path, max_age, chrono::Utc::now()).await?;
            info!(?status, path = %path.display(), "liveness checked");
            match status {
                LivenessStatus::Fresh { age } => println!("healthy: last update {}s ago", age.as_secs()),
                LivenessStatus::Stale { age } => {
                    eprintln!("unhealthy: last update {}s ago", age.as_secs());
                    return Ok(ExitCode::FAILURE);
                }
                LivenessStatus::Missing => {
                    eprintln!("unhealthy: {} not found", path.display());
                    return Ok(ExitCode::FAILURE);
                }
            }
        }
        Commands::Report { limit } => {
            let (history, metrics) = mpw_sync::open_stores(&config).await?;
            println!("{}", mpw_sync::report_markdown(&history, &metrics, limit).await?);
        }
    }

    Ok(ExitCode::SUCCESS)
}
