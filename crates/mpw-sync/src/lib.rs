//! Crawl orchestration: target loading, event detection and the scheduler loop.

use std::sync::Arc;

use anyhow::{Context, Result};
use mpw_adapters::HttpSessionFactory;
use mpw_storage::{HistoryStore, MetricsStore};
use tracing::warn;

pub mod config;
pub mod detector;
pub mod failures;
pub mod liveness;
pub mod recorder;
pub mod report;
pub mod scheduler;

pub use config::{ConfigError, SyncConfig, TargetFilter, TargetList, TargetSource, YamlTargetFile};
pub use detector::{DetectorConfig, EventDetector};
pub use failures::FailureCounter;
pub use liveness::{check_liveness, read_liveness, LivenessFile, LivenessStatus};
pub use recorder::MetricsRecorder;
pub use report::report_markdown;
pub use scheduler::{
    install_signal_handlers, CancelFlag, CycleReport, RunSummary, Scheduler, SchedulerConfig,
};

pub const CRATE_NAME: &str = "mpw-sync";

/// Open both stores, bringing their schemas up to date.
pub async fn open_stores(config: &SyncConfig) -> Result<(HistoryStore, MetricsStore)> {
    let history = HistoryStore::open_and_init(&config.history_db)
        .await
        .with_context(|| format!("opening history store {}", config.history_db.display()))?;
    let metrics = MetricsStore::open_and_init(&config.metrics_db)
        .await
        .with_context(|| format!("opening metrics store {}", config.metrics_db.display()))?;
    Ok((history, metrics))
}

/// Build the production scheduler: HTTP sessions, YAML targets, persisted metrics.
pub async fn scheduler_from_config(config: &SyncConfig, cancel: CancelFlag) -> Result<Scheduler> {
    let history = HistoryStore::open_and_init(&config.history_db)
        .await
        .with_context(|| format!("opening history store {}", config.history_db.display()))?;
    let recorder = match MetricsStore::open_and_init(&config.metrics_db).await {
        Ok(metrics) => MetricsRecorder::new(metrics),
        Err(err) => {
            warn!(path = %config.metrics_db.display(), error = %err, "metrics disabled");
            MetricsRecorder::disabled()
        }
    };

    let targets = YamlTargetFile::new(&config.targets_path, config.filter.clone());
    let factory = HttpSessionFactory::new(config.http_session_config());

    Ok(Scheduler::new(
        SchedulerConfig::from(config),
        history,
        Arc::new(factory),
        Arc::new(targets),
    )
    .with_recorder(recorder)
    .with_liveness(LivenessFile::new(config.liveness_file.clone()))
    .with_cancel_flag(cancel))
}

/// Run the scheduler until a termination signal, or once in debug mode.
pub async fn run_from_config(config: &SyncConfig) -> Result<RunSummary> {
    let cancel = CancelFlag::new();
    let signals = install_signal_handlers(cancel.clone());
    let mut scheduler = scheduler_from_config(config, cancel).await?;
    let summary = scheduler.run().await;
    signals.abort();
    summary
}
