//! Environment-driven runtime settings and the hot-reloadable target list.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use mpw_adapters::{HttpSessionConfig, RateLimit, StoreDefinition};
use mpw_core::Target;
use serde::Deserialize;
use thiserror::Error;

use crate::detector::DetectorConfig;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub history_db: PathBuf,
    pub metrics_db: PathBuf,
    pub targets_path: PathBuf,
    pub interval: Duration,
    pub poll_unit: Duration,
    pub liveness_file: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    /// Per-store fetch burst; zero disables rate limiting.
    pub rate_limit_burst: u32,
    pub rate_limit_refill_ms: u64,
    pub failure_threshold: u32,
    pub dedup_hours: i64,
    pub session_retries: usize,
    pub web_port: u16,
    pub debug: bool,
    pub filter: TargetFilter,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds settings from any `MPW_*` key lookup; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let text = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        fn parsed<T: std::str::FromStr>(raw: Option<String>, default: T) -> T {
            raw.and_then(|v| v.parse().ok()).unwrap_or(default)
        }

        let liveness = text("MPW_LIVENESS_FILE", "./data/liveness");
        Self {
            history_db: PathBuf::from(text("MPW_HISTORY_DB", "./data/history.db")),
            metrics_db: PathBuf::from(text("MPW_METRICS_DB", "./data/metrics.db")),
            targets_path: PathBuf::from(text("MPW_TARGETS", "./targets.yaml")),
            interval: Duration::from_secs(parsed(lookup("MPW_INTERVAL_SECS"), 1800)),
            poll_unit: Duration::from_secs(parsed(lookup("MPW_POLL_SECS"), 10u64).max(1)),
            liveness_file: (!liveness.is_empty()).then(|| PathBuf::from(liveness)),
            user_agent: text("MPW_USER_AGENT", "mpw-bot/0.1"),
            http_timeout_secs: parsed(lookup("MPW_HTTP_TIMEOUT_SECS"), 20),
            rate_limit_burst: parsed(lookup("MPW_RATE_LIMIT_BURST"), 5),
            rate_limit_refill_ms: parsed(lookup("MPW_RATE_LIMIT_REFILL_MS"), 2000),
            failure_threshold: parsed(lookup("MPW_FAILURE_THRESHOLD"), 6),
            dedup_hours: parsed(lookup("MPW_DEDUP_HOURS"), 24),
            session_retries: parsed(lookup("MPW_SESSION_RETRIES"), 3),
            web_port: parsed(lookup("MPW_WEB_PORT"), 8000),
            debug: false,
            filter: TargetFilter::default(),
        }
    }

    /// Age past which the liveness marker counts as stale.
    pub fn max_liveness_age(&self) -> Duration {
        self.interval.saturating_add(self.poll_unit)
    }

    pub fn http_session_config(&self) -> HttpSessionConfig {
        HttpSessionConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            rate_limit: RateLimit::new(
                self.rate_limit_burst,
                Duration::from_millis(self.rate_limit_refill_ms),
            ),
            ..Default::default()
        }
    }

    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            dedup_window: chrono::Duration::try_hours(self.dedup_hours.max(0))
                .unwrap_or(chrono::Duration::MAX),
            ..Default::default()
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading target list {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("parsing target list {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// Stores and the ordered watch list, as maintained by the operator.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetList {
    #[serde(default)]
    pub stores: Vec<StoreDefinition>,
    #[serde(default)]
    pub items: Vec<Target>,
}

impl TargetList {
    pub fn parse(path: &Path, text: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }
}

/// Case-insensitive substring filters on item and store names.
#[derive(Debug, Clone, Default)]
pub struct TargetFilter {
    pub item: Option<String>,
    pub store: Option<String>,
}

impl TargetFilter {
    pub fn matches(&self, target: &Target) -> bool {
        let hit = |needle: &Option<String>, hay: &str| {
            needle
                .as_deref()
                .map_or(true, |n| hay.to_lowercase().contains(&n.to_lowercase()))
        };
        hit(&self.item, &target.name) && hit(&self.store, &target.store)
    }

    pub fn apply(&self, mut list: TargetList) -> TargetList {
        list.items.retain(|t| self.matches(t));
        list
    }
}

/// Source of the target list; called once per cycle, never cached.
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn load(&self) -> Result<TargetList, ConfigError>;
}

#[derive(Debug, Clone)]
pub struct YamlTargetFile {
    path: PathBuf,
    filter: TargetFilter,
}

impl YamlTargetFile {
    pub fn new(path: impl Into<PathBuf>, filter: TargetFilter) -> Self {
        Self {
            path: path.into(),
            filter,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl TargetSource for YamlTargetFile {
    async fn load(&self) -> Result<TargetList, ConfigError> {
        let text = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|source| ConfigError::Read {
                path: self.path.display().to_string(),
                source,
            })?;
        let list = TargetList::parse(&self.path, &text)?;
        Ok(self.filter.apply(list))
    }
}
