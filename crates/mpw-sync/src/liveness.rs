//! Liveness file written by the scheduler and read by the health check.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::warn;

#[derive(Debug, Clone, Default)]
pub struct LivenessFile {
    path: Option<PathBuf>,
}

impl LivenessFile {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self { path }
    }

    pub fn disabled() -> Self {
        Self { path: None }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Best effort; a failed write only logs.
    pub async fn touch(&self, now: DateTime<Utc>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                warn!(path = %path.display(), error = %err, "cannot create liveness directory");
                return;
            }
        }
        if let Err(err) = tokio::fs::write(path, now.to_rfc3339()).await {
            warn!(path = %path.display(), error = %err, "cannot write liveness file");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LivenessStatus {
    Fresh { age: Duration },
    Stale { age: Duration },
    Missing,
}

impl LivenessStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, Self::Fresh { .. })
    }
}

pub async fn read_liveness(path: &Path) -> Result<Option<DateTime<Utc>>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("reading liveness file {}", path.display()))
        }
    };
    let stamp = DateTime::parse_from_rfc3339(raw.trim())
        .with_context(|| format!("parsing liveness timestamp in {}", path.display()))?;
    Ok(Some(stamp.with_timezone(&Utc)))
}

/// Healthy when the file was touched within `max_age` of `now`.
pub async fn check_liveness(
    path: &Path,
    max_age: Duration,
    now: DateTime<Utc>,
) -> Result<LivenessStatus> {
    let Some(stamp) = read_liveness(path).await? else {
        return Ok(LivenessStatus::Missing);
    };
    let age = (now - stamp).to_std().unwrap_or(Duration::ZERO);
    Ok(if age <= max_age {
        LivenessStatus::Fresh { age }
    } else {
        LivenessStatus::Stale { age }
    })
}
