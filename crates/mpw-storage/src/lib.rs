//! Embedded SQLite stores: price history and crawl metrics.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

pub mod history;
pub mod metrics;
pub mod schema;

pub use history::HistoryStore;
pub use metrics::MetricsStore;

pub const CRATE_NAME: &str = "mpw-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("creating store directory {path}: {source}")]
    Directory {
        path: String,
        source: std::io::Error,
    },
    #[error("corrupt row in {table}: {detail}")]
    CorruptRow { table: &'static str, detail: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Connect to an on-disk SQLite file, creating it and its directory if needed.
///
/// Each query checks a connection out of the pool for the duration of one
/// statement or transaction, so slow callers never pin a connection.
pub(crate) async fn open_pool(path: &Path) -> StoreResult<SqlitePool> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|source| StoreError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
    }

    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(4)
        .connect_with(options)
        .await?;
    Ok(pool)
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(table: &'static str, millis: i64) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| StoreError::CorruptRow {
        table,
        detail: format!("timestamp out of range: {millis}"),
    })
}

pub(crate) fn opt_from_millis(
    table: &'static str,
    millis: Option<i64>,
) -> StoreResult<Option<DateTime<Utc>>> {
    millis.map(|m| from_millis(table, m)).transpose()
}

pub(crate) fn parse_text<T>(table: &'static str, raw: &str) -> StoreResult<T>
where
    T: FromStr<Err = mpw_core::ParseEnumError>,
{
    raw.parse().map_err(|err: mpw_core::ParseEnumError| StoreError::CorruptRow {
        table,
        detail: err.to_string(),
    })
}
