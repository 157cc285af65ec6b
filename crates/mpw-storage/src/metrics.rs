//! Scheduler sessions, per-store counters and heartbeats.

use std::path::Path;

use chrono::{DateTime, Utc};
use mpw_core::{ExitReason, Session, StoreCounts, StoreCrawlStat};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use crate::schema::{self, METRICS_MIGRATIONS, METRICS_TABLES};
use crate::{from_millis, opt_from_millis, parse_text, to_millis, StoreResult};

const SESSION_COLUMNS: &str = "id, started_at, ended_at, exit_reason, total_items, success_items, \
                               failed_items, last_heartbeat_at, work_ended_at";
const STORE_STAT_COLUMNS: &str =
    "id, session_id, store_name, started_at, ended_at, item_count, success_count, failed_count";

#[derive(Debug, Clone)]
pub struct MetricsStore {
    pool: SqlitePool,
}

impl MetricsStore {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let pool = crate::open_pool(path.as_ref()).await?;
        Ok(Self { pool })
    }

    pub async fn open_and_init(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self::open(path).await?;
        store.init().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn init(&self) -> StoreResult<usize> {
        schema::apply(&self.pool, METRICS_TABLES, METRICS_MIGRATIONS).await
    }

    pub async fn start_session(&self, now: DateTime<Utc>) -> StoreResult<i64> {
        let now = to_millis(now);
        let result = sqlx::query("INSERT INTO sessions (started_at, last_heartbeat_at) VALUES (?, ?)")
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn update_session_counts(
        &self,
        session_id: i64,
        counts: StoreCounts,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE sessions SET total_items = ?, success_items = ?, failed_items = ?, last_heartbeat_at = ? WHERE id = ?",
        )
        .bind(counts.items)
        .bind(counts.success)
        .bind(counts.failed)
        .bind(to_millis(now))
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn heartbeat(&self, session_id: i64, now: DateTime<Utc>) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET last_heartbeat_at = ? WHERE id = ?")
            .bind(to_millis(now))
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// `None` clears the marker when a new working phase begins.
    pub async fn set_work_ended(
        &self,
        session_id: i64,
        at: Option<DateTime<Utc>>,
    ) -> StoreResult<()> {
        sqlx::query("UPDATE sessions SET work_ended_at = ? WHERE id = ?")
            .bind(at.map(to_millis))
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Close a session. Already-closed sessions are left untouched.
    pub async fn end_session(
        &self,
        session_id: i64,
        exit_reason: ExitReason,
        counts: StoreCounts,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let now = to_millis(now);
        let result = sqlx::query(
            r#"
UPDATE sessions
SET ended_at = ?, exit_reason = ?, total_items = ?, success_items = ?, failed_items = ?, last_heartbeat_at = ?
WHERE id = ? AND ended_at IS NULL
"#,
        )
        .bind(now)
        .bind(exit_reason.as_str())
        .bind(counts.items)
        .bind(counts.success)
        .bind(counts.failed)
        .bind(now)
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn start_store_crawl(
        &self,
        session_id: i64,
        store_name: &str,
        now: DateTime<Utc>,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO store_stats (session_id, store_name, started_at) VALUES (?, ?, ?)",
        )
        .bind(session_id)
        .bind(store_name)
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn end_store_crawl(
        &self,
        stats_id: i64,
        counts: StoreCounts,
        now: DateTime<Utc>,
    ) -> StoreResult<()> {
        sqlx::query(
            "UPDATE store_stats SET ended_at = ?, item_count = ?, success_count = ?, failed_count = ? WHERE id = ?",
        )
        .bind(to_millis(now))
        .bind(counts.items)
        .bind(counts.success)
        .bind(counts.failed)
        .bind(stats_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn session(&self, session_id: i64) -> StoreResult<Option<Session>> {
        let row = sqlx::query(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?"))
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    pub async fn latest_session(&self) -> StoreResult<Option<Session>> {
        let row = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY id DESC LIMIT 1"
        ))
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| session_from_row(&r)).transpose()
    }

    pub async fn recent_sessions(&self, limit: i64) -> StoreResult<Vec<Session>> {
        let rows = sqlx::query(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions ORDER BY id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(session_from_row).collect()
    }

    pub async fn store_stats(&self, session_id: i64) -> StoreResult<Vec<StoreCrawlStat>> {
        let rows = sqlx::query(&format!(
            "SELECT {STORE_STAT_COLUMNS} FROM store_stats WHERE session_id = ? ORDER BY id"
        ))
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(store_stat_from_row).collect()
    }

    pub async fn last_heartbeat(&self) -> StoreResult<Option<DateTime<Utc>>> {
        let millis: Option<i64> = sqlx::query_scalar("SELECT MAX(last_heartbeat_at) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        opt_from_millis("sessions", millis)
    }
}

fn session_from_row(row: &SqliteRow) -> StoreResult<Session> {
    let exit_reason: Option<String> = row.try_get("exit_reason")?;
    Ok(Session {
        id: row.try_get("id")?,
        started_at: from_millis("sessions", row.try_get("started_at")?)?,
        ended_at: opt_from_millis("sessions", row.try_get("ended_at")?)?,
        exit_reason: exit_reason
            .as_deref()
            .map(|raw| parse_text::<ExitReason>("sessions", raw))
            .transpose()?,
        total_items: row.try_get("total_items")?,
        success_items: row.try_get("success_items")?,
        failed_items: row.try_get("failed_items")?,
        last_heartbeat_at: opt_from_millis("sessions", row.try_get("last_heartbeat_at")?)?,
        work_ended_at: opt_from_millis("sessions", row.try_get("work_ended_at")?)?,
    })
}

fn store_stat_from_row(row: &SqliteRow) -> StoreResult<StoreCrawlStat> {
    Ok(StoreCrawlStat {
        id: row.try_get("id")?,
        session_id: row.try_get("session_id")?,
        store_name: row.try_get("store_name")?,
        started_at: from_millis("store_stats", row.try_get("started_at")?)?,
        ended_at: opt_from_millis("store_stats", row.try_get("ended_at")?)?,
        item_count: row.try_get("item_count")?,
        success_count: row.try_get("success_count")?,
        failed_count: row.try_get("failed_count")?,
    })
}
