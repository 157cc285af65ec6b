//! Item identity, append-only price history and the event log.

use std::path::Path;

use chrono::{DateTime, Utc};
use mpw_core::{
    Event, EventType, Item, ItemUpsert, NewEvent, NewObservation, PriceObservation, PriceStats,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::schema::{self, HISTORY_MIGRATIONS, HISTORY_TABLES};
use crate::{from_millis, parse_text, to_millis, StoreResult};

const ITEM_COLUMNS: &str = "id, item_key, url, name, store, thumbnail_url, search_keyword, \
                            search_condition, created_at, updated_at";
const OBSERVATION_COLUMNS: &str = "id, item_id, price, stock, crawl_status, observed_at";
const EVENT_COLUMNS: &str =
    "id, item_id, event_type, price, old_price, threshold_days, created_at, notified";

#[derive(Debug, Clone)]
pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let pool = crate::open_pool(path.as_ref()).await?;
        Ok(Self { pool })
    }

    /// Open and bring the schema up to date.
    pub async fn open_and_init(path: impl AsRef<Path>) -> StoreResult<Self> {
        let store = Self::open(path).await?;
        store.init().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Idempotent schema creation plus additive migrations. Returns the number
    /// of columns added.
    pub async fn init(&self) -> StoreResult<usize> {
        schema::apply(&self.pool, HISTORY_TABLES, HISTORY_MIGRATIONS).await
    }

    /// Insert the item on first sight, otherwise refresh its mutable fields.
    ///
    /// `item_key` is never rewritten. `url`, `thumbnail_url` and
    /// `search_condition` keep their stored value when the new one is absent.
    pub async fn upsert_item(&self, item: &ItemUpsert, now: DateTime<Utc>) -> StoreResult<i64> {
        let now = to_millis(now);
        let result = sqlx::query(
            r#"
INSERT INTO items (item_key, url, name, store, thumbnail_url, search_keyword, search_condition, created_at, updated_at)
VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(item_key) DO UPDATE
SET name = excluded.name,
    url = COALESCE(excluded.url, items.url),
    thumbnail_url = COALESCE(excluded.thumbnail_url, items.thumbnail_url),
    search_condition = COALESCE(excluded.search_condition, items.search_condition),
    updated_at = excluded.updated_at
"#,
        )
        .bind(&item.item_key)
        .bind(&item.url)
        .bind(&item.name)
        .bind(&item.store)
        .bind(&item.thumbnail_url)
        .bind(&item.search_keyword)
        .bind(&item.search_condition)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let id: i64 = sqlx::query_scalar("SELECT id FROM items WHERE item_key = ?")
            .bind(&item.item_key)
            .fetch_one(&self.pool)
            .await?;
        debug!(item_id = id, item_key = %item.item_key, rows = result.rows_affected(), "upserted item");
        Ok(id)
    }

    pub async fn item(&self, item_id: i64) -> StoreResult<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE id = ?"))
            .bind(item_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| item_from_row(&r)).transpose()
    }

    pub async fn item_by_key(&self, item_key: &str) -> StoreResult<Option<Item>> {
        let row = sqlx::query(&format!("SELECT {ITEM_COLUMNS} FROM items WHERE item_key = ?"))
            .bind(item_key)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| item_from_row(&r)).transpose()
    }

    pub async fn list_items(&self) -> StoreResult<Vec<Item>> {
        let rows = sqlx::query(&format!(
            "SELECT {ITEM_COLUMNS} FROM items ORDER BY store, name, id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(item_from_row).collect()
    }

    /// Single-statement insert; the returned id is the new row.
    pub async fn append_observation(
        &self,
        item_id: i64,
        observation: &NewObservation,
    ) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO price_history (item_id, price, stock, crawl_status, observed_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(item_id)
        .bind(observation.price)
        .bind(observation.stock.as_str())
        .bind(observation.crawl_status.as_str())
        .bind(to_millis(observation.observed_at))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn observation(&self, observation_id: i64) -> StoreResult<Option<PriceObservation>> {
        let row = sqlx::query(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM price_history WHERE id = ?"
        ))
        .bind(observation_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| observation_from_row(&r)).transpose()
    }

    pub async fn latest(&self, item_id: i64) -> StoreResult<Option<PriceObservation>> {
        let row = sqlx::query(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM price_history WHERE item_id = ? ORDER BY observed_at DESC, id DESC LIMIT 1"
        ))
        .bind(item_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| observation_from_row(&r)).transpose()
    }

    /// Latest successful observation written before `before_id`.
    pub async fn latest_success_before(
        &self,
        item_id: i64,
        before_id: i64,
    ) -> StoreResult<Option<PriceObservation>> {
        let row = sqlx::query(&format!(
            r#"
SELECT {OBSERVATION_COLUMNS} FROM price_history
WHERE item_id = ? AND id < ? AND crawl_status = 'success'
ORDER BY observed_at DESC, id DESC
LIMIT 1
"#
        ))
        .bind(item_id)
        .bind(before_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| observation_from_row(&r)).transpose()
    }

    pub async fn lowest(&self, item_id: i64) -> StoreResult<Option<i64>> {
        let lowest: Option<i64> =
            sqlx::query_scalar("SELECT MIN(price) FROM price_history WHERE item_id = ? AND price IS NOT NULL")
                .bind(item_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(lowest)
    }

    /// Lowest in-stock price among successful rows observed in `[since, ...)`
    /// and written before `before_id`.
    pub async fn lowest_in_stock_since(
        &self,
        item_id: i64,
        since: DateTime<Utc>,
        before_id: i64,
    ) -> StoreResult<Option<i64>> {
        let lowest: Option<i64> = sqlx::query_scalar(
            r#"
SELECT MIN(price) FROM price_history
WHERE item_id = ? AND id < ? AND observed_at >= ?
  AND crawl_status = 'success' AND stock = 'in_stock' AND price IS NOT NULL
"#,
        )
        .bind(item_id)
        .bind(before_id)
        .bind(to_millis(since))
        .fetch_one(&self.pool)
        .await?;
        Ok(lowest)
    }

    /// `count` covers every row; `lowest`/`highest` skip rows without a price.
    pub async fn stats(&self, item_id: i64) -> StoreResult<PriceStats> {
        let row = sqlx::query(
            "SELECT MIN(price) AS lowest, MAX(price) AS highest, COUNT(*) AS count FROM price_history WHERE item_id = ?",
        )
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(PriceStats {
            lowest: row.try_get("lowest")?,
            highest: row.try_get("highest")?,
            count: row.try_get("count")?,
        })
    }

    pub async fn history(
        &self,
        item_id: i64,
        since: Option<DateTime<Utc>>,
    ) -> StoreResult<Vec<PriceObservation>> {
        let rows = sqlx::query(&format!(
            "SELECT {OBSERVATION_COLUMNS} FROM price_history WHERE item_id = ? AND observed_at >= ? ORDER BY observed_at, id"
        ))
        .bind(item_id)
        .bind(since.map(to_millis).unwrap_or(i64::MIN))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(observation_from_row).collect()
    }

    /// Failed observations written after the most recent success.
    pub async fn consecutive_failures(&self, item_id: i64) -> StoreResult<u32> {
        let count: i64 = sqlx::query_scalar(
            r#"
SELECT COUNT(*) FROM price_history
WHERE item_id = ?1 AND crawl_status = 'failure'
  AND id > COALESCE((SELECT MAX(id) FROM price_history WHERE item_id = ?1 AND crawl_status = 'success'), 0)
"#,
        )
        .bind(item_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    pub async fn insert_event(&self, event: &NewEvent) -> StoreResult<i64> {
        let result = sqlx::query(
            "INSERT INTO events (item_id, event_type, price, old_price, threshold_days, created_at, notified) VALUES (?, ?, ?, ?, ?, ?, 0)",
        )
        .bind(event.item_id)
        .bind(event.event_type.as_str())
        .bind(event.price)
        .bind(event.old_price)
        .bind(event.threshold_days.map(i64::from))
        .bind(to_millis(event.created_at))
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn event(&self, event_id: i64) -> StoreResult<Option<Event>> {
        let row = sqlx::query(&format!("SELECT {EVENT_COLUMNS} FROM events WHERE id = ?"))
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| event_from_row(&r)).transpose()
    }

    /// Whether an event of this type was recorded for the item at or after `since`.
    pub async fn has_event_since(
        &self,
        item_id: i64,
        event_type: EventType,
        since: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let found: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM events WHERE item_id = ? AND event_type = ? AND created_at >= ? LIMIT 1",
        )
        .bind(item_id)
        .bind(event_type.as_str())
        .bind(to_millis(since))
        .fetch_optional(&self.pool)
        .await?;
        Ok(found.is_some())
    }

    pub async fn events_for_item(&self, item_id: i64) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE item_id = ? ORDER BY created_at, id"
        ))
        .bind(item_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    pub async fn recent_events(&self, limit: i64) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events ORDER BY created_at DESC, id DESC LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Oldest-first events not yet delivered by the notifier.
    pub async fn pending_events(&self, limit: i64) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events WHERE notified = 0 ORDER BY created_at, id LIMIT ?"
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(event_from_row).collect()
    }

    /// Flip `notified` to true. Returns false if the event was already notified or missing.
    pub async fn mark_notified(&self, event_id: i64) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE events SET notified = 1 WHERE id = ? AND notified = 0")
            .bind(event_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }
}

fn item_from_row(row: &SqliteRow) -> StoreResult<Item> {
    Ok(Item {
        id: row.try_get("id")?,
        item_key: row.try_get("item_key")?,
        url: row.try_get("url")?,
        name: row.try_get("name")?,
        store: row.try_get("store")?,
        thumbnail_url: row.try_get("thumbnail_url")?,
        search_keyword: row.try_get("search_keyword")?,
        search_condition: row.try_get("search_condition")?,
        created_at: from_millis("items", row.try_get("created_at")?)?,
        updated_at: from_millis("items", row.try_get("updated_at")?)?,
    })
}

fn observation_from_row(row: &SqliteRow) -> StoreResult<PriceObservation> {
    let stock: String = row.try_get("stock")?;
    let crawl_status: String = row.try_get("crawl_status")?;
    Ok(PriceObservation {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        price: row.try_get("price")?,
        stock: parse_text("price_history", &stock)?,
        crawl_status: parse_text("price_history", &crawl_status)?,
        observed_at: from_millis("price_history", row.try_get("observed_at")?)?,
    })
}

fn event_from_row(row: &SqliteRow) -> StoreResult<Event> {
    let event_type: String = row.try_get("event_type")?;
    let threshold_days: Option<i64> = row.try_get("threshold_days")?;
    Ok(Event {
        id: row.try_get("id")?,
        item_id: row.try_get("item_id")?,
        event_type: parse_text("events", &event_type)?,
        price: row.try_get("price")?,
        old_price: row.try_get("old_price")?,
        threshold_days: threshold_days.and_then(|d| u32::try_from(d).ok()),
        created_at: from_millis("events", row.try_get("created_at")?)?,
        notified: row.try_get::<i64, _>("notified")? != 0,
    })
}
