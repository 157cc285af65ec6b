//! Schema creation and additive column migrations.
//!
//! Migrations only ever add nullable (or defaulted) columns. Each one is
//! guarded by a `pragma_table_info` lookup so `init` can run against a
//! populated store any number of times.

use sqlx::SqlitePool;
use tracing::info;

use crate::StoreResult;

#[derive(Debug, Clone, Copy)]
pub struct ColumnMigration {
    pub table: &'static str,
    pub column: &'static str,
    pub definition: &'static str,
}

pub const HISTORY_TABLES: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS items (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_key TEXT NOT NULL UNIQUE,
    url TEXT,
    name TEXT NOT NULL,
    store TEXT NOT NULL,
    thumbnail_url TEXT,
    search_keyword TEXT,
    search_condition TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL REFERENCES items(id),
    price INTEGER,
    stock TEXT NOT NULL,
    crawl_status TEXT NOT NULL DEFAULT 'success',
    observed_at INTEGER NOT NULL
)
"#,
    "CREATE INDEX IF NOT EXISTS idx_price_history_item_time ON price_history (item_id, observed_at)",
    r#"
CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id INTEGER NOT NULL REFERENCES items(id),
    event_type TEXT NOT NULL,
    price INTEGER,
    old_price INTEGER,
    threshold_days INTEGER,
    created_at INTEGER NOT NULL,
    notified INTEGER NOT NULL DEFAULT 0
)
"#,
    "CREATE INDEX IF NOT EXISTS idx_events_item_type_time ON events (item_id, event_type, created_at)",
    "CREATE INDEX IF NOT EXISTS idx_events_pending ON events (notified, created_at)",
];

/// Columns added after the first release of the history store.
pub const HISTORY_MIGRATIONS: &[ColumnMigration] = &[
    ColumnMigration {
        table: "items",
        column: "search_keyword",
        definition: "TEXT",
    },
    ColumnMigration {
        table: "items",
        column: "search_condition",
        definition: "TEXT",
    },
    ColumnMigration {
        table: "price_history",
        column: "crawl_status",
        definition: "TEXT NOT NULL DEFAULT 'success'",
    },
    ColumnMigration {
        table: "events",
        column: "threshold_days",
        definition: "INTEGER",
    },
];

pub const METRICS_TABLES: &[&str] = &[
    r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    exit_reason TEXT,
    total_items INTEGER NOT NULL DEFAULT 0,
    success_items INTEGER NOT NULL DEFAULT 0,
    failed_items INTEGER NOT NULL DEFAULT 0,
    last_heartbeat_at INTEGER,
    work_ended_at INTEGER
)
"#,
    r#"
CREATE TABLE IF NOT EXISTS store_stats (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL,
    store_name TEXT NOT NULL,
    started_at INTEGER NOT NULL,
    ended_at INTEGER,
    item_count INTEGER NOT NULL DEFAULT 0,
    success_count INTEGER NOT NULL DEFAULT 0,
    failed_count INTEGER NOT NULL DEFAULT 0
)
"#,
    "CREATE INDEX IF NOT EXISTS idx_store_stats_session ON store_stats (session_id)",
];

pub const METRICS_MIGRATIONS: &[ColumnMigration] = &[
    ColumnMigration {
        table: "sessions",
        column: "last_heartbeat_at",
        definition: "INTEGER",
    },
    ColumnMigration {
        table: "sessions",
        column: "work_ended_at",
        definition: "INTEGER",
    },
];

pub async fn column_exists(pool: &SqlitePool, table: &str, column: &str) -> StoreResult<bool> {
    let found: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM pragma_table_info(?) WHERE name = ?")
            .bind(table)
            .bind(column)
            .fetch_one(pool)
            .await?;
    Ok(found > 0)
}

/// Create missing tables, then add any missing columns. Never drops or rewrites data.
pub async fn apply(
    pool: &SqlitePool,
    tables: &[&str],
    migrations: &[ColumnMigration],
) -> StoreResult<usize> {
    let mut tx = pool.begin().await?;
    for ddl in tables {
        sqlx::query(ddl).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    let mut applied = 0usize;
    for migration in migrations {
        if column_exists(pool, migration.table, migration.column).await? {
            continue;
        }
        let ddl = format!(
            "ALTER TABLE {} ADD COLUMN {} {}",
            migration.table, migration.column, migration.definition
        );
        sqlx::query(&ddl).execute(pool).await?;
        info!(
            table = migration.table,
            column = migration.column,
            "applied additive migration"
        );
        applied += 1;
    }
    Ok(applied)
}
