//! Core domain model for marketplace price watching.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod identity;

pub use identity::{resolve_item_key, IdentityError, ITEM_KEY_LEN};

pub const CRATE_NAME: &str = "mpw-core";

#[derive(Debug, Error)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// Tri-state stock reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    InStock,
    OutOfStock,
    Unknown,
}

text_enum!(StockStatus, "stock status", {
    InStock => "in_stock",
    OutOfStock => "out_of_stock",
    Unknown => "unknown",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlStatus {
    Success,
    Failure,
}

text_enum!(CrawlStatus, "crawl status", {
    Success => "success",
    Failure => "failure",
});

/// Closed set of notifiable transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    NewItem,
    PriceDecrease,
    Restock,
    Stockout,
}

text_enum!(EventType, "event type", {
    NewItem => "new_item",
    PriceDecrease => "price_decrease",
    Restock => "restock",
    Stockout => "stockout",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    Normal,
    Terminated,
}

text_enum!(ExitReason, "exit reason", {
    Normal => "normal",
    Terminated => "terminated",
});

/// A monitored product at a specific store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: i64,
    pub item_key: String,
    pub url: Option<String>,
    pub name: String,
    pub store: String,
    pub thumbnail_url: Option<String>,
    pub search_keyword: Option<String>,
    pub search_condition: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Write-side view of an item used by the history upsert.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ItemUpsert {
    pub item_key: String,
    pub name: String,
    pub store: String,
    pub url: Option<String>,
    pub thumbnail_url: Option<String>,
    pub search_keyword: Option<String>,
    pub search_condition: Option<String>,
}

/// One stored price/stock reading.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceObservation {
    pub id: i64,
    pub item_id: i64,
    pub price: Option<i64>,
    pub stock: StockStatus,
    pub crawl_status: CrawlStatus,
    pub observed_at: DateTime<Utc>,
}

impl PriceObservation {
    pub fn is_success(&self) -> bool {
        self.crawl_status == CrawlStatus::Success
    }

    /// Price only when the reading is an in-stock success.
    pub fn in_stock_price(&self) -> Option<i64> {
        if self.is_success() && self.stock == StockStatus::InStock {
            self.price
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewObservation {
    pub price: Option<i64>,
    pub stock: StockStatus,
    pub crawl_status: CrawlStatus,
    pub observed_at: DateTime<Utc>,
}

impl NewObservation {
    pub fn failure(observed_at: DateTime<Utc>) -> Self {
        Self {
            price: None,
            stock: StockStatus::Unknown,
            crawl_status: CrawlStatus::Failure,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PriceStats {
    pub lowest: Option<i64>,
    pub highest: Option<i64>,
    pub count: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub item_id: i64,
    pub event_type: EventType,
    pub price: Option<i64>,
    pub old_price: Option<i64>,
    pub threshold_days: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub notified: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NewEvent {
    pub item_id: i64,
    pub event_type: EventType,
    pub price: Option<i64>,
    pub old_price: Option<i64>,
    pub threshold_days: Option<u32>,
    pub created_at: DateTime<Utc>,
}

/// One scheduling cycle as persisted by the metrics store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub exit_reason: Option<ExitReason>,
    pub total_items: i64,
    pub success_items: i64,
    pub failed_items: i64,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    pub work_ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreCrawlStat {
    pub id: i64,
    pub session_id: i64,
    pub store_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub item_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoreCounts {
    pub items: i64,
    pub success: i64,
    pub failed: i64,
}

impl StoreCounts {
    pub fn record(&mut self, success: bool) {
        self.items += 1;
        if success {
            self.success += 1;
        } else {
            self.failed += 1;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceRange {
    pub min: Option<i64>,
    pub max: Option<i64>,
}

impl PriceRange {
    pub fn contains(&self, price: i64) -> bool {
        self.min.map_or(true, |min| price >= min) && self.max.map_or(true, |max| price <= max)
    }
}

/// Baseline used to classify a price decrease for one target.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "baseline", rename_all = "snake_case")]
pub enum PriceDropPolicy {
    /// Compare against the previous in-stock price.
    #[default]
    Last,
    /// Compare against the lowest in-stock price of each trailing window, widest first.
    Window { days: Vec<u32> },
}

/// One watch target from the operator-maintained list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub store: String,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub search_keyword: Option<String>,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub exclude_keyword: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub affiliate_id: Option<String>,
    #[serde(default)]
    pub price_drop: PriceDropPolicy,
}

/// Search filters persisted alongside keyword-identity items. Not part of the key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchCondition {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_range: Option<PriceRange>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exclude_keyword: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl Target {
    pub fn is_keyword_target(&self) -> bool {
        self.search_keyword
            .as_deref()
            .is_some_and(|kw| !kw.trim().is_empty())
    }

    /// Serialized filter set for keyword targets; `None` for URL targets.
    pub fn search_condition(&self) -> Option<String> {
        if !self.is_keyword_target() {
            return None;
        }
        let condition = SearchCondition {
            price_range: self.price_range,
            exclude_keyword: self.exclude_keyword.clone(),
            condition: self.condition.clone(),
        };
        serde_json::to_string(&condition).ok()
    }
}

/// Normalized acquisition result handed back by an adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckResult {
    pub price: Option<i64>,
    pub stock: StockStatus,
    pub crawl_status: CrawlStatus,
    pub thumbnail_url: Option<String>,
    pub resolved_url: Option<String>,
}

impl CheckResult {
    pub fn in_stock(price: i64) -> Self {
        Self {
            price: Some(price),
            stock: StockStatus::InStock,
            crawl_status: CrawlStatus::Success,
            thumbnail_url: None,
            resolved_url: None,
        }
    }

    pub fn out_of_stock() -> Self {
        Self {
            price: None,
            stock: StockStatus::OutOfStock,
            crawl_status: CrawlStatus::Success,
            thumbnail_url: None,
            resolved_url: None,
        }
    }

    pub fn failure() -> Self {
        Self {
            price: None,
            stock: StockStatus::Unknown,
            crawl_status: CrawlStatus::Failure,
            thumbnail_url: None,
            resolved_url: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.crawl_status == CrawlStatus::Success
    }

    pub fn observation(&self, observed_at: DateTime<Utc>) -> NewObservation {
        NewObservation {
            price: self.price,
            stock: self.stock,
            crawl_status: self.crawl_status,
            observed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_enums_parse_their_own_output() {
        for stock in [StockStatus::InStock, StockStatus::OutOfStock, StockStatus::Unknown] {
            assert_eq!(stock.as_str().parse::<StockStatus>().unwrap(), stock);
        }
        assert_eq!("price_decrease".parse::<EventType>().unwrap(), EventType::PriceDecrease);
        assert!("sold".parse::<StockStatus>().is_err());
    }

    #[test]
    fn price_range_bounds_are_inclusive_and_optional() {
        let range = PriceRange { min: Some(100), max: None };
        assert!(range.contains(100));
        assert!(range.contains(1_000_000));
        assert!(!range.contains(99));
    }

    #[test]
    fn url_targets_have_no_search_condition() {
        let target: Target = parse_target(
            r#"{"name":"Lens","store":"shop","url":"https://shop.example/p/1"}"#,
        );
        assert_eq!(target.price_drop, PriceDropPolicy::Last);
        assert!(target.search_condition().is_none());
    }

    #[test]
    fn keyword_targets_persist_filters() {
        let target: Target = parse_target(
            r#"{"name":"Camera","store":"flea","search_keyword":"x100v","price_range":{"min":1000,"max":90000},"price_drop":{"baseline":"window","days":[30,7]}}"#,
        );
        let cond = target.search_condition().unwrap();
        assert!(cond.contains("\"max\":90000"));
        assert_eq!(target.price_drop, PriceDropPolicy::Window { days: vec![30, 7] });
    }

    fn parse_target(json: &str) -> Target {
        serde_json::from_str(json).unwrap()
    }
}
