//! Classifies each new observation against history into at most one event.

use chrono::{DateTime, Duration, Utc};
use mpw_core::{Event, EventType, NewEvent, PriceDropPolicy, PriceObservation, StockStatus};
use mpw_storage::{HistoryStore, StoreError};
use tracing::{debug, info};

#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Same-type events for an item inside this window are suppressed.
    pub dedup_window: Duration,
    pub emit_stockout: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            dedup_window: Duration::hours(24),
            emit_stockout: true,
        }
    }
}

/// Start of a trailing window ending at `end`; unbounded when it underflows.
pub(crate) fn window_start(end: DateTime<Utc>, length: Option<Duration>) -> DateTime<Utc> {
    length
        .and_then(|length| end.checked_sub_signed(length))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Event candidate before deduplication.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    event_type: EventType,
    price: Option<i64>,
    old_price: Option<i64>,
    threshold_days: Option<u32>,
}

#[derive(Debug, Clone)]
pub struct EventDetector {
    history: HistoryStore,
    config: DetectorConfig,
}

impl EventDetector {
    pub fn new(history: HistoryStore, config: DetectorConfig) -> Self {
        Self { history, config }
    }

    pub fn config(&self) -> DetectorConfig {
        self.config
    }

    /// Evaluate an observation that has already been appended to history.
    ///
    /// Failed crawls never produce an event. The comparison baseline is the
    /// latest successful observation written before `current`.
    pub async fn evaluate(
        &self,
        current: &PriceObservation,
        policy: &PriceDropPolicy,
    ) -> Result<Option<Event>, StoreError> {
        if !current.is_success() {
            return Ok(None);
        }

        let previous = self
            .history
            .latest_success_before(current.item_id, current.id)
            .await?;

        let candidate = match previous {
            None => Some(Candidate {
                event_type: EventType::NewItem,
                price: current.in_stock_price(),
                old_price: None,
                threshold_days: None,
            }),
            Some(previous) => self.transition(&previous, current, policy).await?,
        };

        let Some(candidate) = candidate else {
            return Ok(None);
        };

        let since = window_start(current.observed_at, Some(self.config.dedup_window));
        if self
            .history
            .has_event_since(current.item_id, candidate.event_type, since)
            .await?
        {
            debug!(
                item_id = current.item_id,
                event_type = %candidate.event_type,
                "suppressed duplicate event"
            );
            return Ok(None);
        }

        let new_event = NewEvent {
            item_id: current.item_id,
            event_type: candidate.event_type,
            price: candidate.price,
            old_price: candidate.old_price,
            threshold_days: candidate.threshold_days,
            created_at: current.observed_at,
        };
        let id = self.history.insert_event(&new_event).await?;
        info!(
            item_id = current.item_id,
            event_type = %candidate.event_type,
            price = ?candidate.price,
            old_price = ?candidate.old_price,
            "event recorded"
        );

        Ok(Some(Event {
            id,
            item_id: new_event.item_id,
            event_type: new_event.event_type,
            price: new_event.price,
            old_price: new_event.old_price,
            threshold_days: new_event.threshold_days,
            created_at: new_event.created_at,
            notified: false,
        }))
    }

    async fn transition(
        &self,
        previous: &PriceObservation,
        current: &PriceObservation,
        policy: &PriceDropPolicy,
    ) -> Result<Option<Candidate>, StoreError> {
        match (previous.stock, current.stock) {
            (StockStatus::OutOfStock, StockStatus::InStock) => Ok(Some(Candidate {
                event_type: EventType::Restock,
                price: current.price,
                old_price: None,
                threshold_days: None,
            })),
            (StockStatus::InStock, StockStatus::OutOfStock) if self.config.emit_stockout => {
                Ok(Some(Candidate {
                    event_type: EventType::Stockout,
                    price: None,
                    old_price: previous.price,
                    threshold_days: None,
                }))
            }
            (StockStatus::InStock, StockStatus::InStock) => {
                let (Some(price), Some(last)) = (current.price, previous.price) else {
                    return Ok(None);
                };
                self.price_drop(current, price, last, policy).await
            }
            _ => Ok(None),
        }
    }

    async fn price_drop(
        &self,
        current: &PriceObservation,
        price: i64,
        last: i64,
        policy: &PriceDropPolicy,
    ) -> Result<Option<Candidate>, StoreError> {
        match policy {
            PriceDropPolicy::Last => Ok((price < last).then_some(Candidate {
                event_type: EventType::PriceDecrease,
                price: Some(price),
                old_price: Some(last),
                threshold_days: None,
            })),
            PriceDropPolicy::Window { days } => {
                let mut windows = days.clone();
                windows.sort_unstable_by(|a, b| b.cmp(a));
                windows.dedup();
                for window in windows {
                    let since = window_start(
                        current.observed_at,
                        Duration::try_days(i64::from(window)),
                    );
                    let lowest = self
                        .history
                        .lowest_in_stock_since(current.item_id, since, current.id)
                        .await?;
                    if let Some(lowest) = lowest.filter(|lowest| price < *lowest) {
                        return Ok(Some(Candidate {
                            event_type: EventType::PriceDecrease,
                            price: Some(price),
                            old_price: Some(lowest),
                            threshold_days: Some(window),
                        }));
                    }
                }
                Ok(None)
            }
        }
    }
}
