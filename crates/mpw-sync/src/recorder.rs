//! Best-effort session bookkeeping. Every metrics failure is logged and swallowed.

use chrono::Utc;
use mpw_core::{ExitReason, StoreCounts};
use mpw_storage::MetricsStore;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
struct ActiveSession {
    id: i64,
    counts: StoreCounts,
}

#[derive(Debug, Default)]
pub struct MetricsRecorder {
    store: Option<MetricsStore>,
    active: Option<ActiveSession>,
}

impl MetricsRecorder {
    pub fn new(store: MetricsStore) -> Self {
        Self {
            store: Some(store),
            active: None,
        }
    }

    /// A recorder that accepts every call and persists nothing.
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn session_id(&self) -> Option<i64> {
        self.active.map(|active| active.id)
    }

    pub fn counts(&self) -> StoreCounts {
        self.active.map(|active| active.counts).unwrap_or_default()
    }

    pub async fn start_session(&mut self) -> Option<i64> {
        let store = self.store.as_ref()?;
        match store.start_session(Utc::now()).await {
            Ok(id) => {
                debug!(session_id = id, "metrics session started");
                self.active = Some(ActiveSession {
                    id,
                    counts: StoreCounts::default(),
                });
                Some(id)
            }
            Err(err) => {
                warn!(error = %err, "cannot start metrics session");
                self.active = None;
                None
            }
        }
    }

    /// No-op without an active session.
    pub async fn end_session(&mut self, reason: ExitReason) {
        let Some(active) = self.active.take() else {
            return;
        };
        let Some(store) = &self.store else {
            return;
        };
        match store
            .end_session(active.id, reason, active.counts, Utc::now())
            .await
        {
            Ok(true) => debug!(session_id = active.id, %reason, "metrics session ended"),
            Ok(false) => debug!(session_id = active.id, "metrics session was already closed"),
            Err(err) => warn!(session_id = active.id, error = %err, "cannot end metrics session"),
        }
    }

    pub async fn record_item_result(&mut self, success: bool) {
        let Some(active) = self.active.as_mut() else {
            return;
        };
        active.counts.record(success);
        let (id, counts) = (active.id, active.counts);
        if let Some(store) = &self.store {
            if let Err(err) = store.update_session_counts(id, counts, Utc::now()).await {
                warn!(session_id = id, error = %err, "cannot update session counters");
            }
        }
    }

    pub async fn update_heartbeat(&self) {
        let (Some(store), Some(active)) = (&self.store, self.active) else {
            return;
        };
        if let Err(err) = store.heartbeat(active.id, Utc::now()).await {
            warn!(session_id = active.id, error = %err, "cannot write heartbeat");
        }
    }

    pub async fn start_store_crawl(&self, store_name: &str) -> Option<i64> {
        let (Some(store), Some(active)) = (&self.store, self.active) else {
            return None;
        };
        match store.start_store_crawl(active.id, store_name, Utc::now()).await {
            Ok(id) => Some(id),
            Err(err) => {
                warn!(store = store_name, error = %err, "cannot start store crawl stats");
                None
            }
        }
    }

    pub async fn end_store_crawl(&self, stats_id: Option<i64>, counts: StoreCounts) {
        let (Some(store), Some(stats_id)) = (&self.store, stats_id) else {
            return;
        };
        if let Err(err) = store.end_store_crawl(stats_id, counts, Utc::now()).await {
            warn!(stats_id, error = %err, "cannot end store crawl stats");
        }
    }

    pub async fn record_work_started(&self) {
        self.set_work_ended(None).await;
    }

    pub async fn record_work_ended(&self) {
        self.set_work_ended(Some(Utc::now())).await;
    }

    async fn set_work_ended(&self, at: Option<chrono::DateTime<Utc>>) {
        let (Some(store), Some(active)) = (&self.store, self.active) else {
            return;
        };
        if let Err(err) = store.set_work_ended(active.id, at).await {
            warn!(session_id = active.id, error = %err, "cannot record work phase");
        }
    }
}
