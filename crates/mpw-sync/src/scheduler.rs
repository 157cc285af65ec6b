//! The crawl loop: one working pass per cycle, then a cancellable sleep.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use mpw_adapters::{
    AcquisitionAdapter, AcquisitionSession, AdapterError, AdapterRegistry, SessionFactory,
};
use mpw_core::{
    CheckResult, EventType, ExitReason, ItemUpsert, PriceDropPolicy, StoreCounts, Target,
};
use mpw_storage::{HistoryStore, StoreError, StoreResult};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::{SyncConfig, TargetSource};
use crate::detector::{DetectorConfig, EventDetector};
use crate::failures::FailureCounter;
use crate::liveness::LivenessFile;
use crate::recorder::MetricsRecorder;

/// Shared shutdown flag. Setting it is the only effect of a termination signal.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Set `cancel` on Ctrl-C, or SIGTERM on unix.
pub fn install_signal_handlers(cancel: CancelFlag) -> JoinHandle<()> {
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("termination signal received");
        cancel.cancel();
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub poll_unit: Duration,
    /// One item per store, a single cycle, then exit.
    pub debug: bool,
    pub max_session_retries: usize,
    pub failure_threshold: u32,
    pub detector: DetectorConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1800),
            poll_unit: Duration::from_secs(10),
            debug: false,
            max_session_retries: 3,
            failure_threshold: 6,
            detector: DetectorConfig::default(),
        }
    }
}

impl From<&SyncConfig> for SchedulerConfig {
    fn from(config: &SyncConfig) -> Self {
        Self {
            interval: config.interval,
            poll_unit: config.poll_unit,
            debug: config.debug,
            max_session_retries: config.session_retries,
            failure_threshold: config.failure_threshold,
            detector: config.detector_config(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub session_id: Option<i64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub targets: usize,
    pub counts: StoreCounts,
    pub skipped: usize,
    pub events: Vec<EventType>,
    pub failing_keys: Vec<String>,
    pub cancelled: bool,
}

impl CycleReport {
    fn log(&self) {
        info!(
            session_id = ?self.session_id,
            targets = self.targets,
            success = self.counts.success,
            failed = self.counts.failed,
            skipped = self.skipped,
            events = self.events.len(),
            failing = self.failing_keys.len(),
            cancelled = self.cancelled,
            "cycle finished"
        );
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub cycles: usize,
    pub exit_reason: ExitReason,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Skipped,
    Checked {
        success: bool,
        event: Option<EventType>,
    },
}

/// Acquisition failed at the shared-session level and recreation ran out of budget.
#[derive(Debug)]
struct SessionExhausted(String);

pub struct Scheduler {
    config: SchedulerConfig,
    history: HistoryStore,
    detector: EventDetector,
    recorder: MetricsRecorder,
    liveness: LivenessFile,
    factory: Arc<dyn SessionFactory>,
    targets: Arc<dyn TargetSource>,
    extra_adapters: AdapterRegistry,
    session: Option<Arc<dyn AcquisitionSession>>,
    cancel: CancelFlag,
    failures: FailureCounter,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        history: HistoryStore,
        factory: Arc<dyn SessionFactory>,
        targets: Arc<dyn TargetSource>,
    ) -> Self {
        Self {
            detector: EventDetector::new(history.clone(), config.detector),
            failures: FailureCounter::new(config.failure_threshold),
            config,
            history,
            recorder: MetricsRecorder::disabled(),
            liveness: LivenessFile::disabled(),
            factory,
            targets,
            extra_adapters: AdapterRegistry::new(),
            session: None,
            cancel: CancelFlag::new(),
        }
    }

    pub fn with_recorder(mut self, recorder: MetricsRecorder) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_liveness(mut self, liveness: LivenessFile) -> Self {
        self.liveness = liveness;
        self
    }

    /// Adapters layered over the ones built from store definitions.
    pub fn with_adapters(mut self, adapters: AdapterRegistry) -> Self {
        self.extra_adapters = adapters;
        self
    }

    pub fn with_cancel_flag(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Consecutive failure streaks at or above the configured threshold.
    pub fn failing_keys(&self) -> Vec<String> {
        self.failures.over_threshold()
    }

    /// Drive cycles until cancelled, or once in debug mode.
    ///
    /// Only a failure to create the initial acquisition session is returned
    /// as an error; everything after that is logged and survived.
    pub async fn run(&mut self) -> Result<RunSummary> {
        info!(
            interval_secs = self.config.interval.as_secs(),
            poll_ms = self.config.poll_unit.as_millis() as u64,
            debug = self.config.debug,
            "scheduler initializing"
        );
        let session = self
            .factory
            .create()
            .await
            .context("creating the acquisition session")?;
        self.session = Some(session);

        let mut cycles = 0usize;
        let mut last_cycle = None;
        let exit_reason = loop {
            if self.cancel.is_cancelled() {
                break ExitReason::Terminated;
            }

            let cycle_start = Instant::now();
            self.recorder.start_session().await;
            self.recorder.record_work_started().await;

            match self.run_cycle().await {
                Ok(report) => {
                    report.log();
                    last_cycle = Some(report);
                }
                Err(err) => error!(error = %format!("{err:#}"), "cycle aborted"),
            }
            cycles += 1;

            self.recorder.record_work_ended().await;
            self.liveness.touch(Utc::now()).await;

            if self.cancel.is_cancelled() {
                self.recorder.end_session(ExitReason::Terminated).await;
                break ExitReason::Terminated;
            }
            if self.config.debug {
                self.recorder.end_session(ExitReason::Normal).await;
                break ExitReason::Normal;
            }

            if !self.sleep_until(cycle_start.checked_add(self.config.interval)).await {
                self.recorder.end_session(ExitReason::Terminated).await;
                break ExitReason::Terminated;
            }
            self.recorder.end_session(ExitReason::Normal).await;
        };

        self.close_session().await;
        info!(cycles, %exit_reason, "scheduler stopped");
        Ok(RunSummary {
            cycles,
            exit_reason,
            last_cycle,
        })
    }

    /// Sleep in `poll_unit` slices. Returns false when cancelled first.
    /// A `None` deadline never elapses.
    async fn sleep_until(&self, deadline: Option<Instant>) -> bool {
        loop {
            if self.cancel.is_cancelled() {
                return false;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return true;
                    }
                    self.config.poll_unit.min(deadline - now)
                }
                None => self.config.poll_unit,
            };
            tokio::time::sleep(slice).await;
            self.recorder.update_heartbeat().await;
            self.liveness.touch(Utc::now()).await;
        }
    }

    /// One working pass over the freshly loaded target list.
    pub async fn run_cycle(&mut self) -> Result<CycleReport> {
        let list = self.targets.load().await.context("loading the target list")?;
        let mut registry = AdapterRegistry::from_definitions(&list.stores);
        registry.merge(&self.extra_adapters);

        let targets = if self.config.debug {
            one_per_store(list.items)
        } else {
            list.items
        };

        let mut report = CycleReport {
            session_id: self.recorder.session_id(),
            started_at: Some(Utc::now()),
            targets: targets.len(),
            ..Default::default()
        };
        self.seed_failures(&registry, &targets).await;

        let mut store_phase: Option<(String, Option<i64>, StoreCounts)> = None;
        let mut aborted = None;
        for target in &targets {
            if self.cancel.is_cancelled() {
                info!("cancellation requested; stopping the working pass");
                report.cancelled = true;
                break;
            }

            if store_phase.as_ref().map_or(true, |(store, _, _)| store != &target.store) {
                if let Some((_, stats_id, counts)) = store_phase.take() {
                    self.recorder.end_store_crawl(stats_id, counts).await;
                }
                let stats_id = self.recorder.start_store_crawl(&target.store).await;
                store_phase = Some((target.store.clone(), stats_id, StoreCounts::default()));
            }

            match self.process_target(&registry, target).await {
                Ok(ItemOutcome::Skipped) => {
                    report.skipped += 1;
                    report.counts.record(false);
                    if let Some((_, _, counts)) = store_phase.as_mut() {
                        counts.record(false);
                    }
                    self.recorder.record_item_result(false).await;
                }
                Ok(ItemOutcome::Checked { success, event }) => {
                    report.counts.record(success);
                    if let Some((_, _, counts)) = store_phase.as_mut() {
                        counts.record(success);
                    }
                    report.events.extend(event);
                    self.recorder.record_item_result(success).await;
                }
                Err(SessionExhausted(reason)) => {
                    // The item already has its failed row in history.
                    report.counts.record(false);
                    if let Some((_, _, counts)) = store_phase.as_mut() {
                        counts.record(false);
                    }
                    self.recorder.record_item_result(false).await;
                    aborted = Some(reason);
                    break;
                }
            }
        }

        if let Some((_, stats_id, counts)) = store_phase.take() {
            self.recorder.end_store_crawl(stats_id, counts).await;
        }
        if let Some(reason) = aborted {
            return Err(anyhow!("acquisition session could not be recovered: {reason}"));
        }

        report.failing_keys = self.failures.over_threshold();
        report.finished_at = Some(Utc::now());
        Ok(report)
    }

    async fn seed_failures(&mut self, registry: &AdapterRegistry, targets: &[Target]) {
        self.failures = FailureCounter::new(self.config.failure_threshold);
        for target in targets {
            let Ok(key) = target.item_key(registry.fold_store_into_key(&target.store)) else {
                continue;
            };
            let streak = match self.history.item_by_key(&key).await {
                Ok(Some(item)) => self.history.consecutive_failures(item.id).await,
                Ok(None) => Ok(0),
                Err(err) => Err(err),
            };
            match streak {
                Ok(0) => {}
                Ok(count) => self.failures.seed(&key, count),
                Err(err) => warn!(item_key = %key, error = %err, "cannot seed failure counter"),
            }
        }
    }

    async fn process_target(
        &mut self,
        registry: &AdapterRegistry,
        target: &Target,
    ) -> Result<ItemOutcome, SessionExhausted> {
        let item_key = match target.item_key(registry.fold_store_into_key(&target.store)) {
            Ok(key) => key,
            Err(err) => {
                warn!(target = %target.name, store = %target.store, error = %err, "skipping target");
                return Ok(ItemOutcome::Skipped);
            }
        };
        let Some(adapter) = registry.get(&target.store) else {
            warn!(target = %target.name, store = %target.store, "no adapter for store; skipping target");
            return Ok(ItemOutcome::Skipped);
        };

        let span = info_span!("check_target", store = %target.store, item_key = %item_key);
        self.check_and_record(adapter.as_ref(), target, item_key)
            .instrument(span)
            .await
    }

    async fn check_and_record(
        &mut self,
        adapter: &dyn AcquisitionAdapter,
        target: &Target,
        item_key: String,
    ) -> Result<ItemOutcome, SessionExhausted> {
        let checked = self.acquire(adapter, target).await;
        let observed_at = Utc::now();
        let result = match &checked {
            Ok(result) => result.clone(),
            Err(_) => CheckResult::failure(),
        };

        let outcome = self.record(target, &item_key, &result, observed_at).await;
        let success = outcome.is_some_and(|(success, _)| success);
        let streak = self.failures.record(&item_key, success);
        if !success {
            debug!(failures = streak, "item check failed");
        }

        checked?;
        Ok(ItemOutcome::Checked {
            success,
            event: outcome.and_then(|(_, event)| event),
        })
    }

    /// Run the adapter, recreating the shared session on `SessionLost`.
    async fn acquire(
        &mut self,
        adapter: &dyn AcquisitionAdapter,
        target: &Target,
    ) -> Result<CheckResult, SessionExhausted> {
        let mut attempts = 0usize;
        loop {
            let session = match self.session.clone() {
                Some(session) => session,
                None => match self.recreate_session().await {
                    Some(session) => session,
                    None => {
                        attempts += 1;
                        if attempts > self.config.max_session_retries {
                            return Err(SessionExhausted("session could not be created".into()));
                        }
                        continue;
                    }
                },
            };

            match adapter.check(session.as_ref(), target).await {
                Ok(result) => return Ok(result),
                Err(AdapterError::NotFound { url }) => {
                    debug!(%url, "listing gone; treating as out of stock");
                    return Ok(CheckResult::out_of_stock());
                }
                Err(AdapterError::SessionLost(reason)) => {
                    attempts += 1;
                    warn!(attempt = attempts, %reason, "acquisition session lost");
                    session.close().await;
                    self.session = None;
                    if attempts > self.config.max_session_retries {
                        return Err(SessionExhausted(reason));
                    }
                }
                Err(err) => {
                    warn!(error = %err, "acquisition failed");
                    return Ok(CheckResult::failure());
                }
            }
        }
    }

    async fn recreate_session(&mut self) -> Option<Arc<dyn AcquisitionSession>> {
        match self.factory.create().await {
            Ok(session) => {
                info!(session = %session.session_id(), "acquisition session recreated");
                self.session = Some(session.clone());
                Some(session)
            }
            Err(err) => {
                warn!(error = %err, "cannot recreate acquisition session");
                None
            }
        }
    }

    /// Persist item, observation and any event. `None` when a store write failed.
    async fn record(
        &self,
        target: &Target,
        item_key: &str,
        result: &CheckResult,
        observed_at: DateTime<Utc>,
    ) -> Option<(bool, Option<EventType>)> {
        let upsert = ItemUpsert {
            item_key: item_key.to_string(),
            name: target.name.clone(),
            store: target.store.clone(),
            url: result.resolved_url.clone().or_else(|| target.url.clone()),
            thumbnail_url: result.thumbnail_url.clone(),
            search_keyword: target.search_keyword.clone(),
            search_condition: target.search_condition(),
        };

        match self.persist(&upsert, result, observed_at, &target.price_drop).await {
            Ok(event) => Some((result.is_success(), event)),
            Err(err) => {
                warn!(error = %err, "history write failed");
                None
            }
        }
    }

    async fn persist(
        &self,
        upsert: &ItemUpsert,
        result: &CheckResult,
        observed_at: DateTime<Utc>,
        policy: &PriceDropPolicy,
    ) -> StoreResult<Option<EventType>> {
        let item_id = self.history.upsert_item(upsert, observed_at).await?;
        let observation_id = self
            .history
            .append_observation(item_id, &result.observation(observed_at))
            .await?;
        // The detector works off the committed row.
        let observation = self
            .history
            .observation(observation_id)
            .await?
            .ok_or_else(|| StoreError::CorruptRow {
                table: "price_history",
                detail: format!("observation {observation_id} missing after insert"),
            })?;
        let event = self.detector.evaluate(&observation, policy).await?;
        Ok(event.map(|event| event.event_type))
    }

    async fn close_session(&mut self) {
        if let Some(session) = self.session.take() {
            session.close().await;
        }
    }
}

/// Keep the first target of each store, preserving list order.
fn one_per_store(items: Vec<Target>) -> Vec<Target> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|target| seen.insert(target.store.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use mpw_adapters::{FetchedPage, SharedResourceError, StoreKind};
    use mpw_core::{ExitReason, StockStatus};
    use mpw_storage::MetricsStore;
    use tempfile::{tempdir, TempDir};
    use uuid::Uuid;

    use crate::config::{ConfigError, TargetList};

    struct StaticTargets(TargetList);

    #[async_trait]
    impl TargetSource for StaticTargets {
        async fn load(&self) -> Result<TargetList, ConfigError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct FakeSession {
        id: Uuid,
        closed: AtomicBool,
    }

    #[async_trait]
    impl AcquisitionSession for FakeSession {
        fn session_id(&self) -> Uuid {
            self.id
        }

        async fn fetch_page(&self, _store: &str, url: &str) -> Result<FetchedPage, AdapterError> {
            Ok(FetchedPage {
                url: url.to_string(),
                status: 200,
                body: String::new(),
            })
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFactory {
        created: AtomicUsize,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SessionFactory for FakeFactory {
        async fn create(&self) -> Result<Arc<dyn AcquisitionSession>, SharedResourceError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(SharedResourceError("browser unavailable".into()));
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(FakeSession {
                id: Uuid::new_v4(),
                ..Default::default()
            }))
        }
    }

    enum Scripted {
        Result(CheckResult),
        Error(AdapterError),
    }

    /// Pops one scripted reply per check, per target name.
    struct ScriptedAdapter {
        store: String,
        replies: Mutex<HashMap<String, Vec<Scripted>>>,
        calls: AtomicUsize,
    }

    impl ScriptedAdapter {
        fn new(store: &str) -> Self {
            Self {
                store: store.to_string(),
                replies: Mutex::new(HashMap::new()),
                calls: AtomicUsize::new(0),
            }
        }

        fn script(self, name: &str, replies: Vec<Scripted>) -> Self {
            self.replies.lock().unwrap().insert(name.to_string(), replies);
            self
        }
    }

    #[async_trait]
    impl AcquisitionAdapter for ScriptedAdapter {
        fn store(&self) -> &str {
            &self.store
        }

        fn kind(&self) -> StoreKind {
            StoreKind::Url
        }

        async fn check(
            &self,
            _session: &dyn AcquisitionSession,
            target: &Target,
        ) -> Result<CheckResult, AdapterError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut replies = self.replies.lock().unwrap();
            let queue = replies.entry(target.name.clone()).or_default();
            if queue.is_empty() {
                return Ok(CheckResult::in_stock(1000));
            }
            match queue.remove(0) {
                Scripted::Result(result) => Ok(result),
                Scripted::Error(err) => Err(err),
            }
        }
    }

    fn target(name: &str, store: &str) -> Target {
        Target {
            name: name.into(),
            store: store.into(),
            url: Some(format!("https://{store}.example/p/{name}")),
            search_keyword: None,
            price_range: None,
            exclude_keyword: None,
            condition: None,
            affiliate_id: None,
            price_drop: Default::default(),
        }
    }

    struct Harness {
        _dir: TempDir,
        history: HistoryStore,
        metrics: MetricsStore,
        factory: Arc<FakeFactory>,
    }

    async fn harness() -> Harness {
        let dir = tempdir().expect("tempdir");
        let history = HistoryStore::open_and_init(dir.path().join("history.db")).await.unwrap();
        let metrics = MetricsStore::open_and_init(dir.path().join("metrics.db")).await.unwrap();
        Harness {
            _dir: dir,
            history,
            metrics,
            factory: Arc::new(FakeFactory::default()),
        }
    }

    impl Harness {
        fn scheduler(
            &self,
            config: SchedulerConfig,
            items: Vec<Target>,
            adapters: Vec<Arc<ScriptedAdapter>>,
        ) -> Scheduler {
            let mut registry = AdapterRegistry::new();
            for adapter in adapters {
                registry.register(adapter, false);
            }
            Scheduler::new(
                config,
                self.history.clone(),
                self.factory.clone(),
                Arc::new(StaticTargets(TargetList {
                    stores: Vec::new(),
                    items,
                })),
            )
            .with_recorder(MetricsRecorder::new(self.metrics.clone()))
            .with_adapters(registry)
        }
    }

    fn debug_config() -> SchedulerConfig {
        SchedulerConfig {
            debug: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn a_cycle_writes_items_history_and_events() {
        let h = harness().await;
        let adapter = Arc::new(
            ScriptedAdapter::new("camera-shop")
                .script("lens", vec![Scripted::Result(CheckResult::in_stock(1000))])
                .script("body", vec![Scripted::Error(AdapterError::Acquisition("timeout".into()))]),
        );
        let mut scheduler = h.scheduler(
            SchedulerConfig::default(),
            vec![target("lens", "camera-shop"), target("body", "camera-shop")],
            vec![adapter],
        );

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.counts, StoreCounts { items: 2, success: 1, failed: 1 });
        assert_eq!(report.events, vec![EventType::NewItem]);

        let items = h.history.list_items().await.unwrap();
        assert_eq!(items.len(), 2);
        let body = items.iter().find(|i| i.name == "body").unwrap();
        let latest = h.history.latest(body.id).await.unwrap().unwrap();
        assert!(!latest.is_success());
        assert_eq!(latest.stock, StockStatus::Unknown);
        assert!(h.history.events_for_item(body.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_cycle_detects_a_price_decrease() {
        let h = harness().await;
        let adapter = Arc::new(ScriptedAdapter::new("camera-shop").script(
            "lens",
            vec![
                Scripted::Result(CheckResult::in_stock(1000)),
                Scripted::Result(CheckResult::in_stock(800)),
            ],
        ));
        let mut scheduler =
            h.scheduler(SchedulerConfig::default(), vec![target("lens", "camera-shop")], vec![adapter]);

        scheduler.run_cycle().await.unwrap();
        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.events, vec![EventType::PriceDecrease]);

        let item = &h.history.list_items().await.unwrap()[0];
        let stats = h.history.stats(item.id).await.unwrap();
        assert_eq!((stats.lowest, stats.highest, stats.count), (Some(800), Some(1000), 2));
    }

    #[tokio::test]
    async fn not_found_is_recorded_as_out_of_stock() {
        let h = harness().await;
        let adapter = Arc::new(ScriptedAdapter::new("camera-shop").script(
            "lens",
            vec![Scripted::Error(AdapterError::NotFound { url: "https://gone".into() })],
        ));
        let mut scheduler =
            h.scheduler(SchedulerConfig::default(), vec![target("lens", "camera-shop")], vec![adapter]);

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.counts.success, 1);
        let item = &h.history.list_items().await.unwrap()[0];
        let latest = h.history.latest(item.id).await.unwrap().unwrap();
        assert_eq!(latest.stock, StockStatus::OutOfStock);
        assert!(latest.is_success());
    }

    #[tokio::test]
    async fn lost_session_is_recreated_and_the_item_retried() {
        let h = harness().await;
        let adapter = Arc::new(ScriptedAdapter::new("camera-shop").script(
            "lens",
            vec![
                Scripted::Error(AdapterError::SessionLost("browser crashed".into())),
                Scripted::Result(CheckResult::in_stock(1000)),
            ],
        ));
        let mut scheduler = h.scheduler(
            debug_config(),
            vec![target("lens", "camera-shop")],
            vec![adapter.clone()],
        );

        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.exit_reason, ExitReason::Normal);
        assert_eq!(h.factory.created.load(Ordering::SeqCst), 2);
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 2);
        let report = summary.last_cycle.unwrap();
        assert_eq!(report.counts.success, 1);
    }

    #[tokio::test]
    async fn exhausted_session_retries_abort_the_cycle_not_the_process() {
        let h = harness().await;
        let lost = || Scripted::Error(AdapterError::SessionLost("gone".into()));
        let adapter = Arc::new(
            ScriptedAdapter::new("camera-shop")
                .script("lens", vec![lost(), lost(), lost()]),
        );
        let config = SchedulerConfig {
            max_session_retries: 2,
            ..debug_config()
        };
        let mut scheduler = h.scheduler(
            config,
            vec![target("lens", "camera-shop"), target("body", "camera-shop")],
            vec![adapter.clone()],
        );

        let summary = scheduler.run().await.unwrap();
        assert!(summary.last_cycle.is_none());
        assert_eq!(adapter.calls.load(Ordering::SeqCst), 3);

        let items = h.history.list_items().await.unwrap();
        assert_eq!(items.len(), 1);
        let latest = h.history.latest(items[0].id).await.unwrap().unwrap();
        assert!(!latest.is_success());

        let session = h.metrics.latest_session().await.unwrap().unwrap();
        assert_eq!(session.exit_reason, Some(ExitReason::Normal));
        assert_eq!((session.total_items, session.failed_items), (1, 1));
        let stats = h.metrics.store_stats(session.id).await.unwrap();
        assert_eq!(stats.len(), 1);
        assert_eq!((stats[0].item_count, stats[0].failed_count), (1, 1));
    }

    #[tokio::test]
    async fn initial_session_failure_is_fatal() {
        let h = harness().await;
        h.factory.fail.store(true, Ordering::SeqCst);
        let mut scheduler = h.scheduler(debug_config(), vec![target("lens", "camera-shop")], vec![]);
        assert!(scheduler.run().await.is_err());
        assert!(h.metrics.latest_session().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_store_and_missing_anchor_are_skipped() {
        let h = harness().await;
        let mut anchorless = target("mystery", "camera-shop");
        anchorless.url = None;
        let mut scheduler = h.scheduler(
            SchedulerConfig::default(),
            vec![anchorless, target("lens", "nowhere"), target("ok", "camera-shop")],
            vec![Arc::new(ScriptedAdapter::new("camera-shop"))],
        );

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.skipped, 2);
        assert_eq!(report.counts.success, 1);
        assert_eq!(h.history.list_items().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn debug_mode_checks_one_item_per_store_and_stops() {
        let h = harness().await;
        let camera = Arc::new(ScriptedAdapter::new("camera-shop"));
        let flea = Arc::new(ScriptedAdapter::new("flea"));
        let mut scheduler = h.scheduler(
            debug_config(),
            vec![
                target("a", "camera-shop"),
                target("b", "camera-shop"),
                target("c", "flea"),
                target("d", "flea"),
            ],
            vec![camera.clone(), flea.clone()],
        );

        let summary = scheduler.run().await.unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(camera.calls.load(Ordering::SeqCst), 1);
        assert_eq!(flea.calls.load(Ordering::SeqCst), 1);

        let session = h.metrics.latest_session().await.unwrap().unwrap();
        let stats = h.metrics.store_stats(session.id).await.unwrap();
        let names: Vec<_> = stats.iter().map(|s| s.store_name.as_str()).collect();
        assert_eq!(names, vec!["camera-shop", "flea"]);
        assert!(session.work_ended_at.is_some());
    }

    #[tokio::test]
    async fn failure_streaks_survive_restarts() {
        let h = harness().await;
        let failing = || Scripted::Error(AdapterError::Acquisition("blocked".into()));
        let adapter = Arc::new(
            ScriptedAdapter::new("camera-shop")
                .script("lens", vec![failing(), failing(), failing()]),
        );
        let config = SchedulerConfig {
            failure_threshold: 3,
            ..Default::default()
        };
        let items = vec![target("lens", "camera-shop")];
        let mut first = h.scheduler(config, items.clone(), vec![adapter.clone()]);
        first.run_cycle().await.unwrap();
        first.run_cycle().await.unwrap();
        assert!(first.failing_keys().is_empty());

        let mut restarted = h.scheduler(config, items, vec![adapter]);
        let report = restarted.run_cycle().await.unwrap();
        assert_eq!(report.failing_keys.len(), 1);
    }

    #[tokio::test]
    async fn termination_while_sleeping_ends_the_session_within_a_poll_unit() {
        let h = harness().await;
        let liveness_path = h._dir.path().join("liveness");
        let config = SchedulerConfig {
            interval: Duration::from_secs(60),
            poll_unit: Duration::from_millis(50),
            ..Default::default()
        };
        let mut scheduler = h
            .scheduler(
                config,
                vec![target("lens", "camera-shop")],
                vec![Arc::new(ScriptedAdapter::new("camera-shop"))],
            )
            .with_liveness(LivenessFile::new(Some(liveness_path.clone())));
        let cancel = scheduler.cancel_flag();
        let factory = h.factory.clone();

        let started_utc = Utc::now();
        let started = std::time::Instant::now();
        let run = tokio::spawn(async move { scheduler.run().await });
        tokio::time::sleep(Duration::from_millis(400)).await;

        // Mid-sleep: both markers keep moving after the working pass ends.
        let sleeping = h.metrics.latest_session().await.unwrap().unwrap();
        assert!(sleeping.ended_at.is_none());
        let work_ended = sleeping.work_ended_at.expect("work ended");
        assert!(work_ended >= started_utc);
        assert!(sleeping.last_heartbeat_at.expect("heartbeat") > work_ended);
        let stamp = crate::liveness::read_liveness(&liveness_path)
            .await
            .unwrap()
            .expect("liveness file written");
        assert!(stamp - work_ended >= chrono::Duration::milliseconds(100));

        cancel.cancel();
        let cancelled_at = std::time::Instant::now();

        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.exit_reason, ExitReason::Terminated);
        assert!(cancelled_at.elapsed() < Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(factory.created.load(Ordering::SeqCst), 1);

        let session = h.metrics.latest_session().await.unwrap().unwrap();
        assert_eq!(session.exit_reason, Some(ExitReason::Terminated));
        assert!(session.ended_at.is_some());
    }

    #[test]
    fn one_per_store_keeps_list_order() {
        let picked = one_per_store(vec![
            target("a", "x"),
            target("b", "y"),
            target("c", "x"),
        ]);
        let names: Vec<_> = picked.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
