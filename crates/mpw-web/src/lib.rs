//! Read-only JSON API over the history and metrics stores, plus on-demand search.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use mpw_adapters::{AcquisitionSession, AdapterError, AdapterRegistry, SessionFactory, StoreKind};
use mpw_core::{CheckResult, Event, Item, PriceObservation, PriceRange, PriceStats, Session, StoreCrawlStat, Target};
use mpw_storage::{HistoryStore, MetricsStore, StoreError};
use mpw_sync::{check_liveness, LivenessStatus, SyncConfig, TargetSource};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "mpw-web";

/// Keyword search outside the crawl loop, on its own session.
///
/// Only one search runs at a time; a second request is rejected, not queued.
pub struct OnDemandSearch {
    factory: Arc<dyn SessionFactory>,
    targets: Arc<dyn TargetSource>,
    session: Mutex<Option<Arc<dyn AcquisitionSession>>>,
}

impl OnDemandSearch {
    pub fn new(factory: Arc<dyn SessionFactory>, targets: Arc<dyn TargetSource>) -> Self {
        Self {
            factory,
            targets,
            session: Mutex::new(None),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub history: HistoryStore,
    pub metrics: MetricsStore,
    pub search: Arc<OnDemandSearch>,
    pub liveness_file: Option<PathBuf>,
    pub max_liveness_age: Duration,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/items", get(items_handler))
        .route("/api/items/{id}/history", get(item_history_handler))
        .route("/api/events", get(events_handler))
        .route("/api/sessions", get(sessions_handler))
        .route("/api/health", get(health_handler))
        .route("/api/search", post(search_handler))
        .with_state(Arc::new(state))
}

pub async fn serve_from_config(config: &SyncConfig) -> anyhow::Result<()> {
    let (history, metrics) = mpw_sync::open_stores(config).await?;
    let factory = mpw_adapters::HttpSessionFactory::new(config.http_session_config());
    let targets = mpw_sync::YamlTargetFile::new(&config.targets_path, Default::default());
    let state = AppState {
        history,
        metrics,
        search: Arc::new(OnDemandSearch::new(Arc::new(factory), Arc::new(targets))),
        liveness_file: config.liveness_file.clone(),
        max_liveness_age: config.max_liveness_age(),
    };

    let listener = TcpListener::bind(("0.0.0.0", config.web_port)).await?;
    info!(port = config.web_port, "serving api");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

#[derive(Debug)]
enum ApiError {
    NotFound(String),
    Busy,
    BadRequest(String),
    Upstream(String),
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        Self::Internal(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            Self::Busy => (StatusCode::CONFLICT, "a search is already running".to_string()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Upstream(msg) => (StatusCode::BAD_GATEWAY, msg),
            Self::Internal(msg) => {
                warn!(error = %msg, "api request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, msg)
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Serialize)]
pub struct ItemSummary {
    #[serde(flatten)]
    pub item: Item,
    pub latest: Option<PriceObservation>,
    pub stats: PriceStats,
}

async fn items_handler(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ItemSummary>> {
    let mut summaries = Vec::new();
    for item in state.history.list_items().await? {
        let latest = state.history.latest(item.id).await?;
        let stats = state.history.stats(item.id).await?;
        summaries.push(ItemSummary { item, latest, stats });
    }
    Ok(Json(summaries))
}

#[derive(Debug, Deserialize, Default)]
struct HistoryQuery {
    days: Option<i64>,
}

#[derive(Debug, Serialize)]
struct ItemHistory {
    item: Item,
    stats: PriceStats,
    history: Vec<PriceObservation>,
    events: Vec<Event>,
}

async fn item_history_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<ItemHistory> {
    let item = state
        .history
        .item(id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("item {id} not found")))?;
    let since = match query.days.filter(|days| *days > 0) {
        None => None,
        Some(days) => Some(
            chrono::Duration::try_days(days)
                .and_then(|window| Utc::now().checked_sub_signed(window))
                .ok_or_else(|| ApiError::BadRequest(format!("days out of range: {days}")))?,
        ),
    };
    Ok(Json(ItemHistory {
        stats: state.history.stats(id).await?,
        history: state.history.history(id, since).await?,
        events: state.history.events_for_item(id).await?,
        item,
    }))
}

#[derive(Debug, Deserialize, Default)]
struct EventsQuery {
    limit: Option<i64>,
    #[serde(default)]
    pending: bool,
}

async fn events_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Vec<Event>> {
    let limit = query.limit.unwrap_or(50).clamp(1, 500);
    let events = if query.pending {
        state.history.pending_events(limit).await?
    } else {
        state.history.recent_events(limit).await?
    };
    Ok(Json(events))
}

#[derive(Debug, Deserialize, Default)]
struct SessionsQuery {
    limit: Option<i64>,
}

#[derive(Debug, Serialize)]
struct SessionSummary {
    #[serde(flatten)]
    session: Session,
    stores: Vec<StoreCrawlStat>,
}

async fn sessions_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> ApiResult<Vec<SessionSummary>> {
    let limit = query.limit.unwrap_or(20).clamp(1, 200);
    let mut out = Vec::new();
    for session in state.metrics.recent_sessions(limit).await? {
        let stores = state.metrics.store_stats(session.id).await?;
        out.push(SessionSummary { session, stores });
    }
    Ok(Json(out))
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    liveness_age_secs: Option<u64>,
    last_heartbeat: Option<DateTime<Utc>>,
    latest_session: Option<Session>,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Response, ApiError> {
    let liveness = match &state.liveness_file {
        Some(path) => check_liveness(path, state.max_liveness_age, Utc::now())
            .await
            .map_err(|err| ApiError::Internal(format!("{err:#}")))?,
        None => LivenessStatus::Missing,
    };
    let (status, age) = match liveness {
        LivenessStatus::Fresh { age } => ("ok", Some(age.as_secs())),
        LivenessStatus::Stale { age } => ("stale", Some(age.as_secs())),
        LivenessStatus::Missing => ("missing", None),
    };
    let body = Health {
        status,
        liveness_age_secs: age,
        last_heartbeat: state.metrics.last_heartbeat().await?,
        latest_session: state.metrics.latest_session().await?,
    };
    let code = if liveness.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((code, Json(body)).into_response())
}

#[derive(Debug, Deserialize)]
pub struct SearchRequest {
    pub store: String,
    pub keyword: String,
    #[serde(default)]
    pub price_range: Option<PriceRange>,
    #[serde(default)]
    pub exclude_keyword: Option<String>,
}

async fn search_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<SearchRequest>,
) -> ApiResult<CheckResult> {
    if request.keyword.trim().is_empty() {
        return Err(ApiError::BadRequest("keyword must not be empty".into()));
    }
    let search = &state.search;
    let mut session_slot = search.session.try_lock().map_err(|_| ApiError::Busy)?;

    let list = search
        .targets
        .load()
        .await
        .map_err(|err| ApiError::Internal(err.to_string()))?;
    let registry = AdapterRegistry::from_definitions(&list.stores);
    let adapter = registry
        .get(&request.store)
        .filter(|adapter| adapter.kind() == StoreKind::Keyword)
        .ok_or_else(|| {
            ApiError::NotFound(format!("no keyword search store named `{}`", request.store))
        })?;

    let session = match session_slot.as_ref() {
        Some(session) => session.clone(),
        None => {
            let session = search
                .factory
                .create()
                .await
                .map_err(|err| ApiError::Upstream(err.to_string()))?;
            *session_slot = Some(session.clone());
            session
        }
    };

    let target = Target {
        name: request.keyword.clone(),
        store: request.store,
        url: None,
        search_keyword: Some(request.keyword),
        price_range: request.price_range,
        exclude_keyword: request.exclude_keyword,
        condition: None,
        affiliate_id: None,
        price_drop: Default::default(),
    };

    match adapter.check(session.as_ref(), &target).await {
        Ok(result) => Ok(Json(result)),
        Err(AdapterError::NotFound { .. }) => Ok(Json(CheckResult::out_of_stock())),
        Err(AdapterError::SessionLost(reason)) => {
            session.close().await;
            *session_slot = None;
            Err(ApiError::Upstream(reason))
        }
        Err(err) => Err(ApiError::Upstream(err.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{header, Request};
    use http_body_util::BodyExt;
    use mpw_adapters::{FetchedPage, SharedResourceError, StoreDefinition};
    use mpw_core::{ExitReason, ItemUpsert, NewObservation, StockStatus, CrawlStatus, StoreCounts};
    use mpw_sync::{ConfigError, LivenessFile, TargetList};
    use tempfile::{tempdir, TempDir};
    use tower::ServiceExt;
    use uuid::Uuid;

    const RESULTS: &str = r#"
<ul>
  <li class="result"><span class="title">X100V body</span><span class="price">¥98,000</span><a href="/i/1">go</a></li>
  <li class="result"><span class="title">X100V junk</span><span class="price">¥20,000</span><a href="/i/2">go</a></li>
  <li class="result"><span class="title">X100V silver</span><span class="price">¥95,500</span><a href="/i/3">go</a></li>
</ul>
"#;

    struct CannedSession {
        id: Uuid,
        delay: Duration,
    }

    #[async_trait]
    impl AcquisitionSession for CannedSession {
        fn session_id(&self) -> Uuid {
            self.id
        }

        async fn fetch_page(&self, _store: &str, url: &str) -> Result<FetchedPage, AdapterError> {
            tokio::time::sleep(self.delay).await;
            Ok(FetchedPage {
                url: url.to_string(),
                status: 200,
                body: RESULTS.to_string(),
            })
        }

        async fn close(&self) {}
    }

    struct CannedFactory {
        created: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl SessionFactory for CannedFactory {
        async fn create(&self) -> Result<Arc<dyn AcquisitionSession>, SharedResourceError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(CannedSession {
                id: Uuid::new_v4(),
                delay: self.delay,
            }))
        }
    }

    struct FleaStores;

    #[async_trait]
    impl TargetSource for FleaStores {
        async fn load(&self) -> Result<TargetList, ConfigError> {
            Ok(TargetList {
                stores: vec![StoreDefinition {
                    name: "flea".into(),
                    kind: StoreKind::Keyword,
                    price_selector: None,
                    out_of_stock_selector: None,
                    out_of_stock_text: None,
                    thumbnail_selector: None,
                    search_url: Some("https://flea.example/search?q={keyword}".into()),
                    result_selector: Some("li.result".into()),
                    result_title_selector: Some(".title".into()),
                    result_price_selector: Some(".price".into()),
                    result_link_selector: Some("a".into()),
                    key_includes_store: false,
                }],
                items: Vec::new(),
            })
        }
    }

    struct Fixture {
        dir: TempDir,
        state: AppState,
        factory: Arc<CannedFactory>,
    }

    async fn fixture(search_delay: Duration) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let history = HistoryStore::open_and_init(dir.path().join("history.db")).await.unwrap();
        let metrics = MetricsStore::open_and_init(dir.path().join("metrics.db")).await.unwrap();
        let factory = Arc::new(CannedFactory {
            created: AtomicUsize::new(0),
            delay: search_delay,
        });
        let state = AppState {
            history,
            metrics,
            search: Arc::new(OnDemandSearch::new(factory.clone(), Arc::new(FleaStores))),
            liveness_file: Some(dir.path().join("liveness")),
            max_liveness_age: Duration::from_secs(60),
        };
        Fixture { dir, state, factory }
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    fn search_request(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/search")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn seed_item(history: &HistoryStore) -> i64 {
        let now = Utc::now();
        let id = history
            .upsert_item(
                &ItemUpsert {
                    item_key: "k".into(),
                    name: "Lens".into(),
                    store: "camera-shop".into(),
                    ..Default::default()
                },
                now,
            )
            .await
            .unwrap();
        for (hours_ago, price) in [(72, 1000), (1, 800)] {
            history
                .append_observation(
                    id,
                    &NewObservation {
                        price: Some(price),
                        stock: StockStatus::InStock,
                        crawl_status: CrawlStatus::Success,
                        observed_at: now - chrono::Duration::hours(hours_ago),
                    },
                )
                .await
                .unwrap();
        }
        id
    }

    #[tokio::test]
    async fn items_include_latest_and_stats() {
        let f = fixture(Duration::ZERO).await;
        seed_item(&f.state.history).await;
        let (status, body) = get_json(app(f.state), "/api/items").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body[0]["name"], "Lens");
        assert_eq!(body[0]["latest"]["price"], 800);
        assert_eq!(body[0]["stats"]["lowest"], 800);
        assert_eq!(body[0]["stats"]["count"], 2);
    }

    #[tokio::test]
    async fn history_honours_the_days_window() {
        let f = fixture(Duration::ZERO).await;
        let id = seed_item(&f.state.history).await;
        let router = app(f.state);

        let (_, all) = get_json(router.clone(), &format!("/api/items/{id}/history")).await;
        assert_eq!(all["history"].as_array().unwrap().len(), 2);

        let (_, recent) = get_json(router.clone(), &format!("/api/items/{id}/history?days=1")).await;
        assert_eq!(recent["history"].as_array().unwrap().len(), 1);

        let (status, body) =
            get_json(router.clone(), &format!("/api/items/{id}/history?days=200000000")).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["error"].as_str().unwrap().contains("days"));

        let (status, _) = get_json(router, "/api/items/999/history").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn sessions_and_health_reflect_the_scheduler() {
        let f = fixture(Duration::ZERO).await;
        let router = app(f.state.clone());

        let (status, body) = get_json(router.clone(), "/api/health").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "missing");

        let now = Utc::now();
        let id = f.state.metrics.start_session(now).await.unwrap();
        let stats = f.state.metrics.start_store_crawl(id, "camera-shop", now).await.unwrap();
        let counts = StoreCounts { items: 1, success: 1, failed: 0 };
        f.state.metrics.end_store_crawl(stats, counts, now).await.unwrap();
        f.state.metrics.end_session(id, ExitReason::Normal, counts, now).await.unwrap();
        LivenessFile::new(Some(f.dir.path().join("liveness"))).touch(now).await;

        let (status, body) = get_json(router.clone(), "/api/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["latest_session"]["exit_reason"], "normal");

        let (_, sessions) = get_json(router, "/api/sessions").await;
        assert_eq!(sessions[0]["stores"][0]["store_name"], "camera-shop");
    }

    #[tokio::test]
    async fn events_can_be_filtered_to_pending() {
        let f = fixture(Duration::ZERO).await;
        let (status, body) = get_json(app(f.state), "/api/events?pending=true").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_returns_cheapest_match_and_reuses_its_session() {
        let f = fixture(Duration::ZERO).await;
        let router = app(f.state);
        let body = r#"{"store":"flea","keyword":"x100v","exclude_keyword":"junk"}"#;

        for _ in 0..2 {
            let resp = router.clone().oneshot(search_request(body)).await.unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
            let bytes = resp.into_body().collect().await.unwrap().to_bytes();
            let result: CheckResult = serde_json::from_slice(&bytes).unwrap();
            assert_eq!(result.price, Some(95_500));
            assert_eq!(result.stock, StockStatus::InStock);
        }
        assert_eq!(f.factory.created.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_search_is_rejected_not_queued() {
        let f = fixture(Duration::from_millis(300)).await;
        let router = app(f.state);
        let body = r#"{"store":"flea","keyword":"x100v"}"#;

        let first = tokio::spawn(router.clone().oneshot(search_request(body)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = router.oneshot(search_request(body)).await.unwrap();
        assert_eq!(second.status(), StatusCode::CONFLICT);
        assert_eq!(first.await.unwrap().unwrap().status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn search_on_unknown_store_is_not_found() {
        let f = fixture(Duration::ZERO).await;
        let resp = app(f.state)
            .oneshot(search_request(r#"{"store":"camera-shop","keyword":"lens"}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
