//! HTTP acquisition session with retry/backoff and an optional rate limiter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, Instrument};
use uuid::Uuid;

use crate::{AcquisitionSession, AdapterError, FetchedPage, SessionFactory, SharedResourceError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Per-store request allowance: `burst` fetches back to back, then one more
/// every `refill_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub burst: u32,
    pub refill_every: Duration,
}

impl RateLimit {
    /// `None` when either bound is zero, which disables limiting.
    pub fn new(burst: u32, refill_every: Duration) -> Option<Self> {
        (burst > 0 && !refill_every.is_zero()).then_some(Self {
            burst,
            refill_every,
        })
    }
}

#[derive(Debug, Clone)]
pub struct HttpSessionConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub rate_limit: Option<RateLimit>,
}

impl Default for HttpSessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            rate_limit: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Allowance {
    tokens: u32,
    refilled_at: Instant,
}

/// Token buckets keyed by store name.
#[derive(Debug)]
pub struct StoreRateLimiter {
    limit: RateLimit,
    stores: Mutex<HashMap<String, Allowance>>,
}

impl StoreRateLimiter {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> RateLimit {
        self.limit
    }

    /// Claims one request for `store` at `now`, or returns the wait until the next token.
    pub async fn try_acquire_at(&self, store: &str, now: Instant) -> Result<(), Duration> {
        let RateLimit { burst, refill_every } = self.limit;
        let mut stores = self.stores.lock().await;
        let allowance = stores.entry(store.to_string()).or_insert(Allowance {
            tokens: burst,
            refilled_at: now,
        });

        let elapsed = now.saturating_duration_since(allowance.refilled_at);
        let period = refill_every.as_nanos().max(1);
        let refills = elapsed.as_nanos() / period;
        if refills > 0 {
            let refills = u32::try_from(refills).unwrap_or(u32::MAX);
            allowance.tokens = allowance.tokens.saturating_add(refills).min(burst);
            // Carry the partial period forward unless the bucket is full.
            let carried = u64::try_from(elapsed.as_nanos() % period).unwrap_or(0);
            allowance.refilled_at = if allowance.tokens == burst {
                now
            } else {
                now.checked_sub(Duration::from_nanos(carried)).unwrap_or(now)
            };
        }

        if allowance.tokens > 0 {
            allowance.tokens -= 1;
            return Ok(());
        }
        Err(refill_every.saturating_sub(now.saturating_duration_since(allowance.refilled_at)))
    }

    pub async fn acquire(&self, store: &str) {
        loop {
            match self.try_acquire_at(store, Instant::now()).await {
                Ok(()) => return,
                Err(wait) => {
                    debug!(store, wait_ms = wait.as_millis() as u64, "rate limited");
                    tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
                }
            }
        }
    }
}

/// `reqwest`-backed session. Once closed, every fetch reports `SessionLost`.
#[derive(Debug)]
pub struct HttpSession {
    id: Uuid,
    client: reqwest::Client,
    limiter: Option<StoreRateLimiter>,
    backoff: BackoffPolicy,
    closed: AtomicBool,
}

impl HttpSession {
    pub fn new(config: &HttpSessionConfig) -> Result<Self, SharedResourceError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| SharedResourceError(format!("building http client: {err}")))?;

        Ok(Self {
            id: Uuid::new_v4(),
            client,
            limiter: config.rate_limit.map(StoreRateLimiter::new),
            backoff: config.backoff,
            closed: AtomicBool::new(false),
        })
    }

    pub fn rate_limit(&self) -> Option<RateLimit> {
        self.limiter.as_ref().map(StoreRateLimiter::limit)
    }

    async fn fetch_with_retries(&self, store: &str, url: &str) -> Result<FetchedPage, AdapterError> {
        if let Some(limiter) = &self.limiter {
            limiter.acquire(store).await;
        }

        let mut last_error = String::from("no attempt made");
        for attempt in 0..=self.backoff.max_retries {
            if self.closed.load(Ordering::SeqCst) {
                return Err(AdapterError::SessionLost(format!("session {} is closed", self.id)));
            }

            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp
                            .text()
                            .await
                            .map_err(|err| AdapterError::Acquisition(format!("reading body: {err}")))?;
                        return Ok(FetchedPage {
                            url: final_url,
                            status: status.as_u16(),
                            body,
                        });
                    }

                    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
                        return Err(AdapterError::NotFound { url: final_url });
                    }

                    last_error = format!("http status {} for {}", status.as_u16(), final_url);
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(AdapterError::Acquisition(last_error));
                }
                Err(err) => {
                    last_error = format!("request failed: {err}");
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(AdapterError::Acquisition(last_error));
                }
            }
        }

        Err(AdapterError::Acquisition(last_error))
    }
}

#[async_trait]
impl AcquisitionSession for HttpSession {
    fn session_id(&self) -> Uuid {
        self.id
    }

    async fn fetch_page(&self, store: &str, url: &str) -> Result<FetchedPage, AdapterError> {
        let span = info_span!("http_fetch", session = %self.id, store, url);
        self.fetch_with_retries(store, url).instrument(span).await
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(session = %self.id, "closed http session");
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpSessionFactory {
    config: HttpSessionConfig,
}

impl HttpSessionFactory {
    pub fn new(config: HttpSessionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SessionFactory for HttpSessionFactory {
    async fn create(&self) -> Result<Arc<dyn AcquisitionSession>, SharedResourceError> {
        let session = HttpSession::new(&self.config)?;
        info!(session = %session.id, "opened http session");
        Ok(Arc::new(session))
    }
}
