//! Upstream HTTP access, retry policy, the deduplication ledger and result sinks.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub mod ledger;
pub mod sink;

pub use ledger::{DedupLedger, ExclusionSet, LedgerEntry, LedgerError};
pub use sink::{
    AccuracyLedger, LogStatusSink, MemoryResultSink, MemoryStatusSink, PgResultSink, ResultSink,
    SinkError, StatusSink, WorkerHeartbeat,
};

pub const CRATE_NAME: &str = "tpr-storage";

/// What an adapter should do after a failed upstream request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    /// Transient fault: retry the same identity with backoff.
    Retryable,
    /// The identity does not exist upstream; move on without retrying.
    AbandonIdentity,
    /// Upstream asked us to slow down; pause once, then move on.
    RateLimited,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    match status {
        StatusCode::NOT_FOUND => RetryDisposition::AbandonIdentity,
        StatusCode::TOO_MANY_REQUESTS => RetryDisposition::RateLimited,
        _ => RetryDisposition::Retryable,
    }
}

/// Capped exponential backoff: `base * 2^attempt`, never above `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, `retryable` rejects the error, or the policy's
/// retries are spent. `op` receives the zero-based attempt index.
pub async fn retry_with_backoff<T, E, F, Fut, R>(
    policy: &RetryPolicy,
    mut retryable: R,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    R: FnMut(&E) -> bool,
{
    let mut attempt = 0usize;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !retryable(&err) {
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying after backoff");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 2,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("not found: {url}")]
    NotFound { url: String },
    #[error("rate limited by {url}")]
    RateLimited {
        url: String,
        retry_after: Option<Duration>,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("transport failure: {0}")]
    Transport(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::NotFound { .. } => RetryDisposition::AbandonIdentity,
            FetchError::RateLimited { .. } => RetryDisposition::RateLimited,
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::Retryable),
            FetchError::Request(_) | FetchError::Transport(_) => RetryDisposition::Retryable,
        }
    }
}

/// A single GET against an upstream provider. Implementations make exactly one
/// attempt; retry decisions belong to the caller.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn get(
        &self,
        source_id: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn fetch_once(
        &self,
        source_id: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Transport("global fetch limiter closed".to_string()))?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::Transport("per-source fetch limiter closed".to_string()))?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        let resp = request.send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if status.is_success() {
            let body = resp.bytes().await?.to_vec();
            return Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                body,
            });
        }

        match classify_status(status) {
            RetryDisposition::AbandonIdentity => Err(FetchError::NotFound { url: final_url }),
            RetryDisposition::RateLimited => {
                let retry_after = resp
                    .headers()
                    .get(RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|v| v.trim().parse::<u64>().ok())
                    .map(Duration::from_secs);
                Err(FetchError::RateLimited {
                    url: final_url,
                    retry_after,
                })
            }
            RetryDisposition::Retryable => Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            }),
        }
    }
}

#[async_trait]
impl Upstream for HttpFetcher {
    async fn get(
        &self,
        source_id: &str,
        url: &str,
        accept: Option<&str>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url);
        self.fetch_once(source_id, url, accept).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
        }
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(2));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_secs(4));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(8));
        assert_eq!(policy.delay_for_attempt(64), Duration::from_secs(8));
    }

    #[test]
    fn status_classification_separates_404_and_429() {
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::AbandonIdentity
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::RateLimited
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            FetchError::Transport("reset".into()).disposition(),
            RetryDisposition::Retryable
        );
    }

    #[tokio::test]
    async fn retry_helper_stops_after_success() {
        let calls = AtomicUsize::new(0);
        let result: Result<usize, FetchError> = retry_with_backoff(
            &fast_policy(3),
            |e: &FetchError| e.disposition() == RetryDisposition::Retryable,
            |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(FetchError::Transport("flaky".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            },
        )
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_helper_gives_up_after_max_retries() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), FetchError> = retry_with_backoff(
            &fast_policy(3),
            |_| true,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(FetchError::Transport("down".into())) }
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn retry_helper_does_not_retry_rejected_errors() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), FetchError> = retry_with_backoff(
            &fast_policy(3),
            |e: &FetchError| e.disposition() == RetryDisposition::Retryable,
            |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(FetchError::NotFound {
                        url: "https://example.test/missing".into(),
                    })
                }
            },
        )
        .await;
        assert!(matches!(result, Err(FetchError::NotFound { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
