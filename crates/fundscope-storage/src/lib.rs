//! Persistence adapters (job store, entity store) and the outbound HTTP fetcher for Fundscope.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use fundscope_core::JobKey;
use reqwest::StatusCode;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub mod entities;
pub mod jobs;

pub use entities::{EntityStore, MemoryEntityStore, PgEntityStore, ReportQuery};
pub use jobs::{JobMatcher, JobStore, MemoryJobStore, PgJobStore};

pub const CRATE_NAME: &str = "fundscope-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("job {0} already exists")]
    DuplicateJob(JobKey),
    #[error("job queue is empty")]
    QueueEmpty,
    #[error("job {0} not found")]
    JobNotFound(JobKey),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },
    #[error("constraint conflict: {0}")]
    Conflict(String),
    #[error("invalid stored row: {0}")]
    InvalidRow(String),
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("database: {0}")]
    Database(sqlx::Error),
}

impl StoreError {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, StoreError::DuplicateJob(_))
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        StoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let Some(db_err) = err.as_database_error() {
            if db_err.code().as_deref() == Some("23505") {
                return StoreError::Conflict(db_err.message().to_string());
            }
        }
        StoreError::Database(err)
    }
}

pub async fn connect_pool(database_url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect(database_url)
        .await
        .context("connecting to postgres (DATABASE_URL)")
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .context("applying migrations")
}

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
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
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
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            capacity: config.capacity.max(1),
            refill_every: config.refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: config.capacity.max(1),
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if !self.refill_every.is_zero() && elapsed >= self.refill_every {
                let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = if state.tokens == self.capacity {
                    Instant::now()
                } else {
                    state.last_refill + self.refill_every * refills
                };
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchMethod {
    Get,
    PostForm(Vec<(String, String)>),
}

/// One outbound request for one crawl target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub run_id: Uuid,
    pub source_id: String,
    pub url: String,
    pub method: FetchMethod,
    pub headers: Vec<(String, String)>,
}

impl FetchRequest {
    pub fn get(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_id: source_id.into(),
            url: url.into(),
            method: FetchMethod::Get,
            headers: Vec::new(),
        }
    }

    pub fn post_form(
        source_id: impl Into<String>,
        url: impl Into<String>,
        form: Vec<(String, String)>,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            source_id: source_id.into(),
            url: url.into(),
            method: FetchMethod::PostForm(form),
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = run_id;
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedDocument {
    pub status: u16,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shutting down")]
    Shutdown,
}

/// Anything that can turn a [`FetchRequest`] into a document body.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedDocument, FetchError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 32,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
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
        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            token_bucket: config.token_bucket.map(|c| Arc::new(SimpleTokenBucket::new(c))),
            backoff: config.backoff,
        })
    }

    fn build(&self, request: &FetchRequest) -> reqwest::RequestBuilder {
        let mut builder = match &request.method {
            FetchMethod::Get => self.client.get(&request.url),
            FetchMethod::PostForm(form) => self.client.post(&request.url).form(form),
        };
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        builder
    }

    async fn fetch_with_retries(
        &self,
        request: &FetchRequest,
    ) -> Result<FetchedDocument, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;

        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            let err = match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        let body = resp.text().await?;
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched document");
                        return Ok(FetchedDocument {
                            status: status.as_u16(),
                            final_url,
                            body,
                        });
                    }
                    let retryable = classify_status(status) == RetryDisposition::Retryable;
                    let err = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    if !retryable {
                        return Err(err);
                    }
                    err
                }
                Err(err) => {
                    if classify_reqwest_error(&err) != RetryDisposition::Retryable {
                        return Err(FetchError::Request(err));
                    }
                    FetchError::Request(err)
                }
            };

            if attempt >= self.backoff.max_retries {
                return Err(err);
            }
            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedDocument, FetchError> {
        let span = info_span!(
            "http_fetch",
            run_id = %request.run_id,
            source_id = %request.source_id,
            url = %request.url
        );
        self.fetch_with_retries(request).instrument(span).await
    }
}
