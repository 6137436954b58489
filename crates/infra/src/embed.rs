//! Embedding client: best-effort search-vector upsert for enriched entities.
//!
//! Failure here never fails the job; the worker records a degraded success.
//! The client owns its retry budget and circuit breaker, and never lets an
//! error escape its boundary: every call resolves to an [`EmbedOutcome`].

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{debug, warn};

use enrichd_core::UntrustedDocument;

use crate::jobs::JobRecord;
use crate::retry::{CircuitBreaker, RetryPolicy, RetryableError, run_with_retry};

/// Embedding call failure, classified for retry decisions.
#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("embed call timeout")]
    Timeout,

    #[error("embed network error: {0}")]
    Network(String),

    #[error("embed server error: HTTP {0}")]
    Server(u16),

    #[error("embed rate limited")]
    RateLimit,

    #[error("embed auth rejected: HTTP {0}")]
    Auth(u16),

    /// The embedding circuit is open; no network call was made.
    #[error("embed circuit open")]
    CircuitOpen,

    #[error("embed unexpected response: {0}")]
    Unknown(String),
}

impl RetryableError for EmbedError {
    fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network(_) | Self::Server(_) | Self::RateLimit
        )
    }

    fn counts_against_breaker(&self) -> bool {
        !matches!(self, Self::CircuitOpen)
    }
}

/// Result of the embedding phase for one job.
///
/// `reason` explains a skip or, when `success` and `skipped` are both false,
/// the terminal failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmbedOutcome {
    pub success: bool,
    pub duration_ms: u64,
    pub attempts: u32,
    pub skipped: bool,
    pub reason: Option<String>,
}

impl EmbedOutcome {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            duration_ms: 0,
            attempts: 0,
            skipped: true,
            reason: Some(reason.into()),
        }
    }

    fn upserted(duration_ms: u64, attempts: u32) -> Self {
        Self {
            success: true,
            duration_ms,
            attempts,
            skipped: false,
            reason: None,
        }
    }

    fn failed(duration_ms: u64, attempts: u32, reason: String) -> Self {
        Self {
            success: false,
            duration_ms,
            attempts,
            skipped: false,
            reason: Some(reason),
        }
    }
}

/// Embedding endpoint settings.
#[derive(Debug, Clone)]
pub struct EmbedConfig {
    pub enabled: bool,
    /// Full upsert URL, e.g. `https://embed.internal/v1/embeddings/upsert`.
    pub endpoint: String,
    /// Bearer token; omitted header when `None`.
    pub auth_token: Option<String>,
    /// Header carrying the tenant id.
    pub tenant_header: String,
    pub call_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for EmbedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: "http://localhost:8090/v1/embeddings/upsert".to_string(),
            auth_token: None,
            tenant_header: "x-tenant-id".to_string(),
            call_timeout: Duration::from_secs(10),
            retry: RetryPolicy::new(3, Duration::from_millis(250), Duration::from_secs(5)),
        }
    }
}

/// Seam for the worker pool; production uses [`HttpEmbeddingClient`].
#[async_trait]
pub trait EmbeddingClient: Send + Sync {
    async fn upsert(&self, job: &JobRecord, snapshot: &UntrustedDocument) -> EmbedOutcome;
}

/// HTTP client for the embedding service.
pub struct HttpEmbeddingClient {
    http: reqwest::Client,
    config: EmbedConfig,
    breaker: Arc<CircuitBreaker>,
}

impl HttpEmbeddingClient {
    pub fn new(config: EmbedConfig, breaker: Arc<CircuitBreaker>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(config.call_timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            config,
            breaker,
        }
    }

    async fn call_once(&self, job: &JobRecord, text: &str) -> Result<(), EmbedError> {
        if !self.breaker.check() {
            return Err(EmbedError::CircuitOpen);
        }

        let body = serde_json::json!({
            "entityId": job.entity_document_id,
            "text": text,
            "metadata": {
                "jobId": job.job_id,
                "entityId": job.entity_id,
                "correlationId": job.correlation_id,
            },
        });

        let mut request = self
            .http
            .post(&self.config.endpoint)
            .header(&self.config.tenant_header, job.tenant_id.to_string())
            .json(&body);
        if let Some(token) = &self.config.auth_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                EmbedError::Timeout
            } else {
                EmbedError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(match status {
            StatusCode::TOO_MANY_REQUESTS => EmbedError::RateLimit,
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => EmbedError::Auth(status.as_u16()),
            s if s.is_server_error() => EmbedError::Server(s.as_u16()),
            s => EmbedError::Unknown(format!("HTTP {s}")),
        })
    }
}

#[async_trait]
impl EmbeddingClient for HttpEmbeddingClient {
    async fn upsert(&self, job: &JobRecord, snapshot: &UntrustedDocument) -> EmbedOutcome {
        if !self.config.enabled {
            return EmbedOutcome::skipped("embedding_disabled");
        }
        let Some(text) = snapshot.searchable_text() else {
            debug!(job_id = %job.job_id, "no searchable text in snapshot, skipping embed");
            return EmbedOutcome::skipped("no_searchable_text");
        };

        let started = Instant::now();
        let attempts = AtomicU32::new(0);

        let result = run_with_retry(&self.config.retry, Some(self.breaker.as_ref()), |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            self.call_once(job, &text)
        })
        .await;

        let duration_ms = started.elapsed().as_millis() as u64;
        let attempts = attempts.load(Ordering::Relaxed);

        match result {
            Ok(()) => {
                debug!(job_id = %job.job_id, attempts, duration_ms, "embedding upserted");
                EmbedOutcome::upserted(duration_ms, attempts)
            }
            Err(e) => {
                warn!(
                    job_id = %job.job_id,
                    attempts,
                    duration_ms,
                    error = %e,
                    "embedding upsert failed, continuing without it"
                );
                EmbedOutcome::failed(duration_ms, attempts, e.to_string())
            }
        }
    }
}
