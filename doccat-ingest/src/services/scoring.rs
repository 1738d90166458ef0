//! Scoring collaborator (triage / embedding / naming)
//!
//! The models themselves live behind an HTTP service; this module owns the
//! client, the retry policy and the error taxonomy. Latency and occasional
//! failure are expected: callers retry per document with [`with_retry`] and
//! record a per-document failure once attempts are exhausted.

use async_trait::async_trait;
use governor::{Quota, RateLimiter};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::num::NonZeroU32;
use std::time::Duration;
use thiserror::Error;

use crate::models::TriageLabel;

/// Upper bound for a single backoff sleep
const MAX_BACKOFF_MS: u64 = 30_000;

const USER_AGENT: &str = concat!("doccat-ingest/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("API error {0}: {1}")]
    Api(u16, String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Embedding has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
}

impl ScoringError {
    /// Transient failures worth another attempt
    pub fn is_retryable(&self) -> bool {
        match self {
            ScoringError::Network(_) | ScoringError::Timeout | ScoringError::RateLimited => true,
            ScoringError::Api(status, _) => *status >= 500,
            ScoringError::InvalidResponse(_) | ScoringError::DimensionMismatch { .. } => false,
        }
    }
}

/// Triage verdict for one document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriageResult {
    pub label: TriageLabel,
    pub confidence: f32,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Proposed cluster name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterNaming {
    pub name: String,
    #[serde(default, rename = "nameTranslation", alias = "name_translation")]
    pub name_translation: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[async_trait]
pub trait ScoringClient: Send + Sync {
    async fn triage(&self, text: &str) -> Result<TriageResult, ScoringError>;

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ScoringError>;

    /// Name a cluster from sample document texts
    async fn name(&self, samples: &[String]) -> Result<ClusterNaming, ScoringError>;

    /// Fixed embedding length, if known up front
    fn dimension(&self) -> Option<usize>;
}

/// Run `op` up to `max_attempts` times with exponential backoff
///
/// Non-retryable errors are returned immediately.
pub async fn with_retry<T, F, Fut>(
    operation: &str,
    max_attempts: u32,
    backoff_ms: u64,
    mut op: F,
) -> Result<T, ScoringError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ScoringError>>,
{
    let max_attempts = max_attempts.max(1);
    let mut delay_ms = backoff_ms;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < max_attempts => {
                tracing::warn!(
                    operation,
                    attempt,
                    max_attempts,
                    backoff_ms = delay_ms,
                    error = %e,
                    "Scoring call failed, retrying"
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = delay_ms.saturating_mul(2).min(MAX_BACKOFF_MS);
            }
            Err(e) => {
                tracing::debug!(operation, attempt, error = %e, "Scoring call gave up");
                return Err(e);
            }
        }
    }
}

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

/// Evenly spaced requests: no burst above one call
fn rate_limiter(requests_per_second: NonZeroU32) -> DirectRateLimiter {
    RateLimiter::direct(Quota::per_second(requests_per_second).allow_burst(NonZeroU32::MIN))
}

#[derive(Serialize)]
struct TextRequest<'a> {
    text: &'a str,
}

#[derive(Serialize)]
struct NameRequest<'a> {
    samples: &'a [String],
}

#[derive(Deserialize)]
struct WireTriage {
    label: String,
    confidence: f32,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Deserialize)]
struct WireEmbedding {
    vector: Vec<f32>,
}

/// JSON-over-HTTP scoring client (`POST /triage`, `/embed`, `/name`)
pub struct HttpScoringClient {
    http_client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    rate_limiter: Option<DirectRateLimiter>,
    dimension: Option<usize>,
}

impl HttpScoringClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        timeout: Duration,
        max_requests_per_second: Option<u32>,
        dimension: Option<usize>,
    ) -> Result<Self, ScoringError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| ScoringError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            rate_limiter: max_requests_per_second
                .and_then(NonZeroU32::new)
                .map(rate_limiter),
            dimension,
        })
    }

    async fn post<B, R>(&self, endpoint: &str, body: &B) -> Result<R, ScoringError>
    where
        B: Serialize + ?Sized,
        R: for<'de> Deserialize<'de>,
    {
        if let Some(limiter) = &self.rate_limiter {
            limiter.until_ready().await;
        }

        let url = format!("{}/{}", self.base_url, endpoint);
        tracing::debug!(url = %url, "Calling scoring service");

        let mut request = self.http_client.post(&url).json(body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ScoringError::Timeout
            } else {
                ScoringError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ScoringError::RateLimited);
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ScoringError::Api(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ScoringError::InvalidResponse(e.to_string()))
    }
}

#[async_trait]
impl ScoringClient for HttpScoringClient {
    async fn triage(&self, text: &str) -> Result<TriageResult, ScoringError> {
        let wire: WireTriage = self.post("triage", &TextRequest { text }).await?;
        let label = TriageLabel::parse(&wire.label.to_uppercase())
            .ok_or_else(|| ScoringError::InvalidResponse(format!("unknown label '{}'", wire.label)))?;
        Ok(TriageResult {
            label,
            confidence: wire.confidence.clamp(0.0, 1.0),
            reason: wire.reason,
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, ScoringError> {
        let wire: WireEmbedding = self.post("embed", &TextRequest { text }).await?;
        if let Some(expected) = self.dimension {
            if wire.vector.len() != expected {
                return Err(ScoringError::DimensionMismatch {
                    expected,
                    actual: wire.vector.len(),
                });
            }
        }
        Ok(wire.vector)
    }

    async fn name(&self, samples: &[String]) -> Result<ClusterNaming, ScoringError> {
        let naming: ClusterNaming = self.post("name", &NameRequest { samples }).await?;
        if naming.name.trim().is_empty() {
            return Err(ScoringError::InvalidResponse("empty cluster name".to_string()));
        }
        Ok(naming)
    }

    fn dimension(&self) -> Option<usize> {
        self.dimension
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn test_retry_recovers_from_transient_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result = with_retry("triage", 3, 1, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ScoringError::Timeout)
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_at_max_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry("embed", 3, 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ScoringError::Api(503, "busy".into())) }
        })
        .await;

        assert!(matches!(result, Err(ScoringError::Api(503, _))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let result: Result<(), _> = with_retry("name", 5, 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ScoringError::Api(400, "bad request".into())) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_naming_accepts_camel_case_translation() {
        let naming: ClusterNaming = serde_json::from_str(
            r#"{"name":"Invoices","nameTranslation":"Rechnungen","description":"Supplier invoices"}"#,
        )
        .unwrap();
        assert_eq!(naming.name_translation.as_deref(), Some("Rechnungen"));
    }

    #[tokio::test]
    async fn test_rate_limited_client_spaces_requests() {
        let client = HttpScoringClient::new(
            "http://localhost:9",
            None,
            Duration::from_secs(1),
            Some(10),
            None,
        )
        .unwrap();
        let limiter = client.rate_limiter.as_ref().unwrap();

        let start = Instant::now();
        limiter.until_ready().await;
        assert!(start.elapsed() < Duration::from_millis(50));

        // 10 per second without burst: the next permit is ~100ms away
        let start = Instant::now();
        limiter.until_ready().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[test]
    fn test_zero_rate_disables_limiting() {
        let client =
            HttpScoringClient::new("http://localhost:9/", None, Duration::from_secs(1), Some(0), None)
                .unwrap();
        assert!(client.rate_limiter.is_none());
        assert_eq!(client.base_url, "http://localhost:9");
    }
}
