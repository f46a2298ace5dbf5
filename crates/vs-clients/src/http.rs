//! Process-wide HTTP plumbing: a single pooled client, per-request timeout,
//! slow-call logging, and bounded retry with exponential backoff + jitter
//! for transient failures (network, timeout, 5xx, 429).

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use reqwest::{RequestBuilder, Response, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-request timeout applied around every outbound call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Calls slower than this produce a structured `slow external call` warning.
const SLOW_THRESHOLD: Duration = Duration::from_secs(5);

/// Maximum retry attempts for transient failures.
const MAX_RETRIES: u32 = 3;

const BACKOFF_BASE: Duration = Duration::from_millis(250);

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("network error: {0}")]
    Network(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("request timed out")]
    Timeout,
    #[error("cancelled")]
    Cancelled,
}

impl HttpError {
    /// Transient errors are worth retrying; contract errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            HttpError::Network(_) | HttpError::Timeout => true,
            HttpError::Status(code) => *code >= 500 || *code == 429,
            HttpError::Cancelled => false,
        }
    }
}

/// Shared connection-pooled HTTP client. One instance per process; all four
/// external clients route through it so keep-alive, pacing, and metrics are
/// uniform.
#[derive(Debug, Clone)]
pub struct HttpPool {
    client: reqwest::Client,
    cancel: CancellationToken,
    api_delay: Duration,
}

impl HttpPool {
    pub fn new(cancel: CancellationToken, api_delay_ms: u64) -> Self {
        let client = reqwest::Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            cancel,
            api_delay: Duration::from_millis(api_delay_ms),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Optional pacing sleep between external write calls (`API_DELAY`).
    pub async fn pace(&self) {
        if !self.api_delay.is_zero() {
            tokio::time::sleep(self.api_delay).await;
        }
    }

    /// Send a request with timeout, slow-call logging, and retry on
    /// transient failures. `api` labels the downstream service for logs and
    /// the latency histogram. Returns the response only for 2xx statuses.
    pub async fn send(&self, api: &'static str, request: RequestBuilder) -> Result<Response, HttpError> {
        let mut attempt: u32 = 0;
        loop {
            let Some(this_try) = request.try_clone() else {
                // Streaming bodies cannot be retried; single shot.
                return self.send_once(api, request).await;
            };

            match self.send_once(api, this_try).await {
                Ok(resp) => return Ok(resp),
                Err(e) if e.is_transient() && attempt < MAX_RETRIES => {
                    let delay = backoff_delay(attempt);
                    warn!(api, attempt, error = %e, delay_ms = delay.as_millis() as u64,
                          "transient error, retrying");
                    attempt += 1;
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(HttpError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn send_once(&self, api: &'static str, request: RequestBuilder) -> Result<Response, HttpError> {
        if self.cancel.is_cancelled() {
            return Err(HttpError::Cancelled);
        }

        let started = Instant::now();
        let outcome = tokio::select! {
            _ = self.cancel.cancelled() => return Err(HttpError::Cancelled),
            r = tokio::time::timeout(REQUEST_TIMEOUT, request.send()) => r,
        };
        let elapsed = started.elapsed();

        vs_telemetry::global_metrics().record_histogram(
            "api_request_duration_seconds",
            &[("api", api)],
            elapsed.as_secs_f64(),
        );
        if elapsed > SLOW_THRESHOLD {
            warn!(api, elapsed_ms = elapsed.as_millis() as u64, "slow external call");
        } else {
            debug!(api, elapsed_ms = elapsed.as_millis() as u64, "external call");
        }

        let resp = match outcome {
            Err(_) => return Err(HttpError::Timeout),
            Ok(Err(e)) => return Err(HttpError::Network(e.to_string())),
            Ok(Ok(resp)) => resp,
        };

        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else {
            Err(HttpError::Status(status.as_u16()))
        }
    }
}

/// Exponential backoff with jitter. The jitter source is the subsecond clock
/// rather than a PRNG; it only needs to spread concurrent retries apart.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BACKOFF_BASE * 2u32.saturating_pow(attempt);
    let jitter_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let jitter = Duration::from_millis(u64::from(jitter_ns % 125));
    base + jitter
}

/// Convenience: classify a status code the way the retry loop does.
pub fn status_is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(HttpError::Network("reset".into()).is_transient());
        assert!(HttpError::Timeout.is_transient());
        assert!(HttpError::Status(500).is_transient());
        assert!(HttpError::Status(429).is_transient());
        assert!(!HttpError::Status(404).is_transient());
        assert!(!HttpError::Status(409).is_transient());
        assert!(!HttpError::Cancelled.is_transient());
    }

    #[test]
    fn backoff_grows_with_attempts() {
        let d0 = backoff_delay(0);
        let d2 = backoff_delay(2);
        assert!(d0 >= BACKOFF_BASE);
        assert!(d0 < BACKOFF_BASE + Duration::from_millis(126));
        assert!(d2 >= BACKOFF_BASE * 4);
    }

    #[test]
    fn status_helper_matches_retry_policy() {
        assert!(status_is_transient(StatusCode::BAD_GATEWAY));
        assert!(status_is_transient(StatusCode::TOO_MANY_REQUESTS));
        assert!(!status_is_transient(StatusCode::CONFLICT));
    }

    #[tokio::test]
    async fn cancelled_pool_short_circuits() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let pool = HttpPool::new(cancel, 0);
        let req = pool.client().get("http://127.0.0.1:1/never");
        let err = pool.send("tracker", req).await.unwrap_err();
        assert!(matches!(err, HttpError::Cancelled));
    }

    #[tokio::test]
    async fn connection_refused_is_network_error() {
        // Port 1 refuses immediately; with retries this still resolves fast.
        let pool = HttpPool::new(CancellationToken::new(), 0);
        let req = pool.client().get("http://127.0.0.1:1/nope");
        let err = pool.send_once("board", req).await.unwrap_err();
        assert!(matches!(err, HttpError::Network(_)));
    }
}
