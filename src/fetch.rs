//! Resilient fetch layer.
//!
//! Every outbound call in the pipeline goes through [`Fetcher::execute`];
//! no caller implements its own retry loop. Throttling (HTTP 429) and
//! transport failures are retried with exponential backoff, other non-2xx
//! responses fail immediately with a truncated diagnostic body.

use reqwest::{RequestBuilder, Response, StatusCode, header::HeaderMap};
use serde::Serialize;
use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex},
    time::Duration,
};
use thiserror::Error;
use tokio::time::sleep;
use tracing::warn;

const BODY_PREVIEW_CHARS: usize = 512;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("request failed: {0}")]
    Request(String),
}

/// Tunable parameters for the backoff strategy.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_retries: env_u32("FETCH_MAX_RETRIES").unwrap_or(defaults.max_retries),
            initial_delay: env_u64("FETCH_INITIAL_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.initial_delay),
            multiplier: std::env::var("FETCH_BACKOFF_MULTIPLIER")
                .ok()
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(defaults.multiplier),
            max_delay: env_u64("FETCH_MAX_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.max_delay),
        }
    }
}

/// Backoff delay for a 1-indexed attempt:
/// `min(initial_delay × multiplier^(attempt-1), max_delay)`.
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1);
    let scaled =
        policy.initial_delay.as_millis() as f64 * policy.multiplier.powi(exponent as i32);
    Duration::from_millis(scaled as u64).min(policy.max_delay)
}

/// Per-service rate-limit metadata refreshed from response headers, plus the
/// transient "retrying in Ns" notices the UI surfaces during backoff.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RateLimitState {
    pub remaining: Option<u64>,
    pub reset_epoch: Option<i64>,
}

pub struct RateLimitTracker {
    states: Mutex<HashMap<String, RateLimitState>>,
    notices: Mutex<HashMap<String, u64>>,
    warn_threshold: u64,
}

impl RateLimitTracker {
    pub fn from_env() -> Self {
        Self {
            states: Mutex::new(HashMap::new()),
            notices: Mutex::new(HashMap::new()),
            warn_threshold: env_u64("RATE_LIMIT_WARN_THRESHOLD").unwrap_or(5),
        }
    }

    pub fn record(&self, service: &str, headers: &HeaderMap) {
        let remaining = header_u64(headers, "x-ratelimit-remaining");
        let reset_epoch = header_u64(headers, "x-ratelimit-reset").map(|v| v as i64);
        if remaining.is_none() && reset_epoch.is_none() {
            return;
        }
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let entry = states.entry(service.to_string()).or_default();
        if remaining.is_some() {
            entry.remaining = remaining;
        }
        if reset_epoch.is_some() {
            entry.reset_epoch = reset_epoch;
        }
    }

    pub fn snapshot(&self, service: &str) -> Option<RateLimitState> {
        self.states
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .cloned()
    }

    /// Soft warning signal driven by the tracked remaining budget. Never a
    /// hard stop.
    pub fn low_remaining(&self, service: &str) -> bool {
        self.snapshot(service)
            .and_then(|state| state.remaining)
            .is_some_and(|remaining| remaining <= self.warn_threshold)
    }

    pub fn retrying_in(&self, service: &str) -> Option<u64> {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(service)
            .copied()
    }

    fn set_notice(&self, service: &str, wait: Duration) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(service.to_string(), wait.as_secs().max(1));
    }

    fn clear_notice(&self, service: &str) {
        self.notices
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(service);
    }
}

#[derive(Clone)]
pub struct Fetcher {
    policy: RetryPolicy,
    limits: Arc<RateLimitTracker>,
}

impl Fetcher {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            limits: Arc::new(RateLimitTracker::from_env()),
        }
    }

    pub fn from_env() -> Self {
        Self::new(RetryPolicy::from_env())
    }

    pub fn limits(&self) -> Arc<RateLimitTracker> {
        self.limits.clone()
    }

    /// Send a request, absorbing throttling and transient transport errors.
    ///
    /// The builder must carry a cloneable body (JSON payloads are) so the
    /// same request can be re-sent on retry.
    pub async fn execute(
        &self,
        service: &str,
        request: RequestBuilder,
    ) -> Result<Response, FetchError> {
        run_with_retry(&self.policy, service, &self.limits, || {
            let cloned = request.try_clone();
            async move {
                let req =
                    cloned.ok_or_else(|| FetchError::Request("body is not cloneable".into()))?;
                req.send()
                    .await
                    .map_err(|err| FetchError::Network(err.to_string()))
            }
        })
        .await
    }
}

/// Retry engine behind [`Fetcher::execute`], generic over the send operation
/// so the 429/backoff contract is testable without a live socket.
pub(crate) async fn run_with_retry<F, Fut>(
    policy: &RetryPolicy,
    service: &str,
    limits: &RateLimitTracker,
    mut send: F,
) -> Result<Response, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Response, FetchError>>,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match send().await {
            Ok(response) => {
                limits.record(service, response.headers());
                let status = response.status();
                if status.is_success() {
                    limits.clear_notice(service);
                    return Ok(response);
                }
                if status == StatusCode::TOO_MANY_REQUESTS {
                    if attempt >= policy.max_retries {
                        limits.clear_notice(service);
                        return Err(status_error(response).await);
                    }
                    let wait = retry_after_hint(response.headers())
                        .unwrap_or_else(|| backoff_delay(policy, attempt));
                    limits.set_notice(service, wait);
                    warn!(
                        target = "podforge.fetch",
                        service,
                        attempt,
                        wait_secs = wait.as_secs(),
                        "rate limited, retrying"
                    );
                    sleep(wait).await;
                    continue;
                }
                // Any other non-2xx is not retryable.
                return Err(status_error(response).await);
            }
            Err(FetchError::Network(message)) => {
                if attempt >= policy.max_retries {
                    return Err(FetchError::Network(message));
                }
                let wait = backoff_delay(policy, attempt);
                warn!(
                    target = "podforge.fetch",
                    service,
                    attempt,
                    wait_ms = wait.as_millis() as u64,
                    error = %message,
                    "transport error, retrying"
                );
                sleep(wait).await;
            }
            Err(other) => return Err(other),
        }
    }
}

async fn status_error(response: Response) -> FetchError {
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .unwrap_or_default()
        .chars()
        .take(BODY_PREVIEW_CHARS)
        .collect();
    FetchError::Status { status, body }
}

fn retry_after_hint(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get("retry-after")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_u32(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy_ms(max_retries: u32, initial_ms: u64, max_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            initial_delay: Duration::from_millis(initial_ms),
            multiplier: 2.0,
            max_delay: Duration::from_millis(max_ms),
        }
    }

    fn tracker() -> RateLimitTracker {
        RateLimitTracker {
            states: Mutex::new(HashMap::new()),
            notices: Mutex::new(HashMap::new()),
            warn_threshold: 5,
        }
    }

    fn response(status: u16, headers: &[(&str, &str)], body: &str) -> Response {
        let mut builder = axum::http::Response::builder().status(status);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        Response::from(builder.body(body.to_string()).expect("response"))
    }

    #[test]
    fn backoff_formula_is_attempt_indexed() {
        let policy = policy_ms(5, 1_000, 30_000);
        assert_eq!(backoff_delay(&policy, 1), Duration::from_secs(1));
        assert_eq!(backoff_delay(&policy, 2), Duration::from_secs(2));
        assert_eq!(backoff_delay(&policy, 3), Duration::from_secs(4));
        assert_eq!(backoff_delay(&policy, 4), Duration::from_secs(8));
    }

    #[test]
    fn backoff_clamps_at_max_delay() {
        let policy = policy_ms(5, 1_000, 10_000);
        assert_eq!(backoff_delay(&policy, 4), Duration::from_secs(8));
        assert_eq!(backoff_delay(&policy, 5), Duration::from_secs(10));
        assert_eq!(backoff_delay(&policy, 20), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn succeeds_after_k_throttled_attempts() {
        let policy = policy_ms(4, 10, 1_000);
        let limits = tracker();
        let attempts = AtomicU32::new(0);
        let result = run_with_retry(&policy, "demo", &limits, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n <= 2 {
                    Ok(response(429, &[], "slow down"))
                } else {
                    Ok(response(200, &[], "ok"))
                }
            }
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        // success clears the transient indicator
        assert!(limits.retrying_in("demo").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_past_max_retries_errors() {
        let policy = policy_ms(3, 10, 1_000);
        let limits = tracker();
        let attempts = AtomicU32::new(0);
        let err = run_with_retry(&policy, "demo", &limits, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(response(429, &[], "still throttled")) }
        })
        .await
        .expect_err("should exhaust");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match err {
            FetchError::Status { status, body } => {
                assert_eq!(status, 429);
                assert_eq!(body, "still throttled");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_overrides_formula() {
        let policy = policy_ms(3, 60_000, 120_000);
        let limits = tracker();
        let attempts = AtomicU32::new(0);
        let started = tokio::time::Instant::now();
        let result = run_with_retry(&policy, "demo", &limits, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n == 1 {
                    Ok(response(429, &[("retry-after", "7")], ""))
                } else {
                    Ok(response(200, &[], "ok"))
                }
            }
        })
        .await;
        assert!(result.is_ok());
        // waited exactly the server hint, not the 60s formula delay
        assert_eq!(started.elapsed(), Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn other_statuses_fail_without_retry() {
        let policy = policy_ms(5, 10, 1_000);
        let limits = tracker();
        let attempts = AtomicU32::new(0);
        let body = "x".repeat(2_000);
        let err = run_with_retry(&policy, "demo", &limits, || {
            attempts.fetch_add(1, Ordering::SeqCst);
            let body = body.clone();
            async move { Ok(response(500, &[], &body)) }
        })
        .await
        .expect_err("should fail");
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        match err {
            FetchError::Status { status, body } => {
                assert_eq!(status, 500);
                assert_eq!(body.chars().count(), BODY_PREVIEW_CHARS);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn network_errors_retry_then_reraise_last() {
        let policy = policy_ms(3, 10, 1_000);
        let limits = tracker();
        let attempts = AtomicU32::new(0);
        let err = run_with_retry(&policy, "demo", &limits, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            async move { Err::<Response, _>(FetchError::Network(format!("boom {n}"))) }
        })
        .await
        .expect_err("should exhaust");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        match err {
            FetchError::Network(message) => assert_eq!(message, "boom 3"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn rate_limit_headers_feed_the_tracker() {
        let limits = tracker();
        let response = response(
            200,
            &[("x-ratelimit-remaining", "3"), ("x-ratelimit-reset", "1700000000")],
            "",
        );
        limits.record("pricing", response.headers());
        let state = limits.snapshot("pricing").expect("state");
        assert_eq!(state.remaining, Some(3));
        assert_eq!(state.reset_epoch, Some(1_700_000_000));
        assert!(limits.low_remaining("pricing"));
        assert!(!limits.low_remaining("unknown"));
    }
}
