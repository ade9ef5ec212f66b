use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;
use tracing::warn;

use common::config::RetryConfigSection;
use common::Result;

/// Exponential backoff with a cap and jitter, applied only to calls that are
/// idempotent at the venue (reads, cancels by id, leverage/margin changes).
/// Entry placement is deliberately NOT wrapped: after a network-unknown
/// result the reconciler decides, not a blind resend.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_factor: f64,
}

impl RetryPolicy {
    pub fn from_config(section: &RetryConfigSection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_millis(section.base_delay_ms),
            max_delay: Duration::from_millis(section.max_delay_ms),
            jitter_factor: 0.3,
        }
    }

    /// Delay before retry number `attempt` (0-based), doubled each time,
    /// clamped, with ±jitter applied.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64 * 2.0_f64.powi(attempt as i32);
        let clamped = base.min(self.max_delay.as_millis() as f64);
        let jitter_range = clamped * self.jitter_factor;
        let jitter: f64 = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((clamped + jitter).max(0.0) as u64)
    }

    /// Run `operation` until it succeeds or attempts are exhausted. A
    /// non-retryable failure (bad request, business reject) returns
    /// immediately; resending those never helps.
    pub async fn run<F, Fut, T>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut last_error = None;
        for attempt in 0..self.max_attempts {
            match operation().await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    if !is_retryable_error(&e) {
                        warn!(operation = name, error = %e, "non-retryable failure");
                        return Err(e);
                    }
                    if attempt + 1 < self.max_attempts {
                        let delay = self.delay_for_attempt(attempt);
                        warn!(
                            operation = name,
                            attempt = attempt + 1,
                            max = self.max_attempts,
                            error = %e,
                            delay_ms = delay.as_millis() as u64,
                            "retryable call failed"
                        );
                        sleep(delay).await;
                    }
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| common::Error::Other(format!("{name}: retry exhausted"))))
    }
}

/// Whether a failed call is worth resending. Transport-level failures are;
/// venue responses are only when the status is a known-transient one. A
/// business reject (non-HTTP exchange message) never retries.
pub fn is_retryable_error(error: &common::Error) -> bool {
    match error {
        common::Error::Http(_) | common::Error::WebSocket(_) => true,
        common::Error::Exchange(message) => {
            http_status_of(message).map_or(false, is_retryable_status)
        }
        _ => false,
    }
}

/// HTTP statuses worth retrying.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Adapters render venue HTTP failures as `HTTP <status …>: <body>`.
fn http_status_of(message: &str) -> Option<u16> {
    message
        .strip_prefix("HTTP ")?
        .split_whitespace()
        .next()?
        .trim_end_matches(':')
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            jitter_factor: 0.0,
        }
    }

    #[test]
    fn delays_double_and_clamp() {
        let p = policy(5);
        assert_eq!(p.delay_for_attempt(0), Duration::from_millis(1));
        assert_eq!(p.delay_for_attempt(1), Duration::from_millis(2));
        assert_eq!(p.delay_for_attempt(2), Duration::from_millis(4));
        assert_eq!(p.delay_for_attempt(3), Duration::from_millis(4));
    }

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = policy(3)
            .run("test", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(common::Error::Http("503".into()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn returns_last_error_when_exhausted() {
        let result: Result<(), _> = policy(2)
            .run("test", || async { Err(common::Error::Http("500".into())) })
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_retryable_status_stops_after_one_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), _> = policy(3)
            .run("test", || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(common::Error::Exchange(
                        "HTTP 400 Bad Request: {\"code\":-1111}".into(),
                    ))
                }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn transient_exchange_status_still_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result = policy(3)
            .run("test", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 1 {
                        Err(common::Error::Exchange("HTTP 503 Service Unavailable: busy".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn error_classification() {
        assert!(is_retryable_error(&common::Error::Http("timed out".into())));
        assert!(is_retryable_error(&common::Error::Exchange(
            "HTTP 429 Too Many Requests: slow down".into()
        )));
        assert!(!is_retryable_error(&common::Error::Exchange(
            "HTTP 400 Bad Request: bad qty".into()
        )));
        // Business rejects carry no HTTP status and never retry.
        assert!(!is_retryable_error(&common::Error::Exchange(
            "leverage not modified (110043)".into()
        )));
        assert!(!is_retryable_error(&common::Error::Config("bad".into())));
    }
}
