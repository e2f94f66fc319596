//! Error mapping and retry policy for provider calls.
//!
//! Transient vendor failures (transport errors, 429, 5xx) get exactly one
//! retry with exponential backoff and jitter. Client errors are never
//! retried.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

use vx_domain::error::{Error, Result};

/// Convert a [`reqwest::Error`] into the domain error type.
///
/// Timeouts map to [`Error::Timeout`]; everything else is treated as the
/// named service being unreachable.
pub fn from_reqwest(service: &str, e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(format!("{service}: {e}"))
    } else {
        Error::unavailable(service, e.to_string())
    }
}

/// Map a non-success HTTP status to the domain error type.
///
/// `429` and `5xx` surface as retriable unavailability; everything else is
/// an invalid request from our side.
pub fn from_status(service: &str, status: reqwest::StatusCode, body: &str) -> Error {
    let snippet: String = body.chars().take(300).collect();
    if status.as_u16() == 429 || status.is_server_error() {
        Error::unavailable(service, format!("{status}: {snippet}"))
    } else {
        Error::InputInvalid(format!("{service} rejected request ({status}): {snippet}"))
    }
}

/// Run `op`, retrying once on a retriable failure after a jittered backoff.
pub async fn with_retry<T, F, Fut>(base_delay: Duration, op: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match op().await {
        Ok(value) => Ok(value),
        Err(first) if first.is_retriable() => {
            let delay = jittered(base_delay);
            tracing::warn!(
                error = %first,
                delay_ms = delay.as_millis() as u64,
                "retriable provider failure, retrying once"
            );
            tokio::time::sleep(delay).await;
            op().await
        }
        Err(e) => Err(e),
    }
}

/// Double the base delay and add up to 50% random jitter.
fn jittered(base: Duration) -> Duration {
    let doubled = base.saturating_mul(2);
    let jitter_ms = rand::thread_rng().gen_range(0..=doubled.as_millis().max(1) as u64 / 2);
    doubled + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn retries_once_on_transient_failure() {
        let attempts = AtomicU32::new(0);
        let result = with_retry(Duration::from_millis(1), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(Error::unavailable("llm", "503"))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn does_not_retry_client_errors() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(Duration::from_millis(1), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::InputInvalid("bad request".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_second_failure() {
        let attempts = AtomicU32::new(0);
        let result: Result<()> = with_retry(Duration::from_millis(1), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::unavailable("llm", "still down")) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn status_mapping() {
        let too_many = from_status("llm", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(too_many.is_retriable());
        let bad = from_status("llm", reqwest::StatusCode::BAD_REQUEST, "nope");
        assert!(!bad.is_retriable());
    }
}
