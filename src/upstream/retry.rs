//! Retry helper for upstream calls: timeout + exponential backoff with
//! jitter. Wrap every provider call with this to get standardized retries.

use rand::Rng;
use std::time::Duration;
use tokio::time::{sleep, timeout};

use crate::error::UpstreamError;

/// Max attempts including the first
pub const MAX_ATTEMPTS: usize = 3;
/// Base backoff (ms)
const BACKOFF_BASE_MS: u64 = 100;
/// Jitter applied around the computed backoff
const JITTER_FRACTION: f64 = 0.25;

/// Call async closure `op` with the standard retry policy.
///
/// Each attempt runs under `attempt_timeout`; a timed-out attempt counts
/// as [`UpstreamError::Unavailable`]. Malformed responses are terminal and
/// are never retried.
pub async fn with_retry<F, Fut, T>(attempt_timeout: Duration, op: F) -> Result<T, UpstreamError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, UpstreamError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match timeout(attempt_timeout, op()).await {
            Ok(res) => res,
            Err(_) => Err(UpstreamError::Unavailable),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e @ UpstreamError::BadResponse(_)) => return Err(e),
            Err(e) => {
                if attempt >= MAX_ATTEMPTS {
                    return Err(e);
                }
                let backoff_ms = backoff_with_jitter(attempt);
                tracing::debug!(
                    attempt,
                    max_attempts = MAX_ATTEMPTS,
                    backoff_ms,
                    error = %e,
                    "upstream call failed, retrying"
                );
                sleep(Duration::from_millis(backoff_ms)).await;
            }
        }
    }
}

/// Exponential backoff with +/-25% jitter: `base * 2^(attempt-1)`,
/// jittered into `[0.75x, 1.25x]`.
fn backoff_with_jitter(attempt: usize) -> u64 {
    let exp_backoff =
        BACKOFF_BASE_MS.saturating_mul(2_u64.saturating_pow((attempt.saturating_sub(1)) as u32));

    let mut rng = rand::thread_rng();
    let jitter_factor = rng.gen_range((1.0 - JITTER_FRACTION)..=(1.0 + JITTER_FRACTION));
    (exp_backoff as f64 * jitter_factor) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn backoff_stays_within_jitter_bounds() {
        for attempt in 1..=3 {
            let base = BACKOFF_BASE_MS * 2u64.pow(attempt as u32 - 1);
            for _ in 0..20 {
                let backoff = backoff_with_jitter(attempt);
                assert!(backoff >= (base as f64 * 0.75) as u64);
                assert!(backoff <= (base as f64 * 1.25) as u64 + 1);
            }
        }
    }

    #[tokio::test]
    async fn success_on_first_attempt() {
        let result = with_retry(Duration::from_secs(1), || async { Ok::<_, UpstreamError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_until_exhaustion() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, _> = with_retry(Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpstreamError::Unavailable) }
        })
        .await;
        assert_eq!(result.unwrap_err(), UpstreamError::Unavailable);
        assert_eq!(calls.load(Ordering::SeqCst), MAX_ATTEMPTS);
    }

    #[tokio::test]
    async fn bad_response_is_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<i32, _> = with_retry(Duration::from_secs(1), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(UpstreamError::BadResponse("nonsense".into())) }
        })
        .await;
        assert!(matches!(result.unwrap_err(), UpstreamError::BadResponse(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn recovers_after_transient_failures() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(Duration::from_secs(1), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(UpstreamError::RateLimited)
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
    }
}
