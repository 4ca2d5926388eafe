//! Bounded retry loop with retryable / terminal classification.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::context::OpContext;
use crate::error::ProviderError;

/// Outcome of one failed attempt.
#[derive(Debug)]
pub enum RetryError {
    /// Try again after backing off.
    Retryable(ProviderError),
    /// Stop and surface the error.
    NonRetryable(ProviderError),
}

impl RetryError {
    /// The wrapped error.
    pub fn into_inner(self) -> ProviderError {
        match self {
            RetryError::Retryable(e) | RetryError::NonRetryable(e) => e,
        }
    }
}

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// The same delay every time.
    Constant(Duration),
    /// Doubling from `initial`, capped at `max`.
    Exponential {
        /// First delay.
        initial: Duration,
        /// Largest delay.
        max: Duration,
    },
}

impl Backoff {
    /// Delay after the given (zero-based) failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        match *self {
            Backoff::Constant(d) => d,
            Backoff::Exponential { initial, max } => {
                initial.saturating_mul(2u32.saturating_pow(attempt.min(16))).min(max)
            },
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Constant(Duration::from_secs(5))
    }
}

/// Classify an API error for create/update style operations: throttling,
/// conflicts, 5xx and transport failures are retried.
pub fn classify(err: ProviderError) -> RetryError {
    if err.is_retryable() {
        RetryError::Retryable(err)
    } else {
        RetryError::NonRetryable(err)
    }
}

/// Classify an API error for deletes: additionally retries the 403 an object
/// returns while it still contains resources.
pub fn classify_delete(err: ProviderError) -> RetryError {
    if err.is_still_contains_resources() || err.is_retryable() {
        RetryError::Retryable(err)
    } else {
        RetryError::NonRetryable(err)
    }
}

/// Run `op` until it succeeds, fails terminally, or `timeout` elapses.
///
/// When time runs out the most recent retryable error is returned; a
/// cancellation of `ctx` is returned as-is.
pub async fn retry<T, F, Fut>(
    ctx: &OpContext,
    timeout: Duration,
    backoff: Backoff,
    mut op: F,
) -> Result<T, ProviderError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RetryError>>,
{
    let retry_ctx = ctx.child_with_timeout(timeout);
    let mut attempt = 0u32;
    let mut last: Option<ProviderError> = None;
    loop {
        let err = match retry_ctx.run(async { Ok(op().await) }).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(RetryError::NonRetryable(err))) => return Err(err),
            Ok(Err(RetryError::Retryable(err))) => err,
            Err(ctx_err @ ProviderError::Timeout { .. }) => return Err(last.unwrap_or(ctx_err)),
            Err(ctx_err) => return Err(ctx_err),
        };

        let delay = backoff.delay(attempt);
        warn!(attempt, error = %err, "retryable error, retrying in {:?}", delay);
        attempt += 1;

        match retry_ctx.sleep(delay).await {
            Ok(()) => last = Some(err),
            Err(ProviderError::Timeout { .. }) => return Err(err),
            Err(other) => return Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ApiError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::time::Instant;

    fn api(status: u16, message: &str) -> ProviderError {
        ApiError::new("DELETE", "/v2/x", status, message).into()
    }

    #[test]
    fn test_backoff() {
        assert_eq!(Backoff::default().delay(7), Duration::from_secs(5));
        let exp = Backoff::Exponential {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(4),
        };
        assert_eq!(exp.delay(0), Duration::from_millis(500));
        assert_eq!(exp.delay(2), Duration::from_secs(2));
        assert_eq!(exp.delay(9), Duration::from_secs(4));
    }

    #[test]
    fn test_classification() {
        assert!(matches!(classify(api(429, "slow down")), RetryError::Retryable(_)));
        assert!(matches!(classify(api(503, "unavailable")), RetryError::Retryable(_)));
        assert!(matches!(classify(api(422, "invalid")), RetryError::NonRetryable(_)));
        assert!(matches!(
            classify(api(403, "attachment still contains resources")),
            RetryError::NonRetryable(_)
        ));
        assert!(matches!(
            classify_delete(api(403, "attachment still contains resources")),
            RetryError::Retryable(_)
        ));
        assert!(matches!(
            classify_delete(api(403, "forbidden")),
            RetryError::NonRetryable(_)
        ));
        assert!(matches!(
            classify(ProviderError::Parse("x".to_string())),
            RetryError::NonRetryable(_)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let result = retry(&OpContext::new(), Duration::from_secs(60), Backoff::default(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(classify_delete(api(403, "still contains resources")))
                } else {
                    Ok(n)
                }
            }
        })
        .await
        .unwrap();
        assert_eq!(result, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = retry(&OpContext::new(), Duration::from_secs(60), Backoff::default(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err::<(), _>(RetryError::NonRetryable(api(422, "invalid"))) }
        })
        .await
        .unwrap_err();
        assert_eq!(err.status(), Some(422));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_surfaces_last_error() {
        let start = Instant::now();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = retry(&OpContext::new(), Duration::from_secs(20), Backoff::default(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(RetryError::Retryable(api(409, &format!("conflict {}", n)))) }
        })
        .await
        .unwrap_err();
        assert!(start.elapsed() <= Duration::from_secs(20));
        let last = calls.load(Ordering::SeqCst) - 1;
        assert_eq!(err.message(), format!("conflict {}", last));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_during_attempt_surfaces_last_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let err = retry(&OpContext::new(), Duration::from_secs(20), Backoff::default(), move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err::<(), _>(RetryError::Retryable(api(503, "unavailable")))
                } else {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(())
                }
            }
        })
        .await
        .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(err.status(), Some(503));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_is_not_masked() {
        let ctx = OpContext::new();
        let canceller = ctx.clone();
        let err = retry(&ctx, Duration::from_secs(600), Backoff::default(), move || {
            canceller.cancel();
            async { Err::<(), _>(RetryError::Retryable(api(500, "boom"))) }
        })
        .await
        .unwrap_err();
        assert!(matches!(err, ProviderError::Cancelled(_)));
    }
}
