//! Throttle Guard
//!
//! Retries a provider call when it fails with a throttling error, sleeping a
//! randomized interval whose range depends on the throttling sub-class.
//! Any other error is returned on the first failure. After `max_attempts`
//! throttled attempts the last error is returned wrapped in
//! `ProviderError::RetryExhausted`.

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ProviderError, ThrottleKind};

/// Default bound on attempts per call
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Backoff range for generic limit errors
const LIMIT_BACKOFF: (Duration, Duration) = (Duration::from_secs(2), Duration::from_secs(5));

/// Backoff range for request-rate errors
const REQUEST_RATE_BACKOFF: (Duration, Duration) =
    (Duration::from_secs(5), Duration::from_secs(15));

/// Bounded retry wrapper for throttled provider calls
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThrottleGuard {
    max_attempts: u32,
    limit_backoff: (Duration, Duration),
    request_rate_backoff: (Duration, Duration),
}

impl Default for ThrottleGuard {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS)
    }
}

impl ThrottleGuard {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            limit_backoff: LIMIT_BACKOFF,
            request_rate_backoff: REQUEST_RATE_BACKOFF,
        }
    }

    /// Override the backoff range for generic limit errors
    pub fn with_limit_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.limit_backoff = (min, max.max(min));
        self
    }

    /// Override the backoff range for request-rate errors
    pub fn with_request_rate_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.request_rate_backoff = (min, max.max(min));
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `request` until it succeeds, fails fatally, or exhausts its attempts
    pub async fn call<T, F, Fut>(&self, operation: &str, mut request: F) -> Result<T, ProviderError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let mut attempt = 0;

        loop {
            attempt += 1;

            let err = match request().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let Some(kind) = err.throttle_kind() else {
                debug!(operation = %operation, error = %err, "Provider call failed");
                return Err(err);
            };

            if attempt >= self.max_attempts {
                warn!(
                    operation = %operation,
                    attempts = attempt,
                    error = %err,
                    "Throttling retry limit reached"
                );
                return Err(ProviderError::RetryExhausted {
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            let delay = self.backoff(kind);
            warn!(
                operation = %operation,
                kind = %kind,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Throttled by provider, backing off"
            );
            tokio::time::sleep(delay).await;
        }
    }

    fn backoff(&self, kind: ThrottleKind) -> Duration {
        let (min, max) = match kind {
            ThrottleKind::LimitExceeded => self.limit_backoff,
            ThrottleKind::RequestRate => self.request_rate_backoff,
        };
        let millis = rand::thread_rng().gen_range(min.as_millis()..=max.as_millis());
        Duration::from_millis(millis as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::testing::api_error;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tokio::time::Instant;

    fn assert_slept(start: Instant, secs: u64) {
        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_secs(secs)
                && elapsed < Duration::from_secs(secs) + Duration::from_millis(50),
            "slept {:?}, expected {}s",
            elapsed,
            secs
        );
    }

    fn fixed_guard() -> ThrottleGuard {
        ThrottleGuard::new(5)
            .with_limit_backoff(Duration::from_secs(3), Duration::from_secs(3))
            .with_request_rate_backoff(Duration::from_secs(10), Duration::from_secs(10))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_after_throttling_sleeps_once_per_failure() {
        let guard = fixed_guard();
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result = guard
            .call("ListDetectors", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(api_error(400, "LimitExceededException"))
                    } else {
                        Ok("done")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "done");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_slept(start, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_rate_errors_use_their_own_range() {
        let guard = fixed_guard();
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result = guard
            .call("DescribeRegions", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(api_error(503, "RequestLimitExceeded"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await;

        assert!(result.is_ok());
        assert_slept(start, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_returns_last_error_after_max_attempts() {
        let guard = fixed_guard();
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = guard
            .call("ListSecrets", || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    // the final attempt reports a different throttling code
                    let code = if n == 4 { "RequestLimitExceeded" } else { "Throttling" };
                    Err(api_error(400, code))
                }
            })
            .await;

        let err = result.unwrap_err();
        assert!(matches!(err, ProviderError::RetryExhausted { attempts: 5, .. }));
        assert!(err.is_code("RequestLimitExceeded"));
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
        // four sleeps between five attempts
        assert_slept(start, 12);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_errors_are_not_retried() {
        let guard = fixed_guard();
        let attempts = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<(), _> = guard
            .call("GetDetector", || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(api_error(403, "AccessDeniedException")) }
            })
            .await;

        assert!(result.unwrap_err().is_code("AccessDeniedException"));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert_slept(start, 0);
    }

    #[test]
    fn test_default_backoff_ranges() {
        let guard = ThrottleGuard::default();
        assert_eq!(guard.max_attempts(), 5);
        for _ in 0..50 {
            let limit = guard.backoff(ThrottleKind::LimitExceeded);
            assert!(limit >= Duration::from_secs(2) && limit <= Duration::from_secs(5));
            let rate = guard.backoff(ThrottleKind::RequestRate);
            assert!(rate >= Duration::from_secs(5) && rate <= Duration::from_secs(15));
        }
    }
}
