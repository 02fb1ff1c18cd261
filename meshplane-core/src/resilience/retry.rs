//! Retry interceptor (part of component C10).

use crate::error::CoreError;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Default retryable set (spec §4.8): Unavailable, BadGateway, ResourceExhausted,
/// Internal, DeadlineExceeded.
pub fn default_is_retryable(err: &CoreError) -> bool {
    matches!(
        err,
        CoreError::Unavailable(_)
            | CoreError::BadGateway(_)
            | CoreError::ResourceExhausted(_)
            | CoreError::Internal(_)
            | CoreError::DeadlineExceeded(_)
    )
}

impl RetryPolicy {
    /// `min(initial * multiplier^(n-1), max_backoff)`, attempt `n` starting at 1.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = (attempt.saturating_sub(1)) as i32;
        let scaled = self.initial_backoff.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = scaled.min(self.max_backoff.as_secs_f64());
        let factor = if self.jitter {
            rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            1.0
        };
        Duration::from_secs_f64(capped * factor)
    }

    /// Runs `operation` until it succeeds, a non-retryable error is returned, or
    /// `max_attempts` is exhausted (in which case the last error is returned).
    pub async fn execute<F, Fut, T>(
        &self,
        is_retryable: impl Fn(&CoreError) -> bool,
        mut operation: F,
    ) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match operation().await {
                Ok(value) => return Ok(value),
                Err(err) if attempt < self.max_attempts && is_retryable(&err) => {
                    let backoff = self.backoff_for_attempt(attempt);
                    tracing::debug!(attempt, ?backoff, "retrying after error: {err}");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn backoff_is_capped_and_monotonic_without_jitter() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(500),
            multiplier: 2.0,
            jitter: false,
        };
        assert_eq!(policy.backoff_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.backoff_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.backoff_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.backoff_for_attempt(4), Duration::from_millis(500));
    }

    #[tokio::test]
    async fn stops_on_non_retryable_error() {
        let policy = RetryPolicy::default();
        let attempts = AtomicU32::new(0);
        let result = policy
            .execute(default_is_retryable, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(CoreError::InvalidArgument("bad".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_attempts_on_persistent_retryable_error() {
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            multiplier: 2.0,
            jitter: false,
        };
        let attempts = AtomicU32::new(0);
        let result: Result<(), _> = policy
            .execute(default_is_retryable, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(CoreError::Unavailable("down".into())) }
            })
            .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
