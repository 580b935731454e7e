use std::future::Future;
use std::time::Duration;

use crate::error::{Error, Result};

/// Timeout for one attempt plus how often to try again.
///
/// Attempt `n` (starting at zero) gets `initial_timeout * 2^n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_timeout: Duration,
    pub pause: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 2,
            initial_timeout: Duration::from_secs(10),
            pause: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn timeout_for(&self, attempt: u32) -> Duration {
        self.initial_timeout.saturating_mul(1 << attempt.min(16))
    }

    /// Runs `operation` until it succeeds, fails permanently or the retries are exhausted.
    ///
    /// Only timeouts and [`Error::TransientNetwork`] are retried.
    pub async fn run<T, F, Fut>(&self, name: &str, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            let timeout = self.timeout_for(attempt);
            let error = match operation().with_timeout(timeout).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) if !e.is_transient() => return Err(e),
                Ok(Err(e)) => e,
                Err(elapsed) => Error::TransientNetwork(format!("'{name}' timed out after {elapsed:?}")),
            };

            if attempt >= self.max_retries {
                tracing::warn!(%error, attempts = attempt + 1, "'{}' failed, giving up", name);
                return Err(error);
            }
            tracing::debug!(%error, attempt, "'{}' failed, retrying", name);
            attempt += 1;
            tokio::time::sleep(self.pause).await;
        }
    }
}

pub trait WithTimeout<T> {
    /// Resolves to `Err(timeout)` when the future doesn't finish in time.
    fn with_timeout(self, timeout: Duration) -> impl Future<Output = std::result::Result<T, Duration>>
    where
        Self: Future<Output = T>;
}

impl<F, T> WithTimeout<T> for F
where
    F: Future<Output = T>,
{
    async fn with_timeout(self, timeout: Duration) -> std::result::Result<T, Duration> {
        tokio::time::timeout(timeout, self).await.map_err(|_| timeout)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 2,
            initial_timeout: Duration::from_millis(20),
            pause: Duration::from_millis(1),
        }
    }

    #[test]
    fn timeouts_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.timeout_for(0), Duration::from_secs(10));
        assert_eq!(policy.timeout_for(1), Duration::from_secs(20));
        assert_eq!(policy.timeout_for(2), Duration::from_secs(40));
    }

    #[tokio::test]
    async fn retries_transient_errors_then_succeeds() {
        let calls = AtomicU32::new(0);
        let value = fast_policy()
            .run("flaky", || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::TransientNetwork("connection reset".to_owned()))
                } else {
                    Ok(7)
                }
            })
            .await
            .expect("third attempt should succeed");
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let err = fast_policy()
            .run("broken", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Error::Api("HTTP 404".to_owned()))
            })
            .await
            .expect_err("should fail");
        assert!(matches!(err, Error::Api(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausted_timeouts_surface_as_transient() {
        let calls = AtomicU32::new(0);
        let err = fast_policy()
            .run("slow", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await
            .expect_err("should time out");
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
