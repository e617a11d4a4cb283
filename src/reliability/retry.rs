//! Shared retry helper with exponential backoff.
//!
//! All scattered call-site retries route through this one policy so the
//! backoff math and retryability decision live in a single place.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            max_attempts,
            base_backoff,
            max_backoff,
        }
    }

    /// Backoff before attempt `attempt` (1-based): base * 2^(attempt-1),
    /// capped at `max_backoff`.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(16);
        let backoff = self.base_backoff.saturating_mul(1u32 << shift);
        backoff.min(self.max_backoff)
    }
}

/// Run `op` up to `policy.max_attempts` times, sleeping the policy backoff
/// between attempts. `retryable` decides whether an error is worth another
/// attempt; the final error is returned as-is.
pub async fn with_retry<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    label: &str,
    retryable: P,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < policy.max_attempts && retryable(&e) => {
                let backoff = policy.backoff_for(attempt);
                debug!(
                    op = label,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "retrying"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy::new(5, Duration::from_millis(500), Duration::from_secs(2));
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(3), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(4), Duration::from_millis(2000));
        assert_eq!(policy.backoff_for(40), Duration::from_millis(2000));
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = with_retry(&policy, "test", |_| true, || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if n < 3 {
                    Err("transient".to_string())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_fails_immediately() {
        let policy = RetryPolicy::new(5, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(&policy, "test", |_| false, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("validation".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = AtomicU32::new(0);
        let result: Result<(), String> = with_retry(&policy, "test", |_| true, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("down".to_string()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
