//! Local retry for the few provider calls that fail transiently right after
//! a related operation (IP allocation after create, security-group deletion
//! after instance deletion).

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::VmError;

/// Fixed attempt count with linear backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts.
    pub max_attempts: u32,
    /// Backoff step; the delay after attempt `n` is `n * step`.
    pub step: Duration,
}

impl RetryPolicy {
    /// Public IP allocation right after instance creation.
    pub const IP_ALLOCATION: Self = Self {
        max_attempts: 4,
        step: Duration::from_secs(1),
    };

    /// Security-group deletion right after instance deletion.
    pub const SECURITY_GROUP_DELETE: Self = Self {
        max_attempts: 5,
        step: Duration::from_secs(1),
    };

    /// Delay to wait after the given (1-based) failed attempt.
    #[must_use]
    pub fn delay_after(&self, attempt: u32) -> Duration {
        self.step * attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::SECURITY_GROUP_DELETE
    }
}

/// Run `f` until it succeeds or `policy.max_attempts` is exhausted.
///
/// # Errors
/// Returns the last error once all attempts fail.
pub async fn with_linear_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut f: F,
) -> Result<T, VmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, VmError>>,
{
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= policy.max_attempts {
                    warn!(
                        operation = operation_name,
                        attempts = attempt,
                        error = %e,
                        "Giving up after retries"
                    );
                    return Err(e);
                }

                let delay = policy.delay_after(attempt);
                debug!(
                    "{operation_name} failed (attempt {attempt}/{}): {e}. Retrying in {delay:?}...",
                    policy.max_attempts
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn test_linear_delays() {
        let policy = RetryPolicy::SECURITY_GROUP_DELETE;
        let delays: Vec<u64> = (1..policy.max_attempts)
            .map(|n| policy.delay_after(n).as_secs())
            .collect();
        assert_eq!(delays, vec![1, 2, 3, 4]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_until_success() {
        let calls = AtomicU32::new(0);
        let start = tokio::time::Instant::now();

        let result = with_linear_backoff(&RetryPolicy::IP_ALLOCATION, "allocate ip", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 3 {
                Err(VmError::ProviderRejected("not yet".to_string()))
            } else {
                Ok("203.0.113.9")
            }
        })
        .await;

        assert_eq!(result.unwrap(), "203.0.113.9");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(start.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), VmError> =
            with_linear_backoff(&RetryPolicy::SECURITY_GROUP_DELETE, "delete sg", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(VmError::ProviderRejected("DependencyViolation".to_string()))
            })
            .await;

        assert!(matches!(result, Err(VmError::ProviderRejected(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }
}
