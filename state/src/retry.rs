//! Bounded exponential backoff shared by both backends

use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy with exponential backoff and jitter
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            max_delay,
        }
    }

    /// Lock contention on the embedded engine
    pub const fn embedded() -> Self {
        Self::new(5, Duration::from_millis(25), Duration::from_millis(400))
    }

    /// Connection failures against the external server
    pub fn external(max_attempts: u32) -> Self {
        Self::new(max_attempts.max(1), Duration::from_millis(50), Duration::from_secs(2))
    }

    /// Delay before retry number `attempt` (1-based), up to 50% jitter on top
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let jitter_ms = backoff.as_millis() as u64 / 2;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    /// Run a blocking operation, sleeping the current thread between attempts
    pub fn run_blocking<T, E, F, R>(&self, op: &str, mut f: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Result<T, E>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f() {
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(op, attempt, ?delay, error = %e, "retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    /// Run an async operation, sleeping the task between attempts
    pub async fn run<T, E, F, Fut, R>(&self, op: &str, mut f: F, retryable: R) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        R: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match f().await {
                Err(e) if attempt < self.max_attempts && retryable(&e) => {
                    let delay = self.delay_for(attempt);
                    warn!(op, attempt, ?delay, error = %e, "retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_delay_grows_and_caps() {
        let policy = RetryPolicy::new(10, Duration::from_millis(10), Duration::from_millis(80));
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(10) && first <= Duration::from_millis(15));
        let third = policy.delay_for(3);
        assert!(third >= Duration::from_millis(40) && third <= Duration::from_millis(60));
        let capped = policy.delay_for(9);
        assert!(capped >= Duration::from_millis(80) && capped <= Duration::from_millis(120));
    }

    #[test]
    fn test_blocking_gives_up_after_max_attempts() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = Cell::new(0);
        let result: Result<(), String> = policy.run_blocking(
            "busy",
            || {
                calls.set(calls.get() + 1);
                Err("locked".to_string())
            },
            |_| true,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn test_blocking_skips_non_retryable() {
        let policy = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(2));
        let calls = Cell::new(0);
        let result: Result<(), String> = policy.run_blocking(
            "fatal",
            || {
                calls.set(calls.get() + 1);
                Err("corrupt".to_string())
            },
            |_| false,
        );
        assert!(result.is_err());
        assert_eq!(calls.get(), 1);
    }

    #[tokio::test]
    async fn test_async_recovers() {
        let policy = RetryPolicy::new(4, Duration::from_millis(1), Duration::from_millis(2));
        let mut calls = 0;
        let result: Result<u32, String> = policy
            .run(
                "flaky",
                || {
                    calls += 1;
                    let n = calls;
                    async move {
                        if n < 3 {
                            Err("timeout".to_string())
                        } else {
                            Ok(n)
                        }
                    }
                },
                |_| true,
            )
            .await;
        assert_eq!(result.unwrap(), 3);
    }
}
