//! Exponential backoff for downstream delivery.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{error, warn};

/// How often and how patiently to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Sleep after the first failure.
    pub initial: Duration,
    /// Ceiling for any single sleep.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            initial: Duration::from_secs(10),
            max: Duration::from_secs(300),
        }
    }
}

impl BackoffPolicy {
    /// Sleep after the `failures`-th consecutive failure (1-based).
    pub fn delay(&self, failures: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failures.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Every sleep taken if all attempts fail.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        (1..self.attempts).map(|failures| self.delay(failures))
    }
}

/// Run `op` until it succeeds or the attempts run out, returning the last
/// error. `op` receives the 1-based attempt number.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &BackoffPolicy,
    what: &str,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if attempt >= policy.attempts => {
                error!(what, attempt, error = %err, "giving up");
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay(attempt);
                warn!(what, attempt, error = %err, retry_in = ?delay, "attempt failed");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// [`retry_with_backoff`] in a detached task.
pub fn spawn_with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    what: String,
    op: F,
) -> JoinHandle<Result<T, E>>
where
    T: Send + 'static,
    E: Display + Send + 'static,
    F: FnMut(u32) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T, E>> + Send,
{
    tokio::spawn(async move { retry_with_backoff(&policy, &what, op).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn instant(attempts: u32) -> BackoffPolicy {
        BackoffPolicy {
            attempts,
            initial: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    #[test]
    fn test_default_schedule() {
        let secs: Vec<u64> = BackoffPolicy::default()
            .delays()
            .map(|d| d.as_secs())
            .collect();
        assert_eq!(secs, vec![10, 20, 40, 80, 160, 300, 300, 300, 300]);
    }

    #[test]
    fn test_delay_does_not_overflow() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay(40), Duration::from_secs(300));
        assert_eq!(policy.delay(u32::MAX), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_succeeds_on_third_attempt() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, String> = retry_with_backoff(&instant(10), "post grade", |n| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 3 {
                    Err(format!("attempt {n} failed"))
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_last_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let handle = spawn_with_backoff(instant(4), "post grade".into(), move |n| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { Err::<(), _>(format!("attempt {n} failed")) }
        });
        let result = handle.await.unwrap();
        assert_eq!(result, Err("attempt 4 failed".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }
}
