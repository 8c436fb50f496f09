//! Bounded retries for optimistic-concurrency conflicts, and requeue backoff
//!
//! Two kinds of retry live here:
//! - [`retry_on`] retries a single API call inside one reconciliation run
//!   while a predicate says the failure is worth another attempt (conflicts).
//! - [`BackoffTracker`] computes the delay before the next run for a cluster
//!   that keeps failing, and forgets the history once a run succeeds.
//!
//! ```ignore
//! let pod = retry_on(
//!     &RetryConfig::conflicts(3),
//!     "create executor pod",
//!     Error::is_conflict,
//!     || async { kube.create_pod(&namespace, &pod).await },
//! )
//! .await?;
//! ```

use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, warn};

/// Configuration for in-run retries
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Initial delay between attempts
    pub initial_delay: Duration,
    /// Maximum delay between attempts
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::conflicts(3)
    }
}

impl RetryConfig {
    /// Short, bounded retries suited to conflict resolution inside one run
    pub fn conflicts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
        }
    }
}

/// Execute an async operation, retrying while `should_retry` accepts the error.
///
/// Errors rejected by `should_retry` are returned immediately, so validation
/// failures never burn attempts. Delays use jittered exponential backoff.
pub async fn retry_on<F, Fut, T, E, P>(
    config: &RetryConfig,
    operation_name: &str,
    should_retry: P,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
    P: Fn(&E) -> bool,
{
    let mut attempt = 0u32;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if !should_retry(&e) => return Err(e),
            Err(e) if attempt >= config.max_attempts => {
                warn!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    "giving up after max attempts"
                );
                return Err(e);
            }
            Err(e) => {
                // 0.5x to 1.5x of the delay
                let jitter = rand::thread_rng().gen_range(0.5..1.5);
                let jittered = Duration::from_secs_f64(delay.as_secs_f64() * jitter);

                debug!(
                    operation = %operation_name,
                    attempt,
                    error = %e,
                    delay_ms = jittered.as_millis() as u64,
                    "retrying"
                );

                tokio::time::sleep(jittered).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.backoff_multiplier)
                        .min(config.max_delay.as_secs_f64()),
                );
            }
        }
    }
}

/// Per-key consecutive failure counter for requeue backoff
///
/// Delay is `base * 2^failures`, capped at `max`.
pub struct BackoffTracker {
    base: Duration,
    max: Duration,
    failures: DashMap<String, u32>,
}

impl BackoffTracker {
    /// Create a tracker with the given base delay and cap
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            failures: DashMap::new(),
        }
    }

    /// Record a failure for `key` and return the delay before the next attempt
    pub fn next_delay(&self, key: &str) -> Duration {
        let mut entry = self.failures.entry(key.to_string()).or_insert(0);
        let failures = *entry;
        *entry = failures.saturating_add(1);
        delay_for(self.base, self.max, failures)
    }

    /// Forget the failure history of `key`
    pub fn reset(&self, key: &str) {
        self.failures.remove(key);
    }

    /// Number of consecutive failures recorded for `key`
    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).map(|f| *f).unwrap_or(0)
    }
}

/// `base * 2^failures`, capped at `max`; saturates instead of overflowing
pub fn delay_for(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 2u32.saturating_pow(failures);
    base.saturating_mul(factor).min(max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            backoff_multiplier: 2.0,
        }
    }

    #[tokio::test]
    async fn test_succeeds_immediately() {
        let result: Result<i32, &str> =
            retry_on(&fast_config(3), "op", |_| true, || async { Ok(42) }).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn test_succeeds_after_conflicts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_on(
            &fast_config(5),
            "op",
            |e| *e == "conflict",
            || {
                let c = c.clone();
                async move {
                    if c.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("conflict")
                    } else {
                        Ok(42)
                    }
                }
            },
        )
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausts_max_attempts() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_on(
            &fast_config(3),
            "op",
            |_| true,
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("always conflicts")
                }
            },
        )
        .await;

        assert_eq!(result, Err("always conflicts"));
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_error_returns_immediately() {
        let count = Arc::new(AtomicU32::new(0));
        let c = count.clone();

        let result: Result<i32, &str> = retry_on(
            &fast_config(5),
            "op",
            |e| *e == "conflict",
            || {
                let c = c.clone();
                async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Err("invalid")
                }
            },
        )
        .await;

        assert_eq!(result, Err("invalid"));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_conflict_config_never_zero_attempts() {
        assert_eq!(RetryConfig::conflicts(0).max_attempts, 1);
        assert_eq!(RetryConfig::default().max_attempts, 3);
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let base = Duration::from_secs(5);
        let max = Duration::from_secs(300);
        assert_eq!(delay_for(base, max, 0), Duration::from_secs(5));
        assert_eq!(delay_for(base, max, 1), Duration::from_secs(10));
        assert_eq!(delay_for(base, max, 3), Duration::from_secs(40));
        // 5 * 2^7 = 640 -> capped
        assert_eq!(delay_for(base, max, 7), max);
        assert_eq!(delay_for(base, max, u32::MAX), max);
    }

    #[test]
    fn test_tracker_grows_per_key_and_resets() {
        let tracker = BackoffTracker::new(Duration::from_secs(1), Duration::from_secs(60));

        assert_eq!(tracker.next_delay("ns/a"), Duration::from_secs(1));
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_secs(2));
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_secs(4));
        // Other keys are independent
        assert_eq!(tracker.next_delay("ns/b"), Duration::from_secs(1));
        assert_eq!(tracker.failures("ns/a"), 3);

        tracker.reset("ns/a");
        assert_eq!(tracker.failures("ns/a"), 0);
        assert_eq!(tracker.next_delay("ns/a"), Duration::from_secs(1));
    }
}
