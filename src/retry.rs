//! Bounded retry with a fixed interval between attempts.
//!
//! The same primitive backs readiness polling ("is the database accepting
//! connections yet?") and connecting to the container engine at startup. There
//! is deliberately no jitter or exponential growth: the budget is
//! `attempts × interval`.

use std::future::Future;
use std::time::Duration;

/// Readiness polling attempts.
pub const DEFAULT_RETRIES: u32 = 40;
/// Sleep between readiness polls.
pub const DEFAULT_INTERVAL: Duration = Duration::from_millis(500);
/// Engine connection attempts.
pub const CONNECT_RETRIES: u32 = 5;
/// Sleep between engine connection attempts.
pub const CONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// How many times to try an operation and how long to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of invocations, including the first. Zero behaves as one.
    pub attempts: u32,
    /// Sleep after each retryable failure that still has attempts left.
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }

    /// A single attempt, no waiting.
    pub const fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Defaults for waiting on container readiness (40 × 0.5s).
    pub const fn readiness() -> Self {
        Self::new(DEFAULT_RETRIES, DEFAULT_INTERVAL)
    }

    /// Defaults for connecting to the container engine (5 × 1s).
    pub const fn connect() -> Self {
        Self::new(CONNECT_RETRIES, CONNECT_INTERVAL)
    }

    /// Attempts actually performed, with zero clamped to one.
    pub fn effective_attempts(&self) -> u32 {
        self.attempts.max(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::readiness()
    }
}

/// Invoke `operation` until it succeeds, fails with an error `is_retryable`
/// rejects, or the policy runs out of attempts.
///
/// The last error is returned unchanged when the budget is exhausted.
pub async fn retry<T, E, F, Fut, P>(policy: &RetryPolicy, is_retryable: P, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
{
    let mut remaining = policy.effective_attempts();
    loop {
        remaining -= 1;
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if remaining > 0 && is_retryable(&e) => {
                tracing::trace!(remaining, interval = ?policy.interval, "Retryable failure, waiting");
                if !policy.interval.is_zero() {
                    tokio::time::sleep(policy.interval).await;
                }
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Debug, PartialEq, Eq)]
    enum Failure {
        Transient(u32),
        Fatal,
    }

    fn is_transient(e: &Failure) -> bool {
        matches!(e, Failure::Transient(_))
    }

    /// Fails `failures` times with a transient error, then returns the call number.
    async fn flaky(calls: &AtomicU32, failures: u32) -> Result<u32, Failure> {
        let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= failures {
            Err(Failure::Transient(n))
        } else {
            Ok(n)
        }
    }

    #[tokio::test]
    async fn test_success_after_k_failures() {
        for (failures, attempts) in [(0, 1), (2, 3), (3, 10)] {
            let calls = AtomicU32::new(0);
            let policy = RetryPolicy::new(attempts, Duration::ZERO);
            let result = retry(&policy, is_transient, || flaky(&calls, failures)).await;
            assert_eq!(result, Ok(failures + 1));
            assert_eq!(calls.load(Ordering::SeqCst), failures + 1);
        }
    }

    #[tokio::test]
    async fn test_exhaustion_propagates_last_error() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(3, Duration::ZERO);
        let result = retry(&policy, is_transient, || flaky(&calls, 5)).await;
        assert_eq!(result, Err(Failure::Transient(3)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(10, Duration::ZERO);
        let result: Result<(), Failure> = retry(&policy, is_transient, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Failure::Fatal) }
        })
        .await;
        assert_eq!(result, Err(Failure::Fatal));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_zero_attempts_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(0, Duration::ZERO);
        let result = retry(&policy, is_transient, || flaky(&calls, 1)).await;
        assert_eq!(result, Err(Failure::Transient(1)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleeps_between_attempts_only() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, Duration::from_millis(500));
        let start = tokio::time::Instant::now();
        let result = retry(&policy, is_transient, || flaky(&calls, 2)).await;
        assert_eq!(result, Ok(3));
        // Two failures, two sleeps; nothing after the success.
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }

    #[test]
    fn test_default_policies() {
        assert_eq!(RetryPolicy::default().attempts, 40);
        assert_eq!(RetryPolicy::default().interval, Duration::from_millis(500));
        assert_eq!(RetryPolicy::connect().attempts, 5);
        assert_eq!(RetryPolicy::connect().interval, Duration::from_secs(1));
        assert_eq!(RetryPolicy::once().effective_attempts(), 1);
    }
}
