//! Retry with exponential backoff.
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_core::{Error, RetryExecutor, RetryPolicy};
//! use std::time::Duration;
//!
//! # async fn fetch() -> Result<u32, Error> { Ok(1) }
//! # async fn example() -> Result<(), Error> {
//! let executor = RetryExecutor::system();
//! let policy = RetryPolicy::standard().base_delay(Duration::from_millis(100));
//!
//! let value = executor.with_retry(fetch, &policy).await?;
//! # Ok(())
//! # }
//! ```

use crate::clock::{SharedClock, SystemClock};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Predicate deciding whether an error is worth another attempt.
pub type RetryCondition<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Side-effect hook invoked before each retry with the failed attempt number.
pub type RetryHook<E> = Arc<dyn Fn(u32, &E) + Send + Sync>;

/// Default retry-eligibility predicate for remote-data errors.
///
/// Retries network errors, timeouts/aborts, HTTP 5xx and HTTP 429. Never
/// retries validation errors or any other 4xx.
pub fn standard_retry_condition(error: &Error) -> bool {
    error.is_retryable()
}

/// Serializable retry numbers, as found in configuration files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    #[serde(rename = "base_delay_ms", with = "crate::config::duration_ms")]
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    #[serde(rename = "max_delay_ms", with = "crate::config::duration_ms")]
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(10),
            backoff_factor: 2.0,
        }
    }
}

/// Retry policy for a single call.
///
/// Presets ([`critical`](Self::critical), [`standard`](Self::standard),
/// [`quick`](Self::quick), [`background`](Self::background)) only differ in
/// their numbers.
pub struct RetryPolicy<E = Error> {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    /// Multiplier applied per attempt.
    pub backoff_factor: f64,
    retry_condition: RetryCondition<E>,
    on_retry: Option<RetryHook<E>>,
}

impl<E: 'static> RetryPolicy<E> {
    /// Create a policy that retries every error.
    pub fn new(max_attempts: u32) -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: max_attempts.max(1),
            base_delay: defaults.base_delay,
            max_delay: defaults.max_delay,
            backoff_factor: defaults.backoff_factor,
            retry_condition: Arc::new(|_: &E| true),
            on_retry: None,
        }
    }

    /// Set the delay before the first retry.
    pub fn base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Set the upper bound for any single delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set the backoff multiplier. Values below 1 are raised to 1.
    pub fn backoff_factor(mut self, factor: f64) -> Self {
        self.backoff_factor = factor.max(1.0);
        self
    }

    /// Set the maximum number of attempts. Zero is raised to 1.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Only retry errors matching `predicate`.
    pub fn retry_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.retry_condition = Arc::new(predicate);
        self
    }

    /// Invoke `hook` before each retry.
    pub fn on_retry<H>(mut self, hook: H) -> Self
    where
        H: Fn(u32, &E) + Send + Sync + 'static,
    {
        self.on_retry = Some(Arc::new(hook));
        self
    }
}

impl<E> RetryPolicy<E> {
    /// Delay awaited after the failed `attempt` (1-indexed).
    ///
    /// `min(base_delay * backoff_factor^(attempt-1), max_delay)`
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let nanos = self.base_delay.as_nanos() as f64 * self.backoff_factor.powi(exponent);
        let max_nanos = self.max_delay.as_nanos() as f64;

        if !nanos.is_finite() || nanos >= max_nanos {
            self.max_delay
        } else {
            Duration::from_nanos(nanos.round() as u64)
        }
    }

    /// Check whether `error` is eligible for another attempt.
    pub fn should_retry(&self, error: &E) -> bool {
        (self.retry_condition)(error)
    }

    fn notify_retry(&self, attempt: u32, error: &E) {
        if let Some(hook) = &self.on_retry {
            hook(attempt, error);
        }
    }
}

impl RetryPolicy<Error> {
    /// Policy built from configuration numbers with the standard condition.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts)
            .base_delay(config.base_delay)
            .max_delay(config.max_delay)
            .backoff_factor(config.backoff_factor)
            .retry_if(standard_retry_condition)
    }

    /// Everyday remote reads and writes: 3 attempts from 1s, capped at 10s.
    pub fn standard() -> Self {
        Self::from_config(&RetryConfig::default())
    }

    /// Operations that must not be lost: 5 attempts from 1s, capped at 30s.
    pub fn critical() -> Self {
        Self::from_config(&RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        })
    }

    /// Interactive lookups: 2 attempts from 500ms, capped at 2s.
    pub fn quick() -> Self {
        Self::from_config(&RetryConfig {
            max_attempts: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        })
    }

    /// Background sync: 10 attempts from 5s with gentle growth, capped at 5min.
    pub fn background() -> Self {
        Self::from_config(&RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(300),
            backoff_factor: 1.5,
        })
    }
}

impl Default for RetryPolicy<Error> {
    fn default() -> Self {
        Self::standard()
    }
}

impl<E> Clone for RetryPolicy<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            backoff_factor: self.backoff_factor,
            retry_condition: Arc::clone(&self.retry_condition),
            on_retry: self.on_retry.clone(),
        }
    }
}

impl<E> fmt::Debug for RetryPolicy<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_factor", &self.backoff_factor)
            .field("on_retry", &self.on_retry.is_some())
            .finish()
    }
}

/// Result of [`RetryExecutor::try_with_retry`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result.
    pub result: Result<T, E>,
    /// Number of attempts made.
    pub attempts: u32,
}

impl<T, E> RetryOutcome<T, E> {
    /// Whether the operation eventually succeeded.
    pub fn success(&self) -> bool {
        self.result.is_ok()
    }

    /// Successful value, if any.
    pub fn data(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    /// Last error, if the operation failed.
    pub fn error(&self) -> Option<&E> {
        self.result.as_ref().err()
    }
}

/// Retry executor.
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    clock: SharedClock,
}

impl RetryExecutor {
    /// Create an executor that waits through `clock`.
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Create an executor on tokio timers.
    pub fn system() -> Self {
        Self::new(SystemClock::shared())
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error or
    /// runs out of attempts. The last error is returned unchanged.
    pub async fn with_retry<T, E, F, Fut>(&self, operation: F, policy: &RetryPolicy<E>) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run(operation, policy).await.result
    }

    /// Like [`with_retry`](Self::with_retry) but reports the attempt count.
    pub async fn try_with_retry<T, E, F, Fut>(
        &self,
        operation: F,
        policy: &RetryPolicy<E>,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run(operation, policy).await
    }

    /// Produce a retry-enabled version of `f`.
    pub fn wrap<F, E>(&self, f: F, policy: RetryPolicy<E>) -> RetryWrapper<F, E> {
        RetryWrapper {
            executor: self.clone(),
            f,
            policy,
        }
    }

    async fn run<T, E, F, Fut>(&self, mut operation: F, policy: &RetryPolicy<E>) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt = 1;

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Retry succeeded");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(e) => {
                    if !policy.should_retry(&e) {
                        debug!(attempt, error = %e, "Error is not retryable");
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                        };
                    }

                    if attempt >= policy.max_attempts {
                        warn!(
                            attempt,
                            max_attempts = policy.max_attempts,
                            error = %e,
                            "Final retry attempt failed"
                        );
                        return RetryOutcome {
                            result: Err(e),
                            attempts: attempt,
                        };
                    }

                    policy.notify_retry(attempt, &e);
                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        attempt,
                        delay = ?delay,
                        error = %e,
                        "Attempt failed, waiting before retry"
                    );

                    self.clock.sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryExecutor {
    fn default() -> Self {
        Self::system()
    }
}

/// Retry-enabled function produced by [`RetryExecutor::wrap`].
///
/// Arguments are forwarded unchanged and cloned for every attempt.
pub struct RetryWrapper<F, E = Error> {
    executor: RetryExecutor,
    f: F,
    policy: RetryPolicy<E>,
}

impl<F, E> RetryWrapper<F, E> {
    /// Call the wrapped function with retries.
    pub async fn call<A, T, Fut>(&self, args: A) -> Result<T, E>
    where
        A: Clone,
        F: Fn(A) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.executor
            .with_retry(|| (self.f)(args.clone()), &self.policy)
            .await
    }

    /// Policy applied to every call.
    pub fn policy(&self) -> &RetryPolicy<E> {
        &self.policy
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> RetryPolicy<Error> {
        RetryPolicy::standard()
            .max_attempts(max_attempts)
            .base_delay(Duration::from_millis(100))
            .max_delay(Duration::from_secs(1))
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = fast(5);

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(400));
        assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_secs(1));
        assert_eq!(policy.delay_for_attempt(60), Duration::from_secs(1));
    }

    #[test]
    fn test_fractional_backoff_factor() {
        let policy = fast(3).backoff_factor(1.5);
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(150));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(225));
    }

    #[test]
    fn test_presets_use_standard_condition() {
        for policy in [
            RetryPolicy::critical(),
            RetryPolicy::standard(),
            RetryPolicy::quick(),
            RetryPolicy::background(),
        ] {
            assert!(policy.should_retry(&Error::http(503, "unavailable")));
            assert!(!policy.should_retry(&Error::http(404, "missing")));
        }
        assert!(RetryPolicy::critical().max_attempts > RetryPolicy::quick().max_attempts);
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_first_try() {
        let clock = ManualClock::new();
        let executor = RetryExecutor::new(clock.shared());

        let result = executor.with_retry(|| async { Ok::<_, Error>(42) }, &fast(3)).await;

        assert_eq!(result.unwrap(), 42);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_retries_return_last_error() {
        let clock = ManualClock::new();
        let executor = RetryExecutor::new(clock.shared());
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> = executor
            .with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move { Err(Error::http(500, format!("failure {n}"))) }
                },
                &fast(4),
            )
            .await;

        let err = result.unwrap_err();
        assert_eq!(err.to_string(), "Response error: 500 - failure 4");
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            clock.sleeps(),
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_retryable_error_fails_immediately() {
        let clock = ManualClock::new();
        let executor = RetryExecutor::new(clock.shared());
        let calls = AtomicU32::new(0);

        let result: Result<(), Error> = executor
            .with_retry(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(Error::Validation("name is required".into())) }
                },
                &fast(5),
            )
            .await;

        assert!(matches!(result, Err(Error::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_on_retry_hook_sees_each_failed_attempt() {
        let clock = ManualClock::new();
        let executor = RetryExecutor::new(clock.shared());
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let hook_seen = Arc::clone(&seen);
        let policy = fast(3).on_retry(move |attempt, error: &Error| {
            hook_seen.lock().push((attempt, error.status_code()));
        });

        let _ = executor
            .with_retry(|| async { Err::<(), _>(Error::http(502, "bad gateway")) }, &policy)
            .await;

        assert_eq!(*seen.lock(), vec![(1, Some(502)), (2, Some(502))]);
    }

    #[tokio::test]
    async fn test_try_with_retry_reports_attempts() {
        let clock = ManualClock::new();
        let executor = RetryExecutor::new(clock.shared());
        let calls = AtomicU32::new(0);

        let outcome = executor
            .try_with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 1 {
                            Err(Error::Network("reset".into()))
                        } else {
                            Ok("done")
                        }
                    }
                },
                &fast(3),
            )
            .await;

        assert!(outcome.success());
        assert_eq!(outcome.data(), Some(&"done"));
        assert_eq!(outcome.attempts, 2);

        let failed = executor
            .try_with_retry(|| async { Err::<(), _>(Error::http(409, "conflict")) }, &fast(3))
            .await;
        assert!(!failed.success());
        assert_eq!(failed.error().and_then(Error::status_code), Some(409));
        assert_eq!(failed.attempts, 1);
    }

    #[tokio::test]
    async fn test_wrapper_forwards_arguments() {
        let clock = ManualClock::new();
        let executor = RetryExecutor::new(clock.shared());
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);

        let lookup = executor.wrap(
            move |(id, suffix): (u32, String)| {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        Err(Error::Timeout(Duration::from_secs(1)))
                    } else {
                        Ok(format!("{id}-{suffix}"))
                    }
                }
            },
            fast(3),
        );

        let value = lookup.call((7, "a".to_string())).await.unwrap();
        assert_eq!(value, "7-a");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_generic_error_type_with_custom_condition() {
        let clock = ManualClock::new();
        let executor = RetryExecutor::new(clock.shared());
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::<&str>::new(5)
            .base_delay(Duration::from_millis(10))
            .retry_if(|e| *e == "busy");

        let result: Result<(), &str> = executor
            .with_retry(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move { if n < 2 { Err("busy") } else { Err("fatal") } }
                },
                &policy,
            )
            .await;

        assert_eq!(result.unwrap_err(), "fatal");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
