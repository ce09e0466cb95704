//! Circuit Breaker pattern implementation.
//!
//! The circuit breaker stops attempting calls to a failing dependency for a
//! cooldown period.
//!
//! ## States
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Circuit is tripped, calls are rejected without being invoked
//! - **Half-Open**: Exactly one trial call is allowed to probe recovery
//!
//! ```text
//! Closed   --(failure_count >= threshold)----------> Open
//! Open     --(now - last_failure >= recovery_timeout)--> HalfOpen
//! HalfOpen --(success)--> Closed
//! HalfOpen --(failure)--> Open
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use tether_core::{CircuitBreaker, CircuitBreakerConfig, Error, SystemClock};
//! use std::time::Duration;
//!
//! # async fn fetch() -> Result<String, Error> { Ok(String::new()) }
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new("patient")
//!         .failure_threshold(5)
//!         .recovery_timeout(Duration::from_secs(60)),
//!     SystemClock::shared(),
//! );
//!
//! match breaker.execute(fetch).await {
//!     Ok(body) => println!("{body}"),
//!     Err(Error::CircuitOpen(_)) => println!("try again later"),
//!     Err(e) => println!("remote failure: {e}"),
//! }
//! # }
//! ```

use crate::clock::{SharedClock, elapsed_since};
use crate::error::CircuitOpenError;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, calls pass through normally.
    Closed,
    /// Circuit is open, calls are rejected.
    Open,
    /// Circuit is half-open, one trial call is in progress or allowed.
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Closed"),
            Self::Open => write!(f, "Open"),
            Self::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Name of the circuit breaker (for logging).
    pub name: String,
    /// Number of consecutive failures before opening the circuit.
    pub failure_threshold: u32,
    /// Time to wait after the last failure before allowing a trial call.
    #[serde(rename = "recovery_timeout_ms", with = "crate::config::duration_ms")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration with a name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the failure threshold.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set the recovery timeout.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Internal circuit breaker state.
#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    trial_in_flight: bool,
}

/// How a call was let through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Admission {
    /// Regular call while closed.
    Pass,
    /// The single half-open trial.
    Trial,
}

/// Circuit breaker for one protected resource class.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerState>,
    total_requests: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_rejections: AtomicU64,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        info!(
            name = %config.name,
            failure_threshold = config.failure_threshold,
            recovery_timeout = ?config.recovery_timeout,
            "Circuit breaker initialized"
        );

        Self {
            config,
            clock,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure_time: None,
                trial_in_flight: false,
            }),
            total_requests: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
        }
    }

    /// Get the circuit breaker name.
    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Get the configuration.
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Get the current circuit state.
    ///
    /// An open circuit whose recovery timeout has elapsed still reports
    /// `Open` until the next call moves it to `HalfOpen`.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Get the current failure count.
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Time of the most recent failure.
    pub fn last_failure_time(&self) -> Option<DateTime<Utc>> {
        self.inner.lock().last_failure_time
    }

    /// Execute `operation` with circuit breaker protection.
    ///
    /// While open, the operation is not invoked and a [`CircuitOpenError`]
    /// is returned. Otherwise the operation's own result is returned
    /// unchanged, including the failure that trips the circuit.
    pub async fn execute<T, E, F, Fut>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.total_requests.fetch_add(1, Ordering::Relaxed);

        let admission = match self.admit() {
            Ok(admission) => admission,
            Err(rejection) => {
                self.total_rejections.fetch_add(1, Ordering::Relaxed);
                debug!(name = %self.config.name, "Circuit breaker rejected request");
                return Err(rejection.into());
            }
        };

        let mut guard = TrialGuard {
            breaker: self,
            armed: admission == Admission::Trial,
        };
        let result = operation().await;
        guard.armed = false;

        match &result {
            Ok(_) => self.record_success(admission),
            Err(_) => self.record_failure(admission),
        }

        result
    }

    /// Decide whether a call may proceed, moving Open to HalfOpen once the
    /// recovery timeout has elapsed.
    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => Ok(Admission::Pass),
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| elapsed_since(self.clock.as_ref(), t))
                    .unwrap_or(self.config.recovery_timeout);

                if elapsed < self.config.recovery_timeout {
                    return Err(self.rejection());
                }

                debug!(name = %self.config.name, "Circuit breaker transitioning to HALF-OPEN");
                inner.state = CircuitState::HalfOpen;
                inner.trial_in_flight = true;
                Ok(Admission::Trial)
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    Err(self.rejection())
                } else {
                    inner.trial_in_flight = true;
                    Ok(Admission::Trial)
                }
            }
        }
    }

    fn rejection(&self) -> CircuitOpenError {
        CircuitOpenError {
            name: self.config.name.clone(),
        }
    }

    fn record_success(&self, admission: Admission) {
        self.total_successes.fetch_add(1, Ordering::Relaxed);
        let mut inner = self.inner.lock();

        match (inner.state, admission) {
            (CircuitState::Closed, _) => inner.failure_count = 0,
            (CircuitState::HalfOpen, Admission::Trial) => {
                info!(name = %self.config.name, "Circuit breaker CLOSED");
                inner.state = CircuitState::Closed;
                inner.failure_count = 0;
                inner.trial_in_flight = false;
            }
            _ => {
                // A call admitted before the circuit opened.
                debug!(name = %self.config.name, "Success recorded while circuit not closed");
            }
        }
    }

    fn record_failure(&self, admission: Admission) {
        self.total_failures.fetch_add(1, Ordering::Relaxed);
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(now);

        match (inner.state, admission) {
            (CircuitState::Closed, _) => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    warn!(
                        name = %self.config.name,
                        failures = inner.failure_count,
                        "Circuit breaker OPENED"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            (CircuitState::HalfOpen, Admission::Trial) => {
                warn!(name = %self.config.name, "Half-open trial failed, circuit breaker OPENED");
                inner.state = CircuitState::Open;
                inner.trial_in_flight = false;
            }
            _ => {}
        }
    }

    /// Manually reset the circuit breaker to closed state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        if inner.state != CircuitState::Closed {
            info!(name = %self.config.name, "Circuit breaker reset to CLOSED");
        }
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.last_failure_time = None;
        inner.trial_in_flight = false;
    }

    /// Get total calls attempted, including rejections.
    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Get total successful calls.
    pub fn total_successes(&self) -> u64 {
        self.total_successes.load(Ordering::Relaxed)
    }

    /// Get total failed calls.
    pub fn total_failures(&self) -> u64 {
        self.total_failures.load(Ordering::Relaxed)
    }

    /// Get total rejected calls.
    pub fn total_rejections(&self) -> u64 {
        self.total_rejections.load(Ordering::Relaxed)
    }

    /// Get circuit breaker statistics.
    pub fn stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.lock();
        CircuitBreakerStats {
            name: self.config.name.clone(),
            state: inner.state,
            total_requests: self.total_requests(),
            total_successes: self.total_successes(),
            total_failures: self.total_failures(),
            total_rejections: self.total_rejections(),
            current_failure_count: inner.failure_count,
        }
    }
}

/// Releases the half-open trial slot if the trial future is dropped before
/// completing, so the next caller can run a new trial.
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut inner = self.breaker.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                debug!(name = %self.breaker.config.name, "Half-open trial abandoned");
                inner.trial_in_flight = false;
            }
        }
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    /// Circuit breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Total calls, including rejections.
    pub total_requests: u64,
    /// Total successes.
    pub total_successes: u64,
    /// Total failures.
    pub total_failures: u64,
    /// Total rejections.
    pub total_rejections: u64,
    /// Consecutive failures while closed.
    pub current_failure_count: u32,
}

impl CircuitBreakerStats {
    /// Calculate success rate (0.0 - 1.0) over executed calls.
    pub fn success_rate(&self) -> f64 {
        let executed = self.total_successes + self.total_failures;
        if executed == 0 {
            1.0
        } else {
            self.total_successes as f64 / executed as f64
        }
    }
}

/// One circuit breaker per protected resource class, created on first use.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    template: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakerRegistry {
    /// Create a registry whose breakers share `template`'s numbers.
    pub fn new(template: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            template,
            clock,
            breakers: RwLock::new(HashMap::new()),
        }
    }

    /// Get the breaker for `class`, creating it if needed.
    pub fn get(&self, class: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(class) {
            return Arc::clone(breaker);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(class.to_string()).or_insert_with(|| {
            let config = CircuitBreakerConfig {
                name: class.to_string(),
                ..self.template.clone()
            };
            Arc::new(CircuitBreaker::new(config, Arc::clone(&self.clock)))
        });
        Arc::clone(breaker)
    }

    /// State of the breaker for `class`; `Closed` if it was never used.
    pub fn state(&self, class: &str) -> CircuitState {
        self.breakers
            .read()
            .get(class)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Statistics for every breaker created so far, sorted by name.
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.read().values().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Reset every breaker to closed.
    pub fn reset_all(&self) {
        for breaker in self.breakers.read().values() {
            breaker.reset();
        }
    }
}
