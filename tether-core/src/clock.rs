//! Injectable time source.
//!
//! Every component reads the current time and waits for delays through a
//! [`Clock`], so production code runs on tokio timers while tests drive the
//! same logic with a [`ManualClock`].

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Time source used by the resilience components.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current wall-clock time.
    fn now(&self) -> DateTime<Utc>;

    /// Wait for `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// Shared clock handle.
pub type SharedClock = Arc<dyn Clock>;

/// Time elapsed between `since` and the clock's current time.
///
/// Returns zero if `since` lies in the future.
pub fn elapsed_since(clock: &dyn Clock, since: DateTime<Utc>) -> Duration {
    (clock.now() - since).to_std().unwrap_or(Duration::ZERO)
}

fn delta(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::zero())
}

/// Production clock backed by tokio timers.
///
/// Wall-clock time is anchored when the clock is created and then advanced
/// by tokio's monotonic clock, so a paused tokio runtime also pauses `now()`.
#[derive(Debug, Clone)]
pub struct SystemClock {
    anchor_wall: DateTime<Utc>,
    anchor: tokio::time::Instant,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self {
            anchor_wall: Utc::now(),
            anchor: tokio::time::Instant::now(),
        }
    }

    /// Create a shared system clock.
    pub fn shared() -> SharedClock {
        Arc::new(Self::new())
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        self.anchor_wall + delta(self.anchor.elapsed())
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Time only moves when [`advance`](Self::advance) is called or when a
/// sleep is requested: `sleep` records the requested delay, advances the
/// clock by it and completes immediately.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualClockState>>,
}

#[derive(Debug)]
struct ManualClockState {
    now: DateTime<Utc>,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    /// Create a manual clock starting at the current wall-clock time.
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Create a manual clock starting at `start`.
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualClockState {
                now: start,
                sleeps: Vec::new(),
            })),
        }
    }

    /// Move time forward.
    pub fn advance(&self, duration: Duration) {
        let mut inner = self.inner.lock();
        inner.now += delta(duration);
    }

    /// Every delay requested through `sleep`, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.inner.lock().sleeps.clone()
    }

    /// Shared handle to this clock.
    pub fn shared(&self) -> SharedClock {
        Arc::new(self.clone())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        self.inner.lock().now
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        {
            let mut inner = self.inner.lock();
            inner.sleeps.push(duration);
            inner.now += delta(duration);
        }
        Box::pin(futures::future::ready(()))
    }
}
