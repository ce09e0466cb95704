//! # Tether Core
//!
//! Makes calls to an unreliable remote service survive transient failures,
//! total disconnection and cascading failure without losing mutations.
//!
//! ## Features
//!
//! - **Retry with Backoff**: Bounded attempts with capped exponential delays
//! - **Circuit Breaker**: One breaker per resource class with a single half-open trial
//! - **Connectivity Monitoring**: Passive signals plus cancellable active probes
//! - **Offline Queue**: Durable FIFO of deferred mutations, replayed on reconnect
//! - **Stale Cache**: Last-known-good reads served while the service is unreachable
//! - **Injectable Clock**: Deterministic tests through [`ManualClock`]
//!
//! The transport is not part of this crate: every remote call is a
//! caller-supplied async closure returning [`Result`]. `tether-http` provides
//! a reqwest transport and an HTTP connectivity probe.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tether_core::{Error, ReadRequest, ResilientClient, TetherConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Error> {
//!     tether_core::logging::init();
//!
//!     let config = TetherConfig::default().with_env_overrides()?;
//!     let client = ResilientClient::builder(config).build()?;
//!     client.start();
//!
//!     let users = client
//!         .read(ReadRequest::new("users:list"), || async {
//!             Ok(vec!["ada".to_string()])
//!         })
//!         .await?;
//!     println!("{:?} (stale: {})", users.data, users.is_stale);
//!
//!     client.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! ## Using the Pieces Directly
//!
//! ```rust,no_run
//! use tether_core::{CircuitBreaker, CircuitBreakerConfig, Error, RetryExecutor, RetryPolicy, SystemClock};
//!
//! # async fn call() -> Result<u32, Error> { Ok(1) }
//! # async fn example() -> Result<(), Error> {
//! let clock = SystemClock::shared();
//! let breaker = CircuitBreaker::new(CircuitBreakerConfig::new("reports"), clock.clone());
//! let retry = RetryExecutor::new(clock);
//! let policy = RetryPolicy::quick();
//!
//! let value = breaker.execute(|| retry.with_retry(call, &policy)).await?;
//! # Ok(())
//! # }
//! ```

mod cache;
mod circuit_breaker;
mod client;
mod clock;
mod config;
mod connectivity;
mod error;
mod queue;
mod retry;
mod storage;

pub mod keys;
pub mod logging;

pub use cache::{CacheConfig, CacheEntry, CacheStore, Cached};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry, CircuitBreakerStats,
    CircuitState,
};
pub use client::{
    Fetched, InvalidationScope, Invalidated, Mutation, ReadRequest, ReplayHandler,
    ResilientClient, ResilientClientBuilder,
};
pub use clock::{Clock, ManualClock, SharedClock, SystemClock, elapsed_since};
pub use config::{TetherConfig, TetherConfigBuilder, duration_ms};
pub use connectivity::{
    ConnectivityConfig, ConnectivityMonitor, ConnectivityProbe, ConnectivitySnapshot,
};
pub use error::{CircuitOpenError, Error, Result, StorageError};
pub use queue::{
    DEFAULT_CLASS, OfflineQueue, QueueConfig, QueueReport, QueueStatus, QueuedOperation,
};
pub use retry::{
    RetryCondition, RetryConfig, RetryExecutor, RetryHook, RetryOutcome, RetryPolicy,
    RetryWrapper, standard_retry_condition,
};
pub use storage::{FileStore, KeyValueStore, MemoryStore};

/// Prelude for common imports.
///
/// ```
/// use tether_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::cache::Cached;
    pub use crate::circuit_breaker::CircuitState;
    pub use crate::client::{Fetched, InvalidationScope, Mutation, ReadRequest, ResilientClient};
    pub use crate::clock::{Clock, SharedClock, SystemClock};
    pub use crate::config::TetherConfig;
    pub use crate::connectivity::ConnectivityProbe;
    pub use crate::error::{Error, Result};
    pub use crate::keys;
    pub use crate::retry::{RetryExecutor, RetryPolicy};
    pub use crate::storage::{FileStore, KeyValueStore, MemoryStore};
}
