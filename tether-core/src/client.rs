//! Resilient client facade.
//!
//! [`ResilientClient`] owns one instance of every component and runs each
//! remote call as `breaker.execute(|| retry.with_retry(call, policy))`, so an
//! exhausted retry cycle counts as a single breaker failure.
//!
//! - Reads refresh the cache on success and fall back to the cached value
//!   (flagged stale when old) on any failure.
//! - Mutations are queued while offline and fail with
//!   [`Error::QueuedForOffline`]; on success they invalidate the cache
//!   prefixes they name.
//!
//! ```rust,no_run
//! use tether_core::{Error, Mutation, ReadRequest, ResilientClient, TetherConfig, keys};
//! use serde_json::{Value, json};
//!
//! # async fn fetch_patient(_id: &str) -> Result<Value, Error> { Ok(Value::Null) }
//! # async fn create_patient(_body: Value) -> Result<Value, Error> { Ok(Value::Null) }
//! # async fn example() -> Result<(), Error> {
//! let client = ResilientClient::builder(TetherConfig::default()).build()?;
//! client.start();
//!
//! let patient = client
//!     .read(ReadRequest::new(keys::patient("42")).class(keys::PATIENT), || {
//!         fetch_patient("42")
//!     })
//!     .await?;
//! if patient.is_stale {
//!     println!("showing cached data");
//! }
//!
//! let body = json!({"name": "Ada"});
//! let created = client
//!     .mutate(
//!         Mutation::new("createPatient", body.clone())
//!             .class(keys::PATIENT)
//!             .invalidates(keys::category_prefix(keys::PATIENT)),
//!         || create_patient(body.clone()),
//!     )
//!     .await;
//! match created {
//!     Ok(_) => {}
//!     Err(e) if e.is_queued_for_offline() => println!("saved offline"),
//!     Err(e) => return Err(e),
//! }
//! # Ok(())
//! # }
//! ```

use crate::cache::{CacheStore, Cached};
use crate::circuit_breaker::{CircuitBreakerRegistry, CircuitBreakerStats, CircuitState};
use crate::clock::{SharedClock, SystemClock};
use crate::config::TetherConfig;
use crate::connectivity::{ConnectivityMonitor, ConnectivityProbe};
use crate::error::{Error, Result};
use crate::keys;
use crate::queue::{DEFAULT_CLASS, OfflineQueue, QueueReport, QueueStatus, QueuedOperation};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::storage::{KeyValueStore, MemoryStore};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Replays one queued operation against the remote service.
pub type ReplayHandler =
    Arc<dyn Fn(QueuedOperation) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// A cacheable read.
#[derive(Debug, Clone)]
pub struct ReadRequest {
    key: String,
    class: String,
    policy: Option<RetryPolicy>,
}

impl ReadRequest {
    /// Read cached under `key`, in the default resource class.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            class: DEFAULT_CLASS.to_string(),
            policy: None,
        }
    }

    /// Set the resource class whose breaker guards the call.
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Override the client's default retry policy.
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Cache key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// A mutating call that is queued while offline.
#[derive(Debug, Clone)]
pub struct Mutation {
    operation_type: String,
    payload: serde_json::Value,
    class: String,
    invalidates: Vec<String>,
    policy: Option<RetryPolicy>,
}

impl Mutation {
    /// Mutation of `operation_type` carrying `payload` for later replay.
    pub fn new(operation_type: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            operation_type: operation_type.into(),
            payload,
            class: DEFAULT_CLASS.to_string(),
            invalidates: Vec::new(),
            policy: None,
        }
    }

    /// Set the resource class whose breaker guards the call.
    pub fn class(mut self, class: impl Into<String>) -> Self {
        self.class = class.into();
        self
    }

    /// Clear cache entries under `prefix` once the mutation succeeds.
    pub fn invalidates(mut self, prefix: impl Into<String>) -> Self {
        self.invalidates.push(prefix.into());
        self
    }

    /// Override the client's default retry policy.
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Operation type.
    pub fn operation_type(&self) -> &str {
        &self.operation_type
    }
}

/// Result of a read.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched<T> {
    /// The value.
    pub data: T,
    /// Whether the value came from the cache and is older than the
    /// staleness threshold.
    pub is_stale: bool,
    /// Whether the value came from the cache.
    pub from_cache: bool,
    /// When the value was fetched from the remote service.
    pub fetched_at: DateTime<Utc>,
}

impl<T> Fetched<T> {
    fn fresh(data: T, fetched_at: DateTime<Utc>) -> Self {
        Self {
            data,
            is_stale: false,
            from_cache: false,
            fetched_at,
        }
    }

    fn cached(hit: Cached<T>) -> Self {
        Self {
            data: hit.data,
            is_stale: hit.is_stale,
            from_cache: true,
            fetched_at: hit.timestamp,
        }
    }
}

/// What [`ResilientClient::invalidate`] clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidationScope {
    /// Cache entries only.
    Cache,
    /// Queued operations only.
    Queue,
    /// Cache entries and queued operations.
    Both,
}

/// Counts removed by an invalidation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Invalidated {
    /// Cache entries removed.
    pub cache_entries: usize,
    /// Queued operations removed.
    pub queued_operations: usize,
}

/// Builder for [`ResilientClient`].
pub struct ResilientClientBuilder {
    config: TetherConfig,
    store: Option<Arc<dyn KeyValueStore>>,
    clock: Option<SharedClock>,
    probe: Option<Arc<dyn ConnectivityProbe>>,
    policy: Option<RetryPolicy>,
}

impl ResilientClientBuilder {
    /// Set the durable store for the offline queue. Defaults to memory.
    pub fn store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Set the time source. Defaults to [`SystemClock`].
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Set the active connectivity probe.
    pub fn probe(mut self, probe: Arc<dyn ConnectivityProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Replace the default retry policy built from the configuration.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validate the configuration and assemble the client.
    pub fn build(self) -> Result<Arc<ResilientClient>> {
        self.config.validate()?;

        let clock = self.clock.unwrap_or_else(SystemClock::shared);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);

        let mut monitor = ConnectivityMonitor::new(self.config.connectivity.clone(), clock.clone());
        if let Some(probe) = self.probe {
            monitor = monitor.with_probe(probe);
        }
        let connectivity = Arc::new(monitor);

        let queue = Arc::new(OfflineQueue::new(
            self.config.queue.clone(),
            store,
            clock.clone(),
            connectivity.clone(),
        ));

        let default_policy = self
            .policy
            .unwrap_or_else(|| RetryPolicy::from_config(&self.config.retry));

        info!(
            failure_threshold = self.config.circuit_breaker.failure_threshold,
            max_attempts = default_policy.max_attempts,
            queued = queue.size(),
            "Resilient client created"
        );

        Ok(Arc::new(ResilientClient {
            retry: RetryExecutor::new(clock.clone()),
            breakers: CircuitBreakerRegistry::new(
                self.config.circuit_breaker.clone(),
                clock.clone(),
            ),
            cache: CacheStore::new(self.config.cache.clone(), clock.clone()),
            connectivity,
            queue,
            clock,
            default_policy,
            handlers: RwLock::new(HashMap::new()),
            replay_task: Mutex::new(None),
            config: self.config,
        }))
    }
}

/// Facade composing retry, circuit breaking, connectivity, the offline queue
/// and the cache around caller-supplied remote calls.
pub struct ResilientClient {
    config: TetherConfig,
    clock: SharedClock,
    retry: RetryExecutor,
    default_policy: RetryPolicy,
    breakers: CircuitBreakerRegistry,
    connectivity: Arc<ConnectivityMonitor>,
    queue: Arc<OfflineQueue>,
    cache: CacheStore,
    handlers: RwLock<HashMap<String, ReplayHandler>>,
    replay_task: Mutex<Option<CancellationToken>>,
}

impl fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilientClient")
            .field("connectivity", &self.connectivity.snapshot())
            .field("queue", &self.queue.status())
            .field("cache_entries", &self.cache.len())
            .field("breakers", &self.breakers.stats())
            .finish()
    }
}

impl ResilientClient {
    /// Start building a client.
    pub fn builder(config: TetherConfig) -> ResilientClientBuilder {
        ResilientClientBuilder {
            config,
            store: None,
            clock: None,
            probe: None,
            policy: None,
        }
    }

    /// Get the configuration.
    pub fn config(&self) -> &TetherConfig {
        &self.config
    }

    /// Connectivity monitor.
    pub fn connectivity(&self) -> &Arc<ConnectivityMonitor> {
        &self.connectivity
    }

    /// Offline queue.
    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    /// Cache of read results.
    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Per-class circuit breakers.
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Default retry policy.
    pub fn default_policy(&self) -> &RetryPolicy {
        &self.default_policy
    }

    /// Run a read through breaker and retry, caching the result.
    ///
    /// While offline a cached value is served without contacting the remote
    /// service. On failure the cached value is returned if present,
    /// otherwise the error.
    pub async fn read<T, F, Fut>(&self, request: ReadRequest, call: F) -> Result<Fetched<T>>
    where
        T: Serialize + DeserializeOwned,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.connectivity.is_offline()
            && let Some(hit) = self.cache.get::<T>(&request.key)
        {
            debug!(key = %request.key, stale = hit.is_stale, "Offline, serving cached value");
            return Ok(Fetched::cached(hit));
        }

        let policy = request.policy.as_ref().unwrap_or(&self.default_policy);
        let breaker = self.breakers.get(&request.class);

        let result = breaker
            .execute(|| self.retry.with_retry(call, policy))
            .await;

        match result {
            Ok(data) => {
                self.connectivity.handle_signal(true);
                self.cache.set(&request.key, &data);
                Ok(Fetched::fresh(data, self.clock.now()))
            }
            Err(err) => {
                self.observe_failure(&err);
                match self.cache.get::<T>(&request.key) {
                    Some(hit) => {
                        warn!(
                            key = %request.key,
                            stale = hit.is_stale,
                            error = %err,
                            "Read failed, serving cached value"
                        );
                        Ok(Fetched::cached(hit))
                    }
                    None => Err(err),
                }
            }
        }
    }

    /// Run a mutation through breaker and retry.
    ///
    /// While offline, or when the call fails because connectivity was lost,
    /// the mutation is queued and [`Error::QueuedForOffline`] returned. If
    /// the queue cannot take it, [`Error::Offline`] is returned instead.
    pub async fn mutate<T, F, Fut>(&self, mutation: Mutation, call: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.connectivity.is_offline() {
            return Err(self.defer(mutation));
        }

        let policy = mutation.policy.as_ref().unwrap_or(&self.default_policy);
        let breaker = self.breakers.get(&mutation.class);

        let result = breaker
            .execute(|| self.retry.with_retry(call, policy))
            .await;

        match result {
            Ok(value) => {
                self.connectivity.handle_signal(true);
                for prefix in &mutation.invalidates {
                    self.cache.clear_prefix(prefix);
                }
                Ok(value)
            }
            Err(err) => {
                self.observe_failure(&err);
                if self.connectivity.is_offline() {
                    Err(self.defer(mutation))
                } else {
                    Err(err)
                }
            }
        }
    }

    fn defer(&self, mutation: Mutation) -> Error {
        match self
            .queue
            .enqueue_for(mutation.class, mutation.operation_type, mutation.payload)
        {
            Some(op) => Error::QueuedForOffline {
                operation_id: op.id,
                operation_type: op.operation_type,
            },
            None => Error::Offline,
        }
    }

    /// A connection-level failure is a passive offline signal.
    fn observe_failure(&self, err: &Error) {
        if err.is_network() {
            self.connectivity.handle_signal(false);
        }
    }

    /// Register the replay handler for queued operations of `operation_type`.
    pub fn register_replay<F, Fut>(&self, operation_type: impl Into<String>, handler: F)
    where
        F: Fn(QueuedOperation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let boxed: ReplayHandler =
            Arc::new(move |op: QueuedOperation| -> BoxFuture<'static, Result<()>> {
                Box::pin(handler(op))
            });
        self.handlers.write().insert(operation_type.into(), boxed);
    }

    /// Replay the offline queue through breaker and retry using the
    /// registered handlers.
    ///
    /// Operations without a handler fail with [`Error::NoReplayHandler`] and
    /// stay queued.
    pub async fn retry_failed_operations(&self) -> Result<QueueReport> {
        self.queue.process_queue(|op| self.replay(op)).await
    }

    async fn replay(&self, op: QueuedOperation) -> Result<()> {
        let handler = self.handlers.read().get(&op.operation_type).cloned();
        let Some(handler) = handler else {
            return Err(Error::NoReplayHandler(op.operation_type));
        };

        let breaker = self.breakers.get(&op.class);
        let result = breaker
            .execute(|| {
                self.retry
                    .with_retry(|| handler(op.clone()), &self.default_policy)
            })
            .await;
        if let Err(err) = &result {
            self.observe_failure(err);
        }
        result
    }

    /// Whether the remote service is believed unreachable.
    pub fn is_offline(&self) -> bool {
        self.connectivity.is_offline()
    }

    /// Probe the remote service now.
    pub async fn check_connection(&self) -> bool {
        self.connectivity.recheck_connectivity().await
    }

    /// Pending and failed queue counts.
    pub fn queue_status(&self) -> QueueStatus {
        self.queue.status()
    }

    /// State of the default class breaker.
    pub fn circuit_breaker_state(&self) -> CircuitState {
        self.breakers.state(DEFAULT_CLASS)
    }

    /// State of the breaker guarding `class`.
    pub fn circuit_breaker_state_for(&self, class: &str) -> CircuitState {
        self.breakers.state(class)
    }

    /// Statistics of every breaker used so far.
    pub fn circuit_breaker_stats(&self) -> Vec<CircuitBreakerStats> {
        self.breakers.stats()
    }

    /// Force every breaker closed.
    pub fn reset_circuit_breaker(&self) {
        self.breakers.reset_all();
    }

    /// Remove cache entries and/or queued operations.
    ///
    /// With a category, cache entries under `"{category}:"` and queued
    /// operations of that class are removed; without one, everything in
    /// scope is.
    pub fn invalidate(&self, category: Option<&str>, scope: InvalidationScope) -> Invalidated {
        let mut removed = Invalidated::default();

        if scope != InvalidationScope::Queue {
            removed.cache_entries = match category {
                Some(name) => self.cache.clear_prefix(&keys::category_prefix(name)),
                None => self.cache.clear(),
            };
        }
        if scope != InvalidationScope::Cache {
            removed.queued_operations = match category {
                Some(name) => self.queue.clear_matching(|op| op.class == name),
                None => self.queue.clear(),
            };
        }

        debug!(
            category = category.unwrap_or("*"),
            cache_entries = removed.cache_entries,
            queued_operations = removed.queued_operations,
            "Invalidated"
        );
        removed
    }

    /// Remove every cache entry.
    pub fn clear_all_caches(&self) -> usize {
        self.invalidate(None, InvalidationScope::Cache).cache_entries
    }

    /// Remove cache entries of one category.
    pub fn clear_by_category(&self, category: &str) -> usize {
        self.invalidate(Some(category), InvalidationScope::Cache)
            .cache_entries
    }

    /// Remove every patient cache entry.
    pub fn clear_patient_caches(&self) -> usize {
        self.clear_by_category(keys::PATIENT)
    }

    /// Remove resource cache entries, of one kind or all kinds.
    pub fn clear_resource_caches(&self, kind: Option<&str>) -> usize {
        match kind {
            Some(kind) => self.cache.clear_prefix(&keys::resource_prefix(kind)),
            None => self.clear_by_category(keys::RESOURCE),
        }
    }

    /// Start periodic probing and, when enabled, automatic replay on
    /// reconnect. Requires a tokio runtime.
    pub fn start(self: &Arc<Self>) {
        self.connectivity.start();

        if !self.config.auto_replay {
            return;
        }

        let mut task = self.replay_task.lock();
        if task.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *task = Some(token.clone());
        drop(task);

        // Listeners fire once per transition, so no reconnect is missed
        // while a replay is running.
        let reconnected = Arc::new(Notify::new());
        let signal = reconnected.clone();
        self.connectivity.on_online(move |_| signal.notify_one());
        if self.connectivity.is_online() && !self.queue.is_empty() {
            // Operations restored from a previous run.
            reconnected.notify_one();
        }

        let client = Arc::downgrade(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = reconnected.notified() => {}
                }

                let Some(client) = client.upgrade() else {
                    break;
                };
                if client.queue.is_empty() {
                    continue;
                }

                info!(pending = client.queue.size(), "Reconnected, replaying offline queue");
                match client.retry_failed_operations().await {
                    Ok(report) => debug!(
                        processed = report.processed,
                        remaining = report.remaining,
                        "Automatic replay finished"
                    ),
                    Err(e) => warn!(error = %e, "Automatic replay failed"),
                }
            }
            debug!("Automatic replay stopped");
        });
    }

    /// Stop background work and persist the offline queue.
    pub fn shutdown(&self) {
        self.connectivity.stop();
        if let Some(token) = self.replay_task.lock().take() {
            token.cancel();
        }
        match self.queue.flush() {
            Ok(()) => info!(pending = self.queue.size(), "Resilient client shut down"),
            Err(e) => warn!(error = %e, "Failed to flush offline queue on shutdown"),
        }
    }
}

impl Drop for ResilientClient {
    fn drop(&mut self) {
        if let Some(token) = self.replay_task.get_mut().take() {
            token.cancel();
        }
    }
}
