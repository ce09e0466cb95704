//! Durable, ordered log of deferred mutations.
//!
//! Operations are appended when a mutation cannot reach the remote service
//! and replayed strictly in enqueue order once connectivity returns. The whole
//! queue is persisted as one JSON array under a single storage key after
//! every change.

use crate::clock::SharedClock;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{Error, Result, StorageError};
use crate::storage::KeyValueStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resource class used when a caller does not name one.
pub const DEFAULT_CLASS: &str = "default";

fn default_class() -> String {
    DEFAULT_CLASS.to_string()
}

/// A mutation deferred while offline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedOperation {
    /// Unique, time-ordered identifier.
    pub id: String,
    /// Operation type, e.g. `createPatient`.
    #[serde(rename = "type")]
    pub operation_type: String,
    /// Opaque operation payload.
    pub payload: serde_json::Value,
    /// When the operation was queued.
    pub timestamp: DateTime<Utc>,
    /// Resource class the operation belongs to.
    #[serde(default = "default_class")]
    pub class: String,
    /// Failed replay attempts so far.
    #[serde(default)]
    pub attempts: u32,
    /// Error from the most recent failed replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

/// Offline queue configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Storage key the queue is persisted under.
    pub storage_key: String,
    /// Maximum number of queued operations. Zero means unbounded.
    pub max_size: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            storage_key: "tether:offline_queue".to_string(),
            max_size: 0,
        }
    }
}

/// Queue counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    /// Operations waiting for replay.
    pub pending: usize,
    /// Pending operations whose replay has failed at least once.
    pub failed: usize,
}

/// Outcome of one queue replay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueReport {
    /// Operations replayed successfully and removed.
    pub processed: usize,
    /// Operations whose replay failed and were kept.
    pub failed: usize,
    /// Operations still queued after the run.
    pub remaining: usize,
}

/// Durable FIFO of deferred mutations.
#[derive(Debug)]
pub struct OfflineQueue {
    config: QueueConfig,
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    connectivity: Arc<ConnectivityMonitor>,
    operations: Mutex<Vec<QueuedOperation>>,
    processing: AtomicBool,
}

impl OfflineQueue {
    /// Create a queue, loading any operations persisted by a previous run.
    ///
    /// Unreadable or corrupt persisted data is logged and the queue starts
    /// empty.
    pub fn new(
        config: QueueConfig,
        store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
        connectivity: Arc<ConnectivityMonitor>,
    ) -> Self {
        let operations = load(store.as_ref(), &config.storage_key);
        if !operations.is_empty() {
            info!(count = operations.len(), "Restored offline queue");
        }

        Self {
            config,
            store,
            clock,
            connectivity,
            operations: Mutex::new(operations),
            processing: AtomicBool::new(false),
        }
    }

    /// Queue an operation in the default class.
    pub fn enqueue(
        &self,
        operation_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Option<QueuedOperation> {
        self.enqueue_for(DEFAULT_CLASS, operation_type, payload)
    }

    /// Queue an operation and persist the queue.
    ///
    /// Returns `None` without changing the queue if it is full or cannot be
    /// persisted; the failure is logged, never raised.
    pub fn enqueue_for(
        &self,
        class: impl Into<String>,
        operation_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Option<QueuedOperation> {
        let operation = QueuedOperation {
            id: Uuid::now_v7().to_string(),
            operation_type: operation_type.into(),
            payload,
            timestamp: self.clock.now(),
            class: class.into(),
            attempts: 0,
            last_error: None,
        };

        let mut operations = self.operations.lock();

        if self.config.max_size > 0 && operations.len() >= self.config.max_size {
            warn!(
                operation_type = %operation.operation_type,
                max_size = self.config.max_size,
                "Offline queue full, operation dropped"
            );
            return None;
        }

        operations.push(operation.clone());
        if let Err(e) = self.persist(&operations) {
            operations.pop();
            warn!(
                operation_type = %operation.operation_type,
                error = %e,
                "Failed to persist offline queue, operation dropped"
            );
            return None;
        }

        debug!(
            id = %operation.id,
            operation_type = %operation.operation_type,
            "Operation queued for offline processing"
        );
        Some(operation)
    }

    /// Replay queued operations in order.
    ///
    /// Fails with [`Error::Offline`] while the monitor reports offline and
    /// with [`Error::QueueBusy`] if another replay is running; the queue is
    /// untouched in both cases. Operations whose processor succeeds are
    /// removed; failed ones keep their relative order.
    /// Operations queued during the run are kept after it.
    pub async fn process_queue<F, Fut, E>(&self, mut processor: F) -> Result<QueueReport>
    where
        F: FnMut(QueuedOperation) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Display,
    {
        if self.connectivity.is_offline() {
            return Err(Error::Offline);
        }

        let _guard = ProcessingGuard::acquire(&self.processing).ok_or(Error::QueueBusy)?;

        let snapshot = self.operations.lock().clone();
        if snapshot.is_empty() {
            return Ok(QueueReport::default());
        }

        info!(count = snapshot.len(), "Processing offline queue");

        let mut processed = 0;
        let mut failed = 0;

        for operation in snapshot {
            let id = operation.id.clone();
            let operation_type = operation.operation_type.clone();
            match processor(operation).await {
                Ok(()) => {
                    debug!(id = %id, operation_type = %operation_type, "Replayed queued operation");
                    self.commit(&id, None);
                    processed += 1;
                }
                Err(e) => {
                    warn!(
                        id = %id,
                        operation_type = %operation_type,
                        error = %e,
                        "Replay of queued operation failed"
                    );
                    self.commit(&id, Some(e.to_string()));
                    failed += 1;
                }
            }
        }

        let report = QueueReport {
            processed,
            failed,
            remaining: self.size(),
        };
        info!(
            processed = report.processed,
            failed = report.failed,
            remaining = report.remaining,
            "Offline queue processed"
        );
        Ok(report)
    }

    /// Record one replay result and persist it before the next operation
    /// runs, so a run dropped midway never replays a success twice.
    fn commit(&self, id: &str, error: Option<String>) {
        let mut operations = self.operations.lock();
        match error {
            None => operations.retain(|op| op.id != id),
            Some(message) => {
                if let Some(op) = operations.iter_mut().find(|op| op.id == id) {
                    op.attempts += 1;
                    op.last_error = Some(message);
                }
            }
        }
        if let Err(e) = self.persist(&operations) {
            warn!(error = %e, "Failed to persist offline queue after replay");
        }
    }

    /// Number of queued operations.
    pub fn size(&self) -> usize {
        self.operations.lock().len()
    }

    /// Check if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.operations.lock().is_empty()
    }

    /// Whether a replay is running.
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::Acquire)
    }

    /// Copy of the queued operations, oldest first.
    pub fn pending(&self) -> Vec<QueuedOperation> {
        self.operations.lock().clone()
    }

    /// Pending and failed counts.
    pub fn status(&self) -> QueueStatus {
        let operations = self.operations.lock();
        QueueStatus {
            pending: operations.len(),
            failed: operations.iter().filter(|op| op.attempts > 0).count(),
        }
    }

    /// Remove every queued operation.
    pub fn clear(&self) -> usize {
        self.clear_matching(|_| true)
    }

    /// Remove queued operations matching `predicate`, returning how many
    /// were removed.
    pub fn clear_matching<P>(&self, mut predicate: P) -> usize
    where
        P: FnMut(&QueuedOperation) -> bool,
    {
        let mut operations = self.operations.lock();
        let before = operations.len();
        operations.retain(|op| !predicate(op));
        let removed = before - operations.len();

        if removed > 0 {
            if let Err(e) = self.persist(&operations) {
                warn!(error = %e, "Failed to persist offline queue after clear");
            }
            debug!(removed, "Cleared queued operations");
        }
        removed
    }

    /// Write the current queue to the store.
    pub fn flush(&self) -> std::result::Result<(), StorageError> {
        let operations = self.operations.lock();
        self.persist(&operations)
    }

    fn persist(&self, operations: &[QueuedOperation]) -> std::result::Result<(), StorageError> {
        if operations.is_empty() {
            return self.store.remove(&self.config.storage_key);
        }
        let json = serde_json::to_string(operations)
            .map_err(|e| StorageError::Io(std::io::Error::other(e)))?;
        self.store.set(&self.config.storage_key, &json)
    }
}

fn load(store: &dyn KeyValueStore, key: &str) -> Vec<QueuedOperation> {
    match store.get(key) {
        Ok(Some(json)) => serde_json::from_str(&json).unwrap_or_else(|e| {
            warn!(key, error = %e, "Discarding unreadable offline queue");
            Vec::new()
        }),
        Ok(None) => Vec::new(),
        Err(e) => {
            warn!(key, error = %e, "Failed to load offline queue");
            Vec::new()
        }
    }
}

/// Holds the single replay slot for the lifetime of a run.
struct ProcessingGuard<'a>(&'a AtomicBool);

impl<'a> ProcessingGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connectivity::ConnectivityConfig;
    use crate::storage::MemoryStore;
    use serde_json::json;

    struct Fixture {
        store: Arc<MemoryStore>,
        clock: ManualClock,
        monitor: Arc<ConnectivityMonitor>,
    }

    impl Fixture {
        fn new() -> Self {
            let clock = ManualClock::new();
            let monitor = Arc::new(ConnectivityMonitor::new(
                ConnectivityConfig::default(),
                clock.shared(),
            ));
            Self {
                store: Arc::new(MemoryStore::new()),
                clock,
                monitor,
            }
        }

        fn queue(&self, config: QueueConfig) -> OfflineQueue {
            OfflineQueue::new(
                config,
                self.store.clone(),
                self.clock.shared(),
                self.monitor.clone(),
            )
        }
    }

    #[test]
    fn test_enqueue_persists_immediately() {
        let fx = Fixture::new();
        let queue = fx.queue(QueueConfig::default());

        let op = queue.enqueue("createPatient", json!({"name": "Ada"})).unwrap();
        assert_eq!(op.class, DEFAULT_CLASS);
        assert_eq!(queue.size(), 1);

        let raw = fx.store.get("tether:offline_queue").unwrap().unwrap();
        let persisted: Vec<QueuedOperation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted, vec![op]);
        assert!(raw.contains("\"type\":\"createPatient\""));
    }

    #[test]
    fn test_queue_survives_restart() {
        let fx = Fixture::new();
        let first = fx.queue(QueueConfig::default());
        first.enqueue("createPatient", json!({"id": 1}));
        first.enqueue("updatePatient", json!({"id": 1}));

        let second = fx.queue(QueueConfig::default());
        let types: Vec<_> = second
            .pending()
            .into_iter()
            .map(|op| op.operation_type)
            .collect();
        assert_eq!(types, vec!["createPatient", "updatePatient"]);
    }

    #[test]
    fn test_corrupt_storage_starts_empty() {
        let fx = Fixture::new();
        fx.store.set("tether:offline_queue", "not json").unwrap();
        assert!(fx.queue(QueueConfig::default()).is_empty());
    }

    #[test]
    fn test_storage_failure_is_a_logged_noop() {
        let clock = ManualClock::new();
        let monitor = Arc::new(ConnectivityMonitor::new(
            ConnectivityConfig::default(),
            clock.shared(),
        ));
        let queue = OfflineQueue::new(
            QueueConfig::default(),
            Arc::new(MemoryStore::with_quota(16)),
            clock.shared(),
            monitor,
        );

        assert!(queue.enqueue("createPatient", json!({"big": "x".repeat(64)})).is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_max_size() {
        let fx = Fixture::new();
        let queue = fx.queue(QueueConfig {
            max_size: 2,
            ..Default::default()
        });

        assert!(queue.enqueue("a", json!(1)).is_some());
        assert!(queue.enqueue("b", json!(2)).is_some());
        assert!(queue.enqueue("c", json!(3)).is_none());
        let types: Vec<_> = queue.pending().into_iter().map(|op| op.operation_type).collect();
        assert_eq!(types, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_process_refuses_while_offline() {
        let fx = Fixture::new();
        let queue = fx.queue(QueueConfig::default());
        queue.enqueue("createPatient", json!({}));
        fx.monitor.set_online(false);

        let mut calls = 0;
        let result = queue
            .process_queue(|_| {
                calls += 1;
                async { Ok::<_, Error>(()) }
            })
            .await;

        assert!(matches!(result, Err(Error::Offline)));
        assert_eq!(calls, 0);
        assert_eq!(queue.size(), 1);
    }

    #[tokio::test]
    async fn test_process_keeps_failures_in_order() {
        let fx = Fixture::new();
        let queue = fx.queue(QueueConfig::default());
        for name in ["a", "b", "c", "d"] {
            queue.enqueue(name, json!({}));
        }

        let mut seen = Vec::new();
        let report = queue
            .process_queue(|op| {
                seen.push(op.operation_type.clone());
                let fail = op.operation_type == "b" || op.operation_type == "d";
                async move {
                    if fail {
                        Err(Error::http(503, "unavailable"))
                    } else {
                        Ok(())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(seen, vec!["a", "b", "c", "d"]);
        assert_eq!(
            report,
            QueueReport {
                processed: 2,
                failed: 2,
                remaining: 2
            }
        );

        let left = queue.pending();
        assert_eq!(left[0].operation_type, "b");
        assert_eq!(left[1].operation_type, "d");
        assert_eq!(left[0].attempts, 1);
        assert!(left[0].last_error.as_deref().unwrap().contains("503"));
        assert_eq!(queue.status(), QueueStatus { pending: 2, failed: 2 });

        let raw = fx.store.get("tether:offline_queue").unwrap().unwrap();
        let persisted: Vec<QueuedOperation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted, left);
    }

    #[tokio::test]
    async fn test_fully_drained_queue_removes_storage_key() {
        let fx = Fixture::new();
        let queue = fx.queue(QueueConfig::default());
        queue.enqueue("createPatient", json!({}));

        let report = queue
            .process_queue(|_| async { Ok::<_, Error>(()) })
            .await
            .unwrap();

        assert_eq!(report.remaining, 0);
        assert_eq!(fx.store.get("tether:offline_queue").unwrap(), None);
    }

    #[tokio::test]
    async fn test_concurrent_processing_is_rejected() {
        let fx = Fixture::new();
        let queue = fx.queue(QueueConfig::default());
        queue.enqueue("createPatient", json!({}));

        let (release, wait) = tokio::sync::oneshot::channel::<()>();
        let mut wait = Some(wait);
        let first = queue.process_queue(move |_| {
            let wait = wait.take();
            async move {
                if let Some(wait) = wait {
                    let _ = wait.await;
                }
                Ok::<_, Error>(())
            }
        });
        tokio::pin!(first);
        assert!(futures::poll!(first.as_mut()).is_pending());
        assert!(queue.is_processing());

        let second = queue.process_queue(|_| async { Ok::<_, Error>(()) }).await;
        assert!(matches!(second, Err(Error::QueueBusy)));

        release.send(()).unwrap();
        assert_eq!(first.await.unwrap().processed, 1);
        assert!(!queue.is_processing());
    }

    #[tokio::test]
    async fn test_abandoned_run_keeps_completed_replays() {
        let fx = Fixture::new();
        let queue = fx.queue(QueueConfig::default());
        queue.enqueue("createPatient", json!({}));
        queue.enqueue("updatePatient", json!({}));

        let run = queue.process_queue(|op| async move {
            if op.operation_type == "updatePatient" {
                futures::future::pending::<()>().await;
            }
            Ok::<_, Error>(())
        });
        {
            tokio::pin!(run);
            assert!(futures::poll!(run.as_mut()).is_pending());
        }

        assert!(!queue.is_processing());
        let left: Vec<_> = queue
            .pending()
            .into_iter()
            .map(|op| op.operation_type)
            .collect();
        assert_eq!(left, vec!["updatePatient"]);

        let raw = fx.store.get("tether:offline_queue").unwrap().unwrap();
        let persisted: Vec<QueuedOperation> = serde_json::from_str(&raw).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(persisted[0].operation_type, "updatePatient");
    }

    #[test]
    fn test_clear_matching() {
        let fx = Fixture::new();
        let queue = fx.queue(QueueConfig::default());
        queue.enqueue_for("patient", "createPatient", json!({}));
        queue.enqueue_for("resource", "createObservation", json!({}));
        queue.enqueue_for("patient", "updatePatient", json!({}));

        assert_eq!(queue.clear_matching(|op| op.class == "patient"), 2);
        assert_eq!(queue.pending()[0].operation_type, "createObservation");

        assert_eq!(queue.clear(), 1);
        assert!(queue.is_empty());
        assert_eq!(fx.store.get("tether:offline_queue").unwrap(), None);
    }
}
