//! Error types for resilient remote operations.

use std::time::Duration;
use thiserror::Error;

/// Result type for Tether operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by remote operations and the layer around them.
///
/// Every error is tagged where it is raised, so classification never has to
/// inspect messages.
#[derive(Debug, Error)]
pub enum Error {
    /// The remote service could not be reached.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote call did not complete within its deadline.
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    /// The remote call was aborted before completing.
    #[error("Request aborted: {0}")]
    Aborted(String),

    /// The remote service answered with a non-success status.
    #[error("Response error: {status} - {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Error message or response body.
        message: String,
    },

    /// The request was rejected as invalid.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The circuit breaker short-circuited the call.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// A mutation was deferred to the offline queue. It will be replayed once
    /// connectivity returns.
    #[error("Operation '{operation_type}' queued for offline processing ({operation_id})")]
    QueuedForOffline {
        /// Identifier of the queued operation.
        operation_id: String,
        /// Operation type, e.g. `createPatient`.
        operation_type: String,
    },

    /// The layer is offline and the requested work needs the network.
    #[error("Offline: remote service unreachable")]
    Offline,

    /// Another task is already replaying the offline queue.
    #[error("Offline queue is already being processed")]
    QueueBusy,

    /// No replay handler is registered for a queued operation type.
    #[error("No replay handler registered for operation type: {0}")]
    NoReplayHandler(String),

    /// Durable storage failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a response error.
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        Self::Http {
            status,
            message: message.into(),
        }
    }

    /// Check if this error is transient and worth retrying.
    ///
    /// Network failures, timeouts, aborts, 5xx and 429 are retryable.
    /// Validation errors and every other 4xx are not.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::Aborted(_) => true,
            Self::Http { status, .. } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    /// Check if this is a timeout or abort.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::Aborted(_))
    }

    /// Check if this is a connection-level failure.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Check if the circuit breaker rejected the call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen(_))
    }

    /// Check if the call was deferred to the offline queue.
    ///
    /// Callers should treat this as a deferred success rather than a failure.
    pub fn is_queued_for_offline(&self) -> bool {
        matches!(self, Self::QueuedForOffline { .. })
    }

    /// Get the HTTP status code if this is a response error.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Raised by a circuit breaker that refuses to run an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Circuit breaker '{name}' is open, request rejected")]
pub struct CircuitOpenError {
    /// Name of the rejecting breaker.
    pub name: String,
}

/// Durable key/value storage errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The store refused the write because it is full.
    #[error("Storage quota exceeded writing key: {0}")]
    QuotaExceeded(String),

    /// The key cannot be represented by the store.
    #[error("Invalid storage key: {0}")]
    InvalidKey(String),
}
