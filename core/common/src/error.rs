//! Common error types for Ferry.

use thiserror::Error;

/// Top-level error type for Ferry operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Offline read for a key that was never cached.
    #[error("No cached data for key: {0}")]
    NoCachedData(String),

    /// Timeout, connection reset, or a 5xx-class response.
    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    /// The remote end refused the operation (4xx, validation, auth).
    #[error("Operation rejected ({status}): {message}")]
    RejectedOperation { status: u16, message: String },

    /// Retry budget spent without a success.
    #[error("Retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted { attempts: u32, last_error: String },

    /// The durable store failed while reading or writing a queue entry.
    #[error("Queue persistence error: {0}")]
    QueuePersistence(String),

    /// Storage operation failed.
    #[error("Storage error: {0}")]
    Storage(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// The engine or one of its background tasks has stopped.
    #[error("Shut down: {0}")]
    Shutdown(String),
}

impl Error {
    /// Classify a non-success response status.
    ///
    /// 5xx, 408 (request timeout) and 429 (too many requests) are transient;
    /// every other status is a rejection.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        if status >= 500 || status == 408 || status == 429 {
            Error::TransientNetwork(format!("HTTP {}: {}", status, message))
        } else {
            Error::RejectedOperation { status, message }
        }
    }

    /// Whether replaying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientNetwork(_) | Error::Io(_))
    }

    /// Re-tag a store failure as a queue persistence failure.
    ///
    /// Used on the queue paths where losing the write would lose a user's
    /// intent; other variants pass through.
    pub fn into_queue_persistence(self) -> Self {
        match self {
            Error::Storage(msg) | Error::Serialization(msg) => Error::QueuePersistence(msg),
            Error::Io(e) => Error::QueuePersistence(e.to_string()),
            other => other,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
