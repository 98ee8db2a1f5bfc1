//! Error types for Tessera core.

use crate::types::Timestamp;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in Tessera core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] tessera_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding or decoding of a persistent structure failed.
    #[error("codec error: {message}")]
    Codec {
        /// Description of the failure.
        message: String,
    },

    /// No index with this name exists at the requested time.
    #[error("index not found: {name}")]
    IndexNotFound {
        /// Index name.
        name: String,
    },

    /// An index with this name is already registered.
    #[error("index already exists: {name}")]
    IndexExists {
        /// Index name.
        name: String,
    },

    /// The index does not support transactional isolation.
    #[error("index is not isolatable: {name}")]
    NotIsolatable {
        /// Index name.
        name: String,
    },

    /// A task touched a resource it did not declare.
    #[error("resource not declared by task: {name}")]
    ResourceNotDeclared {
        /// Resource name.
        name: String,
    },

    /// A run-state transition is not allowed.
    #[error("illegal state transition: {from} -> {to}")]
    IllegalState {
        /// Current state.
        from: String,
        /// Requested state.
        to: String,
    },

    /// The transaction is no longer active.
    #[error("transaction not active: {tx}")]
    NotActive {
        /// Transaction start time.
        tx: Timestamp,
    },

    /// No active transaction has this start time.
    #[error("transaction not found: {tx}")]
    TransactionNotFound {
        /// Transaction start time.
        tx: Timestamp,
    },

    /// A transaction's write set conflicts with committed state.
    #[error("validation failed for {tx}: write-write conflict in index {index}")]
    ValidationFailed {
        /// Transaction start time.
        tx: Timestamp,
        /// Index with the conflicting write.
        index: String,
    },

    /// The group commit a task participated in failed.
    #[error("commit failed: {message}")]
    CommitFailed {
        /// Description of the failure.
        message: String,
    },

    /// Resource locks were not granted in time.
    #[error("lock request timed out after {waited_ms}ms on {resources:?}")]
    LockTimeout {
        /// Requested resources.
        resources: Vec<String>,
        /// How long the request waited.
        waited_ms: u64,
    },

    /// Waiting for a result timed out.
    #[error("timed out waiting for task result")]
    Timeout,

    /// The task was cancelled before it ran.
    #[error("task cancelled")]
    Cancelled,

    /// The submission queue is full.
    #[error("task rejected: {lane} queue is full")]
    Rejected {
        /// Lane that rejected the task.
        lane: String,
    },

    /// The concurrency manager no longer accepts work.
    #[error("concurrency manager is shut down")]
    Shutdown,

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },

    /// The journal is closed.
    #[error("journal is closed")]
    JournalClosed,
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec {
            message: message.into(),
        }
    }

    /// Creates an index not found error.
    pub fn index_not_found(name: impl Into<String>) -> Self {
        Self::IndexNotFound { name: name.into() }
    }

    /// Creates a commit failed error.
    pub fn commit_failed(message: impl Into<String>) -> Self {
        Self::CommitFailed {
            message: message.into(),
        }
    }

    /// Creates an illegal state error.
    pub fn illegal_state(from: impl ToString, to: impl ToString) -> Self {
        Self::IllegalState {
            from: from.to_string(),
            to: to.to_string(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }

    /// True for faults a caller can recover from by retrying the whole
    /// transaction against a fresh snapshot.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::ValidationFailed { .. } | Self::LockTimeout { .. })
    }
}
