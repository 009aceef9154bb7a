//! Error types for the replication engine.

use forkline_storage::StorageError;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplicationResult<T> = Result<T, ReplicationError>;

/// Boxed future returned by the object-safe replication contracts.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = ReplicationResult<T>> + Send + 'a>>;

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// Network or transport error raised by a replication handler.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the failed batch can be retried.
        retryable: bool,
    },

    /// Fork or meta storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// A collaborator broke its contract, for example a handler returning
    /// more documents than requested.
    #[error("contract violation: {0}")]
    Contract(String),

    /// Checkpoint or document (de)serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The replication was cancelled.
    #[error("replication cancelled")]
    Cancelled,

    /// A replication with the same identifier is already running.
    #[error("replication identifier {0:?} is already in use")]
    DuplicateIdentifier(String),

    /// The fork storage rejected a write for a reason other than a conflict.
    #[error("fork write rejected for document {document_id:?}: {reason}")]
    ForkWrite {
        /// Primary key of the rejected document.
        document_id: String,
        /// Rejection reason reported by the storage.
        reason: String,
    },
}

impl ReplicationError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the failed batch should be retried in a fresh batch.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::Transport { retryable, .. } => *retryable,
            ReplicationError::Storage(StorageError::Closed) => false,
            ReplicationError::Storage(_) => true,
            _ => false,
        }
    }

    /// Returns true if the error stops the replication instance.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ReplicationError::Contract(_)
                | ReplicationError::Transport {
                    retryable: false,
                    ..
                }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ReplicationError::transport_retryable("connection lost").is_retryable());
        assert!(!ReplicationError::transport_fatal("bad credentials").is_retryable());
        assert!(ReplicationError::Storage(StorageError::Backend("busy".into())).is_retryable());
        assert!(!ReplicationError::Storage(StorageError::Closed).is_retryable());
        assert!(!ReplicationError::Cancelled.is_retryable());
        assert!(!ReplicationError::Contract("too many documents".into()).is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(ReplicationError::Contract("bad".into()).is_fatal());
        assert!(ReplicationError::transport_fatal("gone").is_fatal());
        assert!(!ReplicationError::transport_retryable("flaky").is_fatal());
        assert!(!ReplicationError::Cancelled.is_fatal());
    }

    #[test]
    fn error_display() {
        let err = ReplicationError::DuplicateIdentifier("todos".into());
        assert_eq!(err.to_string(), "replication identifier \"todos\" is already in use");

        let err = ReplicationError::ForkWrite {
            document_id: "x".into(),
            reason: "schema".into(),
        };
        assert!(err.to_string().contains("\"x\""));
        assert!(err.to_string().contains("schema"));
    }
}
