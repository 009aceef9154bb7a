//! Error types for storage operations.

use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// Per-document write failures (such as revision mismatches) are not
/// errors of the whole call; they are reported inside
/// [`crate::BulkWriteResponse`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The storage instance is closed.
    #[error("storage is closed")]
    Closed,

    /// A document could not be serialized.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The stored data is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// An error reported by a storage backend implementation.
    #[error("backend error: {0}")]
    Backend(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(StorageError::Closed.to_string(), "storage is closed");
        assert!(StorageError::Backend("disk full".into())
            .to_string()
            .contains("disk full"));
    }
}
