//! Storage instance trait definition.

use crate::error::StorageResult;
use forkline_protocol::{Document, Revision, WithDeleted};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;

/// Boxed future returned by [`StorageInstance`] operations.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// A document state as persisted by a storage instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredDocument<T> {
    /// The document state.
    pub data: WithDeleted<T>,
    /// Revision assigned by the storage on write.
    pub revision: Revision,
    /// Write sequence number, used for change iteration.
    pub sequence: u64,
}

impl<T: Document> StoredDocument<T> {
    /// Returns the primary key of the stored document.
    pub fn id(&self) -> &str {
        self.data.id()
    }
}

/// A row of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct BulkWriteRow<T> {
    /// The stored state the writer based its write on.
    ///
    /// `None` means the writer expects the document not to exist.
    pub previous: Option<StoredDocument<T>>,
    /// The new state.
    pub document: WithDeleted<T>,
}

impl<T> BulkWriteRow<T> {
    /// Creates a row that inserts a new document.
    pub fn insert(document: WithDeleted<T>) -> Self {
        Self {
            previous: None,
            document,
        }
    }

    /// Creates a row that replaces `previous`.
    pub fn update(previous: StoredDocument<T>, document: WithDeleted<T>) -> Self {
        Self {
            previous: Some(previous),
            document,
        }
    }
}

/// Why a single row of a bulk write was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// The `previous` revision did not match the stored revision (status 409).
    Conflict,
    /// The storage refused the row for another reason.
    Rejected(String),
}

/// A rejected row of a bulk write.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteError<T> {
    /// Primary key of the rejected document.
    pub document_id: String,
    /// Why the row was rejected.
    pub kind: WriteErrorKind,
    /// The current stored state, if any.
    pub document_in_db: Option<StoredDocument<T>>,
    /// The rejected row.
    pub write_row: BulkWriteRow<T>,
}

impl<T> WriteError<T> {
    /// Returns true if the row was rejected because of a revision mismatch.
    pub fn is_conflict(&self) -> bool {
        self.kind == WriteErrorKind::Conflict
    }
}

/// Result of a bulk write.
///
/// Every row is either in `success` or in `error`; a rejected row never
/// aborts the other rows.
#[derive(Debug, Clone)]
pub struct BulkWriteResponse<T> {
    /// Written documents by primary key.
    pub success: HashMap<String, StoredDocument<T>>,
    /// Rejected rows by primary key.
    pub error: HashMap<String, WriteError<T>>,
}

impl<T> Default for BulkWriteResponse<T> {
    fn default() -> Self {
        Self {
            success: HashMap::new(),
            error: HashMap::new(),
        }
    }
}

impl<T> BulkWriteResponse<T> {
    /// Returns true if no row was rejected.
    pub fn is_ok(&self) -> bool {
        self.error.is_empty()
    }
}

/// Position in the write history of a storage instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StorageCheckpoint {
    /// Sequence number of the last seen write.
    pub sequence: u64,
}

impl StorageCheckpoint {
    /// Creates a checkpoint at the given sequence.
    pub fn new(sequence: u64) -> Self {
        Self { sequence }
    }
}

/// Documents changed after a checkpoint, in write order.
#[derive(Debug, Clone)]
pub struct ChangedDocuments<T> {
    /// Latest stored state of every changed document, tombstones included.
    pub documents: Vec<StoredDocument<T>>,
    /// Checkpoint after the last returned document.
    pub checkpoint: StorageCheckpoint,
}

/// Kind of a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOperation {
    /// The document did not exist or was a tombstone before.
    Insert,
    /// A live document was replaced by another live state.
    Update,
    /// The document was replaced by a tombstone.
    Delete,
}

/// A single document change.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent<T> {
    /// Primary key of the changed document.
    pub document_id: String,
    /// Kind of change.
    pub operation: ChangeOperation,
    /// The stored state after the write.
    pub document: StoredDocument<T>,
    /// The stored state before the write.
    pub previous: Option<StoredDocument<T>>,
}

/// All change events produced by one bulk write.
#[derive(Debug, Clone)]
pub struct EventBulk<T> {
    /// Unique id of the bulk.
    pub id: String,
    /// Events in write order.
    pub events: Vec<ChangeEvent<T>>,
    /// Checkpoint after the last event.
    pub checkpoint: StorageCheckpoint,
    /// The context string passed to [`StorageInstance::bulk_write`].
    ///
    /// Writers tag their writes with it so that consumers can tell write
    /// origins apart.
    pub context: String,
}

/// A document store consumed by the replication protocol.
///
/// Both the fork and the replication meta store are storage instances.
///
/// # Invariants
///
/// - `bulk_write` performs a per-document compare-and-swap against the
///   revision of `previous`; mismatches are per-row errors, not aborts
/// - every successful write gets a new revision and a new, strictly
///   increasing sequence number
/// - every bulk write with at least one success emits exactly one
///   [`EventBulk`] on the change stream, in sequence order
/// - implementations must be `Send + Sync`
pub trait StorageInstance<T: Document>: Send + Sync {
    /// Writes documents, each row atomically.
    fn bulk_write<'a>(
        &'a self,
        rows: Vec<BulkWriteRow<T>>,
        context: &'a str,
    ) -> StorageFuture<'a, BulkWriteResponse<T>>;

    /// Looks up documents by primary key.
    ///
    /// Tombstones are only returned when `include_deleted` is set.
    fn find_documents_by_id(
        &self,
        ids: Vec<String>,
        include_deleted: bool,
    ) -> StorageFuture<'_, HashMap<String, StoredDocument<T>>>;

    /// Returns up to `limit` documents written after `checkpoint`.
    ///
    /// Passing the returned checkpoint again never returns the same
    /// documents and never skips later writes.
    fn changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<StorageCheckpoint>,
    ) -> StorageFuture<'_, ChangedDocuments<T>>;

    /// Subscribes to all future writes.
    fn change_stream(&self) -> broadcast::Receiver<EventBulk<T>>;
}
