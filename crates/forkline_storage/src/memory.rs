//! In-memory storage instance.

use crate::error::{StorageError, StorageResult};
use crate::instance::{
    BulkWriteResponse, BulkWriteRow, ChangeEvent, ChangeOperation, ChangedDocuments, EventBulk,
    StorageCheckpoint, StorageFuture, StorageInstance, StoredDocument, WriteError, WriteErrorKind,
};
use forkline_protocol::{Document, Revision, WithDeleted};
use parking_lot::RwLock;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::broadcast;

/// Default capacity of the change stream channel.
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

struct Inner<T> {
    documents: HashMap<String, StoredDocument<T>>,
    next_sequence: u64,
    closed: bool,
}

/// An in-memory storage instance.
///
/// This instance keeps all documents in memory and is suitable for:
/// - Unit and integration tests
/// - The replication meta store of ephemeral replications
/// - Standing in as the master when replicating two instances in-process
///
/// # Thread Safety
///
/// The instance is thread-safe and can be shared across tasks behind an `Arc`.
///
/// # Example
///
/// ```rust
/// use forkline_protocol::{Document, WithDeleted};
/// use forkline_storage::{BulkWriteRow, MemoryStorage, StorageInstance};
///
/// #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
/// struct Note {
///     id: String,
/// }
///
/// impl Document for Note {
///     fn primary_key(&self) -> &str {
///         &self.id
///     }
/// }
///
/// let rt = tokio::runtime::Runtime::new().unwrap();
/// rt.block_on(async {
///     let storage = MemoryStorage::new("notes");
///     let row = BulkWriteRow::insert(WithDeleted::new(Note { id: "a".into() }));
///     let result = storage.bulk_write(vec![row], "example").await.unwrap();
///     assert!(result.is_ok());
///     assert_eq!(storage.len(), 1);
/// });
/// ```
pub struct MemoryStorage<T> {
    name: String,
    inner: RwLock<Inner<T>>,
    changes: broadcast::Sender<EventBulk<T>>,
}

impl<T: Document> MemoryStorage<T> {
    /// Creates a new empty storage instance.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_CHANGE_CAPACITY)
    }

    /// Creates a storage instance whose change stream buffers `capacity` bulks.
    ///
    /// Subscribers that fall further behind observe a lag instead of the
    /// missed bulks.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        let (changes, _) = broadcast::channel(capacity.max(1));
        Self {
            name: name.into(),
            inner: RwLock::new(Inner {
                documents: HashMap::new(),
                next_sequence: 1,
                closed: false,
            }),
            changes,
        }
    }

    /// Returns the name of this instance.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stored documents, tombstones included.
    pub fn len(&self) -> usize {
        self.inner.read().documents.len()
    }

    /// Returns true if no document was ever written.
    pub fn is_empty(&self) -> bool {
        self.inner.read().documents.is_empty()
    }

    /// Returns the stored state of a document, tombstones included.
    pub fn get(&self, id: &str) -> Option<StoredDocument<T>> {
        self.inner.read().documents.get(id).cloned()
    }

    /// Returns all non-deleted documents, sorted by primary key.
    pub fn active_documents(&self) -> Vec<WithDeleted<T>> {
        let inner = self.inner.read();
        let mut docs: Vec<_> = inner
            .documents
            .values()
            .filter(|stored| !stored.data.deleted)
            .map(|stored| stored.data.clone())
            .collect();
        docs.sort_by(|a, b| a.id().cmp(b.id()));
        docs
    }

    /// Returns every stored document, tombstones included, sorted by primary key.
    pub fn all_documents(&self) -> Vec<StoredDocument<T>> {
        let inner = self.inner.read();
        let mut docs: Vec<_> = inner.documents.values().cloned().collect();
        docs.sort_by(|a, b| a.id().cmp(b.id()));
        docs
    }

    /// Returns the number of live change stream subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.changes.receiver_count()
    }

    /// Closes the instance; every later operation fails with [`StorageError::Closed`].
    pub fn close(&self) {
        self.inner.write().closed = true;
    }

    fn write_rows(
        &self,
        rows: Vec<BulkWriteRow<T>>,
        context: &str,
    ) -> StorageResult<BulkWriteResponse<T>> {
        let hashes = rows
            .iter()
            .map(|row| content_hash(&row.document))
            .collect::<StorageResult<Vec<_>>>()?;

        let mut inner = self.inner.write();
        if inner.closed {
            return Err(StorageError::Closed);
        }

        let mut response = BulkWriteResponse::default();
        let mut events = Vec::new();

        for (row, hash) in rows.into_iter().zip(hashes) {
            let id = row.document.id().to_string();
            let current = inner.documents.get(&id).cloned();

            let matches = match (&row.previous, &current) {
                (None, None) => true,
                (Some(previous), Some(current)) => previous.revision == current.revision,
                _ => false,
            };
            if !matches {
                response.error.insert(
                    id.clone(),
                    WriteError {
                        document_id: id,
                        kind: WriteErrorKind::Conflict,
                        document_in_db: current,
                        write_row: row,
                    },
                );
                continue;
            }

            let revision = Revision::next(current.as_ref().map(|c| &c.revision), hash);
            let sequence = inner.next_sequence;
            inner.next_sequence += 1;

            let operation = if row.document.deleted {
                ChangeOperation::Delete
            } else if current.as_ref().map_or(true, |c| c.data.deleted) {
                ChangeOperation::Insert
            } else {
                ChangeOperation::Update
            };

            let stored = StoredDocument {
                data: row.document,
                revision,
                sequence,
            };
            inner.documents.insert(id.clone(), stored.clone());
            events.push(ChangeEvent {
                document_id: id.clone(),
                operation,
                document: stored.clone(),
                previous: current,
            });
            response.success.insert(id, stored);
        }

        if let Some(last) = events.last() {
            let checkpoint = StorageCheckpoint::new(last.document.sequence);
            let bulk = EventBulk {
                id: uuid::Uuid::new_v4().to_string(),
                checkpoint,
                events,
                context: context.to_string(),
            };
            // Sent under the write lock so bulks arrive in sequence order.
            let _ = self.changes.send(bulk);
        }

        Ok(response)
    }

    fn find_by_id(
        &self,
        ids: &[String],
        include_deleted: bool,
    ) -> StorageResult<HashMap<String, StoredDocument<T>>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        Ok(ids
            .iter()
            .filter_map(|id| inner.documents.get(id))
            .filter(|stored| include_deleted || !stored.data.deleted)
            .map(|stored| (stored.id().to_string(), stored.clone()))
            .collect())
    }

    fn changed_since(
        &self,
        limit: usize,
        checkpoint: Option<StorageCheckpoint>,
    ) -> StorageResult<ChangedDocuments<T>> {
        let inner = self.inner.read();
        if inner.closed {
            return Err(StorageError::Closed);
        }
        let after = checkpoint.unwrap_or_default();
        let mut documents: Vec<_> = inner
            .documents
            .values()
            .filter(|stored| stored.sequence > after.sequence)
            .cloned()
            .collect();
        documents.sort_by_key(|stored| stored.sequence);
        documents.truncate(limit);

        let checkpoint = documents
            .last()
            .map(|stored| StorageCheckpoint::new(stored.sequence))
            .unwrap_or(after);
        Ok(ChangedDocuments {
            documents,
            checkpoint,
        })
    }
}

impl<T: Document> StorageInstance<T> for MemoryStorage<T> {
    fn bulk_write<'a>(
        &'a self,
        rows: Vec<BulkWriteRow<T>>,
        context: &'a str,
    ) -> StorageFuture<'a, BulkWriteResponse<T>> {
        Box::pin(async move { self.write_rows(rows, context) })
    }

    fn find_documents_by_id(
        &self,
        ids: Vec<String>,
        include_deleted: bool,
    ) -> StorageFuture<'_, HashMap<String, StoredDocument<T>>> {
        Box::pin(async move { self.find_by_id(&ids, include_deleted) })
    }

    fn changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<StorageCheckpoint>,
    ) -> StorageFuture<'_, ChangedDocuments<T>> {
        Box::pin(async move { self.changed_since(limit, checkpoint) })
    }

    fn change_stream(&self) -> broadcast::Receiver<EventBulk<T>> {
        self.changes.subscribe()
    }
}

impl<T> std::fmt::Debug for MemoryStorage<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStorage")
            .field("name", &self.name)
            .field("documents", &self.inner.read().documents.len())
            .finish()
    }
}

/// Hashes a serializable value into a short hex digest.
pub fn content_hash<V: Serialize>(value: &V) -> StorageResult<String> {
    let bytes = serde_json::to_vec(value)?;
    let digest = Sha256::digest(&bytes);
    Ok(digest[..16].iter().map(|b| format!("{b:02x}")).collect())
}
