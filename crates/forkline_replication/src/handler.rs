//! The master side contract and a storage-backed implementation.

use crate::error::{BoxFuture, ReplicationError, ReplicationResult};
use forkline_protocol::{
    ConflictHandler, Document, DocumentsWithCheckpoint, PullStreamItem, ReplicationWriteRow,
    WithDeleted,
};
use forkline_storage::{BulkWriteRow, StorageCheckpoint, StorageInstance, WriteErrorKind};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Capacity of the live stream of [`StorageReplicationHandler`].
const MASTER_STREAM_CAPACITY: usize = 1024;

/// Adapter to the master, implemented once per backend.
///
/// # Contract
///
/// - `master_changes_since` returns at most `batch_size` documents; pulling
///   again from the returned checkpoint never returns them again and never
///   skips unseen ones
/// - `master_write` applies every row whose `assumed_master_state` matches
///   the master state and returns the real master state of every other
///   row; an empty result means everything was written
/// - `master_change_stream` delivers live batches, or [`PullStreamItem::Resync`]
///   whenever events may have been missed
///
/// Transport failures are reported as [`ReplicationError::Transport`].
pub trait ReplicationHandler<T, C>: Send + Sync {
    /// Subscribes to live master changes.
    fn master_change_stream(&self) -> broadcast::Receiver<PullStreamItem<T, C>>;

    /// Pulls master documents changed after `checkpoint`.
    fn master_changes_since(
        &self,
        checkpoint: Option<C>,
        batch_size: usize,
    ) -> BoxFuture<'_, DocumentsWithCheckpoint<T, C>>;

    /// Writes rows to the master and returns the conflicting master states.
    fn master_write(&self, rows: Vec<ReplicationWriteRow<T>>) -> BoxFuture<'_, Vec<WithDeleted<T>>>;
}

/// Exposes a [`StorageInstance`] as the master of a replication.
///
/// Useful to replicate two storage instances in the same process and as
/// the reference master in tests. The master detects conflicts by
/// comparing each row's assumed state with its stored state through the
/// conflict handler's equality.
pub struct StorageReplicationHandler<T: Document> {
    master: Arc<dyn StorageInstance<T>>,
    conflict_handler: Arc<dyn ConflictHandler<T>>,
    stream: broadcast::Sender<PullStreamItem<T, StorageCheckpoint>>,
    forwarder: JoinHandle<()>,
}

impl<T: Document> StorageReplicationHandler<T> {
    /// Wraps `master`; must be called inside a tokio runtime.
    pub fn new(
        master: Arc<dyn StorageInstance<T>>,
        conflict_handler: Arc<dyn ConflictHandler<T>>,
    ) -> Self {
        let (stream, _) = broadcast::channel(MASTER_STREAM_CAPACITY);
        let mut changes = master.change_stream();
        let sender = stream.clone();
        let forwarder = tokio::spawn(async move {
            loop {
                let item = match changes.recv().await {
                    Ok(bulk) => PullStreamItem::Changes(DocumentsWithCheckpoint::new(
                        bulk.events.into_iter().map(|e| e.document.data).collect(),
                        bulk.checkpoint,
                    )),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "master change stream lagged, requesting resync");
                        PullStreamItem::Resync
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let _ = sender.send(item);
            }
        });
        Self {
            master,
            conflict_handler,
            stream,
            forwarder,
        }
    }

    /// Emits [`PullStreamItem::Resync`], as a transport does after reconnecting.
    pub fn resync(&self) {
        let _ = self.stream.send(PullStreamItem::Resync);
    }

    /// Returns the wrapped master storage.
    pub fn master(&self) -> &Arc<dyn StorageInstance<T>> {
        &self.master
    }

    async fn write_rows(
        &self,
        rows: Vec<ReplicationWriteRow<T>>,
    ) -> ReplicationResult<Vec<WithDeleted<T>>> {
        let ids = rows
            .iter()
            .map(|row| row.new_document_state.id().to_string())
            .collect();
        let current = self.master.find_documents_by_id(ids, true).await?;

        let mut conflicts = Vec::new();
        let mut writes = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.new_document_state.id();
            match (current.get(id), &row.assumed_master_state) {
                (None, _) => writes.push(BulkWriteRow::insert(row.new_document_state)),
                (Some(real), Some(assumed))
                    if self
                        .conflict_handler
                        .is_equal(&real.data, assumed, "master-write-assumed-state") =>
                {
                    writes.push(BulkWriteRow::update(real.clone(), row.new_document_state));
                }
                (Some(real), _) => conflicts.push(real.data.clone()),
            }
        }

        if writes.is_empty() {
            return Ok(conflicts);
        }
        let response = self.master.bulk_write(writes, "replication-master-write").await?;
        for (id, error) in response.error {
            match error.kind {
                WriteErrorKind::Conflict => match error.document_in_db {
                    Some(real) => conflicts.push(real.data),
                    None => {
                        return Err(ReplicationError::transport_retryable(format!(
                            "master lost document {id:?} during write"
                        )))
                    }
                },
                WriteErrorKind::Rejected(reason) => {
                    return Err(ReplicationError::transport_fatal(format!(
                        "master rejected document {id:?}: {reason}"
                    )))
                }
            }
        }
        debug!(
            written = response.success.len(),
            conflicts = conflicts.len(),
            "master write"
        );
        Ok(conflicts)
    }
}

impl<T: Document> ReplicationHandler<T, StorageCheckpoint> for StorageReplicationHandler<T> {
    fn master_change_stream(&self) -> broadcast::Receiver<PullStreamItem<T, StorageCheckpoint>> {
        self.stream.subscribe()
    }

    fn master_changes_since(
        &self,
        checkpoint: Option<StorageCheckpoint>,
        batch_size: usize,
    ) -> BoxFuture<'_, DocumentsWithCheckpoint<T, StorageCheckpoint>> {
        Box::pin(async move {
            let changed = self
                .master
                .changed_documents_since(batch_size, checkpoint)
                .await?;
            Ok(DocumentsWithCheckpoint::new(
                changed.documents.into_iter().map(|stored| stored.data).collect(),
                changed.checkpoint,
            ))
        })
    }

    fn master_write(
        &self,
        rows: Vec<ReplicationWriteRow<T>>,
    ) -> BoxFuture<'_, Vec<WithDeleted<T>>> {
        Box::pin(self.write_rows(rows))
    }
}

impl<T: Document> Drop for StorageReplicationHandler<T> {
    fn drop(&mut self) {
        self.forwarder.abort();
    }
}

impl<T: Document> std::fmt::Debug for StorageReplicationHandler<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageReplicationHandler")
            .field("subscribers", &self.stream.receiver_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkline_protocol::ConflictPolicy;
    use forkline_storage::MemoryStorage;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        color: String,
    }

    impl Document for Item {
        fn primary_key(&self) -> &str {
            &self.id
        }
    }

    fn item(id: &str, color: &str) -> WithDeleted<Item> {
        WithDeleted::new(Item {
            id: id.into(),
            color: color.into(),
        })
    }

    fn handler() -> (Arc<MemoryStorage<Item>>, StorageReplicationHandler<Item>) {
        let master = Arc::new(MemoryStorage::new("master"));
        let handler =
            StorageReplicationHandler::new(master.clone(), Arc::new(ConflictPolicy::MasterWins));
        (master, handler)
    }

    #[tokio::test]
    async fn first_write_inserts() {
        let (master, handler) = handler();
        let conflicts = handler
            .master_write(vec![ReplicationWriteRow::insert(item("x", "blue"))])
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(master.get("x").unwrap().data, item("x", "blue"));
    }

    #[tokio::test]
    async fn stale_assumed_state_conflicts() {
        let (master, handler) = handler();
        handler
            .master_write(vec![ReplicationWriteRow::insert(item("x", "green"))])
            .await
            .unwrap();

        let conflicts = handler
            .master_write(vec![ReplicationWriteRow::new(
                Some(item("x", "red")),
                item("x", "blue"),
            )])
            .await
            .unwrap();
        assert_eq!(conflicts, vec![item("x", "green")]);
        assert_eq!(master.get("x").unwrap().data, item("x", "green"));

        // No assumed state on an existing document is a conflict too
        let conflicts = handler
            .master_write(vec![ReplicationWriteRow::insert(item("x", "blue"))])
            .await
            .unwrap();
        assert_eq!(conflicts.len(), 1);
    }

    #[tokio::test]
    async fn matching_assumed_state_updates() {
        let (master, handler) = handler();
        handler
            .master_write(vec![ReplicationWriteRow::insert(item("x", "red"))])
            .await
            .unwrap();
        let conflicts = handler
            .master_write(vec![ReplicationWriteRow::new(
                Some(item("x", "red")),
                item("x", "blue"),
            )])
            .await
            .unwrap();
        assert!(conflicts.is_empty());
        assert_eq!(master.get("x").unwrap().data, item("x", "blue"));
    }

    #[tokio::test]
    async fn pull_pages_through_master() {
        let (master, handler) = handler();
        let rows = (0..5)
            .map(|i| BulkWriteRow::insert(item(&format!("d{i}"), "red")))
            .collect();
        master.bulk_write(rows, "seed").await.unwrap();

        let first = handler.master_changes_since(None, 3).await.unwrap();
        assert_eq!(first.len(), 3);
        let second = handler
            .master_changes_since(Some(first.checkpoint), 3)
            .await
            .unwrap();
        assert_eq!(second.len(), 2);
        let third = handler
            .master_changes_since(Some(second.checkpoint), 3)
            .await
            .unwrap();
        assert!(third.is_empty());
        assert_eq!(third.checkpoint, second.checkpoint);
    }

    #[tokio::test]
    async fn live_stream_forwards_writes_and_resync() {
        let (master, handler) = handler();
        let mut stream = handler.master_change_stream();

        master
            .bulk_write(vec![BulkWriteRow::insert(item("x", "red"))], "elsewhere")
            .await
            .unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        match next {
            PullStreamItem::Changes(batch) => {
                assert_eq!(batch.documents, vec![item("x", "red")]);
                assert_eq!(batch.checkpoint, StorageCheckpoint::new(1));
            }
            PullStreamItem::Resync => panic!("expected changes"),
        }

        handler.resync();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(next.is_resync());
    }
}
