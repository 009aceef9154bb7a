//! Per-direction checkpoint persistence.

use crate::error::ReplicationResult;
use forkline_protocol::{
    meta_row_id, Document, ReplicationDirection, ReplicationMetaRow, WithDeleted,
};
use forkline_storage::{BulkWriteRow, StorageError, StorageInstance, StoredDocument, WriteErrorKind};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, trace};

const CHECKPOINT_CONTEXT: &str = "replication-set-checkpoint";
const MAX_CHECKPOINT_WRITE_ATTEMPTS: usize = 5;

/// Persists the last processed checkpoint of each direction.
///
/// All reads and writes go through one fair lock, so checkpoint writes are
/// applied in the order they were requested and never overtake each other.
/// The last known checkpoint row per direction is cached to avoid a read
/// before every write.
pub struct CheckpointManager<T: Document> {
    identifier: String,
    meta: Arc<dyn StorageInstance<ReplicationMetaRow<T>>>,
    last_rows: Mutex<HashMap<ReplicationDirection, StoredDocument<ReplicationMetaRow<T>>>>,
}

impl<T: Document> CheckpointManager<T> {
    /// Creates a manager for the checkpoint rows of `identifier`.
    pub fn new(
        identifier: impl Into<String>,
        meta: Arc<dyn StorageInstance<ReplicationMetaRow<T>>>,
    ) -> Self {
        Self {
            identifier: identifier.into(),
            meta,
            last_rows: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the persisted checkpoint of `direction`, if any.
    pub async fn get(
        &self,
        direction: ReplicationDirection,
    ) -> ReplicationResult<Option<serde_json::Value>> {
        let mut last_rows = self.last_rows.lock().await;
        let row = self.load(&mut last_rows, direction).await?;
        Ok(row.and_then(|stored| stored.data.doc.checkpoint_data))
    }

    /// Returns the persisted checkpoint of `direction` as `C`.
    pub async fn get_typed<C: DeserializeOwned>(
        &self,
        direction: ReplicationDirection,
    ) -> ReplicationResult<Option<C>> {
        match self.get(direction).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Persists `checkpoint` for `direction`.
    ///
    /// Writing the checkpoint that is already stored is a no-op.
    pub async fn set(
        &self,
        direction: ReplicationDirection,
        checkpoint: serde_json::Value,
    ) -> ReplicationResult<()> {
        let mut last_rows = self.last_rows.lock().await;
        let mut previous = self.load(&mut last_rows, direction).await?;
        if previous
            .as_ref()
            .and_then(|stored| stored.data.doc.checkpoint_data.as_ref())
            == Some(&checkpoint)
        {
            trace!(%direction, "checkpoint unchanged");
            return Ok(());
        }

        let document = WithDeleted::new(ReplicationMetaRow::checkpoint(
            &self.identifier,
            direction,
            checkpoint,
        ));
        for _ in 0..MAX_CHECKPOINT_WRITE_ATTEMPTS {
            let row = BulkWriteRow {
                previous: previous.clone(),
                document: document.clone(),
            };
            let mut response = self.meta.bulk_write(vec![row], CHECKPOINT_CONTEXT).await?;
            let id = document.doc.id.as_str();
            if let Some(stored) = response.success.remove(id) {
                debug!(identifier = %self.identifier, %direction, "checkpoint persisted");
                last_rows.insert(direction, stored);
                return Ok(());
            }
            match response.error.remove(id) {
                Some(error) if error.kind == WriteErrorKind::Conflict => {
                    // another state of this replication wrote the row
                    previous = error.document_in_db;
                }
                Some(error) => {
                    return Err(StorageError::Backend(format!(
                        "checkpoint write rejected: {:?}",
                        error.kind
                    ))
                    .into())
                }
                None => {
                    return Err(StorageError::Corrupted(
                        "checkpoint write returned no result".into(),
                    )
                    .into())
                }
            }
        }
        Err(StorageError::Backend("checkpoint row kept conflicting".into()).into())
    }

    /// Persists a typed checkpoint for `direction`.
    pub async fn set_typed<C: Serialize>(
        &self,
        direction: ReplicationDirection,
        checkpoint: &C,
    ) -> ReplicationResult<()> {
        self.set(direction, serde_json::to_value(checkpoint)?).await
    }

    /// Writes `checkpoint` only if `direction` has no checkpoint yet.
    pub async fn set_initial(
        &self,
        direction: ReplicationDirection,
        checkpoint: serde_json::Value,
    ) -> ReplicationResult<bool> {
        if self.get(direction).await?.is_some() {
            return Ok(false);
        }
        self.set(direction, checkpoint).await?;
        Ok(true)
    }

    /// Waits until every checkpoint operation requested so far completed.
    pub async fn flush(&self) {
        drop(self.last_rows.lock().await);
    }

    async fn load(
        &self,
        last_rows: &mut HashMap<ReplicationDirection, StoredDocument<ReplicationMetaRow<T>>>,
        direction: ReplicationDirection,
    ) -> ReplicationResult<Option<StoredDocument<ReplicationMetaRow<T>>>> {
        if let Some(stored) = last_rows.get(&direction) {
            return Ok(Some(stored.clone()));
        }
        let id = meta_row_id(&self.identifier, direction.as_str(), true);
        let mut found = self.meta.find_documents_by_id(vec![id.clone()], false).await?;
        let stored = found.remove(&id);
        if let Some(stored) = &stored {
            last_rows.insert(direction, stored.clone());
        }
        Ok(stored)
    }
}

impl<T: Document> std::fmt::Debug for CheckpointManager<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkline_storage::{MemoryStorage, StorageCheckpoint};
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
    }

    impl Document for Item {
        fn primary_key(&self) -> &str {
            &self.id
        }
    }

    fn meta() -> Arc<MemoryStorage<ReplicationMetaRow<Item>>> {
        Arc::new(MemoryStorage::new("meta"))
    }

    fn manager(storage: &Arc<MemoryStorage<ReplicationMetaRow<Item>>>) -> CheckpointManager<Item> {
        CheckpointManager::new("repl", storage.clone())
    }

    #[tokio::test]
    async fn missing_checkpoint_is_none() {
        let manager = manager(&meta());
        assert!(manager.get(ReplicationDirection::Down).await.unwrap().is_none());
        let typed: Option<StorageCheckpoint> =
            manager.get_typed(ReplicationDirection::Up).await.unwrap();
        assert!(typed.is_none());
    }

    #[tokio::test]
    async fn directions_are_independent() {
        let storage = meta();
        let manager = manager(&storage);
        manager
            .set_typed(ReplicationDirection::Down, &StorageCheckpoint::new(4))
            .await
            .unwrap();
        manager
            .set_typed(ReplicationDirection::Up, &StorageCheckpoint::new(9))
            .await
            .unwrap();

        let down: Option<StorageCheckpoint> =
            manager.get_typed(ReplicationDirection::Down).await.unwrap();
        let up: Option<StorageCheckpoint> =
            manager.get_typed(ReplicationDirection::Up).await.unwrap();
        assert_eq!(down, Some(StorageCheckpoint::new(4)));
        assert_eq!(up, Some(StorageCheckpoint::new(9)));
        assert_eq!(storage.len(), 2);
    }

    #[tokio::test]
    async fn overwrites_in_place_and_skips_unchanged() {
        let storage = meta();
        let manager = manager(&storage);
        for sequence in [1, 2, 2, 3] {
            manager
                .set_typed(ReplicationDirection::Down, &StorageCheckpoint::new(sequence))
                .await
                .unwrap();
        }
        assert_eq!(storage.len(), 1);
        let row = storage.all_documents().remove(0);
        // three distinct checkpoints, three revisions
        assert_eq!(row.revision.height, 3);
    }

    #[tokio::test]
    async fn survives_restart() {
        let storage = meta();
        manager(&storage)
            .set_typed(ReplicationDirection::Down, &StorageCheckpoint::new(7))
            .await
            .unwrap();

        let restarted = manager(&storage);
        let down: Option<StorageCheckpoint> =
            restarted.get_typed(ReplicationDirection::Down).await.unwrap();
        assert_eq!(down, Some(StorageCheckpoint::new(7)));

        // A stale cache in another manager is rebased on conflict
        let stale = manager(&storage);
        let _: Option<StorageCheckpoint> =
            stale.get_typed(ReplicationDirection::Down).await.unwrap();
        restarted
            .set_typed(ReplicationDirection::Down, &StorageCheckpoint::new(8))
            .await
            .unwrap();
        stale
            .set_typed(ReplicationDirection::Down, &StorageCheckpoint::new(9))
            .await
            .unwrap();
        let down: Option<StorageCheckpoint> = manager(&storage)
            .get_typed(ReplicationDirection::Down)
            .await
            .unwrap();
        assert_eq!(down, Some(StorageCheckpoint::new(9)));
    }

    #[tokio::test]
    async fn initial_checkpoint_only_written_once() {
        let manager = manager(&meta());
        assert!(manager
            .set_initial(ReplicationDirection::Up, serde_json::json!({"sequence": 2}))
            .await
            .unwrap());
        assert!(!manager
            .set_initial(ReplicationDirection::Up, serde_json::json!({"sequence": 5}))
            .await
            .unwrap());
        assert_eq!(
            manager.get(ReplicationDirection::Up).await.unwrap(),
            Some(serde_json::json!({"sequence": 2}))
        );
    }
}
