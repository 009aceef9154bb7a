//! Messages exchanged between the fork and the master.

use crate::document::WithDeleted;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

/// An opaque, direction-specific cursor supplied by the master side.
///
/// The protocol never inspects checkpoints. It stores them in the meta
/// store (as JSON) and hands them back to the master to resume pulls.
pub trait Checkpoint: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<C> Checkpoint for C where C: Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{}

/// A row sent upstream to the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationWriteRow<T> {
    /// What the fork believes the master currently holds.
    ///
    /// `None` on the first-ever push of a document id.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assumed_master_state: Option<WithDeleted<T>>,
    /// The fork state that should become the master state.
    pub new_document_state: WithDeleted<T>,
}

impl<T> ReplicationWriteRow<T> {
    /// Creates a write row.
    pub fn new(
        assumed_master_state: Option<WithDeleted<T>>,
        new_document_state: WithDeleted<T>,
    ) -> Self {
        Self {
            assumed_master_state,
            new_document_state,
        }
    }

    /// Creates a write row for a document the master has never seen.
    pub fn insert(new_document_state: WithDeleted<T>) -> Self {
        Self::new(None, new_document_state)
    }
}

/// A batch of master documents plus the checkpoint that follows them.
///
/// Returned by a master pull and emitted by the master's live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentsWithCheckpoint<T, C> {
    /// Document states in master order.
    pub documents: Vec<WithDeleted<T>>,
    /// Resuming from this checkpoint must not return `documents` again.
    pub checkpoint: C,
}

impl<T, C> DocumentsWithCheckpoint<T, C> {
    /// Creates a batch.
    pub fn new(documents: Vec<WithDeleted<T>>, checkpoint: C) -> Self {
        Self {
            documents,
            checkpoint,
        }
    }

    /// Returns the number of documents in the batch.
    pub fn len(&self) -> usize {
        self.documents.len()
    }

    /// Returns true if the batch carries no documents.
    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

/// An item of the master's live change stream.
#[derive(Debug, Clone, PartialEq)]
pub enum PullStreamItem<T, C> {
    /// Documents that changed on the master.
    Changes(DocumentsWithCheckpoint<T, C>),
    /// The stream may have missed events (for example after a reconnect);
    /// the fork has to re-pull from its last persisted checkpoint.
    Resync,
}

impl<T, C> PullStreamItem<T, C> {
    /// Returns true for the `RESYNC` sentinel.
    pub fn is_resync(&self) -> bool {
        matches!(self, PullStreamItem::Resync)
    }
}

impl<T, C> From<DocumentsWithCheckpoint<T, C>> for PullStreamItem<T, C> {
    fn from(batch: DocumentsWithCheckpoint<T, C>) -> Self {
        PullStreamItem::Changes(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
    }

    #[test]
    fn first_push_omits_assumed_state() {
        let row = ReplicationWriteRow::insert(WithDeleted::new(Item { id: "x".into() }));
        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("assumed_master_state").is_none());
        assert_eq!(json["new_document_state"]["id"], "x");

        let back: ReplicationWriteRow<Item> = serde_json::from_value(json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn documents_with_checkpoint_len() {
        let batch: DocumentsWithCheckpoint<Item, u64> = DocumentsWithCheckpoint::new(
            vec![WithDeleted::new(Item { id: "a".into() })],
            4,
        );
        assert_eq!(batch.len(), 1);
        assert!(!batch.is_empty());

        let item: PullStreamItem<Item, u64> = batch.into();
        assert!(!item.is_resync());
        assert!(PullStreamItem::<Item, u64>::Resync.is_resync());
    }
}
