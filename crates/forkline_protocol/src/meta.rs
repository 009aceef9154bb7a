//! Rows of the replication meta store.

use crate::document::{Document, Revision, WithDeleted};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a replication stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationDirection {
    /// Fork to master.
    Up,
    /// Master to fork.
    Down,
}

impl ReplicationDirection {
    /// Both directions, upstream first.
    pub const ALL: [ReplicationDirection; 2] = [ReplicationDirection::Up, ReplicationDirection::Down];

    /// Returns the lowercase name used in meta row ids and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            ReplicationDirection::Up => "up",
            ReplicationDirection::Down => "down",
        }
    }
}

impl fmt::Display for ReplicationDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Builds the composite primary key `[identifier, itemId, isCheckpoint]`.
///
/// The key is rendered as a JSON array so that identifiers or document ids
/// containing separator characters can never collide.
pub fn meta_row_id(identifier: &str, item_id: &str, is_checkpoint: bool) -> String {
    let flag = if is_checkpoint { "1" } else { "0" };
    serde_json::Value::from(vec![identifier, item_id, flag]).to_string()
}

/// A row of the replication meta store.
///
/// Document rows (`is_checkpoint == false`) hold the last document state the
/// protocol assumes the master holds. Checkpoint rows hold the last persisted
/// checkpoint of one direction. The same meta store can serve several
/// replications because every id is scoped by the replication identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMetaRow<T> {
    /// Composite primary key, see [`meta_row_id`].
    pub id: String,
    /// Replication identifier.
    pub identifier: String,
    /// Document primary key or checkpoint direction.
    pub item_id: String,
    /// Discriminates checkpoint rows from document rows.
    pub is_checkpoint: bool,
    /// Checkpoint payload, only on checkpoint rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_data: Option<serde_json::Value>,
    /// Assumed master state, only on document rows.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_data: Option<WithDeleted<T>>,
    /// Fork revision of a conflict resolution that still has to be pushed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_resolved_conflict: Option<Revision>,
}

impl<T: Document> ReplicationMetaRow<T> {
    /// Creates an assumed-master-state row for a document.
    pub fn document(
        identifier: &str,
        doc_data: WithDeleted<T>,
        is_resolved_conflict: Option<Revision>,
    ) -> Self {
        let item_id = doc_data.id().to_string();
        Self {
            id: meta_row_id(identifier, &item_id, false),
            identifier: identifier.to_string(),
            item_id,
            is_checkpoint: false,
            checkpoint_data: None,
            doc_data: Some(doc_data),
            is_resolved_conflict,
        }
    }

    /// Creates a checkpoint row for one direction.
    pub fn checkpoint(
        identifier: &str,
        direction: ReplicationDirection,
        checkpoint_data: serde_json::Value,
    ) -> Self {
        let item_id = direction.as_str().to_string();
        Self {
            id: meta_row_id(identifier, &item_id, true),
            identifier: identifier.to_string(),
            item_id,
            is_checkpoint: true,
            checkpoint_data: Some(checkpoint_data),
            doc_data: None,
            is_resolved_conflict: None,
        }
    }
}

impl<T: Document> Document for ReplicationMetaRow<T> {
    fn primary_key(&self) -> &str {
        &self.id
    }
}
