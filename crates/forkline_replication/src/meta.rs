//! Reads and writes of assumed master states in the meta store.

use crate::error::{ReplicationError, ReplicationResult};
use forkline_protocol::{meta_row_id, Document, ReplicationMetaRow, Revision, WithDeleted};
use forkline_storage::{BulkWriteRow, StorageError, StorageInstance, StoredDocument, WriteErrorKind};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tracing::debug;

/// How often a meta write is rebased onto a concurrently written row.
const MAX_META_WRITE_ATTEMPTS: usize = 5;

/// Context of upstream meta writes.
pub const UP_META_CONTEXT: &str = "replication-up-write-meta";
/// Context of meta writes after conflict resolution.
pub const UP_CONFLICT_META_CONTEXT: &str = "replication-up-write-conflict-meta";
/// Context of downstream meta writes.
pub const DOWN_META_CONTEXT: &str = "replication-down-write-meta";

/// Returns the context string that tags downstream writes to the fork.
///
/// The upstream skips fork changes carrying it, so pulled documents are
/// never pushed back to the master.
pub fn downstream_write_context(identifier: &str) -> String {
    let digest = Sha256::digest(identifier.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    format!("replication-downstream-{hex}")
}

/// The assumed master state of one document.
#[derive(Debug, Clone)]
pub(crate) struct AssumedMasterState<T> {
    /// Document state the fork believes the master holds.
    pub doc_data: WithDeleted<T>,
    /// The stored meta row, used as `previous` of the next meta write.
    pub meta_document: StoredDocument<ReplicationMetaRow<T>>,
}

impl<T> AssumedMasterState<T> {
    /// Fork revision of a conflict resolution that was not pushed yet.
    pub fn resolved_conflict(&self) -> Option<&Revision> {
        self.meta_document.data.doc.is_resolved_conflict.as_ref()
    }
}

/// Loads the assumed master states of `doc_ids`, keyed by document id.
///
/// Documents without a meta row are missing from the result.
pub(crate) async fn get_assumed_master_state<T: Document>(
    meta: &dyn StorageInstance<ReplicationMetaRow<T>>,
    identifier: &str,
    doc_ids: &[String],
) -> ReplicationResult<HashMap<String, AssumedMasterState<T>>> {
    let row_ids = doc_ids
        .iter()
        .map(|id| meta_row_id(identifier, id, false))
        .collect();
    let found = meta.find_documents_by_id(row_ids, true).await?;

    let mut states = HashMap::with_capacity(found.len());
    for (_, stored) in found {
        let row = &stored.data.doc;
        let doc_data = row.doc_data.clone().ok_or_else(|| {
            StorageError::Corrupted(format!("meta row {} has no document data", row.id))
        })?;
        states.insert(
            row.item_id.clone(),
            AssumedMasterState {
                doc_data,
                meta_document: stored,
            },
        );
    }
    Ok(states)
}

/// Builds the meta write that records `new_master_state` as the assumed
/// master state of its document.
pub(crate) fn meta_write_row<T: Document>(
    identifier: &str,
    new_master_state: WithDeleted<T>,
    previous: Option<&AssumedMasterState<T>>,
    is_resolved_conflict: Option<Revision>,
) -> BulkWriteRow<ReplicationMetaRow<T>> {
    BulkWriteRow {
        previous: previous.map(|state| state.meta_document.clone()),
        document: WithDeleted::new(ReplicationMetaRow::document(
            identifier,
            new_master_state,
            is_resolved_conflict,
        )),
    }
}

/// What [`write_meta_rows`] does with a row whose stored version changed
/// since it was read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnMetaConflict {
    /// Write the row over the newer version.
    Rebase,
    /// Keep the newer version and drop the row.
    KeepStored,
}

/// Writes meta rows and returns the ids of the rows that were dropped.
///
/// Both directions update the same rows. The downstream rebases, as its
/// states come from the master stream in master order. The upstream keeps
/// a row the downstream wrote in between, as the downstream recorded a
/// master state at least as recent as the pushed one.
pub(crate) async fn write_meta_rows<T: Document>(
    meta: &dyn StorageInstance<ReplicationMetaRow<T>>,
    mut rows: Vec<BulkWriteRow<ReplicationMetaRow<T>>>,
    context: &str,
    on_conflict: OnMetaConflict,
) -> ReplicationResult<Vec<String>> {
    let mut dropped = Vec::new();
    for _ in 0..MAX_META_WRITE_ATTEMPTS {
        if rows.is_empty() {
            return Ok(dropped);
        }
        let response = meta.bulk_write(rows, context).await?;
        rows = Vec::new();
        for (id, error) in response.error {
            match (error.kind, on_conflict) {
                (WriteErrorKind::Conflict, OnMetaConflict::Rebase) => {
                    debug!(meta_id = %id, "rebasing meta row");
                    let mut row = error.write_row;
                    row.previous = error.document_in_db;
                    rows.push(row);
                }
                (WriteErrorKind::Conflict, OnMetaConflict::KeepStored) => {
                    debug!(meta_id = %id, "meta row changed concurrently, keeping it");
                    dropped.push(id);
                }
                (WriteErrorKind::Rejected(reason), _) => {
                    return Err(StorageError::Backend(format!(
                        "meta row {id} rejected: {reason}"
                    ))
                    .into())
                }
            }
        }
    }
    if rows.is_empty() {
        Ok(dropped)
    } else {
        Err(ReplicationError::Storage(StorageError::Backend(format!(
            "{} meta rows kept conflicting",
            rows.len()
        ))))
    }
}
