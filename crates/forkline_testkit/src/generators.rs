//! Property-based test generators using proptest.
//!
//! Write sequences touch a small id space so that fork and master writes
//! collide often.

use crate::fixtures::{doc, ReplicationHarness, TestDoc};
use forkline_protocol::WithDeleted;
use proptest::prelude::*;

/// Side of a replication a write is applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The local fork.
    Fork,
    /// The master.
    Master,
}

/// A single application write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Inserts or replaces a document.
    Put {
        /// Where to write.
        side: Side,
        /// Document id.
        id: String,
        /// New payload.
        color: String,
    },
    /// Replaces a document with a tombstone.
    Delete {
        /// Where to write.
        side: Side,
        /// Document id.
        id: String,
    },
}

impl ReplicationHarness {
    /// Applies a generated write.
    pub async fn apply(&self, op: &WriteOp) {
        let (side, state) = match op {
            WriteOp::Put { side, id, color } => (*side, doc(id, color)),
            WriteOp::Delete { side, id } => {
                let current = match side {
                    Side::Fork => self.fork_state(id),
                    Side::Master => self.master_state(id),
                };
                let state = current
                    .map(WithDeleted::into_tombstone)
                    .unwrap_or_else(|| doc(id, "gone").into_tombstone());
                (*side, state)
            }
        };
        match side {
            Side::Fork => self.write_fork(state).await,
            Side::Master => self.write_master(state).await,
        };
    }
}

/// Strategy for a write side.
pub fn side_strategy() -> impl Strategy<Value = Side> {
    prop_oneof![Just(Side::Fork), Just(Side::Master)]
}

/// Strategy for document ids from a small id space.
pub fn doc_id_strategy() -> impl Strategy<Value = String> {
    (0u8..4).prop_map(|n| format!("doc-{n}"))
}

/// Strategy for document payloads.
pub fn color_strategy() -> impl Strategy<Value = String> {
    prop::sample::select(vec!["red", "green", "blue", "yellow"]).prop_map(String::from)
}

/// Strategy for live test documents.
pub fn test_doc_strategy() -> impl Strategy<Value = WithDeleted<TestDoc>> {
    (doc_id_strategy(), color_strategy()).prop_map(|(id, color)| doc(&id, &color))
}

/// Strategy for a single write, deletes being rarer than puts.
pub fn write_op_strategy() -> impl Strategy<Value = WriteOp> {
    prop_oneof![
        4 => (side_strategy(), doc_id_strategy(), color_strategy())
            .prop_map(|(side, id, color)| WriteOp::Put { side, id, color }),
        1 => (side_strategy(), doc_id_strategy())
            .prop_map(|(side, id)| WriteOp::Delete { side, id }),
    ]
}

/// Strategy for a non-empty sequence of up to `max_len` writes.
pub fn write_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<WriteOp>> {
    prop::collection::vec(write_op_strategy(), 1..=max_len.max(1))
}
