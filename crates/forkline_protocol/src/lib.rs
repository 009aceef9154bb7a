//! # Forkline Protocol
//!
//! Replication protocol types for forkline.
//!
//! This crate provides:
//! - [`Document`] and [`WithDeleted`] for tombstone-aware document states
//! - [`Revision`] tags assigned by storage instances
//! - [`ReplicationWriteRow`], [`DocumentsWithCheckpoint`] and [`PullStreamItem`]
//!   exchanged with the master
//! - [`ReplicationMetaRow`] persisted by the replication meta store
//! - The [`ConflictHandler`] contract and the built-in [`ConflictPolicy`]
//!
//! This is a pure protocol crate with no I/O operations. It does not define
//! a wire format; every type derives `serde` traits so that transport adapters
//! can pick their own encoding.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod document;
mod messages;
mod meta;

pub use conflict::{
    conflict_handler_fn, ConflictHandler, ConflictHandlerInput, ConflictPolicy,
    ConflictResolution, FnConflictHandler, ResolvedConflict,
};
pub use document::{Document, Revision, RevisionParseError, WithDeleted};
pub use messages::{Checkpoint, DocumentsWithCheckpoint, PullStreamItem, ReplicationWriteRow};
pub use meta::{meta_row_id, ReplicationDirection, ReplicationMetaRow};
