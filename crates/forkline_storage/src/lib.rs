//! # Forkline Storage
//!
//! Storage instance contract and implementations for forkline.
//!
//! The replication protocol never talks to a storage engine directly; it
//! consumes the [`StorageInstance`] contract for both the fork and the
//! replication meta store. Indexing, query execution and on-disk formats are
//! the concern of the implementations.
//!
//! ## Design Principles
//!
//! - Writes are per-document compare-and-swap against a [`forkline_protocol::Revision`]
//! - Rejected rows are values in [`BulkWriteResponse`], never aborts
//! - Every write bulk is announced on a change stream tagged with the
//!   writer's context string
//! - Instances must be `Send + Sync` for concurrent access
//!
//! ## Available Instances
//!
//! - [`MemoryStorage`] - For testing, meta stores and in-process masters

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod instance;
mod memory;

pub use error::{StorageError, StorageResult};
pub use instance::{
    BulkWriteResponse, BulkWriteRow, ChangeEvent, ChangeOperation, ChangedDocuments, EventBulk,
    StorageCheckpoint, StorageFuture, StorageInstance, StoredDocument, WriteError, WriteErrorKind,
};
pub use memory::{content_hash, MemoryStorage, DEFAULT_CHANGE_CAPACITY};
