//! # Forkline Replication
//!
//! Fork/master replication engine for forkline.
//!
//! This crate provides:
//! - [`ReplicationState`], a running replication between a local fork and a
//!   master reached through a [`ReplicationHandler`]
//! - Downstream pulls (checkpoint iteration plus live change stream)
//! - Upstream pushes with three-way conflict detection
//! - Conflict resolution through a pluggable
//!   [`forkline_protocol::ConflictHandler`]
//! - Checkpoints and assumed master states persisted in a meta store
//! - Retry with exponential backoff for transient transport errors
//!
//! ## Architecture
//!
//! Every replication keeps three stores apart:
//!
//! 1. The **fork** holds the documents the application reads and writes
//! 2. The **meta** store holds the last state the fork assumes the master
//!    holds, plus one checkpoint per direction
//! 3. The **master** is only reached through the handler
//!
//! Both directions run as independent tokio tasks and each processes its
//! batches strictly one after another on its own queue. Writes a direction
//! performs on the fork are tagged with a context string so that the other
//! direction can recognise its own echoes and never ping-pong a document.
//!
//! ## Key Invariants
//!
//! - A checkpoint is persisted only after its batch and meta rows were written
//! - Conflicts are resolved on the fork, never on the master
//! - Master writes are idempotent: repeating a push with an unchanged
//!   assumed state is a no-op
//! - Two live replications never share an identifier within one
//!   [`ReplicationRegistry`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use forkline_protocol::ConflictPolicy;
//! use forkline_replication::{
//!     ReplicationConfig, ReplicationInput, ReplicationState, StorageReplicationHandler,
//! };
//! use forkline_storage::MemoryStorage;
//! use std::sync::Arc;
//!
//! let master = Arc::new(MemoryStorage::new("master"));
//! let handler = StorageReplicationHandler::new(master, Arc::new(ConflictPolicy::MasterWins));
//! let input = ReplicationInput::new(
//!     ReplicationConfig::new("todos"),
//!     Arc::new(MemoryStorage::new("fork")),
//!     Arc::new(MemoryStorage::new("meta")),
//!     Arc::new(handler),
//!     Arc::new(ConflictPolicy::MasterWins),
//! );
//! let state = ReplicationState::start(input).await?;
//! state.await_in_sync().await?;
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backlog;
mod checkpoint;
mod config;
mod conflicts;
mod context;
mod downstream;
mod error;
mod handler;
mod meta;
mod observable;
mod queue;
mod registry;
mod state;
mod stats;
mod upstream;

pub use checkpoint::CheckpointManager;
pub use config::{
    InitialCheckpoint, ReplicationConfig, ReplicationInput, RetryConfig, WaitBeforePersist,
    DEFAULT_BATCH_SIZE,
};
pub use context::ReplicationEvents;
pub use error::{BoxFuture, ReplicationError, ReplicationResult};
pub use handler::{ReplicationHandler, StorageReplicationHandler};
pub use meta::{
    downstream_write_context, DOWN_META_CONTEXT, UP_CONFLICT_META_CONTEXT, UP_META_CONTEXT,
};
pub use observable::ObservableValue;
pub use registry::ReplicationRegistry;
pub use state::ReplicationState;
pub use stats::{DownstreamStats, ReplicationStats, UpstreamStats};
pub use upstream::UP_CONFLICT_CONTEXT;

