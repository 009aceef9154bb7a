//! State shared by both directions of a replication.

use crate::checkpoint::CheckpointManager;
use crate::config::ReplicationInput;
use crate::error::{ReplicationError, ReplicationResult};
use crate::meta::downstream_write_context;
use crate::observable::ObservableValue;
use crate::stats::StatsCounters;
use forkline_protocol::{Document, ReplicationDirection, ReplicationWriteRow, ResolvedConflict};
use forkline_storage::BulkWriteRow;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, warn};

const EVENT_CAPACITY: usize = 1024;

/// Streams and flags a replication exposes to the application.
pub struct ReplicationEvents<T> {
    pub(crate) processed_up: broadcast::Sender<ReplicationWriteRow<T>>,
    pub(crate) processed_down: broadcast::Sender<BulkWriteRow<T>>,
    pub(crate) resolved_conflicts: broadcast::Sender<ResolvedConflict<T>>,
    pub(crate) errors: broadcast::Sender<Arc<ReplicationError>>,
    /// Set once the replication was cancelled.
    pub canceled: ObservableValue<bool>,
    /// Set while the replication is paused.
    pub paused: ObservableValue<bool>,
    /// Set while the upstream processes a batch.
    pub active_up: ObservableValue<bool>,
    /// Set while the downstream processes a batch.
    pub active_down: ObservableValue<bool>,
    /// Set once the upstream finished its first pass.
    pub first_sync_done_up: ObservableValue<bool>,
    /// Set once the downstream finished its first pass.
    pub first_sync_done_down: ObservableValue<bool>,
}

impl<T: Clone> ReplicationEvents<T> {
    pub(crate) fn new() -> Self {
        Self {
            processed_up: broadcast::channel(EVENT_CAPACITY).0,
            processed_down: broadcast::channel(EVENT_CAPACITY).0,
            resolved_conflicts: broadcast::channel(EVENT_CAPACITY).0,
            errors: broadcast::channel(EVENT_CAPACITY).0,
            canceled: ObservableValue::new(false),
            paused: ObservableValue::new(false),
            active_up: ObservableValue::new(false),
            active_down: ObservableValue::new(false),
            first_sync_done_up: ObservableValue::new(false),
            first_sync_done_down: ObservableValue::new(false),
        }
    }

    /// Returns the active flag of `direction`.
    pub fn active(&self, direction: ReplicationDirection) -> &ObservableValue<bool> {
        match direction {
            ReplicationDirection::Up => &self.active_up,
            ReplicationDirection::Down => &self.active_down,
        }
    }

    /// Returns the first-sync-done flag of `direction`.
    pub fn first_sync_done(&self, direction: ReplicationDirection) -> &ObservableValue<bool> {
        match direction {
            ReplicationDirection::Up => &self.first_sync_done_up,
            ReplicationDirection::Down => &self.first_sync_done_down,
        }
    }
}

impl<T> std::fmt::Debug for ReplicationEvents<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationEvents")
            .field("canceled", &self.canceled.get())
            .field("paused", &self.paused.get())
            .finish_non_exhaustive()
    }
}

pub(crate) struct ReplicationContext<T: Document, C> {
    pub input: ReplicationInput<T, C>,
    pub downstream_context: String,
    pub events: ReplicationEvents<T>,
    pub stats: StatsCounters,
    pub checkpoints: CheckpointManager<T>,
}

impl<T: Document, C> ReplicationContext<T, C> {
    pub fn new(input: ReplicationInput<T, C>) -> Self {
        let identifier = input.config.identifier.clone();
        Self {
            downstream_context: downstream_write_context(&identifier),
            checkpoints: CheckpointManager::new(identifier, Arc::clone(&input.meta)),
            events: ReplicationEvents::new(),
            stats: StatsCounters::default(),
            input,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.input.config.identifier
    }

    pub fn is_canceled(&self) -> bool {
        self.events.canceled.get()
    }

    pub fn is_paused(&self) -> bool {
        self.events.paused.get()
    }

    /// Publishes an error; fatal errors stop the replication.
    pub fn emit_error(&self, direction: ReplicationDirection, err: ReplicationError) {
        StatsCounters::incr(&self.stats.errors);
        if err.is_fatal() {
            error!(identifier = %self.identifier(), %direction, error = %err, "fatal replication error");
        } else {
            warn!(identifier = %self.identifier(), %direction, error = %err, "replication error");
        }
        let fatal = err.is_fatal();
        let _ = self.events.errors.send(Arc::new(err));
        if fatal {
            self.events.canceled.set(true);
            self.events.active_up.set(false);
            self.events.active_down.set(false);
        }
    }

    /// Writes the configured initial checkpoints of directions without one.
    pub async fn write_initial_checkpoints(&self) -> ReplicationResult<()> {
        let initial = &self.input.config.initial_checkpoint;
        for (direction, checkpoint) in [
            (ReplicationDirection::Up, &initial.upstream),
            (ReplicationDirection::Down, &initial.downstream),
        ] {
            if let Some(checkpoint) = checkpoint {
                self.checkpoints
                    .set_initial(direction, checkpoint.clone())
                    .await?;
            }
        }
        Ok(())
    }
}
