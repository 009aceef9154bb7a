//! Replication statistics.
//!
//! All counters are atomic and can be read while the replication runs.
//! Values are monotonically increasing.

use std::sync::atomic::{AtomicU64, Ordering};

/// Snapshot of the downstream counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownstreamStats {
    /// Tasks added to the downstream.
    pub add_new_task: u64,
    /// Checkpoint-driven pull passes.
    pub downstream_resync_once: u64,
    /// Live stream batches processed.
    pub downstream_process_changes: u64,
    /// Items received from the master stream.
    pub master_change_stream_emit: u64,
    /// Persistence rounds.
    pub persist_from_master: u64,
    /// Master documents written to the fork.
    pub documents_pulled: u64,
}

/// Snapshot of the upstream counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpstreamStats {
    /// Checkpoint-driven push passes.
    pub upstream_initial_sync: u64,
    /// Bulks received from the fork change stream.
    pub fork_change_stream_emit: u64,
    /// Processing rounds of fork changes.
    pub process_tasks: u64,
    /// Push rounds.
    pub persist_to_master: u64,
    /// Push rounds that reported conflicts.
    pub persist_to_master_had_conflicts: u64,
    /// Push rounds that wrote resolved conflicts to the fork.
    pub persist_to_master_conflict_writes: u64,
    /// Fork documents accepted by the master.
    pub documents_pushed: u64,
    /// Conflicts resolved on the fork.
    pub conflicts_resolved: u64,
}

/// Snapshot of all replication counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplicationStats {
    /// Downstream counters.
    pub down: DownstreamStats,
    /// Upstream counters.
    pub up: UpstreamStats,
    /// Errors published on the error channel.
    pub errors: u64,
    /// Retries scheduled after retryable errors.
    pub retries: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    pub add_new_task: AtomicU64,
    pub downstream_resync_once: AtomicU64,
    pub downstream_process_changes: AtomicU64,
    pub master_change_stream_emit: AtomicU64,
    pub persist_from_master: AtomicU64,
    pub documents_pulled: AtomicU64,

    pub upstream_initial_sync: AtomicU64,
    pub fork_change_stream_emit: AtomicU64,
    pub process_tasks: AtomicU64,
    pub persist_to_master: AtomicU64,
    pub persist_to_master_had_conflicts: AtomicU64,
    pub persist_to_master_conflict_writes: AtomicU64,
    pub documents_pushed: AtomicU64,
    pub conflicts_resolved: AtomicU64,

    pub errors: AtomicU64,
    pub retries: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ReplicationStats {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        ReplicationStats {
            down: DownstreamStats {
                add_new_task: load(&self.add_new_task),
                downstream_resync_once: load(&self.downstream_resync_once),
                downstream_process_changes: load(&self.downstream_process_changes),
                master_change_stream_emit: load(&self.master_change_stream_emit),
                persist_from_master: load(&self.persist_from_master),
                documents_pulled: load(&self.documents_pulled),
            },
            up: UpstreamStats {
                upstream_initial_sync: load(&self.upstream_initial_sync),
                fork_change_stream_emit: load(&self.fork_change_stream_emit),
                process_tasks: load(&self.process_tasks),
                persist_to_master: load(&self.persist_to_master),
                persist_to_master_had_conflicts: load(&self.persist_to_master_had_conflicts),
                persist_to_master_conflict_writes: load(&self.persist_to_master_conflict_writes),
                documents_pushed: load(&self.documents_pushed),
                conflicts_resolved: load(&self.conflicts_resolved),
            },
            errors: load(&self.errors),
            retries: load(&self.retries),
        }
    }
}
