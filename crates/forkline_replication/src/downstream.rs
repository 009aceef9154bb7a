//! Master to fork replication.
//!
//! The downstream has two modes. A checkpoint-driven pass pulls the master
//! backlog in batches; it runs on start, after `RESYNC` and after failures.
//! Between passes the live master stream is processed as it arrives.
//! Every batch runs on the direction's task queue, so a batch never starts
//! before the documents, meta rows and checkpoint of the previous one were
//! persisted.
//!
//! The checkpoint only moves past master states that are settled on the
//! fork. After a failed batch, or when a master state meets an unpushed
//! fork write, the downstream stops persisting checkpoints and re-pulls
//! from the last persisted one: after the retry delay in the first case,
//! once the upstream finished a round in the second.

use crate::backlog::StreamBacklog;
use crate::context::ReplicationContext;
use crate::error::{ReplicationError, ReplicationResult};
use crate::meta::{
    get_assumed_master_state, meta_write_row, write_meta_rows, OnMetaConflict, DOWN_META_CONTEXT,
};
use crate::queue::TaskQueue;
use crate::stats::StatsCounters;
use forkline_protocol::{Checkpoint, Document, PullStreamItem, ReplicationDirection, WithDeleted};
use forkline_storage::{BulkWriteRow, StorageError, WriteErrorKind};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// How often a batch is re-evaluated after losing fork write races.
const MAX_FORK_WRITE_ATTEMPTS: usize = 5;

struct TimedTask<T, C> {
    time: u64,
    task: PullStreamItem<T, C>,
}

/// What a batch left behind on the fork.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BatchOutcome {
    /// Every master state of the batch is settled.
    Settled,
    /// Some master states met unpushed fork writes and were skipped.
    Deferred,
}

pub(crate) struct Downstream<T: Document, C> {
    ctx: Arc<ReplicationContext<T, C>>,
    queue: TaskQueue,
    stream: Mutex<Option<broadcast::Receiver<PullStreamItem<T, C>>>>,
    backlog: StreamBacklog<PullStreamItem<T, C>>,
    open_tasks: Mutex<VecDeque<TimedTask<T, C>>>,
    timer: AtomicU64,
    /// Tasks older than the last master pull are covered by that pull.
    last_time_master_changes_requested: AtomicU64,
    failed_attempts: AtomicU32,
    /// Set while the persisted checkpoint is behind unsettled master states.
    needs_resync: AtomicBool,
    /// Set while a retry of a failed batch is scheduled.
    retry_pending: AtomicBool,
    /// Set while a deferred batch waits for the upstream to finish a round.
    waiting_for_upstream: AtomicBool,
    upstream_rounds: AtomicU64,
}

impl<T: Document, C: Checkpoint> Downstream<T, C> {
    pub fn new(ctx: Arc<ReplicationContext<T, C>>) -> Arc<Self> {
        let stream = ctx.input.handler.master_change_stream();
        Arc::new(Self {
            backlog: StreamBacklog::track(&stream),
            stream: Mutex::new(Some(stream)),
            ctx,
            queue: TaskQueue::new("downstream"),
            open_tasks: Mutex::new(VecDeque::new()),
            timer: AtomicU64::new(1),
            last_time_master_changes_requested: AtomicU64::new(0),
            failed_attempts: AtomicU32::new(0),
            needs_resync: AtomicBool::new(false),
            retry_pending: AtomicBool::new(false),
            waiting_for_upstream: AtomicBool::new(false),
            upstream_rounds: AtomicU64::new(0),
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn has_open_tasks(&self) -> bool {
        !self.open_tasks.lock().is_empty()
    }

    /// Returns true while live master events or a retry are not queued yet.
    pub fn has_pending_input(&self) -> bool {
        self.backlog.pending() > 0 || self.retry_pending.load(Ordering::SeqCst)
    }

    /// Schedules the first pass and listens to the master stream.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let stream = self.stream.lock().take();
        self.add_new_task(PullStreamItem::Resync);

        let this = Arc::clone(self);
        tokio::spawn(async move {
            let Some(mut stream) = stream else {
                return;
            };
            loop {
                tokio::select! {
                    _ = this.ctx.events.canceled.wait_for(|canceled| *canceled) => break,
                    item = stream.recv() => match item {
                        Ok(item) => {
                            StatsCounters::incr(&this.ctx.stats.master_change_stream_emit);
                            if !this.ctx.is_paused() {
                                this.add_new_task(item);
                            }
                            this.backlog.handled(1);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(identifier = %this.ctx.identifier(), missed, "master stream lagged");
                            this.add_new_task(PullStreamItem::Resync);
                            this.backlog.handled(missed);
                        }
                        Err(RecvError::Closed) => {
                            debug!(identifier = %this.ctx.identifier(), "master stream closed");
                            break;
                        }
                    },
                }
            }
        })
    }

    pub fn add_new_task(self: &Arc<Self>, task: PullStreamItem<T, C>) {
        StatsCounters::incr(&self.ctx.stats.add_new_task);
        let time = self.timer.fetch_add(1, Ordering::SeqCst);
        self.open_tasks.lock().push_back(TimedTask { time, task });
        let this = Arc::clone(self);
        self.queue.push(async move { this.process_open_tasks().await });
    }

    /// Called after every upstream round; re-pulls deferred master states.
    pub fn upstream_round_done(self: &Arc<Self>) {
        self.upstream_rounds.fetch_add(1, Ordering::SeqCst);
        if self.waiting_for_upstream.swap(false, Ordering::SeqCst) {
            debug!(identifier = %self.ctx.identifier(), "re-pulling deferred master states");
            self.add_new_task(PullStreamItem::Resync);
        }
    }

    /// Waits for the next upstream round before re-pulling.
    ///
    /// `rounds_before` is the round count read before the fork and meta
    /// states of the deferred batch were read.
    fn defer_to_upstream(self: &Arc<Self>, rounds_before: u64) {
        self.needs_resync.store(true, Ordering::SeqCst);
        self.waiting_for_upstream.store(true, Ordering::SeqCst);
        // a round that ended after the read may not have seen the deferral
        if self.upstream_rounds.load(Ordering::SeqCst) != rounds_before
            && self.waiting_for_upstream.swap(false, Ordering::SeqCst)
        {
            self.add_new_task(PullStreamItem::Resync);
        }
    }

    async fn process_open_tasks(self: Arc<Self>) {
        if self.ctx.is_canceled() {
            return;
        }
        if self.ctx.is_paused() {
            self.open_tasks.lock().clear();
            self.ctx.events.active_down.set(false);
            return;
        }

        let tasks = self.take_tasks();
        if tasks.is_empty() {
            if !self.has_open_tasks() {
                self.ctx.events.active_down.set(false);
            }
            return;
        }
        self.ctx.events.active_down.set(true);

        let rounds_before = self.upstream_rounds.load(Ordering::SeqCst);
        let result = if tasks[0].is_resync() {
            self.resync_once().await
        } else {
            self.process_changes(tasks).await
        };
        match result {
            Ok(BatchOutcome::Settled) => self.failed_attempts.store(0, Ordering::SeqCst),
            Ok(BatchOutcome::Deferred) => {
                self.failed_attempts.store(0, Ordering::SeqCst);
                self.defer_to_upstream(rounds_before);
            }
            Err(err) => self.handle_error(err),
        }

        if !self.has_open_tasks() {
            self.ctx.events.active_down.set(false);
        }
    }

    /// Takes either one `RESYNC` or a run of change batches.
    ///
    /// While the checkpoint is behind unsettled states, live batches are
    /// replaced by a pull from that checkpoint, unless a retry will pull
    /// anyway.
    fn take_tasks(&self) -> Vec<PullStreamItem<T, C>> {
        let covered_before = self
            .last_time_master_changes_requested
            .load(Ordering::SeqCst);
        let mut open = self.open_tasks.lock();
        if self.needs_resync.load(Ordering::SeqCst) {
            let mut resync = false;
            let mut changes = false;
            for timed in open.drain(..) {
                if timed.time < covered_before {
                    continue;
                }
                if timed.task.is_resync() {
                    resync = true;
                } else {
                    changes = true;
                }
            }
            if resync || (changes && !self.retry_pending.load(Ordering::SeqCst)) {
                return vec![PullStreamItem::Resync];
            }
            return Vec::new();
        }

        let mut tasks = Vec::new();
        while let Some(timed) = open.pop_front() {
            if timed.time < covered_before {
                continue;
            }
            if timed.task.is_resync() {
                if tasks.is_empty() {
                    tasks.push(timed.task);
                } else {
                    open.push_front(timed);
                }
                break;
            }
            tasks.push(timed.task);
        }
        tasks
    }

    async fn resync_once(&self) -> ReplicationResult<BatchOutcome> {
        StatsCounters::incr(&self.ctx.stats.downstream_resync_once);
        // this pass starts at the persisted checkpoint and covers everything after it
        self.needs_resync.store(false, Ordering::SeqCst);
        let batch_size = self.ctx.input.config.pull_batch_size;
        let mut checkpoint: Option<C> = self
            .ctx
            .checkpoints
            .get_typed(ReplicationDirection::Down)
            .await?;

        let mut outcome = BatchOutcome::Settled;
        loop {
            if self.ctx.is_canceled() || self.ctx.is_paused() {
                return Ok(outcome);
            }
            let requested_at = self.timer.fetch_add(1, Ordering::SeqCst);
            self.last_time_master_changes_requested
                .store(requested_at, Ordering::SeqCst);

            let batch = self
                .ctx
                .input
                .handler
                .master_changes_since(checkpoint.clone(), batch_size)
                .await?;
            let count = batch.len();
            if count > batch_size {
                return Err(ReplicationError::Contract(format!(
                    "master returned {count} documents for a batch size of {batch_size}"
                )));
            }
            if count == 0 {
                break;
            }
            if count == batch_size && same_checkpoint(checkpoint.as_ref(), &batch.checkpoint)? {
                return Err(ReplicationError::Contract(format!(
                    "master returned a full batch without advancing the checkpoint {:?}",
                    batch.checkpoint
                )));
            }
            checkpoint = Some(batch.checkpoint.clone());
            if self.persist_from_master(batch.documents, batch.checkpoint).await?
                == BatchOutcome::Deferred
            {
                outcome = BatchOutcome::Deferred;
            }
            if count < batch_size {
                break;
            }
        }

        if !self.ctx.is_canceled() && !self.ctx.events.first_sync_done_down.get() {
            info!(identifier = %self.ctx.identifier(), "downstream initial sync done");
            self.ctx.events.first_sync_done_down.set(true);
        }
        Ok(outcome)
    }

    async fn process_changes(
        &self,
        tasks: Vec<PullStreamItem<T, C>>,
    ) -> ReplicationResult<BatchOutcome> {
        StatsCounters::incr(&self.ctx.stats.downstream_process_changes);
        let mut documents = Vec::new();
        let mut checkpoint = None;
        for task in tasks {
            if let PullStreamItem::Changes(batch) = task {
                documents.extend(batch.documents);
                checkpoint = Some(batch.checkpoint);
            }
        }
        match checkpoint {
            Some(checkpoint) => self.persist_from_master(documents, checkpoint).await,
            None => Ok(BatchOutcome::Settled),
        }
    }

    /// Merges master states into the fork, then records them as assumed
    /// master states, then advances the checkpoint.
    ///
    /// The checkpoint stays where it is if a state of this or an earlier
    /// batch of the pass was deferred.
    async fn persist_from_master(
        &self,
        documents: Vec<WithDeleted<T>>,
        checkpoint: C,
    ) -> ReplicationResult<BatchOutcome> {
        let ctx = &self.ctx;
        StatsCounters::incr(&ctx.stats.persist_from_master);

        // later states of the same id replace earlier ones
        let mut ids = Vec::new();
        let mut master_states = HashMap::new();
        for document in documents {
            let id = document.id().to_string();
            if master_states.insert(id.clone(), document).is_none() {
                ids.push(id);
            }
        }

        if ctx.is_canceled() {
            return Ok(BatchOutcome::Settled);
        }
        ctx.input.wait_before_persist().await;

        let mut written = 0;
        let mut deferred = 0;
        let mut attempt = 0;
        while !ids.is_empty() {
            if ctx.is_canceled() {
                return Ok(BatchOutcome::Settled);
            }
            attempt += 1;
            if attempt > MAX_FORK_WRITE_ATTEMPTS {
                return Err(StorageError::Backend(format!(
                    "{} fork documents kept conflicting",
                    ids.len()
                ))
                .into());
            }
            ids = self
                .persist_round(&ids, &master_states, &mut written, &mut deferred)
                .await?;
        }

        if ctx.is_canceled() {
            return Ok(BatchOutcome::Settled);
        }
        StatsCounters::add(&ctx.stats.documents_pulled, written);
        if deferred > 0 {
            self.needs_resync.store(true, Ordering::SeqCst);
        }
        if self.needs_resync.load(Ordering::SeqCst) {
            debug!(
                identifier = %ctx.identifier(),
                count = written,
                deferred,
                "persisted master batch, checkpoint held back"
            );
        } else {
            ctx.checkpoints
                .set_typed(ReplicationDirection::Down, &checkpoint)
                .await?;
            debug!(identifier = %ctx.identifier(), count = written, "persisted master batch");
        }
        Ok(if deferred > 0 {
            BatchOutcome::Deferred
        } else {
            BatchOutcome::Settled
        })
    }

    /// Returns the ids whose fork write lost a race and must be re-evaluated.
    async fn persist_round(
        &self,
        ids: &[String],
        master_states: &HashMap<String, WithDeleted<T>>,
        written: &mut usize,
        deferred: &mut usize,
    ) -> ReplicationResult<Vec<String>> {
        let ctx = &self.ctx;
        let handler = &ctx.input.conflict_handler;
        let fork_states = ctx
            .input
            .fork
            .find_documents_by_id(ids.to_vec(), true)
            .await?;
        let assumed = get_assumed_master_state(&*ctx.input.meta, ctx.identifier(), ids).await?;

        let mut fork_rows = Vec::new();
        let mut fork_meta_rows = HashMap::new();
        let mut meta_rows = Vec::new();
        for id in ids {
            let Some(master_state) = master_states.get(id) else {
                continue;
            };
            let fork_state = fork_states.get(id);
            let assumed_master = assumed.get(id);

            if let (Some(fork_state), Some(assumed_master)) = (fork_state, assumed_master) {
                if assumed_master.resolved_conflict() == Some(&fork_state.revision) {
                    // a resolved conflict the upstream has to push first
                    *deferred += 1;
                    continue;
                }
            }

            let assumed_equals_fork = match (fork_state, assumed_master) {
                (Some(fork_state), Some(assumed_master)) => handler.is_equal(
                    &assumed_master.doc_data,
                    &fork_state.data,
                    "downstream-check-if-equal-0",
                ),
                _ => false,
            };

            if let Some(fork_state) = fork_state {
                if handler.is_equal(master_state, &fork_state.data, "downstream-check-if-equal-1") {
                    if !assumed_equals_fork {
                        meta_rows.push(meta_write_row(
                            ctx.identifier(),
                            master_state.clone(),
                            assumed_master,
                            None,
                        ));
                    }
                    continue;
                }
                if !assumed_equals_fork {
                    // unpushed local write; the upstream resolves it against the master
                    *deferred += 1;
                    continue;
                }
            }

            fork_rows.push(BulkWriteRow {
                previous: fork_state.cloned(),
                document: master_state.clone(),
            });
            fork_meta_rows.insert(
                id.clone(),
                meta_write_row(ctx.identifier(), master_state.clone(), assumed_master, None),
            );
        }

        let mut retry = Vec::new();
        if !fork_rows.is_empty() {
            if ctx.is_canceled() {
                return Ok(retry);
            }
            let rows_by_id: HashMap<String, BulkWriteRow<T>> = fork_rows
                .iter()
                .map(|row| (row.document.id().to_string(), row.clone()))
                .collect();
            let response = ctx
                .input
                .fork
                .bulk_write(fork_rows, &ctx.downstream_context)
                .await?;
            for (id, error) in response.error {
                match error.kind {
                    WriteErrorKind::Conflict => retry.push(id),
                    WriteErrorKind::Rejected(reason) => {
                        return Err(ReplicationError::ForkWrite {
                            document_id: id,
                            reason,
                        })
                    }
                }
            }
            for id in response.success.keys() {
                if let Some(row) = rows_by_id.get(id) {
                    let _ = ctx.events.processed_down.send(row.clone());
                }
                if let Some(meta_row) = fork_meta_rows.remove(id) {
                    meta_rows.push(meta_row);
                }
            }
            *written += response.success.len();
        }

        write_meta_rows(
            &*ctx.input.meta,
            meta_rows,
            DOWN_META_CONTEXT,
            OnMetaConflict::Rebase,
        )
        .await?;
        Ok(retry)
    }

    fn handle_error(self: &Arc<Self>, err: ReplicationError) {
        // whatever the failed batch did not persist must be pulled again
        self.needs_resync.store(true, Ordering::SeqCst);
        let retryable = err.is_retryable();
        self.ctx.emit_error(ReplicationDirection::Down, err);
        if !retryable || self.ctx.is_canceled() {
            return;
        }

        let retry = &self.ctx.input.config.retry;
        let attempt = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !retry.should_retry(attempt) {
            warn!(identifier = %self.ctx.identifier(), attempt, "downstream retries exhausted");
            self.failed_attempts.store(0, Ordering::SeqCst);
            return;
        }

        StatsCounters::incr(&self.ctx.stats.retries);
        let delay = retry.delay_for_attempt(attempt);
        self.retry_pending.store(true, Ordering::SeqCst);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if !this.ctx.is_canceled() {
                this.add_new_task(PullStreamItem::Resync);
            }
            this.retry_pending.store(false, Ordering::SeqCst);
        });
    }
}

/// Compares checkpoints by their serialized form.
fn same_checkpoint<C: Checkpoint>(previous: Option<&C>, next: &C) -> ReplicationResult<bool> {
    match previous {
        Some(previous) => Ok(serde_json::to_value(previous)? == serde_json::to_value(next)?),
        None => Ok(false),
    }
}
