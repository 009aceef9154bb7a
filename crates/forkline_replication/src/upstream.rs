//! Fork to master replication.
//!
//! The upstream iterates the fork by checkpoint on start and after
//! `RESYNC`; in between it follows the fork change stream. The fork is
//! local and does not miss events, so the stream is trusted unless the
//! receiver lags. Every finished round is reported to the downstream,
//! which may hold master states back until the fork writes they met were
//! pushed.

use crate::backlog::StreamBacklog;
use crate::conflicts::resolve_conflict;
use crate::context::ReplicationContext;
use crate::error::{ReplicationError, ReplicationResult};
use crate::meta::{
    get_assumed_master_state, meta_write_row, write_meta_rows, OnMetaConflict,
    UP_CONFLICT_META_CONTEXT, UP_META_CONTEXT,
};
use crate::queue::TaskQueue;
use crate::stats::StatsCounters;
use forkline_protocol::{
    Checkpoint, ConflictHandlerInput, Document, PullStreamItem, ReplicationDirection,
    ReplicationWriteRow, WithDeleted,
};
use forkline_storage::{BulkWriteRow, EventBulk, StorageCheckpoint, WriteErrorKind};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Context of fork writes that store resolved conflicts.
pub const UP_CONFLICT_CONTEXT: &str = "replication-up-write-conflict";

enum UpTask<T> {
    Changes(EventBulk<T>),
    Resync,
}

struct TimedTask<T> {
    time: u64,
    task: UpTask<T>,
}

type RoundHook = Box<dyn Fn() + Send + Sync>;

pub(crate) struct Upstream<T: Document, C> {
    ctx: Arc<ReplicationContext<T, C>>,
    queue: TaskQueue,
    fork_stream: Mutex<Option<broadcast::Receiver<EventBulk<T>>>>,
    fork_backlog: StreamBacklog<EventBulk<T>>,
    master_stream: Mutex<Option<broadcast::Receiver<PullStreamItem<T, C>>>>,
    master_backlog: StreamBacklog<PullStreamItem<T, C>>,
    open_tasks: Mutex<VecDeque<TimedTask<T>>>,
    timer: AtomicU64,
    /// Tasks older than the last checkpoint iteration are covered by it.
    initial_sync_start: AtomicU64,
    failed_attempts: AtomicU32,
    retry_pending: AtomicBool,
    on_round_done: RoundHook,
}

impl<T: Document, C: Checkpoint> Upstream<T, C> {
    pub fn new<F>(ctx: Arc<ReplicationContext<T, C>>, on_round_done: F) -> Arc<Self>
    where
        F: Fn() + Send + Sync + 'static,
    {
        let fork_stream = ctx.input.fork.change_stream();
        let master_stream = ctx.input.handler.master_change_stream();
        Arc::new(Self {
            fork_backlog: StreamBacklog::track(&fork_stream),
            fork_stream: Mutex::new(Some(fork_stream)),
            master_backlog: StreamBacklog::track(&master_stream),
            master_stream: Mutex::new(Some(master_stream)),
            ctx,
            queue: TaskQueue::new("upstream"),
            open_tasks: Mutex::new(VecDeque::new()),
            timer: AtomicU64::new(1),
            initial_sync_start: AtomicU64::new(0),
            failed_attempts: AtomicU32::new(0),
            retry_pending: AtomicBool::new(false),
            on_round_done: Box::new(on_round_done),
        })
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn has_open_tasks(&self) -> bool {
        !self.open_tasks.lock().is_empty()
    }

    /// Returns true while fork events, `RESYNC` or a retry are not queued yet.
    pub fn has_pending_input(&self) -> bool {
        self.fork_backlog.pending() > 0
            || self.master_backlog.pending() > 0
            || self.retry_pending.load(Ordering::SeqCst)
    }

    /// Schedules the first pass and listens to the fork stream and to
    /// `RESYNC` from the master.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        let fork_stream = self.fork_stream.lock().take();
        let master_stream = self.master_stream.lock().take();

        let this = Arc::clone(self);
        self.queue.push(async move {
            this.ctx.events.active_up.set(true);
            let result = this.initial_sync().await;
            this.finish_round(result);
        });

        let this = Arc::clone(self);
        let fork_listener = tokio::spawn(async move {
            let Some(mut fork_stream) = fork_stream else {
                return;
            };
            loop {
                tokio::select! {
                    _ = this.ctx.events.canceled.wait_for(|canceled| *canceled) => break,
                    bulk = fork_stream.recv() => match bulk {
                        Ok(bulk) => {
                            if !this.ctx.is_paused() {
                                StatsCounters::incr(&this.ctx.stats.fork_change_stream_emit);
                                this.add_task(UpTask::Changes(bulk));
                            }
                            this.fork_backlog.handled(1);
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(identifier = %this.ctx.identifier(), missed, "fork stream lagged");
                            this.add_task(UpTask::Resync);
                            this.fork_backlog.handled(missed);
                        }
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        let this = Arc::clone(self);
        let resync_listener = tokio::spawn(async move {
            let Some(mut master_stream) = master_stream else {
                return;
            };
            loop {
                tokio::select! {
                    _ = this.ctx.events.canceled.wait_for(|canceled| *canceled) => break,
                    item = master_stream.recv() => match item {
                        Ok(item) => {
                            if item.is_resync() && !this.ctx.is_paused() {
                                this.add_task(UpTask::Resync);
                            }
                            this.master_backlog.handled(1);
                        }
                        Err(RecvError::Lagged(missed)) => this.master_backlog.handled(missed),
                        Err(RecvError::Closed) => break,
                    },
                }
            }
        });

        vec![fork_listener, resync_listener]
    }

    /// Schedules a checkpoint-driven pass.
    pub fn resync(self: &Arc<Self>) {
        self.add_task(UpTask::Resync);
    }

    fn add_task(self: &Arc<Self>, task: UpTask<T>) {
        let time = self.timer.fetch_add(1, Ordering::SeqCst);
        self.open_tasks.lock().push_back(TimedTask { time, task });
        self.ctx.events.active_up.set(true);
        let this = Arc::clone(self);
        self.queue.push(async move { this.process_open_tasks().await });
    }

    async fn process_open_tasks(self: Arc<Self>) {
        if self.ctx.is_canceled() {
            return;
        }
        if self.ctx.is_paused() {
            self.open_tasks.lock().clear();
            self.ctx.events.active_up.set(false);
            return;
        }
        if !self.has_open_tasks() {
            self.ctx.events.active_up.set(false);
            return;
        }

        StatsCounters::incr(&self.ctx.stats.process_tasks);
        self.ctx.events.active_up.set(true);
        self.ctx.input.wait_before_persist().await;

        let result = match self.take_tasks() {
            TakenTasks::Resync => self.initial_sync().await,
            TakenTasks::Changes(ids, checkpoint) => {
                self.persist_to_master(ids, checkpoint).await.map(|_| ())
            }
            TakenTasks::Nothing => Ok(()),
        };
        self.finish_round(result);
    }

    fn finish_round(self: &Arc<Self>, result: ReplicationResult<()>) {
        match result {
            Ok(()) => self.failed_attempts.store(0, Ordering::SeqCst),
            Err(err) => self.handle_error(err),
        }
        (self.on_round_done)();
        if !self.has_open_tasks() {
            self.ctx.events.active_up.set(false);
        }
    }

    /// Merges open fork changes into one set of ids, skipping downstream writes.
    fn take_tasks(&self) -> TakenTasks {
        let covered_before = self.initial_sync_start.load(Ordering::SeqCst);
        let mut open = self.open_tasks.lock();
        let mut ids = Vec::new();
        let mut checkpoint = None;
        while let Some(timed) = open.pop_front() {
            if timed.time < covered_before {
                continue;
            }
            match timed.task {
                UpTask::Resync if checkpoint.is_none() => return TakenTasks::Resync,
                UpTask::Resync => {
                    open.push_front(timed);
                    break;
                }
                UpTask::Changes(bulk) => {
                    // downstream writes still advance the checkpoint
                    if bulk.context != self.ctx.downstream_context {
                        ids.extend(bulk.events.into_iter().map(|event| event.document_id));
                    }
                    checkpoint = Some(bulk.checkpoint);
                }
            }
        }
        match checkpoint {
            Some(checkpoint) => TakenTasks::Changes(ids, checkpoint),
            None => TakenTasks::Nothing,
        }
    }

    async fn initial_sync(&self) -> ReplicationResult<()> {
        let ctx = &self.ctx;
        let batch_size = ctx.input.config.push_batch_size;
        loop {
            StatsCounters::incr(&ctx.stats.upstream_initial_sync);
            let mut checkpoint: Option<StorageCheckpoint> =
                ctx.checkpoints.get_typed(ReplicationDirection::Up).await?;
            let mut had_conflicts = false;
            loop {
                if ctx.is_canceled() || ctx.is_paused() {
                    return Ok(());
                }
                let started_at = self.timer.fetch_add(1, Ordering::SeqCst);
                self.initial_sync_start.store(started_at, Ordering::SeqCst);

                let changed = ctx
                    .input
                    .fork
                    .changed_documents_since(batch_size, checkpoint)
                    .await?;
                if changed.documents.is_empty() {
                    break;
                }
                checkpoint = Some(changed.checkpoint);
                let ids = changed
                    .documents
                    .iter()
                    .map(|stored| stored.id().to_string())
                    .collect();
                had_conflicts |= self.persist_to_master(ids, changed.checkpoint).await?;
            }
            // conflict resolutions were written to the fork and must be pushed
            if !had_conflicts {
                break;
            }
        }

        if !ctx.is_canceled() && !ctx.events.first_sync_done_up.get() {
            info!(identifier = %ctx.identifier(), "upstream initial sync done");
            ctx.events.first_sync_done_up.set(true);
        }
        Ok(())
    }

    /// Pushes the current fork state of `ids` and resolves the conflicts the
    /// master reports. Returns true if resolved conflicts were written to the
    /// fork.
    async fn persist_to_master(
        &self,
        mut ids: Vec<String>,
        checkpoint: StorageCheckpoint,
    ) -> ReplicationResult<bool> {
        let ctx = &self.ctx;
        StatsCounters::incr(&ctx.stats.persist_to_master);
        if ctx.is_canceled() {
            return Ok(false);
        }

        let mut seen = HashSet::new();
        ids.retain(|id| seen.insert(id.clone()));
        if ids.is_empty() {
            self.set_checkpoint(checkpoint).await?;
            return Ok(false);
        }

        let handler = &ctx.input.conflict_handler;
        let fork_states = ctx
            .input
            .fork
            .find_documents_by_id(ids.clone(), true)
            .await?;
        let assumed = get_assumed_master_state(&*ctx.input.meta, ctx.identifier(), &ids).await?;

        let mut rows = Vec::new();
        for id in &ids {
            let Some(fork_state) = fork_states.get(id) else {
                continue;
            };
            let assumed_master = assumed.get(id);
            if let Some(assumed_master) = assumed_master {
                let is_resolved_conflict =
                    assumed_master.resolved_conflict() == Some(&fork_state.revision);
                if !is_resolved_conflict
                    && handler.is_equal(
                        &assumed_master.doc_data,
                        &fork_state.data,
                        "upstream-check-if-equal",
                    )
                {
                    continue;
                }
            }
            rows.push(ReplicationWriteRow::new(
                assumed_master.map(|assumed_master| assumed_master.doc_data.clone()),
                fork_state.data.clone(),
            ));
        }
        if rows.is_empty() {
            self.set_checkpoint(checkpoint).await?;
            return Ok(false);
        }

        let mut conflicts: HashMap<String, WithDeleted<T>> = HashMap::new();
        for chunk in rows.chunks(ctx.input.config.push_batch_size) {
            let pushed: HashSet<&str> = chunk
                .iter()
                .map(|row| row.new_document_state.id())
                .collect();
            let real_states = ctx.input.handler.master_write(chunk.to_vec()).await?;
            for real in real_states {
                if !pushed.contains(real.id()) {
                    return Err(ReplicationError::Contract(format!(
                        "master reported a conflict for {:?} which was not pushed",
                        real.id()
                    )));
                }
                conflicts.insert(real.id().to_string(), real);
            }
        }
        if ctx.is_canceled() {
            return Ok(false);
        }

        let mut meta_rows = Vec::new();
        for row in &rows {
            let id = row.new_document_state.id();
            if conflicts.contains_key(id) {
                continue;
            }
            let _ = ctx.events.processed_up.send(row.clone());
            meta_rows.push(meta_write_row(
                ctx.identifier(),
                row.new_document_state.clone(),
                assumed.get(id),
                None,
            ));
        }
        let pushed = meta_rows.len();
        write_meta_rows(
            &*ctx.input.meta,
            meta_rows,
            UP_META_CONTEXT,
            OnMetaConflict::KeepStored,
        )
        .await?;
        StatsCounters::add(&ctx.stats.documents_pushed, pushed);
        debug!(
            identifier = %ctx.identifier(),
            count = pushed,
            conflicts = conflicts.len(),
            "pushed fork batch"
        );

        let mut had_conflict_writes = false;
        if !conflicts.is_empty() {
            StatsCounters::incr(&ctx.stats.persist_to_master_had_conflicts);
            let rows_by_id: HashMap<&str, &ReplicationWriteRow<T>> = rows
                .iter()
                .map(|row| (row.new_document_state.id(), row))
                .collect();

            let mut fork_rows = Vec::new();
            let mut real_states = HashMap::new();
            let mut settled = Vec::new();
            for (id, real) in conflicts {
                let (Some(row), Some(fork_state)) =
                    (rows_by_id.get(id.as_str()), fork_states.get(&id))
                else {
                    continue;
                };
                let input = ConflictHandlerInput {
                    assumed_master_state: row.assumed_master_state.clone(),
                    real_master_state: real.clone(),
                    new_document_state: row.new_document_state.clone(),
                };
                match resolve_conflict(&**handler, input) {
                    // the master already holds the pushed state
                    None => settled.push(meta_write_row(
                        ctx.identifier(),
                        real,
                        assumed.get(&id),
                        None,
                    )),
                    Some(resolved) => {
                        fork_rows.push(BulkWriteRow::update(
                            fork_state.clone(),
                            resolved.output.clone(),
                        ));
                        StatsCounters::incr(&ctx.stats.conflicts_resolved);
                        let _ = ctx.events.resolved_conflicts.send(resolved);
                        real_states.insert(id, real);
                    }
                }
            }

            if !fork_rows.is_empty() {
                had_conflict_writes = true;
                StatsCounters::incr(&ctx.stats.persist_to_master_conflict_writes);
                let response = ctx
                    .input
                    .fork
                    .bulk_write(fork_rows, UP_CONFLICT_CONTEXT)
                    .await?;
                // a conflict here means a newer local write, which gets its own cycle
                for (id, error) in response.error {
                    if let WriteErrorKind::Rejected(reason) = error.kind {
                        return Err(ReplicationError::ForkWrite {
                            document_id: id,
                            reason,
                        });
                    }
                }
                for (id, stored) in &response.success {
                    if let Some(real) = real_states.remove(id) {
                        settled.push(meta_write_row(
                            ctx.identifier(),
                            real,
                            assumed.get(id),
                            Some(stored.revision.clone()),
                        ));
                    }
                }
            }
            write_meta_rows(
                &*ctx.input.meta,
                settled,
                UP_CONFLICT_META_CONTEXT,
                OnMetaConflict::KeepStored,
            )
            .await?;
        }

        self.set_checkpoint(checkpoint).await?;
        Ok(had_conflict_writes)
    }

    async fn set_checkpoint(&self, checkpoint: StorageCheckpoint) -> ReplicationResult<()> {
        if self.ctx.is_canceled() {
            return Ok(());
        }
        self.ctx
            .checkpoints
            .set_typed(ReplicationDirection::Up, &checkpoint)
            .await
    }

    fn handle_error(self: &Arc<Self>, err: ReplicationError) {
        let retryable = err.is_retryable();
        self.ctx.emit_error(ReplicationDirection::Up, err);
        if !retryable || self.ctx.is_canceled() {
            return;
        }

        let retry = &self.ctx.input.config.retry;
        let attempt = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if !retry.should_retry(attempt) {
            warn!(identifier = %self.ctx.identifier(), attempt, "upstream retries exhausted");
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
                this.resync();
            }
            this.retry_pending.store(false, Ordering::SeqCst);
        });
    }
}

enum TakenTasks {
    Resync,
    Changes(Vec<String>, StorageCheckpoint),
    Nothing,
}
