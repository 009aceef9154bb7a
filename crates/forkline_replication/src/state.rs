//! Replication state and orchestration.

use crate::config::ReplicationInput;
use crate::context::{ReplicationContext, ReplicationEvents};
use crate::downstream::Downstream;
use crate::error::{ReplicationError, ReplicationResult};
use crate::registry::Registration;
use crate::stats::ReplicationStats;
use crate::upstream::Upstream;
use forkline_protocol::{
    Checkpoint, Document, PullStreamItem, ReplicationDirection, ReplicationWriteRow,
    ResolvedConflict,
};
use forkline_storage::BulkWriteRow;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use std::time::Duration;
use tracing::info;

/// How often [`ReplicationState::await_idle`] re-checks pending input.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(1);
/// Scheduler rounds granted to handler-internal forwarding before each check.
const HANDLER_SETTLE_ROUNDS: usize = 4;

/// A running replication between a fork and a master.
///
/// Both directions run as independent tasks on the current tokio runtime.
/// The state owns them: dropping it cancels the replication without
/// waiting for in-flight batches, [`ReplicationState::cancel`] waits for
/// them.
///
/// # Example
///
/// ```rust,ignore
/// let state = ReplicationState::start(input).await?;
/// state.await_in_sync().await?;
/// println!("pushed {}", state.stats().up.documents_pushed);
/// state.cancel().await;
/// ```
pub struct ReplicationState<T: Document, C: Checkpoint> {
    ctx: Arc<ReplicationContext<T, C>>,
    downstream: Arc<Downstream<T, C>>,
    upstream: Arc<Upstream<T, C>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
    registration: Mutex<Option<Registration>>,
    closed: AtomicBool,
}

impl<T: Document, C: Checkpoint> ReplicationState<T, C> {
    /// Starts replicating; must be called inside a tokio runtime.
    ///
    /// Configured initial checkpoints are persisted before either
    /// direction starts.
    pub async fn start(input: ReplicationInput<T, C>) -> ReplicationResult<Self> {
        Self::start_registered(input, None).await
    }

    pub(crate) async fn start_registered(
        input: ReplicationInput<T, C>,
        registration: Option<Registration>,
    ) -> ReplicationResult<Self> {
        input.config.validate()?;
        let ctx = Arc::new(ReplicationContext::new(input));
        ctx.write_initial_checkpoints().await?;

        let downstream = Downstream::new(Arc::clone(&ctx));
        let waiting = Arc::downgrade(&downstream);
        let upstream = Upstream::new(Arc::clone(&ctx), move || {
            if let Some(downstream) = waiting.upgrade() {
                downstream.upstream_round_done();
            }
        });
        let mut listeners = vec![downstream.start()];
        listeners.extend(upstream.start());
        info!(
            identifier = %ctx.identifier(),
            pull_batch_size = ctx.input.config.pull_batch_size,
            push_batch_size = ctx.input.config.push_batch_size,
            "replication started"
        );

        Ok(Self {
            ctx,
            downstream,
            upstream,
            listeners: Mutex::new(listeners),
            registration: Mutex::new(registration),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the replication identifier.
    pub fn identifier(&self) -> &str {
        self.ctx.identifier()
    }

    /// Returns the observable flags of this replication.
    pub fn events(&self) -> &ReplicationEvents<T> {
        &self.ctx.events
    }

    /// Subscribes to rows accepted by the master.
    pub fn processed_up(&self) -> broadcast::Receiver<ReplicationWriteRow<T>> {
        self.ctx.events.processed_up.subscribe()
    }

    /// Subscribes to master states written to the fork.
    pub fn processed_down(&self) -> broadcast::Receiver<BulkWriteRow<T>> {
        self.ctx.events.processed_down.subscribe()
    }

    /// Subscribes to conflicts resolved on the fork.
    pub fn resolved_conflicts(&self) -> broadcast::Receiver<ResolvedConflict<T>> {
        self.ctx.events.resolved_conflicts.subscribe()
    }

    /// Subscribes to errors of both directions.
    ///
    /// Conflicts are never reported here.
    pub fn errors(&self) -> broadcast::Receiver<Arc<ReplicationError>> {
        self.ctx.events.errors.subscribe()
    }

    /// Returns true once the replication was cancelled.
    pub fn is_canceled(&self) -> bool {
        self.ctx.is_canceled()
    }

    /// Returns true while the replication is paused.
    pub fn is_paused(&self) -> bool {
        self.ctx.is_paused()
    }

    /// Returns true while `direction` processes a batch.
    pub fn is_active(&self, direction: ReplicationDirection) -> bool {
        self.ctx.events.active(direction).get()
    }

    /// Returns a snapshot of the statistics counters.
    pub fn stats(&self) -> ReplicationStats {
        self.ctx.stats.snapshot()
    }

    /// Waits until both directions finished their first checkpoint pass.
    pub async fn await_first_in_sync(&self) -> ReplicationResult<()> {
        let events = &self.ctx.events;
        let both_done = async {
            events.first_sync_done_up.wait_for(|done| *done).await;
            events.first_sync_done_down.wait_for(|done| *done).await;
        };
        tokio::select! {
            biased;
            _ = both_done => Ok(()),
            _ = events.canceled.wait_for(|canceled| *canceled) => Err(ReplicationError::Cancelled),
        }
    }

    /// Waits for the first pass and for all work queued so far.
    pub async fn await_in_sync(&self) -> ReplicationResult<()> {
        self.await_first_in_sync().await?;
        self.downstream.queue().drained().await;
        self.upstream.queue().drained().await;
        if self.is_canceled() {
            return Err(ReplicationError::Cancelled);
        }
        Ok(())
    }

    /// Waits until no direction has work left, including work caused by
    /// the other direction while waiting.
    ///
    /// Stream events that were sent but not received yet and scheduled
    /// retries count as work. Events a handler has not published on its
    /// stream yet are invisible here.
    pub async fn await_idle(&self) -> ReplicationResult<()> {
        loop {
            self.await_in_sync().await?;
            // lets in-process handlers forward what their master emitted
            for _ in 0..HANDLER_SETTLE_ROUNDS {
                tokio::task::yield_now().await;
            }
            let idle = self.downstream.queue().pending() == 0
                && self.upstream.queue().pending() == 0
                && !self.downstream.has_open_tasks()
                && !self.upstream.has_open_tasks()
                && !self.downstream.has_pending_input()
                && !self.upstream.has_pending_input();
            if idle {
                return Ok(());
            }
            // let the listeners and retry timers run
            tokio::time::sleep(IDLE_POLL_INTERVAL).await;
        }
    }

    /// Stops starting new batches; the running batch finishes.
    pub fn pause(&self) {
        if !self.is_paused() {
            info!(identifier = %self.identifier(), "replication paused");
            self.ctx.events.paused.set(true);
        }
    }

    /// Resumes a paused replication from the persisted checkpoints.
    pub fn resume(&self) {
        if !self.is_paused() || self.is_canceled() {
            return;
        }
        info!(identifier = %self.identifier(), "replication resumed");
        self.ctx.events.paused.set(false);
        self.downstream.add_new_task(PullStreamItem::Resync);
        self.upstream.resync();
    }

    /// Cancels the replication.
    ///
    /// Stream listeners stop at once. In-flight batches finish, but their
    /// results are discarded. Returns after queued work and checkpoint
    /// writes settled and the identifier was released.
    pub async fn cancel(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctx.events.canceled.set(true);
        let listeners = std::mem::take(&mut *self.listeners.lock());
        for listener in listeners {
            listener.abort();
        }

        self.downstream.queue().drained().await;
        self.upstream.queue().drained().await;
        self.ctx.checkpoints.flush().await;

        self.ctx.events.active_up.set(false);
        self.ctx.events.active_down.set(false);
        self.registration.lock().take();
        info!(identifier = %self.identifier(), "replication canceled");
    }
}

impl<T: Document, C: Checkpoint> Drop for ReplicationState<T, C> {
    fn drop(&mut self) {
        self.ctx.events.canceled.set(true);
        for listener in self.listeners.lock().drain(..) {
            listener.abort();
        }
    }
}

impl<T: Document, C: Checkpoint> std::fmt::Debug for ReplicationState<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationState")
            .field("identifier", &self.identifier())
            .field("canceled", &self.is_canceled())
            .field("paused", &self.is_paused())
            .finish_non_exhaustive()
    }
}
