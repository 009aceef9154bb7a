//! Master handlers that misbehave on purpose.

use forkline_protocol::{
    Checkpoint, Document, DocumentsWithCheckpoint, PullStreamItem, ReplicationWriteRow,
    WithDeleted,
};
use forkline_replication::{BoxFuture, ReplicationError, ReplicationHandler};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Wraps a handler and injects faults into its calls.
///
/// Without configured faults every call is forwarded unchanged. Calls and
/// forwarded write rows are recorded either way.
pub struct FaultyHandler<T, C> {
    inner: Arc<dyn ReplicationHandler<T, C>>,
    failing_pulls: AtomicUsize,
    failing_writes: AtomicUsize,
    fatal_writes: AtomicBool,
    oversized_pulls: AtomicBool,
    stalled_pulls: AtomicBool,
    duplicate_writes: AtomicBool,
    muted: Option<broadcast::Sender<PullStreamItem<T, C>>>,
    pull_calls: AtomicUsize,
    write_calls: AtomicUsize,
    written: Mutex<Vec<ReplicationWriteRow<T>>>,
}

impl<T: Document, C: Checkpoint> FaultyHandler<T, C> {
    /// Wraps `inner`.
    pub fn new(inner: Arc<dyn ReplicationHandler<T, C>>) -> Self {
        Self {
            inner,
            failing_pulls: AtomicUsize::new(0),
            failing_writes: AtomicUsize::new(0),
            fatal_writes: AtomicBool::new(false),
            oversized_pulls: AtomicBool::new(false),
            stalled_pulls: AtomicBool::new(false),
            duplicate_writes: AtomicBool::new(false),
            muted: None,
            pull_calls: AtomicUsize::new(0),
            write_calls: AtomicUsize::new(0),
            written: Mutex::new(Vec::new()),
        }
    }

    /// Fails the next `count` pulls with a retryable transport error.
    pub fn fail_pulls(self, count: usize) -> Self {
        self.failing_pulls.store(count, Ordering::SeqCst);
        self
    }

    /// Fails the next `count` writes with a retryable transport error.
    pub fn fail_writes(self, count: usize) -> Self {
        self.failing_writes.store(count, Ordering::SeqCst);
        self
    }

    /// Fails every write with a fatal transport error.
    pub fn fatal_writes(self) -> Self {
        self.fatal_writes.store(true, Ordering::SeqCst);
        self
    }

    /// Returns more documents than the requested batch size.
    pub fn oversized_pulls(self) -> Self {
        self.oversized_pulls.store(true, Ordering::SeqCst);
        self
    }

    /// Answers pulls from a checkpoint with that same checkpoint, so the
    /// pull never moves forward.
    pub fn stalled_pulls(self) -> Self {
        self.stalled_pulls.store(true, Ordering::SeqCst);
        self
    }

    /// Applies every write twice and answers with the second response,
    /// like a retried call whose first response was lost.
    pub fn duplicate_writes(self) -> Self {
        self.duplicate_writes.store(true, Ordering::SeqCst);
        self
    }

    /// Drops every live master event; only [`FaultyHandler::resync`] is delivered.
    pub fn muted_stream(mut self) -> Self {
        self.muted = Some(broadcast::channel(16).0);
        self
    }

    /// Emits `RESYNC` on the muted stream.
    pub fn resync(&self) {
        if let Some(muted) = &self.muted {
            let _ = muted.send(PullStreamItem::Resync);
        }
    }

    /// Returns the number of pull calls, failed ones included.
    pub fn pull_calls(&self) -> usize {
        self.pull_calls.load(Ordering::SeqCst)
    }

    /// Returns the number of write calls, failed ones included.
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    /// Returns every row forwarded to the wrapped handler.
    pub fn written_rows(&self) -> Vec<ReplicationWriteRow<T>> {
        self.written.lock().clone()
    }
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

impl<T: Document, C: Checkpoint> ReplicationHandler<T, C> for FaultyHandler<T, C> {
    fn master_change_stream(&self) -> broadcast::Receiver<PullStreamItem<T, C>> {
        match &self.muted {
            Some(muted) => muted.subscribe(),
            None => self.inner.master_change_stream(),
        }
    }

    fn master_changes_since(
        &self,
        checkpoint: Option<C>,
        batch_size: usize,
    ) -> BoxFuture<'_, DocumentsWithCheckpoint<T, C>> {
        Box::pin(async move {
            self.pull_calls.fetch_add(1, Ordering::SeqCst);
            if take_failure(&self.failing_pulls) {
                return Err(ReplicationError::transport_retryable("injected pull failure"));
            }
            let mut batch = self
                .inner
                .master_changes_since(checkpoint.clone(), batch_size)
                .await?;
            if self.stalled_pulls.load(Ordering::SeqCst) {
                if let Some(checkpoint) = checkpoint {
                    batch.checkpoint = checkpoint;
                }
            }
            if self.oversized_pulls.load(Ordering::SeqCst) {
                while !batch.documents.is_empty() && batch.documents.len() <= batch_size {
                    let copy = batch.documents.clone();
                    batch.documents.extend(copy);
                }
            }
            Ok(batch)
        })
    }

    fn master_write(&self, rows: Vec<ReplicationWriteRow<T>>) -> BoxFuture<'_, Vec<WithDeleted<T>>> {
        Box::pin(async move {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            if self.fatal_writes.load(Ordering::SeqCst) {
                return Err(ReplicationError::transport_fatal("injected fatal write failure"));
            }
            if take_failure(&self.failing_writes) {
                return Err(ReplicationError::transport_retryable("injected write failure"));
            }
            self.written.lock().extend(rows.iter().cloned());
            if self.duplicate_writes.load(Ordering::SeqCst) {
                self.inner.master_write(rows.clone()).await?;
            }
            self.inner.master_write(rows).await
        })
    }
}
