//! Transport failures and contract violations.

use forkline_protocol::{
    meta_row_id, DocumentsWithCheckpoint, PullStreamItem, ReplicationWriteRow, WithDeleted,
};
use forkline_replication::{
    BoxFuture, ReplicationError, ReplicationHandler, ReplicationState, RetryConfig,
    StorageReplicationHandler,
};
use forkline_storage::StorageCheckpoint;
use forkline_testkit::prelude::*;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;

fn faulty(harness: &ReplicationHarness) -> FaultyHandler<TestDoc, StorageCheckpoint> {
    FaultyHandler::new(harness.handler.clone())
}

#[tokio::test]
async fn retryable_errors_are_retried_in_fresh_batches() {
    init_tracing();
    let harness = ReplicationHarness::new();
    let handler = Arc::new(faulty(&harness).fail_pulls(2).fail_writes(2));
    harness.write_master(doc("a", "red")).await;
    harness.write_fork(doc("b", "blue")).await;

    let state = ReplicationState::start(
        harness.input_with_handler(harness.config("retry"), handler.clone()),
    )
    .await
    .unwrap();
    state.await_first_in_sync().await.unwrap();

    assert!(harness.wait_converged().await);
    assert_eq!(harness.fork_state("a"), Some(doc("a", "red")));
    assert_eq!(harness.master_state("b"), Some(doc("b", "blue")));
    assert!(!state.is_canceled());

    let stats = state.stats();
    assert!(stats.errors >= 4);
    assert!(stats.retries >= 4);
    assert!(handler.pull_calls() >= 3);
    assert!(handler.write_calls() >= 3);

    state.cancel().await;
}

#[tokio::test]
async fn failed_pull_does_not_advance_checkpoint() {
    init_tracing();
    let harness = ReplicationHarness::new();
    let handler = Arc::new(faulty(&harness).fail_pulls(10));
    harness.write_master(doc("a", "red")).await;

    let config = harness.config("exhausted").with_retry(
        RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(5))
            .with_jitter(false),
    );
    let state = ReplicationState::start(harness.input_with_handler(config, handler.clone()))
        .await
        .unwrap();

    assert!(wait_until(WAIT_TIMEOUT, || state.stats().errors >= 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.pull_calls(), 2);
    assert!(harness.fork.is_empty());
    assert!(harness.meta.get(&meta_row_id("exhausted", "down", true)).is_none());
    assert!(!state.is_canceled());
    assert!(!state.events().first_sync_done_down.get());

    state.cancel().await;
}

#[tokio::test]
async fn oversized_pull_cancels_replication() {
    init_tracing();
    let harness = ReplicationHarness::new();
    for id in ["a", "b", "c"] {
        harness.write_master(doc(id, "red")).await;
    }
    let handler = Arc::new(faulty(&harness).oversized_pulls());
    let config = harness.config("oversized").with_pull_batch_size(2);
    let state = ReplicationState::start(harness.input_with_handler(config, handler))
        .await
        .unwrap();
    let mut errors = state.errors();

    assert!(matches!(
        state.await_first_in_sync().await,
        Err(ReplicationError::Cancelled)
    ));
    let err = timeout(WAIT_TIMEOUT, errors.recv())
        .await
        .expect("no error published")
        .unwrap();
    assert!(matches!(*err, ReplicationError::Contract(_)));
    assert!(state.is_canceled());
    assert!(harness.fork.is_empty());
    assert!(harness.meta.get(&meta_row_id("oversized", "down", true)).is_none());

    state.cancel().await;
}

#[tokio::test]
async fn stalled_pull_cancels_replication() {
    init_tracing();
    let harness = ReplicationHarness::new();
    for id in ["a", "b", "c", "d"] {
        harness.write_master(doc(id, "red")).await;
    }
    let handler = Arc::new(faulty(&harness).stalled_pulls());
    let config = harness.config("stalled").with_pull_batch_size(2);
    let state = ReplicationState::start(harness.input_with_handler(config, handler.clone()))
        .await
        .unwrap();
    let mut errors = state.errors();

    let err = timeout(WAIT_TIMEOUT, errors.recv())
        .await
        .expect("no error published")
        .unwrap();
    assert!(matches!(*err, ReplicationError::Contract(_)));
    assert!(wait_until(WAIT_TIMEOUT, || state.is_canceled()).await);
    assert_eq!(handler.pull_calls(), 2);
    assert_eq!(harness.fork.len(), 2);

    state.cancel().await;
}

#[tokio::test]
async fn fatal_transport_error_cancels_replication() {
    init_tracing();
    let harness = ReplicationHarness::new();
    harness.write_fork(doc("a", "red")).await;
    let handler = Arc::new(faulty(&harness).fatal_writes());
    let state = ReplicationState::start(harness.input_with_handler(harness.config("fatal"), handler))
        .await
        .unwrap();
    let mut errors = state.errors();

    let err = timeout(WAIT_TIMEOUT, errors.recv())
        .await
        .expect("no error published")
        .unwrap();
    assert!(err.is_fatal());
    assert!(!err.is_retryable());
    assert!(wait_until(WAIT_TIMEOUT, || state.is_canceled()).await);
    assert!(harness.master.is_empty());

    state.cancel().await;
}

/// Reports a conflict for a document that was never pushed.
struct PhantomConflictHandler {
    inner: Arc<StorageReplicationHandler<TestDoc>>,
}

impl ReplicationHandler<TestDoc, StorageCheckpoint> for PhantomConflictHandler {
    fn master_change_stream(&self) -> broadcast::Receiver<PullStreamItem<TestDoc, StorageCheckpoint>> {
        self.inner.master_change_stream()
    }

    fn master_changes_since(
        &self,
        checkpoint: Option<StorageCheckpoint>,
        batch_size: usize,
    ) -> BoxFuture<'_, DocumentsWithCheckpoint<TestDoc, StorageCheckpoint>> {
        self.inner.master_changes_since(checkpoint, batch_size)
    }

    fn master_write(
        &self,
        _rows: Vec<ReplicationWriteRow<TestDoc>>,
    ) -> BoxFuture<'_, Vec<WithDeleted<TestDoc>>> {
        Box::pin(async { Ok(vec![doc("phantom", "red")]) })
    }
}

#[tokio::test]
async fn conflict_for_unpushed_document_is_a_contract_violation() {
    init_tracing();
    let harness = ReplicationHarness::new();
    harness.write_fork(doc("a", "red")).await;
    let handler = Arc::new(PhantomConflictHandler {
        inner: harness.handler.clone(),
    });
    let state = ReplicationState::start(harness.input_with_handler(harness.config("phantom"), handler))
        .await
        .unwrap();
    let mut errors = state.errors();

    let err = timeout(WAIT_TIMEOUT, errors.recv())
        .await
        .expect("no error published")
        .unwrap();
    assert!(matches!(*err, ReplicationError::Contract(_)));
    assert!(wait_until(WAIT_TIMEOUT, || state.is_canceled()).await);
    assert_eq!(harness.fork_state("phantom"), None);

    state.cancel().await;
}
