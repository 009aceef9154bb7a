//! Convergence of forks and master under concurrent writes.

use forkline_protocol::{ConflictHandler, ConflictPolicy};
use forkline_testkit::prelude::*;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

#[tokio::test]
async fn two_forks_converge_through_master() {
    init_tracing();
    let left = ReplicationHarness::new();
    let right = left.peer();

    left.write_fork(doc("x", "red")).await;
    right.write_fork(doc("y", "blue")).await;
    let left_state = left.start("left").await;
    let right_state = right.start("right").await;

    left.write_fork(doc("z", "green")).await;
    right.write_fork(doc("z", "yellow")).await;

    assert!(
        wait_until(WAIT_TIMEOUT, || {
            left.master.len() == 3 && left.is_converged() && right.is_converged()
        })
        .await
    );
    let z = left.master_state("z").unwrap();
    assert!(z == doc("z", "green") || z == doc("z", "yellow"));
    assert_eq!(left.fork_state("z"), Some(z.clone()));
    assert_eq!(right.fork_state("z"), Some(z));

    left_state.cancel().await;
    right_state.cancel().await;
}

fn run_writes(ops: Vec<WriteOp>, fork_wins: bool) -> (bool, bool) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    runtime.block_on(async move {
        let policy = if fork_wins {
            ConflictPolicy::ForkWins
        } else {
            ConflictPolicy::MasterWins
        };
        let conflict_handler: Arc<dyn ConflictHandler<TestDoc>> = Arc::new(policy);
        let harness = ReplicationHarness::with_conflict_handler(conflict_handler);

        let (before, after) = ops.split_at(ops.len() / 3);
        for op in before {
            harness.apply(op).await;
        }
        let state = harness.start("convergence").await;
        for op in after {
            harness.apply(op).await;
            tokio::task::yield_now().await;
        }
        state.await_idle().await.unwrap();
        let converged = harness.wait_converged().await;

        let written: BTreeSet<&str> = ops
            .iter()
            .map(|op| match op {
                WriteOp::Put { id, .. } | WriteOp::Delete { id, .. } => id.as_str(),
            })
            .collect();
        let nothing_lost = written
            .iter()
            .all(|id| harness.master.get(id).is_some() && harness.fork.get(id).is_some());

        state.cancel().await;
        (converged, nothing_lost)
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn concurrent_writes_converge(ops in write_sequence_strategy(12), fork_wins in any::<bool>()) {
        let (converged, nothing_lost) = run_writes(ops, fork_wins);
        prop_assert!(converged);
        prop_assert!(nothing_lost);
    }
}
