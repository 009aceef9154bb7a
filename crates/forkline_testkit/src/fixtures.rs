//! Test fixtures and replication helpers.
//!
//! Provides a test document type and a harness that wires a fork, a meta
//! store and a master together in memory.

use forkline_protocol::{
    ConflictHandler, ConflictPolicy, Document, ReplicationMetaRow, WithDeleted,
};
use forkline_replication::{
    ReplicationConfig, ReplicationHandler, ReplicationInput, ReplicationState, RetryConfig,
    StorageReplicationHandler,
};
use forkline_storage::{
    BulkWriteRow, MemoryStorage, StorageCheckpoint, StorageInstance, StoredDocument,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Context of writes performed by the simulated application.
pub const APP_WRITE_CONTEXT: &str = "application-write";

/// Default timeout of [`wait_until`] in tests.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// A minimal replicated document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TestDoc {
    /// Primary key.
    pub id: String,
    /// Payload.
    pub color: String,
}

impl Document for TestDoc {
    fn primary_key(&self) -> &str {
        &self.id
    }
}

/// Creates a live document state.
pub fn doc(id: &str, color: &str) -> WithDeleted<TestDoc> {
    WithDeleted::new(TestDoc {
        id: id.to_string(),
        color: color.to_string(),
    })
}

/// Creates a tombstone.
pub fn tombstone(id: &str, color: &str) -> WithDeleted<TestDoc> {
    doc(id, color).into_tombstone()
}

/// Writes `state` over whatever `storage` currently holds.
///
/// Retries when a concurrent writer moved the document in between.
pub async fn write_doc(
    storage: &dyn StorageInstance<TestDoc>,
    state: WithDeleted<TestDoc>,
    context: &str,
) -> StoredDocument<TestDoc> {
    let id = state.id().to_string();
    loop {
        let current = storage
            .find_documents_by_id(vec![id.clone()], true)
            .await
            .expect("Failed to read document");
        let row = match current.get(&id) {
            Some(stored) => BulkWriteRow::update(stored.clone(), state.clone()),
            None => BulkWriteRow::insert(state.clone()),
        };
        let mut response = storage
            .bulk_write(vec![row], context)
            .await
            .expect("Failed to write document");
        if let Some(stored) = response.success.remove(&id) {
            return stored;
        }
    }
}

/// Polls `condition` until it holds or `timeout` elapses.
///
/// Returns whether the condition held.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// A fork, its meta store and a master, all in memory.
///
/// Must be created inside a tokio runtime.
pub struct ReplicationHarness {
    /// The local fork.
    pub fork: Arc<MemoryStorage<TestDoc>>,
    /// The replication meta store.
    pub meta: Arc<MemoryStorage<ReplicationMetaRow<TestDoc>>>,
    /// The master storage.
    pub master: Arc<MemoryStorage<TestDoc>>,
    /// The master adapter.
    pub handler: Arc<StorageReplicationHandler<TestDoc>>,
    /// Conflict handler used by the fork and the master.
    pub conflict_handler: Arc<dyn ConflictHandler<TestDoc>>,
}

impl ReplicationHarness {
    /// Creates a harness resolving conflicts with [`ConflictPolicy::MasterWins`].
    pub fn new() -> Self {
        Self::with_conflict_handler(Arc::new(ConflictPolicy::MasterWins))
    }

    /// Creates a harness with a custom conflict handler.
    pub fn with_conflict_handler(conflict_handler: Arc<dyn ConflictHandler<TestDoc>>) -> Self {
        let master = Arc::new(MemoryStorage::new("master"));
        let handler = Arc::new(StorageReplicationHandler::new(
            master.clone(),
            Arc::clone(&conflict_handler),
        ));
        Self {
            fork: Arc::new(MemoryStorage::new("fork")),
            meta: Arc::new(MemoryStorage::new("meta")),
            master,
            handler,
            conflict_handler,
        }
    }

    /// Creates a second fork replicating with the same master.
    pub fn peer(&self) -> Self {
        Self {
            fork: Arc::new(MemoryStorage::new("peer-fork")),
            meta: Arc::new(MemoryStorage::new("peer-meta")),
            master: Arc::clone(&self.master),
            handler: Arc::clone(&self.handler),
            conflict_handler: Arc::clone(&self.conflict_handler),
        }
    }

    /// Returns a configuration with short retry delays.
    pub fn config(&self, identifier: &str) -> ReplicationConfig {
        ReplicationConfig::new(identifier).with_retry(
            RetryConfig::new(5)
                .with_initial_delay(Duration::from_millis(10))
                .with_max_delay(Duration::from_millis(50))
                .with_jitter(false),
        )
    }

    /// Builds a replication input against the storage master.
    pub fn input(&self, identifier: &str) -> ReplicationInput<TestDoc, StorageCheckpoint> {
        self.input_with(self.config(identifier))
    }

    /// Builds a replication input with a custom configuration.
    pub fn input_with(
        &self,
        config: ReplicationConfig,
    ) -> ReplicationInput<TestDoc, StorageCheckpoint> {
        self.input_with_handler(config, self.handler.clone())
    }

    /// Builds a replication input with a custom master handler.
    pub fn input_with_handler(
        &self,
        config: ReplicationConfig,
        handler: Arc<dyn ReplicationHandler<TestDoc, StorageCheckpoint>>,
    ) -> ReplicationInput<TestDoc, StorageCheckpoint> {
        ReplicationInput::new(
            config,
            self.fork.clone(),
            self.meta.clone(),
            handler,
            Arc::clone(&self.conflict_handler),
        )
    }

    /// Starts a replication with the default configuration.
    pub async fn start(&self, identifier: &str) -> ReplicationState<TestDoc, StorageCheckpoint> {
        ReplicationState::start(self.input(identifier))
            .await
            .expect("Failed to start replication")
    }

    /// Writes a state to the fork as the application would.
    pub async fn write_fork(&self, state: WithDeleted<TestDoc>) -> StoredDocument<TestDoc> {
        write_doc(self.fork.as_ref(), state, APP_WRITE_CONTEXT).await
    }

    /// Writes a state to the master as another client would.
    pub async fn write_master(&self, state: WithDeleted<TestDoc>) -> StoredDocument<TestDoc> {
        write_doc(self.master.as_ref(), state, APP_WRITE_CONTEXT).await
    }

    /// Returns the fork state of `id`, tombstones included.
    pub fn fork_state(&self, id: &str) -> Option<WithDeleted<TestDoc>> {
        self.fork.get(id).map(|stored| stored.data)
    }

    /// Returns the master state of `id`, tombstones included.
    pub fn master_state(&self, id: &str) -> Option<WithDeleted<TestDoc>> {
        self.master.get(id).map(|stored| stored.data)
    }

    /// Returns true if fork and master hold the same live documents.
    pub fn is_converged(&self) -> bool {
        sorted(self.fork.active_documents()) == sorted(self.master.active_documents())
    }

    /// Waits until fork and master hold the same live documents.
    pub async fn wait_converged(&self) -> bool {
        wait_until(WAIT_TIMEOUT, || self.is_converged()).await
    }
}

impl Default for ReplicationHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn sorted(mut documents: Vec<WithDeleted<TestDoc>>) -> Vec<WithDeleted<TestDoc>> {
    documents.sort_by(|a, b| a.doc.id.cmp(&b.doc.id));
    documents
}
