//! Tracks running replications by identifier.

use crate::config::ReplicationInput;
use crate::error::{ReplicationError, ReplicationResult};
use crate::state::ReplicationState;
use forkline_protocol::{Checkpoint, Document};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

/// Refuses to start two replications with the same identifier.
///
/// Two live replications sharing an identifier would share meta rows and
/// checkpoints. An identifier is released when its state is cancelled or
/// dropped.
#[derive(Debug, Clone, Default)]
pub struct ReplicationRegistry {
    running: Arc<Mutex<HashSet<String>>>,
}

impl ReplicationRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a replication unless its identifier is already running.
    pub async fn start<T: Document, C: Checkpoint>(
        &self,
        input: ReplicationInput<T, C>,
    ) -> ReplicationResult<ReplicationState<T, C>> {
        let registration = self.register(&input.config.identifier)?;
        ReplicationState::start_registered(input, Some(registration)).await
    }

    /// Returns true if a replication with `identifier` is running.
    pub fn is_running(&self, identifier: &str) -> bool {
        self.running.lock().contains(identifier)
    }

    /// Returns the number of running replications.
    pub fn len(&self) -> usize {
        self.running.lock().len()
    }

    /// Returns true if no replication is running.
    pub fn is_empty(&self) -> bool {
        self.running.lock().is_empty()
    }

    fn register(&self, identifier: &str) -> ReplicationResult<Registration> {
        if !self.running.lock().insert(identifier.to_string()) {
            return Err(ReplicationError::DuplicateIdentifier(identifier.to_string()));
        }
        debug!(identifier, "replication registered");
        Ok(Registration {
            running: Arc::clone(&self.running),
            identifier: identifier.to_string(),
        })
    }
}

/// Holds an identifier in its registry until dropped.
pub(crate) struct Registration {
    running: Arc<Mutex<HashSet<String>>>,
    identifier: String,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.running.lock().remove(&self.identifier);
        debug!(identifier = %self.identifier, "replication unregistered");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_identifiers_are_refused() {
        let registry = ReplicationRegistry::new();
        let first = registry.register("todos").unwrap();
        assert!(registry.is_running("todos"));
        assert!(matches!(
            registry.register("todos"),
            Err(ReplicationError::DuplicateIdentifier(id)) if id == "todos"
        ));

        let other = registry.register("notes").unwrap();
        assert_eq!(registry.len(), 2);

        drop(first);
        assert!(!registry.is_running("todos"));
        assert!(registry.register("todos").is_ok());
        drop(other);
    }

    #[test]
    fn clones_share_state() {
        let registry = ReplicationRegistry::new();
        let clone = registry.clone();
        let _held = registry.register("todos").unwrap();
        assert!(clone.is_running("todos"));
        assert!(!clone.is_empty());
    }
}
