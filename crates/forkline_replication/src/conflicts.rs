//! Conflict resolution glue.

use forkline_protocol::{
    ConflictHandler, ConflictHandlerInput, ConflictResolution, Document, ResolvedConflict,
};

const RESOLVE_CONTEXT: &str = "replication-resolve-conflict";

/// Resolves a conflict reported by the master.
///
/// Returns `None` if the master already holds the pushed state, in which
/// case there is nothing to resolve.
pub(crate) fn resolve_conflict<T: Document>(
    handler: &dyn ConflictHandler<T>,
    input: ConflictHandlerInput<T>,
) -> Option<ResolvedConflict<T>> {
    if handler.is_equal(
        &input.real_master_state,
        &input.new_document_state,
        RESOLVE_CONTEXT,
    ) {
        return None;
    }
    let output = handler.resolve(&input, RESOLVE_CONTEXT);
    let resolution = ConflictResolution::classify(handler, &input, &output);
    Some(ResolvedConflict {
        input,
        output,
        resolution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use forkline_protocol::{ConflictPolicy, WithDeleted};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Item {
        id: String,
        color: String,
    }

    impl Document for Item {
        fn primary_key(&self) -> &str {
            &self.id
        }
    }

    fn item(color: &str) -> WithDeleted<Item> {
        WithDeleted::new(Item {
            id: "x".into(),
            color: color.into(),
        })
    }

    #[test]
    fn equal_states_need_no_resolution() {
        let input = ConflictHandlerInput {
            assumed_master_state: Some(item("red")),
            real_master_state: item("blue"),
            new_document_state: item("blue"),
        };
        assert!(resolve_conflict(&ConflictPolicy::MasterWins, input).is_none());
    }

    #[test]
    fn fork_wins_keeps_pushed_state() {
        let input = ConflictHandlerInput {
            assumed_master_state: Some(item("red")),
            real_master_state: item("green"),
            new_document_state: item("blue"),
        };
        let resolved = resolve_conflict(&ConflictPolicy::ForkWins, input).unwrap();
        assert_eq!(resolved.output, item("blue"));
        assert_eq!(resolved.resolution, ConflictResolution::KeepFork);
    }

    #[test]
    fn master_wins_accepts_master() {
        let input = ConflictHandlerInput {
            assumed_master_state: None,
            real_master_state: item("green"),
            new_document_state: item("blue"),
        };
        let resolved = resolve_conflict(&ConflictPolicy::MasterWins, input).unwrap();
        assert_eq!(resolved.output, item("green"));
        assert_eq!(resolved.resolution, ConflictResolution::AcceptMaster);
    }

    #[test]
    fn tombstones_take_part_in_resolution() {
        let input = ConflictHandlerInput {
            assumed_master_state: Some(item("red")),
            real_master_state: item("green"),
            new_document_state: item("red").into_tombstone(),
        };
        let resolved = resolve_conflict(&ConflictPolicy::ForkWins, input).unwrap();
        assert!(resolved.output.is_deleted());
    }
}
