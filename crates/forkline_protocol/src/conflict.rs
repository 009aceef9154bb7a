//! Conflict handler contract and built-in policies.

use crate::document::{Document, WithDeleted};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The three-way input of a conflict resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictHandlerInput<T> {
    /// What the fork assumed the master held when it pushed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assumed_master_state: Option<WithDeleted<T>>,
    /// What the master actually holds.
    pub real_master_state: WithDeleted<T>,
    /// The fork state that was pushed.
    pub new_document_state: WithDeleted<T>,
}

/// Resolves competing document states.
///
/// Implementations must be deterministic and side-effect free: the same
/// input always yields the same output, otherwise repeated retries would
/// oscillate instead of converging. The protocol treats the handler as
/// fully pluggable.
pub trait ConflictHandler<T: Document>: Send + Sync {
    /// Returns true if both states are equal for replication purposes.
    ///
    /// The engines use this to decide whether a fork state still has to be
    /// pushed or whether a master state still has to be written to the fork.
    fn is_equal(&self, a: &WithDeleted<T>, b: &WithDeleted<T>, _context: &str) -> bool {
        a == b
    }

    /// Resolves a conflict and returns the document state that wins.
    fn resolve(&self, input: &ConflictHandlerInput<T>, context: &str) -> WithDeleted<T>;
}

/// Built-in conflict policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConflictPolicy {
    /// The master state always wins.
    #[default]
    MasterWins,
    /// The pushed fork state wins (last write wins by `newDocumentState`).
    ForkWins,
}

impl<T: Document> ConflictHandler<T> for ConflictPolicy {
    fn resolve(&self, input: &ConflictHandlerInput<T>, _context: &str) -> WithDeleted<T> {
        match self {
            ConflictPolicy::MasterWins => input.real_master_state.clone(),
            ConflictPolicy::ForkWins => input.new_document_state.clone(),
        }
    }
}

/// A conflict handler backed by a closure.
///
/// Created with [`conflict_handler_fn`].
pub struct FnConflictHandler<F> {
    resolve: F,
}

impl<F> fmt::Debug for FnConflictHandler<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnConflictHandler").finish_non_exhaustive()
    }
}

/// Wraps a resolve closure into a [`ConflictHandler`] using structural equality.
pub fn conflict_handler_fn<T, F>(resolve: F) -> FnConflictHandler<F>
where
    T: Document,
    F: Fn(&ConflictHandlerInput<T>, &str) -> WithDeleted<T> + Send + Sync,
{
    FnConflictHandler { resolve }
}

impl<T, F> ConflictHandler<T> for FnConflictHandler<F>
where
    T: Document,
    F: Fn(&ConflictHandlerInput<T>, &str) -> WithDeleted<T> + Send + Sync,
{
    fn resolve(&self, input: &ConflictHandlerInput<T>, context: &str) -> WithDeleted<T> {
        (self.resolve)(input, context)
    }
}

/// How a resolved conflict relates to its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictResolution {
    /// The fork state was kept and will be pushed again.
    KeepFork,
    /// The master state was accepted.
    AcceptMaster,
    /// A new state was produced from both sides.
    Merged,
}

impl ConflictResolution {
    /// Classifies `output` against the input states using the handler's equality.
    pub fn classify<T: Document>(
        handler: &dyn ConflictHandler<T>,
        input: &ConflictHandlerInput<T>,
        output: &WithDeleted<T>,
    ) -> Self {
        if handler.is_equal(output, &input.real_master_state, "classify-resolution") {
            ConflictResolution::AcceptMaster
        } else if handler.is_equal(output, &input.new_document_state, "classify-resolution") {
            ConflictResolution::KeepFork
        } else {
            ConflictResolution::Merged
        }
    }
}

/// A conflict that was resolved on the fork.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedConflict<T> {
    /// The handler input.
    pub input: ConflictHandlerInput<T>,
    /// The handler output written to the fork.
    pub output: WithDeleted<T>,
    /// How the output relates to the input.
    pub resolution: ConflictResolution,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shape {
        id: String,
        color: String,
    }

    impl Document for Shape {
        fn primary_key(&self) -> &str {
            &self.id
        }
    }

    fn shape(color: &str) -> WithDeleted<Shape> {
        WithDeleted::new(Shape {
            id: "x".into(),
            color: color.into(),
        })
    }

    fn input() -> ConflictHandlerInput<Shape> {
        ConflictHandlerInput {
            assumed_master_state: Some(shape("red")),
            real_master_state: shape("green"),
            new_document_state: shape("blue"),
        }
    }

    #[test]
    fn policy_resolution() {
        let input = input();
        assert_eq!(ConflictPolicy::MasterWins.resolve(&input, "test"), shape("green"));
        assert_eq!(ConflictPolicy::ForkWins.resolve(&input, "test"), shape("blue"));
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::MasterWins);
    }

    #[test]
    fn default_equality_is_structural() {
        let policy = ConflictPolicy::MasterWins;
        assert!(ConflictHandler::<Shape>::is_equal(&policy, &shape("red"), &shape("red"), "t"));
        assert!(!ConflictHandler::<Shape>::is_equal(&policy, &shape("red"), &shape("blue"), "t"));
        assert!(!ConflictHandler::<Shape>::is_equal(
            &policy,
            &shape("red"),
            &shape("red").into_tombstone(),
            "t"
        ));
    }

    #[test]
    fn closure_handler() {
        let handler = conflict_handler_fn(|input: &ConflictHandlerInput<Shape>, _ctx: &str| {
            let mut merged = input.real_master_state.clone();
            merged.doc.color = format!(
                "{}+{}",
                input.real_master_state.doc.color, input.new_document_state.doc.color
            );
            merged
        });
        let output = handler.resolve(&input(), "test");
        assert_eq!(output.doc.color, "green+blue");
        assert_eq!(
            ConflictResolution::classify(&handler, &input(), &output),
            ConflictResolution::Merged
        );
    }

    #[test]
    fn classify_resolutions() {
        let policy = ConflictPolicy::ForkWins;
        let input = input();
        assert_eq!(
            ConflictResolution::classify(&policy, &input, &shape("blue")),
            ConflictResolution::KeepFork
        );
        assert_eq!(
            ConflictResolution::classify(&policy, &input, &shape("green")),
            ConflictResolution::AcceptMaster
        );
    }

    #[test]
    fn input_without_assumed_state_deserializes() {
        let input = ConflictHandlerInput {
            assumed_master_state: None,
            real_master_state: shape("green"),
            new_document_state: shape("blue"),
        };
        let json = serde_json::to_value(&input).unwrap();
        assert!(json.get("assumed_master_state").is_none());
        let back: ConflictHandlerInput<Shape> = serde_json::from_value(json).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn resolution_is_deterministic() {
        let input = input();
        for policy in [ConflictPolicy::MasterWins, ConflictPolicy::ForkWins] {
            assert_eq!(policy.resolve(&input, "a"), policy.resolve(&input, "b"));
        }
    }
}
