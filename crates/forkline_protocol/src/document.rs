//! Document states and revisions.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An application document that can be replicated.
///
/// Implementors are plain data: the protocol clones, compares and
/// serializes them, and identifies them by their primary key.
pub trait Document:
    Clone + fmt::Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Returns the primary key of the document.
    fn primary_key(&self) -> &str;
}

/// A document state plus its deletion flag.
///
/// Deletion is a tombstone: a deleted document keeps its data and is
/// replicated like any other state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithDeleted<T> {
    /// The application document.
    #[serde(flatten)]
    pub doc: T,
    /// Whether this state is a tombstone.
    #[serde(rename = "_deleted", default)]
    pub deleted: bool,
}

impl<T> WithDeleted<T> {
    /// Creates a live (non-deleted) document state.
    pub fn new(doc: T) -> Self {
        Self {
            doc,
            deleted: false,
        }
    }

    /// Creates a tombstone for the given document.
    pub fn tombstone(doc: T) -> Self {
        Self { doc, deleted: true }
    }

    /// Returns true if this state is a tombstone.
    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Turns this state into a tombstone, keeping the document data.
    pub fn into_tombstone(self) -> Self {
        Self {
            doc: self.doc,
            deleted: true,
        }
    }
}

impl<T: Document> WithDeleted<T> {
    /// Returns the primary key of the wrapped document.
    pub fn id(&self) -> &str {
        self.doc.primary_key()
    }
}

/// A revision assigned by a storage instance to a stored document state.
///
/// Revisions are rendered as `<height>-<hash>`. The height grows by one with
/// every write to the same document, the hash identifies the written content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Revision {
    /// Number of writes that led to this state.
    pub height: u64,
    /// Content hash of the written state.
    pub hash: String,
}

impl Revision {
    /// Creates a revision from its parts.
    pub fn new(height: u64, hash: impl Into<String>) -> Self {
        Self {
            height,
            hash: hash.into(),
        }
    }

    /// Creates the revision that follows `previous` for the given content hash.
    pub fn next(previous: Option<&Revision>, hash: impl Into<String>) -> Self {
        let height = previous.map(|rev| rev.height + 1).unwrap_or(1);
        Self::new(height, hash)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.height, self.hash)
    }
}

/// Error returned when parsing a malformed revision string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevisionParseError(String);

impl fmt::Display for RevisionParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid revision: {}", self.0)
    }
}

impl std::error::Error for RevisionParseError {}

impl FromStr for Revision {
    type Err = RevisionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (height, hash) = s
            .split_once('-')
            .ok_or_else(|| RevisionParseError(s.to_string()))?;
        let height = height
            .parse::<u64>()
            .map_err(|_| RevisionParseError(s.to_string()))?;
        if height == 0 || hash.is_empty() {
            return Err(RevisionParseError(s.to_string()));
        }
        Ok(Self::new(height, hash))
    }
}

impl TryFrom<String> for Revision {
    type Error = RevisionParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Revision> for String {
    fn from(rev: Revision) -> Self {
        rev.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Note {
        id: String,
        text: String,
    }

    impl Document for Note {
        fn primary_key(&self) -> &str {
            &self.id
        }
    }

    fn note(id: &str, text: &str) -> Note {
        Note {
            id: id.into(),
            text: text.into(),
        }
    }

    #[test]
    fn with_deleted_serializes_flat() {
        let state = WithDeleted::new(note("a", "hello"));
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"id": "a", "text": "hello", "_deleted": false})
        );

        let back: WithDeleted<Note> = serde_json::from_value(json).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn missing_deleted_flag_defaults_to_live() {
        let back: WithDeleted<Note> =
            serde_json::from_value(serde_json::json!({"id": "a", "text": "x"})).unwrap();
        assert!(!back.is_deleted());
        assert_eq!(back.id(), "a");
    }

    #[test]
    fn tombstone_keeps_data() {
        let state = WithDeleted::new(note("a", "hello")).into_tombstone();
        assert!(state.is_deleted());
        assert_eq!(state.doc.text, "hello");
        assert_eq!(state, WithDeleted::tombstone(note("a", "hello")));
    }

    #[test]
    fn revision_display_and_parse() {
        let rev = Revision::new(3, "abcdef");
        assert_eq!(rev.to_string(), "3-abcdef");
        assert_eq!("3-abcdef".parse::<Revision>().unwrap(), rev);

        assert!("abc".parse::<Revision>().is_err());
        assert!("0-abc".parse::<Revision>().is_err());
        assert!("x-abc".parse::<Revision>().is_err());
        assert!("2-".parse::<Revision>().is_err());
    }

    #[test]
    fn revision_next_increments_height() {
        let first = Revision::next(None, "h1");
        assert_eq!(first.height, 1);

        let second = Revision::next(Some(&first), "h2");
        assert_eq!(second.height, 2);
        assert_eq!(second.hash, "h2");
    }

    #[test]
    fn revision_serializes_as_string() {
        let json = serde_json::to_value(Revision::new(7, "ff")).unwrap();
        assert_eq!(json, serde_json::json!("7-ff"));
    }
}
