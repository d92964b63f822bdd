use chrono::{DateTime, Utc};
use loom_llm::ContentPart;

use crate::types::{EntryIndex, EntryKind, SessionEntry, SessionHeader};

#[derive(Debug, thiserror::Error)]
pub enum EntryStoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("io failure: {0}")]
    Io(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

impl EntryStoreError {
    pub(crate) fn entry_not_found(index: EntryIndex) -> Self {
        Self::NotFound {
            resource: "entry",
            id: index.to_string(),
        }
    }
}

pub type EntryStoreResult<T> = Result<T, EntryStoreError>;

/// Replacement content for one pruned tool result.
#[derive(Clone, Debug, PartialEq)]
pub struct PruneMark {
    pub index: EntryIndex,
    pub content: Vec<ContentPart>,
}

/// Transactional append-only session log.
///
/// `append` never moves the leaf; callers decide which branch an entry extends
/// and then call `set_leaf`.
#[async_trait::async_trait]
pub trait EntryStore: Send + Sync {
    async fn header(&self) -> EntryStoreResult<SessionHeader>;

    /// Every entry in index order, across all branches.
    async fn entries(&self) -> EntryStoreResult<Vec<SessionEntry>>;

    async fn entry(&self, index: EntryIndex) -> EntryStoreResult<SessionEntry>;

    async fn leaf(&self) -> EntryStoreResult<Option<EntryIndex>>;

    async fn append(
        &self,
        parent: Option<EntryIndex>,
        kind: EntryKind,
    ) -> EntryStoreResult<SessionEntry>;

    async fn set_leaf(&self, leaf: Option<EntryIndex>) -> EntryStoreResult<()>;

    /// Replace the content of message entries and stamp them with `pruned_at`.
    ///
    /// Every mark is validated before any entry changes.
    async fn mark_pruned(
        &self,
        marks: Vec<PruneMark>,
        pruned_at: DateTime<Utc>,
    ) -> EntryStoreResult<()>;
}
