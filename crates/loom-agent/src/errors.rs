use loom_store::{EntryIndex, EntryStoreError};
use thiserror::Error;

/// An operation overlapped with the single in-flight completion.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum ConcurrencyError {
    #[error("a completion is already streaming")]
    PromptWhileStreaming,
    #[error("entry {index} is on the branch of the active stream")]
    BranchIntoActiveStream { index: EntryIndex },
    #[error("branch navigation is in progress")]
    NavigationInProgress,
    #[error("cannot append session entries while a completion is streaming")]
    AppendWhileStreaming,
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Concurrency(#[from] ConcurrencyError),
    #[error("session is closed")]
    Closed,
    #[error("unknown entry: {0}")]
    UnknownEntry(EntryIndex),
    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum WorkerError {
    /// The parent answered the proxied call with an error.
    #[error("proxy call failed: {0}")]
    CallFailed(String),
    #[error("proxy call {call_id} was cancelled")]
    Cancelled { call_id: String },
    #[error("proxy call {call_id} timed out after {timeout_ms}ms")]
    TimedOut { call_id: String, timeout_ms: u64 },
    #[error("worker channel closed")]
    ChannelClosed,
    #[error("invalid worker message: {0}")]
    Validation(String),
}

/// Top-level error type for the loom-agent crate.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("transport call aborted")]
    TransportAborted,
    #[error("transport error: {0}")]
    Transport(String),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error("failed to spawn subprocess: {0}")]
    ProcessSpawn(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("unknown tool: {0}")]
    UnknownTool(String),
    #[error("tool validation failed: {0}")]
    ToolValidation(String),
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error(transparent)]
    Store(#[from] EntryStoreError),
    #[error(transparent)]
    Llm(#[from] loom_llm::SDKError),
}

impl AgentError {
    pub fn session_closed() -> Self {
        Self::Session(SessionError::Closed)
    }

    pub fn is_concurrency(&self) -> bool {
        matches!(self, Self::Session(SessionError::Concurrency(_)))
    }
}

impl From<ConcurrencyError> for AgentError {
    fn from(value: ConcurrencyError) -> Self {
        Self::Session(SessionError::Concurrency(value))
    }
}
