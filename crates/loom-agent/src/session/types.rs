use loom_llm::{Message, Usage};
use loom_store::EntryIndex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Idle,
    Streaming,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Streaming => "STREAMING",
            Self::Closed => "CLOSED",
        }
    }

    pub fn can_transition_to(&self, next: &SessionState) -> bool {
        if self == next {
            return true;
        }
        if *next == SessionState::Closed {
            return true;
        }
        match self {
            SessionState::Idle => matches!(next, SessionState::Streaming),
            SessionState::Streaming => matches!(next, SessionState::Idle),
            SessionState::Closed => false,
        }
    }
}

impl Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueKind {
    /// Delivered at the next turn boundary, between tool rounds.
    Steer,
    /// Delivered once the agent would otherwise stop.
    FollowUp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedMessage {
    pub kind: QueueKind,
    pub text: String,
}

/// What `prompt_with` does when a completion is already streaming.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamingBehavior {
    #[default]
    Reject,
    Steer,
    FollowUp,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PromptOptions {
    pub streaming_behavior: StreamingBehavior,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptStatus {
    Completed,
    Aborted,
    /// The prompt was queued behind an active stream instead of running.
    Queued,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PromptOutcome {
    pub status: PromptStatus,
    /// User inputs processed, queued deliveries included.
    pub turns: usize,
    pub last_message: Option<Message>,
}

impl PromptOutcome {
    pub(super) fn queued() -> Self {
        Self {
            status: PromptStatus::Queued,
            turns: 0,
            last_message: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BranchOutcome {
    /// Leaf after navigation.
    pub leaf: Option<EntryIndex>,
    pub summary_index: Option<EntryIndex>,
    pub abandoned: usize,
    /// Summarization was aborted; the leaf did not move.
    pub cancelled: bool,
    /// Set when summarization failed and a placeholder summary was stored.
    pub summary_error: Option<String>,
}

/// A user turn that can serve as a branch point.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserMessageRef {
    pub index: EntryIndex,
    pub text: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct SessionStats {
    pub session_id: String,
    pub entry_count: usize,
    pub branch_length: usize,
    pub entries_by_kind: BTreeMap<String, usize>,
    pub user_messages: usize,
    pub assistant_messages: usize,
    pub tool_results: usize,
    pub pruned_tool_results: usize,
    /// Estimated tokens of the context the next completion would send.
    pub context_tokens: u64,
    pub usage: Usage,
}
