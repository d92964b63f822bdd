use chrono::{DateTime, Utc};
use loom_llm::{ContentPart, Message, Role};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position of an entry in the session arena. Indices are assigned in append
/// order and never reused.
pub type EntryIndex = usize;

pub const SESSION_FORMAT_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub id: String,
    pub version: u32,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_session: Option<String>,
}

impl SessionHeader {
    pub fn new() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            version: SESSION_FORMAT_VERSION,
            created_at: Utc::now(),
            cwd: None,
            parent_session: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_parent_session(mut self, parent: impl Into<String>) -> Self {
        self.parent_session = Some(parent.into());
        self
    }
}

impl Default for SessionHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryKind {
    Message {
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pruned_at: Option<DateTime<Utc>>,
    },
    CustomMessage {
        custom_type: String,
        content: Vec<ContentPart>,
        #[serde(default)]
        display: bool,
    },
    BranchSummary {
        summary: String,
        /// Entry the abandoned branch was leaving from.
        from_index: Option<EntryIndex>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        read_files: Vec<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        modified_files: Vec<String>,
    },
    Compaction {
        summary: String,
        first_kept_index: EntryIndex,
        tokens_before: u64,
    },
    ThinkingLevelChange {
        level: String,
    },
    ModelChange {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider: Option<String>,
        model: String,
    },
    Custom {
        custom_type: String,
        #[serde(default)]
        data: Value,
    },
    Label {
        target: EntryIndex,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        label: Option<String>,
    },
}

impl EntryKind {
    pub fn message(message: Message) -> Self {
        Self::Message {
            message,
            pruned_at: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::CustomMessage { .. } => "custom_message",
            Self::BranchSummary { .. } => "branch_summary",
            Self::Compaction { .. } => "compaction",
            Self::ThinkingLevelChange { .. } => "thinking_level_change",
            Self::ModelChange { .. } => "model_change",
            Self::Custom { .. } => "custom",
            Self::Label { .. } => "label",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub index: EntryIndex,
    pub parent: Option<EntryIndex>,
    pub timestamp: DateTime<Utc>,
    pub kind: EntryKind,
}

impl SessionEntry {
    pub fn message(&self) -> Option<&Message> {
        match &self.kind {
            EntryKind::Message { message, .. } => Some(message),
            _ => None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        self.message().map(|message| message.role)
    }

    pub fn is_tool_result(&self) -> bool {
        self.role() == Some(Role::ToolResult)
    }

    pub fn pruned_at(&self) -> Option<DateTime<Utc>> {
        match &self.kind {
            EntryKind::Message { pruned_at, .. } => *pruned_at,
            _ => None,
        }
    }
}
