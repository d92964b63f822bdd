use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

pub const MAX_RECENT_TOOLS: usize = 5;
pub const MAX_RECENT_OUTPUT_LINES: usize = 8;
const ARGS_PREVIEW_CHARS: usize = 80;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// A finished tool execution as shown in the progress view.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ToolActivity {
    pub tool: String,
    pub args_preview: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub is_error: bool,
}

/// Live snapshot of one delegated agent.
///
/// `recent_tools` and `recent_output` are newest first. `recent_output` mirrors
/// the message being streamed and is replaced on every update.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AgentProgress {
    pub index: usize,
    pub task: String,
    pub status: ProgressStatus,
    pub current_tool: Option<String>,
    pub current_tool_args: Option<String>,
    pub current_tool_started_at: Option<DateTime<Utc>>,
    pub recent_tools: VecDeque<ToolActivity>,
    pub recent_output: Vec<String>,
    pub tool_count: usize,
    pub tokens: u64,
    pub duration_ms: u64,
}

impl AgentProgress {
    pub fn new(index: usize, task: impl Into<String>) -> Self {
        Self {
            index,
            task: task.into(),
            ..Self::default()
        }
    }

    pub fn tool_started(&mut self, tool: &str, args: &Value) {
        self.current_tool = Some(tool.to_string());
        self.current_tool_args = Some(args_preview(args));
        self.current_tool_started_at = Some(Utc::now());
    }

    pub fn tool_finished(&mut self, tool: &str, is_error: bool) {
        let now = Utc::now();
        let args_preview = self.current_tool_args.take().unwrap_or_default();
        let started_at = self.current_tool_started_at.take().unwrap_or(now);
        self.current_tool = None;
        self.tool_count += 1;
        self.recent_tools.push_front(ToolActivity {
            tool: tool.to_string(),
            args_preview,
            started_at,
            ended_at: now,
            is_error,
        });
        self.recent_tools.truncate(MAX_RECENT_TOOLS);
    }

    pub fn replace_output(&mut self, text: &str) {
        self.recent_output = text
            .lines()
            .rev()
            .filter(|line| !line.trim().is_empty())
            .take(MAX_RECENT_OUTPUT_LINES)
            .map(str::to_string)
            .collect();
    }
}

fn args_preview(args: &Value) -> String {
    let text = match args {
        Value::Null => return String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= ARGS_PREVIEW_CHARS {
        return text;
    }
    let mut preview: String = text.chars().take(ARGS_PREVIEW_CHARS).collect();
    preview.push('…');
    preview
}
