//! Digest of an abandoned branch plus a ledger of the files it touched.

use std::collections::{BTreeSet, HashSet};
use std::fmt::Write as _;
use std::time::Duration;

use loom_llm::{
    AbortSignal, CompletionOptions, CompletionTransport, ContentPart, Message, Request, Role,
    SDKError, StopReason, Usage,
};
use loom_store::{EntryKind, SessionEntry};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::BranchSummaryConfig;

pub const NOTHING_TO_SUMMARIZE: &str = "No content to summarize";
/// Stored in place of a summary when the transport fails.
pub const NO_SUMMARY_PLACEHOLDER: &str = "(no summary)";

const SUMMARY_SYSTEM_PROMPT: &str = "You are a context summarization assistant. Read the conversation between a user and an AI coding assistant and produce only the requested summary. Do not continue the conversation.";

pub const DEFAULT_SUMMARY_INSTRUCTIONS: &str = "The conversation above is a branch the user has stepped away from. Summarize it so the work can continue on another branch without losing context.\n\nUse this format:\n\n## Goal\n[What the user was trying to accomplish on this branch]\n\n## Progress\n- [What was done, including decisions and their rationale]\n\n## Open Ends\n- [Unfinished work, errors, or questions that were left behind]\n\nBe concise. Preserve exact file paths, function names, and error messages.";

const PATH_KEYS: [&str; 2] = ["path", "file_path"];

/// Files touched by tool calls, grouped by operation.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FileOperations {
    pub read: BTreeSet<String>,
    pub written: BTreeSet<String>,
    pub edited: BTreeSet<String>,
}

impl FileOperations {
    pub fn record(&mut self, tool_name: &str, arguments: &Value) {
        let Some(path) = PATH_KEYS
            .iter()
            .find_map(|key| arguments.get(*key).and_then(Value::as_str))
            .filter(|path| !path.is_empty())
        else {
            return;
        };
        let set = match tool_name {
            "read" | "read_file" | "grep" | "find" | "ls" => &mut self.read,
            "write" | "write_file" => &mut self.written,
            "edit" | "edit_file" => &mut self.edited,
            _ => return,
        };
        set.insert(path.to_string());
    }

    /// Files only read, never written or edited.
    pub fn read_files(&self) -> Vec<String> {
        self.read
            .iter()
            .filter(|path| !self.written.contains(*path) && !self.edited.contains(*path))
            .cloned()
            .collect()
    }

    pub fn edited_files(&self) -> Vec<String> {
        self.edited.iter().cloned().collect()
    }

    /// Written but never edited.
    pub fn created_files(&self) -> Vec<String> {
        self.written.difference(&self.edited).cloned().collect()
    }

    pub fn modified_files(&self) -> Vec<String> {
        self.written.union(&self.edited).cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.written.is_empty() && self.edited.is_empty()
    }

    /// Deterministic ledger appended to every successful summary.
    pub fn render_suffix(&self) -> String {
        let mut out = String::new();
        for (tag, files) in [
            ("read-files", self.read_files()),
            ("edited-files", self.edited_files()),
            ("created-files", self.created_files()),
        ] {
            if files.is_empty() {
                continue;
            }
            let _ = write!(out, "\n\n<{tag}>\n{}\n</{tag}>", files.join("\n"));
        }
        out
    }
}

/// Text extracted from an abandoned slice.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BranchContent {
    pub conversation: String,
    pub previous_summaries: Vec<String>,
    pub file_ops: FileOperations,
}

impl BranchContent {
    pub fn has_text(&self) -> bool {
        !self.conversation.trim().is_empty()
    }

    fn previous_context(&self) -> Option<String> {
        if self.previous_summaries.is_empty() {
            return None;
        }
        Some(format!(
            "[Previous context: {}]",
            self.previous_summaries.join(" | ")
        ))
    }
}

fn push_block(out: &mut String, label: &str, text: &str) {
    if text.trim().is_empty() {
        return;
    }
    if !out.is_empty() {
        out.push_str("\n\n");
    }
    let _ = write!(out, "[{label}]: {text}");
}

fn render_tool_calls(message: &Message) -> String {
    message
        .tool_calls()
        .iter()
        .map(|call| {
            let args = match call.arguments.as_object() {
                Some(object) => object
                    .iter()
                    .map(|(key, value)| format!("{key}={value}"))
                    .collect::<Vec<_>>()
                    .join(", "),
                None => call.arguments.to_string(),
            };
            format!("{}({args})", call.name)
        })
        .collect::<Vec<_>>()
        .join("; ")
}

fn content_text(content: &[ContentPart]) -> String {
    content
        .iter()
        .filter_map(|part| match part {
            ContentPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Extract conversation text and file operations from `entries`, oldest first.
///
/// Tool results are skipped because the paired assistant call already carries
/// their context; only their error flag is consulted so failed calls do not
/// enter the file ledger. Compaction entries never feed back into a summary.
pub fn collect_branch_content(entries: &[SessionEntry]) -> BranchContent {
    let failed_calls: HashSet<&str> = entries
        .iter()
        .filter_map(SessionEntry::message)
        .filter(|message| message.role == Role::ToolResult && message.is_error)
        .filter_map(|message| message.tool_call_id.as_deref())
        .collect();

    let mut content = BranchContent::default();
    for entry in entries {
        match &entry.kind {
            EntryKind::Message { message, .. } => match message.role {
                Role::ToolResult => {}
                Role::User => push_block(&mut content.conversation, "User", &message.text()),
                Role::Assistant => {
                    push_block(&mut content.conversation, "Assistant", &message.text());
                    if message.has_tool_calls() {
                        push_block(
                            &mut content.conversation,
                            "Assistant tool calls",
                            &render_tool_calls(message),
                        );
                    }
                    for call in message.tool_calls() {
                        if !failed_calls.contains(call.id.as_str()) {
                            content.file_ops.record(&call.name, &call.arguments);
                        }
                    }
                }
            },
            EntryKind::CustomMessage {
                custom_type,
                content: parts,
                ..
            } => push_block(
                &mut content.conversation,
                &format!("Custom:{custom_type}"),
                &content_text(parts),
            ),
            EntryKind::BranchSummary { summary, .. } => {
                if !summary.trim().is_empty() {
                    content.previous_summaries.push(summary.trim().to_string());
                }
            }
            EntryKind::Compaction { .. }
            | EntryKind::ThinkingLevelChange { .. }
            | EntryKind::ModelChange { .. }
            | EntryKind::Custom { .. }
            | EntryKind::Label { .. } => {}
        }
    }
    content
}

#[derive(Clone, Debug, PartialEq)]
pub struct BranchSummary {
    pub summary: String,
    pub read_files: Vec<String>,
    pub modified_files: Vec<String>,
    pub usage: Usage,
}

/// Terminal result of summarizing a branch. None of these is an error for the
/// caller.
#[derive(Clone, Debug, PartialEq)]
pub enum BranchSummaryOutcome {
    Summarized(BranchSummary),
    NothingToSummarize,
    Cancelled,
    Failed {
        error: String,
        file_ops: FileOperations,
    },
}

/// Model settings a summary request inherits from its session.
#[derive(Clone, Debug)]
pub struct SummaryTarget {
    pub model: String,
    pub provider: Option<String>,
    pub api_key: Option<String>,
    /// How long the transport may keep running after an abort.
    pub abort_grace_ms: u64,
}

impl Default for SummaryTarget {
    fn default() -> Self {
        Self {
            model: String::new(),
            provider: None,
            api_key: None,
            abort_grace_ms: 5_000,
        }
    }
}

pub fn build_summary_prompt(content: &BranchContent, config: &BranchSummaryConfig) -> String {
    let instructions = config
        .custom_instructions
        .as_deref()
        .filter(|text| !text.trim().is_empty())
        .unwrap_or(DEFAULT_SUMMARY_INSTRUCTIONS);
    let mut conversation = String::new();
    if let Some(previous) = content.previous_context() {
        conversation.push_str(&previous);
        conversation.push_str("\n\n");
    }
    conversation.push_str(&content.conversation);
    format!("<conversation>\n{conversation}\n</conversation>\n\n{instructions}")
}

/// Summarize an abandoned slice of entries.
///
/// Slices without conversation text resolve to
/// [`BranchSummaryOutcome::NothingToSummarize`] without calling the transport.
pub async fn summarize_branch(
    transport: &dyn CompletionTransport,
    entries: &[SessionEntry],
    target: &SummaryTarget,
    config: &BranchSummaryConfig,
    signal: AbortSignal,
) -> BranchSummaryOutcome {
    let content = collect_branch_content(entries);
    if !content.has_text() {
        debug!(entries = entries.len(), "abandoned branch has no text to summarize");
        return BranchSummaryOutcome::NothingToSummarize;
    }
    if signal.is_aborted() {
        return BranchSummaryOutcome::Cancelled;
    }

    let request = Request {
        model: config.model.clone().unwrap_or_else(|| target.model.clone()),
        provider: target.provider.clone(),
        system_prompt: Some(SUMMARY_SYSTEM_PROMPT.to_string()),
        messages: vec![Message::user(build_summary_prompt(&content, config))],
        ..Request::default()
    };
    let options = CompletionOptions {
        api_key: target.api_key.clone(),
        signal: signal.clone(),
        max_tokens: Some(config.max_tokens),
    };

    let call = transport.complete(request, options);
    tokio::pin!(call);
    let finished = tokio::select! {
        result = &mut call => Some(result),
        _ = signal.aborted() => None,
    };
    let result = match finished {
        Some(result) => result,
        None => {
            let grace = Duration::from_millis(target.abort_grace_ms);
            match tokio::time::timeout(grace, &mut call).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("summary transport ignored abort within grace period");
                    return BranchSummaryOutcome::Cancelled;
                }
            }
        }
    };

    let response = match result {
        Ok(response) => response,
        Err(SDKError::Aborted) => return BranchSummaryOutcome::Cancelled,
        Err(error) => {
            warn!(error = %error, "branch summary failed");
            return BranchSummaryOutcome::Failed {
                error: error.to_string(),
                file_ops: content.file_ops,
            };
        }
    };

    match response.stop_reason {
        StopReason::Aborted => BranchSummaryOutcome::Cancelled,
        StopReason::Error => {
            let error = response
                .error_message
                .clone()
                .unwrap_or_else(|| "summarization failed".to_string());
            warn!(error = %error, "branch summary failed");
            BranchSummaryOutcome::Failed {
                error,
                file_ops: content.file_ops,
            }
        }
        _ if signal.is_aborted() => BranchSummaryOutcome::Cancelled,
        _ => {
            let text = response.text();
            let text = if text.trim().is_empty() {
                NO_SUMMARY_PLACEHOLDER.to_string()
            } else {
                text.trim().to_string()
            };
            BranchSummaryOutcome::Summarized(BranchSummary {
                summary: format!("{text}{}", content.file_ops.render_suffix()),
                read_files: content.file_ops.read_files(),
                modified_files: content.file_ops.modified_files(),
                usage: response.usage,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use loom_llm::{Response, ToolCallData};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        reply: Result<Response, SDKError>,
        calls: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        fn new(reply: Result<Response, SDKError>) -> Self {
            Self {
                reply,
                calls: AtomicUsize::new(0),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl CompletionTransport for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn complete(
            &self,
            request: Request,
            _options: CompletionOptions,
        ) -> Result<Response, SDKError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.prompts
                .lock()
                .expect("prompts mutex")
                .push(request.messages[0].text());
            self.reply.clone()
        }
    }

    fn reply(text: &str, stop_reason: StopReason) -> Response {
        Response {
            message: Message::assistant(text),
            stop_reason,
            usage: Usage::default(),
            error_message: None,
        }
    }

    fn entries(kinds: Vec<EntryKind>) -> Vec<SessionEntry> {
        kinds
            .into_iter()
            .enumerate()
            .map(|(index, kind)| SessionEntry {
                index,
                parent: index.checked_sub(1),
                timestamp: Utc::now(),
                kind,
            })
            .collect()
    }

    fn call(id: &str, name: &str, path: &str) -> ContentPart {
        ContentPart::tool_call(ToolCallData {
            id: id.to_string(),
            name: name.to_string(),
            arguments: serde_json::json!({ "path": path }),
        })
    }

    fn working_branch() -> Vec<SessionEntry> {
        entries(vec![
            EntryKind::message(Message::user("fix the parser")),
            EntryKind::message(Message::assistant_parts(
                vec![
                    ContentPart::text("looking"),
                    call("c1", "read", "src/parser.rs"),
                    call("c2", "edit", "src/parser.rs"),
                    call("c3", "write", "src/new.rs"),
                    call("c4", "read", "src/lib.rs"),
                    call("c5", "write", "src/broken.rs"),
                ],
                StopReason::ToolUse,
            )),
            EntryKind::message(Message::tool_result("c1", "read", "fn parse()", false)),
            EntryKind::message(Message::tool_result("c5", "write", "denied", true)),
        ])
    }

    #[tokio::test(flavor = "current_thread")]
    async fn tool_results_only_returns_nothing_without_calling_transport() {
        let transport = Scripted::new(Ok(reply("unused", StopReason::Stop)));
        let slice = entries(vec![
            EntryKind::message(Message::tool_result("c1", "read", "data", false)),
            EntryKind::message(Message::tool_result("c2", "grep", "more", false)),
        ]);

        let outcome = summarize_branch(
            &transport,
            &slice,
            &SummaryTarget::default(),
            &BranchSummaryConfig::default(),
            AbortSignal::new(),
        )
        .await;

        assert_eq!(outcome, BranchSummaryOutcome::NothingToSummarize);
        assert_eq!(transport.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn successful_summary_appends_sorted_file_ledger() {
        let transport = Scripted::new(Ok(reply("  did parser work  ", StopReason::Stop)));
        let outcome = summarize_branch(
            &transport,
            &working_branch(),
            &SummaryTarget::default(),
            &BranchSummaryConfig::default(),
            AbortSignal::new(),
        )
        .await;

        let BranchSummaryOutcome::Summarized(summary) = outcome else {
            panic!("expected a summary, got {outcome:?}");
        };
        assert_eq!(
            summary.summary,
            "did parser work\n\n<read-files>\nsrc/lib.rs\n</read-files>\n\n<edited-files>\nsrc/parser.rs\n</edited-files>\n\n<created-files>\nsrc/new.rs\n</created-files>"
        );
        assert_eq!(summary.read_files, vec!["src/lib.rs".to_string()]);
        assert_eq!(
            summary.modified_files,
            vec!["src/new.rs".to_string(), "src/parser.rs".to_string()]
        );

        let prompts = transport.prompts.lock().expect("prompts mutex");
        assert!(prompts[0].contains("[User]: fix the parser"));
        assert!(prompts[0].contains("[Assistant tool calls]: read(path=\"src/parser.rs\")"));
        assert!(!prompts[0].contains("fn parse()"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn previous_summaries_become_context_prefix() {
        let transport = Scripted::new(Ok(reply("ok", StopReason::Stop)));
        let slice = entries(vec![
            EntryKind::BranchSummary {
                summary: "first".to_string(),
                from_index: None,
                read_files: Vec::new(),
                modified_files: Vec::new(),
            },
            EntryKind::BranchSummary {
                summary: "second".to_string(),
                from_index: None,
                read_files: Vec::new(),
                modified_files: Vec::new(),
            },
            EntryKind::message(Message::user("continue")),
        ]);

        summarize_branch(
            &transport,
            &slice,
            &SummaryTarget::default(),
            &BranchSummaryConfig::default(),
            AbortSignal::new(),
        )
        .await;

        let prompts = transport.prompts.lock().expect("prompts mutex");
        assert!(prompts[0].contains("[Previous context: first | second]"));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn aborted_and_failed_transports_map_to_distinct_outcomes() {
        let aborted = Scripted::new(Ok(reply("", StopReason::Aborted)));
        let outcome = summarize_branch(
            &aborted,
            &working_branch(),
            &SummaryTarget::default(),
            &BranchSummaryConfig::default(),
            AbortSignal::new(),
        )
        .await;
        assert_eq!(outcome, BranchSummaryOutcome::Cancelled);

        let failing = Scripted::new(Err(SDKError::provider("overloaded")));
        let outcome = summarize_branch(
            &failing,
            &working_branch(),
            &SummaryTarget::default(),
            &BranchSummaryConfig::default(),
            AbortSignal::new(),
        )
        .await;
        let BranchSummaryOutcome::Failed { error, file_ops } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("overloaded"));
        assert_eq!(file_ops.edited_files(), vec!["src/parser.rs".to_string()]);
    }

    #[test]
    fn file_operations_accept_file_path_and_ignore_unknown_tools() {
        let mut ops = FileOperations::default();
        ops.record("edit_file", &serde_json::json!({ "file_path": "a.rs" }));
        ops.record("shell", &serde_json::json!({ "path": "b.rs" }));
        ops.record("read", &serde_json::json!({ "pattern": "x" }));
        assert_eq!(ops.edited_files(), vec!["a.rs".to_string()]);
        assert!(ops.read.is_empty());
        assert!(ops.render_suffix().contains("<edited-files>\na.rs\n</edited-files>"));
    }
}
