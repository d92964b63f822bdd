//! Materialized views over a root-to-leaf branch.

use loom_llm::{Message, Role};
use loom_store::{EntryKind, SessionEntry};

const BRANCH_SUMMARY_PREFIX: &str =
    "The following is a summary of a branch that this conversation came back from:\n\n<summary>\n";
const COMPACTION_PREFIX: &str =
    "The conversation history before this point was compacted into the following summary:\n\n<summary>\n";
const SUMMARY_SUFFIX: &str = "\n</summary>";

fn custom_message(entry: &SessionEntry) -> Option<Message> {
    match &entry.kind {
        EntryKind::CustomMessage { content, .. } => {
            let mut message = Message::user(String::new());
            message.content = content.clone();
            Some(message)
        }
        _ => None,
    }
}

/// The conversational view: `message` and `custom_message` entries, in order.
pub fn conversation_messages(branch: &[SessionEntry]) -> Vec<Message> {
    branch
        .iter()
        .filter_map(|entry| match &entry.kind {
            EntryKind::Message { message, .. } => Some(message.clone()),
            EntryKind::CustomMessage { .. } => custom_message(entry),
            _ => None,
        })
        .collect()
}

/// The view sent to the transport.
///
/// Branch summaries and compaction summaries are rendered as user context.
/// When the branch holds a compaction, entries before its `first_kept_index`
/// are dropped and the compaction summary leads the context.
pub fn context_messages(branch: &[SessionEntry]) -> Vec<Message> {
    let compaction = branch.iter().rposition(|entry| {
        matches!(entry.kind, EntryKind::Compaction { .. })
    });

    let mut messages = Vec::new();
    let mut first_kept = 0;
    if let Some(position) = compaction {
        if let EntryKind::Compaction {
            summary,
            first_kept_index,
            ..
        } = &branch[position].kind
        {
            messages.push(Message::user(format!(
                "{COMPACTION_PREFIX}{summary}{SUMMARY_SUFFIX}"
            )));
            first_kept = *first_kept_index;
        }
    }

    for (position, entry) in branch.iter().enumerate() {
        if compaction == Some(position) || entry.index < first_kept {
            continue;
        }
        match &entry.kind {
            EntryKind::Message { message, .. } => messages.push(message.clone()),
            EntryKind::CustomMessage { .. } => messages.extend(custom_message(entry)),
            EntryKind::BranchSummary { summary, .. } => messages.push(Message::user(format!(
                "{BRANCH_SUMMARY_PREFIX}{summary}{SUMMARY_SUFFIX}"
            ))),
            // Older compactions are superseded by the latest one.
            EntryKind::Compaction { .. }
            | EntryKind::ThinkingLevelChange { .. }
            | EntryKind::ModelChange { .. }
            | EntryKind::Custom { .. }
            | EntryKind::Label { .. } => {}
        }
    }
    messages
}

pub(super) fn is_user_message(entry: &SessionEntry) -> bool {
    entry.role() == Some(Role::User)
}
