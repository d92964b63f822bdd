//! Character-based token estimates.
//!
//! Estimates are deliberately coarse (about four characters per token) and only
//! feed budget decisions; they are never reported as billed usage.

use loom_llm::{ContentPart, Message};
use loom_store::{EntryKind, SessionEntry};

pub const CHARS_PER_TOKEN: u64 = 4;
pub const IMAGE_TOKEN_ESTIMATE: u64 = 1_200;

fn chars_to_tokens(chars: u64) -> u64 {
    chars.div_ceil(CHARS_PER_TOKEN)
}

pub fn estimate_text_tokens(text: &str) -> u64 {
    chars_to_tokens(text.chars().count() as u64)
}

fn content_chars_and_images(content: &[ContentPart]) -> (u64, u64) {
    let mut chars = 0u64;
    let mut images = 0u64;
    for part in content {
        match part {
            ContentPart::Text { text } => chars += text.chars().count() as u64,
            ContentPart::Thinking { thinking } => chars += thinking.chars().count() as u64,
            ContentPart::ToolCall(call) => {
                chars += call.name.chars().count() as u64;
                chars += call.arguments.to_string().chars().count() as u64;
            }
            ContentPart::Image { .. } => images += 1,
        }
    }
    (chars, images)
}

pub fn estimate_content_tokens(content: &[ContentPart]) -> u64 {
    let (chars, images) = content_chars_and_images(content);
    chars_to_tokens(chars) + images * IMAGE_TOKEN_ESTIMATE
}

pub fn estimate_message_tokens(message: &Message) -> u64 {
    estimate_content_tokens(&message.content)
}

pub fn estimate_messages_tokens(messages: &[Message]) -> u64 {
    messages.iter().map(estimate_message_tokens).sum()
}

/// Tokens an entry contributes when rendered into model context.
pub fn estimate_entry_tokens(entry: &SessionEntry) -> u64 {
    match &entry.kind {
        EntryKind::Message { message, .. } => estimate_message_tokens(message),
        EntryKind::CustomMessage { content, .. } => estimate_content_tokens(content),
        EntryKind::BranchSummary { summary, .. } | EntryKind::Compaction { summary, .. } => {
            estimate_text_tokens(summary)
        }
        _ => 0,
    }
}
