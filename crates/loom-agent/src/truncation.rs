/// Output cut to a byte and line budget.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TruncatedOutput {
    pub text: String,
    pub truncated: bool,
}

/// Apply a byte budget and a line budget, whichever is hit first.
///
/// When the line budget runs out the text ends at the last complete line. When
/// the byte budget runs out the text ends at the last line completed within the
/// budget, or at a character boundary if the budget holds no whole line.
pub fn truncate_output(text: &str, max_bytes: usize, max_lines: usize) -> TruncatedOutput {
    let mut end = text.len();
    let mut truncated = false;

    if max_lines == 0 {
        end = 0;
        truncated = !text.is_empty();
    } else if let Some((newline, _)) = text.match_indices('\n').nth(max_lines - 1) {
        if newline + 1 < text.len() {
            end = newline;
            truncated = true;
        }
    }

    if end > max_bytes {
        let mut cut = max_bytes;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        end = if text.as_bytes().get(cut) == Some(&b'\n') {
            cut
        } else {
            text[..cut].rfind('\n').unwrap_or(cut)
        };
        truncated = true;
    }

    TruncatedOutput {
        text: text[..end].to_string(),
        truncated,
    }
}

/// Accumulates streamed output under a byte and line budget.
///
/// Once a budget is exhausted every later push is dropped and `truncated` stays
/// set.
#[derive(Clone, Debug)]
pub struct OutputBuffer {
    max_bytes: usize,
    max_lines: usize,
    text: String,
    truncated: bool,
}

impl OutputBuffer {
    pub fn new(max_bytes: usize, max_lines: usize) -> Self {
        Self {
            max_bytes,
            max_lines,
            text: String::new(),
            truncated: false,
        }
    }

    /// Append a completed block of text, separated from earlier blocks by a newline.
    pub fn push_block(&mut self, block: &str) {
        if self.truncated || block.is_empty() {
            return;
        }
        let mut candidate = std::mem::take(&mut self.text);
        if !candidate.is_empty() {
            candidate.push('\n');
        }
        candidate.push_str(block);
        let cut = truncate_output(&candidate, self.max_bytes, self.max_lines);
        self.text = cut.text;
        self.truncated = cut.truncated;
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_output(self) -> TruncatedOutput {
        TruncatedOutput {
            text: self.text,
            truncated: self.truncated,
        }
    }
}

/// Cut tool output for the model, keeping its head and tail.
pub fn truncate_tool_output(output: &str, max_chars: usize) -> String {
    let char_count = output.chars().count();
    if char_count <= max_chars {
        return output.to_string();
    }

    let removed = char_count - max_chars;
    let head = max_chars / 2;
    let tail = max_chars - head;
    format!(
        "{}\n\n[WARNING: Tool output was truncated. {} characters were removed from the middle.]\n\n{}",
        take_head(output, head),
        removed,
        take_tail(output, tail)
    )
}

fn take_head(input: &str, char_count: usize) -> String {
    input.chars().take(char_count).collect()
}

fn take_tail(input: &str, char_count: usize) -> String {
    let total = input.chars().count();
    input
        .chars()
        .skip(total.saturating_sub(char_count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_budget_cuts_back_to_last_complete_line() {
        let output = truncate_output("one\ntwo\nthree\nfour\nfive", 1_000, 3);
        assert_eq!(output.text, "one\ntwo\nthree");
        assert_eq!(output.text.lines().count(), 3);
        assert!(output.truncated);
    }

    #[test]
    fn exact_line_budget_with_trailing_newline_is_not_truncated() {
        let output = truncate_output("a\nb\nc\n", 1_000, 3);
        assert_eq!(output.text, "a\nb\nc\n");
        assert!(!output.truncated);
    }

    #[test]
    fn byte_budget_prefers_line_boundary_then_char_boundary() {
        let output = truncate_output("abc\ndefgh", 6, 100);
        assert_eq!(output.text, "abc");
        assert!(output.truncated);

        let output = truncate_output("héllo", 2, 100);
        assert_eq!(output.text, "h");
        assert!(output.truncated);
    }

    #[test]
    fn byte_budget_keeps_a_line_that_ends_exactly_at_the_limit() {
        let output = truncate_output("a\nb\nc", 3, 100);
        assert_eq!(output.text, "a\nb");
        assert!(output.truncated);
    }

    #[test]
    fn output_buffer_stops_accepting_after_budget() {
        let mut buffer = OutputBuffer::new(1_000, 3);
        buffer.push_block("1\n2");
        buffer.push_block("3\n4\n5");
        buffer.push_block("6");
        assert_eq!(buffer.as_str(), "1\n2\n3");
        assert!(buffer.is_truncated());
    }

    #[test]
    fn truncate_tool_output_keeps_head_and_tail() {
        let output = truncate_tool_output("abcdefghij", 6);
        assert!(output.starts_with("abc"));
        assert!(output.ends_with("hij"));
        assert!(output.contains("4 characters were removed"));
    }
}
