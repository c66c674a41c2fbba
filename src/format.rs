//! Bounding tool output before it goes back into the conversation.

use crate::conversation::{Message, ToolResult, ToolStatus};

/// Caps result text independently of each tool's own limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResultFormatter {
    max_chars: usize,
}

impl Default for ResultFormatter {
    fn default() -> Self {
        Self::new(32_000)
    }
}

impl ResultFormatter {
    pub fn new(max_chars: usize) -> Self {
        Self {
            max_chars: max_chars.max(1),
        }
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    /// Cut oversized output at a line boundary and say so in the text.
    pub fn bound(&self, mut result: ToolResult) -> ToolResult {
        let total = result.output.chars().count();
        if total <= self.max_chars {
            return result;
        }

        let byte_end = result
            .output
            .char_indices()
            .nth(self.max_chars)
            .map_or(result.output.len(), |(i, _)| i);
        let head = &result.output[..byte_end];
        // Prefer a line boundary unless it would throw away most of the budget.
        let cut = match head.rfind('\n') {
            Some(i) if i >= byte_end / 2 => i,
            _ => byte_end,
        };
        let shown = result.output[..cut].chars().count();

        let mut bounded = result.output[..cut].to_string();
        bounded.push_str(&format!(
            "\n\n[output truncated: showing {shown} of {total} characters. \
             Use read with offset/limit or a narrower grep/find to see the rest.]"
        ));
        result.output = bounded;
        result.truncated = true;
        result
    }

    /// Bound `result` and wrap it as a tool-role message.
    pub fn to_message(&self, result: &ToolResult) -> Message {
        let bounded = self.bound(result.clone());
        let body = match bounded.status {
            ToolStatus::Success => bounded.output,
            ToolStatus::Error => format!("Error: {}", bounded.output),
            ToolStatus::Denied => format!("Denied: {}", bounded.output),
        };
        Message::tool(bounded.call_id, body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_small_output_passes_through() {
        let formatter = ResultFormatter::new(100);
        let result = ToolResult::success("c1", "short");
        assert_eq!(formatter.bound(result.clone()), result);
    }

    #[test]
    fn test_bounds_at_line_boundary() {
        let formatter = ResultFormatter::new(25);
        let output = "line one\nline two\nline three\nline four\n";
        let bounded = formatter.bound(ToolResult::success("c1", output));

        assert!(bounded.truncated);
        assert!(bounded.output.starts_with("line one\nline two\n\n"));
        assert!(!bounded.output.contains("line three"));
        assert!(bounded.output.contains("showing 17 of 39 characters"));
    }

    #[test]
    fn test_bounds_multibyte_without_panicking() {
        let formatter = ResultFormatter::new(5);
        let bounded = formatter.bound(ToolResult::success("c1", "ééééééééé"));
        assert!(bounded.output.starts_with("ééééé\n"));
        assert!(bounded.truncated);
    }

    #[test]
    fn test_keeps_tool_truncation_flag() {
        let formatter = ResultFormatter::new(100);
        let result = ToolResult::success("c1", "partial").with_truncated(true);
        assert!(formatter.bound(result).truncated);
    }

    #[test]
    fn test_message_shape() {
        let formatter = ResultFormatter::default();
        let message = formatter.to_message(&ToolResult::denied("c7", "The user denied this"));
        assert_eq!(message.role, Role::Tool);
        assert_eq!(message.tool_call_id.as_deref(), Some("c7"));
        assert_eq!(message.content.as_deref(), Some("Denied: The user denied this"));

        let message = formatter.to_message(&ToolResult::error("c8", "File not found: x"));
        assert_eq!(message.content.as_deref(), Some("Error: File not found: x"));
    }
}
