//! Context pruning — replace old tool outputs with a placeholder when the
//! estimated token count grows past a threshold but compaction is unwanted.
//!
//! Pruning marks completed tool parts (outside a protected tool set) and
//! swaps their content for a placeholder. It never alters message structure.

use crate::message::Message;
use crate::part::{PartKind, ToolState};

/// What pruned tool outputs are replaced with.
pub const PRUNED_PLACEHOLDER: &str = "[tool output pruned]";

/// Coarse token estimate: `ceil(chars / 4)` across text parts and tool
/// input/output. Only used for threshold checks, never for billing.
pub fn estimate_tokens(messages: &[Message]) -> usize {
    let mut chars = 0usize;
    for message in messages {
        for part in &message.parts {
            match &part.kind {
                PartKind::Text { text } => chars += text.len(),
                PartKind::Reasoning { text, .. } => chars += text.len(),
                PartKind::File { url, .. } => chars += url.len(),
                PartKind::Tool { input, output, .. } => {
                    chars += input.to_string().len();
                    chars += output.as_ref().map_or(0, |o| o.len());
                }
            }
        }
    }
    chars.div_ceil(4)
}

/// Replace completed tool outputs with [`PRUNED_PLACEHOLDER`], skipping
/// tools in `protected` and parts already pruned. Returns how many parts
/// were rewritten.
pub fn prune_tool_outputs(messages: &mut [Message], protected: &[String]) -> usize {
    let mut pruned = 0;
    for message in messages.iter_mut() {
        for part in message.parts.iter_mut() {
            if let PartKind::Tool {
                tool,
                state,
                output,
                ..
            } = &mut part.kind
            {
                if *state != ToolState::Completed {
                    continue;
                }
                if protected.iter().any(|p| p == tool) {
                    continue;
                }
                match output {
                    Some(content) if content != PRUNED_PLACEHOLDER => {
                        *content = PRUNED_PLACEHOLDER.to_owned();
                        pruned += 1;
                    }
                    _ => {}
                }
            }
        }
    }
    pruned
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRole;
    use crate::part::Part;

    fn tool_message(tool: &str, output: &str) -> Message {
        Message::with_part(
            "ses_x",
            MessageRole::Tool,
            Part::tool_completed("call_1", tool, serde_json::json!({}), output),
        )
    }

    #[test]
    fn estimate_rounds_up() {
        let messages = vec![Message::with_part(
            "ses_x",
            MessageRole::User,
            Part::text("abcde"), // 5 chars -> 2 tokens
        )];
        assert_eq!(estimate_tokens(&messages), 2);
    }

    #[test]
    fn prune_replaces_completed_outputs() {
        let mut messages = vec![tool_message("exec", "very long output")];
        let n = prune_tool_outputs(&mut messages, &[]);
        assert_eq!(n, 1);
        match &messages[0].parts[0].kind {
            PartKind::Tool { output, .. } => {
                assert_eq!(output.as_deref(), Some(PRUNED_PLACEHOLDER));
            }
            _ => panic!("expected tool part"),
        }
    }

    #[test]
    fn prune_skips_protected_tools() {
        let mut messages = vec![
            tool_message("task", "{\"status\":\"accepted\",\"task_id\":\"tsk_1\"}"),
            tool_message("exec", "scrollback"),
        ];
        let n = prune_tool_outputs(&mut messages, &["task".into()]);
        assert_eq!(n, 1);
        match &messages[0].parts[0].kind {
            PartKind::Tool { output, .. } => {
                assert_eq!(
                    output.as_deref(),
                    Some("{\"status\":\"accepted\",\"task_id\":\"tsk_1\"}")
                );
            }
            _ => panic!("expected tool part"),
        }
        match &messages[1].parts[0].kind {
            PartKind::Tool { output, .. } => {
                assert_eq!(output.as_deref(), Some(PRUNED_PLACEHOLDER));
            }
            _ => panic!("expected tool part"),
        }
    }

    #[test]
    fn prune_skips_pending_parts() {
        let mut messages = vec![Message::with_part(
            "ses_x",
            MessageRole::Assistant,
            Part::tool_pending("call_2", "exec", serde_json::json!({})),
        )];
        assert_eq!(prune_tool_outputs(&mut messages, &[]), 0);
    }

    #[test]
    fn prune_is_idempotent() {
        let mut messages = vec![tool_message("exec", "output")];
        assert_eq!(prune_tool_outputs(&mut messages, &[]), 1);
        assert_eq!(prune_tool_outputs(&mut messages, &[]), 0);
    }
}
