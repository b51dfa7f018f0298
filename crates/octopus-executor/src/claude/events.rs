//! Translation of CLI output into backend-neutral adapter events.

use octopus_core::{AdapterEvent, Completion};
use serde_json::Value;

use super::types::{CLIMessage, ContentBlock, MessageContent, ResultMessage};

/// Translate a decoded non-control message.
///
/// Assistant text and tool calls, tool results (from either role) and the
/// final result map to events. Everything else, including message kinds this
/// crate does not know about, becomes [`AdapterEvent::Ignored`].
#[must_use]
pub fn translate(kind: &str, message: CLIMessage) -> Vec<AdapterEvent> {
    match message {
        CLIMessage::Assistant { message } | CLIMessage::User { message } => {
            match message.content {
                MessageContent::Blocks(blocks) => {
                    blocks.into_iter().filter_map(translate_block).collect()
                }
                // Plain string content is the echo of our own prompt.
                MessageContent::Text(_) => Vec::new(),
            }
        }
        CLIMessage::Result(result) => vec![AdapterEvent::Completed(completion(result))],
        CLIMessage::System { .. }
        | CLIMessage::ControlRequest { .. }
        | CLIMessage::ControlResponse { .. }
        | CLIMessage::Unknown => vec![AdapterEvent::Ignored {
            kind: kind.to_string(),
        }],
    }
}

fn translate_block(block: ContentBlock) -> Option<AdapterEvent> {
    match block {
        ContentBlock::Text { text } => Some(AdapterEvent::Text { text }),
        ContentBlock::ToolUse { id, name, input } => Some(AdapterEvent::ToolUse { id, name, input }),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => Some(AdapterEvent::ToolResult {
            tool_use_id,
            output: flatten_tool_output(content),
            is_error: is_error.unwrap_or(false),
        }),
        ContentBlock::Other => None,
    }
}

fn completion(result: ResultMessage) -> Completion {
    Completion {
        resume_token: result.session_id,
        cost: result.total_cost_usd,
        turns: result.num_turns,
        duration_ms: result.duration_ms,
        is_error: result.is_error,
    }
}

/// Collapse a list of text blocks into one string; other shapes pass through.
fn flatten_tool_output(content: Value) -> Value {
    let Value::Array(items) = &content else {
        return content;
    };
    let texts: Option<Vec<&str>> = items
        .iter()
        .map(|item| {
            if item.get("type").and_then(Value::as_str) == Some("text") {
                item.get("text").and_then(Value::as_str)
            } else {
                None
            }
        })
        .collect();
    match texts {
        Some(texts) => Value::String(texts.join("\n")),
        None => content,
    }
}
