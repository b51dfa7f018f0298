//! Events streamed during a turn.
//!
//! Two vocabularies live here:
//! - [`AdapterEvent`] - what an assistant backend reports, already decoupled
//!   from any particular CLI's native protocol.
//! - [`SessionEvent`] - what the registry persists and broadcasts. Its serde
//!   form is the server-to-client wire format.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    message::{Message, MessageBody, MessageRole},
    session::{SessionId, SessionStatus},
};

/// Completion metadata reported at the end of a turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    /// Continuity handle for the next turn.
    pub resume_token: Option<String>,
    /// Total cost in USD.
    pub cost: Option<f64>,
    /// Number of backend turns.
    pub turns: Option<u32>,
    /// Wall-clock duration.
    pub duration_ms: Option<u64>,
    /// Whether the backend flagged the turn as failed.
    pub is_error: bool,
}

/// Backend-neutral event produced by an adapter handle.
#[derive(Debug, Clone, PartialEq)]
pub enum AdapterEvent {
    /// Assistant text chunk.
    Text { text: String },
    /// Tool invocation.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    /// Tool output.
    ToolResult {
        tool_use_id: String,
        output: Value,
        is_error: bool,
    },
    /// The backend is blocked until the tool call is approved or denied.
    ApprovalRequested {
        tool_use_id: String,
        tool_name: String,
        tool_input: Value,
    },
    /// A pending approval was decided and the backend resumed.
    ApprovalResolved { tool_use_id: String, approved: bool },
    /// Turn finished.
    Completed(Completion),
    /// Backend output with no meaning for the registry.
    Ignored { kind: String },
}

/// Event persisted and broadcast by the registry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    /// Echo of the submitted prompt.
    UserMessage { content: String },
    /// Assistant text chunk.
    AssistantText { content: String },
    /// Tool invocation.
    ToolUse {
        tool: String,
        input: Value,
        tool_use_id: String,
    },
    /// Tool output.
    ToolResult {
        tool_use_id: String,
        output: Value,
        is_error: bool,
    },
    /// Tool invocation waiting for a user decision.
    ToolApprovalRequest {
        tool_name: String,
        tool_input: Value,
        tool_use_id: String,
    },
    /// Turn completion.
    Result {
        claude_session_id: Option<String>,
        cost: Option<f64>,
        turns: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
        #[serde(default)]
        is_error: bool,
    },
    /// Session status transition.
    Status { status: SessionStatus },
    /// In-band failure.
    Error { message: String },
}

impl SessionEvent {
    /// Transcript record for this event, if it has one.
    ///
    /// Status transitions are ephemeral and never stored.
    #[must_use]
    pub fn to_message(&self) -> Option<Message> {
        let (role, body) = match self {
            Self::UserMessage { content } => (
                MessageRole::User,
                MessageBody::Text {
                    content: content.clone(),
                },
            ),
            Self::AssistantText { content } => (
                MessageRole::Assistant,
                MessageBody::Text {
                    content: content.clone(),
                },
            ),
            Self::ToolUse {
                tool,
                input,
                tool_use_id,
            } => (
                MessageRole::Assistant,
                MessageBody::ToolUse {
                    tool_name: tool.clone(),
                    tool_input: input.clone(),
                    tool_use_id: tool_use_id.clone(),
                },
            ),
            Self::ToolResult {
                tool_use_id,
                output,
                is_error,
            } => (
                MessageRole::Tool,
                MessageBody::ToolResult {
                    tool_use_id: tool_use_id.clone(),
                    content: output.clone(),
                    is_error: *is_error,
                },
            ),
            Self::ToolApprovalRequest {
                tool_name,
                tool_input,
                tool_use_id,
            } => (
                MessageRole::Tool,
                MessageBody::ToolApprovalRequest {
                    tool_name: tool_name.clone(),
                    tool_input: tool_input.clone(),
                    tool_use_id: tool_use_id.clone(),
                },
            ),
            Self::Result {
                claude_session_id,
                cost,
                turns,
                ..
            } => (
                MessageRole::System,
                MessageBody::Result {
                    session_id: claude_session_id.clone(),
                    cost: *cost,
                    turns: *turns,
                },
            ),
            Self::Error { message } => (
                MessageRole::System,
                MessageBody::Error {
                    content: message.clone(),
                },
            ),
            Self::Status { .. } => return None,
        };
        Some(Message::new(role, body))
    }
}

/// A [`SessionEvent`] addressed to one session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    pub session_id: SessionId,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl EventFrame {
    #[must_use]
    pub fn new(session_id: impl Into<SessionId>, event: SessionEvent) -> Self {
        Self {
            session_id: session_id.into(),
            event,
        }
    }
}
