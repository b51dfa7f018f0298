//! Transcript messages.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Author of a transcript message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    Tool,
}

impl MessageRole {
    /// Wire name of the role.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::Tool => "tool",
        }
    }
}

/// Type-specific payload of a message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessageBody {
    /// Plain text from the user or the assistant.
    Text { content: String },
    /// Tool invocation requested by the assistant.
    ToolUse {
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
        tool_use_id: String,
    },
    /// Output of a tool invocation.
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    /// Tool invocation parked until the user decides.
    ToolApprovalRequest {
        tool_name: String,
        #[serde(default)]
        tool_input: Value,
        tool_use_id: String,
    },
    /// Completion metadata of a turn.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cost: Option<f64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        turns: Option<u32>,
    },
    /// Failure reported in-band.
    Error { content: String },
}

impl MessageBody {
    /// Wire name of the discriminator.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Text { .. } => "text",
            Self::ToolUse { .. } => "tool_use",
            Self::ToolResult { .. } => "tool_result",
            Self::ToolApprovalRequest { .. } => "tool_approval_request",
            Self::Result { .. } => "result",
            Self::Error { .. } => "error",
        }
    }
}

/// One immutable transcript record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: MessageRole,
    #[serde(flatten)]
    pub body: MessageBody,
}

impl Message {
    #[must_use]
    pub const fn new(role: MessageRole, body: MessageBody) -> Self {
        Self { role, body }
    }

    /// User prompt.
    #[must_use]
    pub fn user_text(content: impl Into<String>) -> Self {
        Self::new(
            MessageRole::User,
            MessageBody::Text {
                content: content.into(),
            },
        )
    }

    /// System-authored error record.
    #[must_use]
    pub fn error(content: impl Into<String>) -> Self {
        Self::new(
            MessageRole::System,
            MessageBody::Error {
                content: content.into(),
            },
        )
    }
}
