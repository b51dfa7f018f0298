//! Claude Code stream-json protocol types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Permission mode passed to the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
}

impl PermissionMode {
    /// Value of the `--permission-mode` flag.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::AcceptEdits => "acceptEdits",
            Self::Plan => "plan",
            Self::BypassPermissions => "bypassPermissions",
        }
    }
}

/// Message read from the CLI's stdout.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CLIMessage {
    System {
        #[serde(default)]
        subtype: Option<String>,
        #[serde(default)]
        session_id: Option<String>,
    },
    Assistant {
        message: ContentMessage,
    },
    User {
        message: ContentMessage,
    },
    Result(ResultMessage),
    ControlRequest {
        request_id: String,
        request: ControlRequestType,
    },
    ControlResponse {
        #[serde(default)]
        response: Value,
    },
    #[serde(other)]
    Unknown,
}

/// A decoded stdout line together with its raw `type` tag.
#[derive(Debug, Clone)]
pub struct Decoded {
    pub kind: String,
    pub message: CLIMessage,
}

impl Decoded {
    /// Decode one stdout line.
    ///
    /// # Errors
    /// Returns error if the line is not a JSON object of a known shape.
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        let value: Value = serde_json::from_str(line)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let message = serde_json::from_value(value)?;
        Ok(Self { kind, message })
    }
}

/// Body of `assistant` and `user` messages.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ContentMessage {
    #[serde(default)]
    pub content: MessageContent,
}

/// Message content: either a bare string or a list of blocks.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Blocks(Vec::new())
    }
}

/// Content block.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: Option<bool>,
    },
    #[serde(other)]
    Other,
}

/// Final message of a turn.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ResultMessage {
    pub subtype: Option<String>,
    pub is_error: bool,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u32>,
    pub session_id: Option<String>,
    pub total_cost_usd: Option<f64>,
}

/// Control request sent by the CLI.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlRequestType {
    CanUseTool {
        tool_name: String,
        #[serde(default)]
        input: Value,
        #[serde(default)]
        permission_suggestions: Option<Value>,
        #[serde(default)]
        tool_use_id: Option<String>,
    },
    #[serde(other)]
    Unsupported,
}

/// Control request sent to the CLI.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "control_request")]
pub struct SDKControlRequest {
    pub request_id: String,
    pub request: SDKControlRequestType,
}

impl SDKControlRequest {
    #[must_use]
    pub fn new(request: SDKControlRequestType) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            request,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum SDKControlRequestType {
    Initialize {
        #[serde(skip_serializing_if = "Option::is_none")]
        hooks: Option<Value>,
    },
    Interrupt {},
}

/// Reply to a CLI control request.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "control_response")]
pub struct ControlResponseMessage {
    pub response: ControlResponseType,
}

impl ControlResponseMessage {
    #[must_use]
    pub const fn new(response: ControlResponseType) -> Self {
        Self { response }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "subtype", rename_all = "snake_case")]
pub enum ControlResponseType {
    Success {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        response: Option<Value>,
    },
    Error {
        request_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

/// User prompt written to the CLI's stdin.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename = "user")]
pub struct Message {
    pub message: UserContent,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserContent {
    pub role: &'static str,
    pub content: String,
}

impl Message {
    #[must_use]
    pub const fn new_user(content: String) -> Self {
        Self {
            message: UserContent {
                role: "user",
                content,
            },
        }
    }
}
