//! Wire protocol for client-server communication.
//!
//! WebSocket frames are JSON objects tagged with `type`. Server frames reuse
//! the [`SessionEvent`] vocabulary and add `session_id` when the frame
//! concerns a session.

use std::path::PathBuf;

use octopus_core::{EventFrame, Message, SessionEvent, SessionId};
use serde::{Deserialize, Serialize};

/// Default name for sessions created without one.
pub const DEFAULT_SESSION_NAME: &str = "New Session";

fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.to_string()
}

/// Message from client to server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a prompt.
    SendMessage {
        #[serde(default)]
        session_id: SessionId,
        #[serde(default)]
        content: String,
    },
    /// Let a parked tool invocation proceed.
    ApproveTool {
        session_id: SessionId,
        tool_use_id: String,
    },
    /// Reject a parked tool invocation.
    DenyTool {
        session_id: SessionId,
        tool_use_id: String,
        #[serde(default)]
        reason: Option<String>,
    },
    /// Receive a session's events without sending to it.
    Subscribe { session_id: SessionId },
    /// Stop receiving a session's events.
    Unsubscribe { session_id: SessionId },
    /// Anything newer clients send that this server does not understand.
    #[serde(other)]
    Unknown,
}

/// Message from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<SessionId>,
    #[serde(flatten)]
    pub event: SessionEvent,
}

impl ServerMessage {
    /// Error not tied to a session.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            session_id: None,
            event: SessionEvent::Error {
                message: message.into(),
            },
        }
    }

    /// Error concerning one session.
    #[must_use]
    pub fn session_error(session_id: impl Into<SessionId>, message: impl Into<String>) -> Self {
        Self {
            session_id: Some(session_id.into()),
            event: SessionEvent::Error {
                message: message.into(),
            },
        }
    }
}

impl From<EventFrame> for ServerMessage {
    fn from(frame: EventFrame) -> Self {
        Self {
            session_id: Some(frame.session_id),
            event: frame.event,
        }
    }
}

/// `POST /api/sessions` body.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    #[serde(default = "default_session_name")]
    pub name: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

/// `PATCH /api/sessions/{id}` body.
#[derive(Debug, Clone, Deserialize)]
pub struct RenameSessionRequest {
    pub name: String,
}

/// `POST /api/sessions/import` body.
#[derive(Debug, Clone, Deserialize)]
pub struct ImportSessionRequest {
    #[serde(default = "default_session_name")]
    pub name: String,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
    /// Backend conversation to continue.
    #[serde(default)]
    pub claude_session_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
}
