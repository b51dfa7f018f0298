//! Session model.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Session identifier.
///
/// Opaque to clients; generated ids are 12 lowercase hex characters.
pub type SessionId = String;

/// Length of generated session ids.
const SESSION_ID_LEN: usize = 12;

/// Generate a fresh session id.
#[must_use]
pub fn new_session_id() -> SessionId {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SESSION_ID_LEN);
    id
}

/// Session status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No turn in flight.
    #[default]
    Idle,
    /// A turn is in flight.
    Running,
    /// A turn is paused on a tool approval decision.
    WaitingApproval,
}

impl SessionStatus {
    /// Whether a turn currently owns the session.
    #[must_use]
    pub const fn is_busy(self) -> bool {
        !matches!(self, Self::Idle)
    }
}

/// One logical conversation with the assistant backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: SessionId,
    /// Display label.
    pub name: String,
    /// Filesystem root handed to the assistant process.
    pub working_dir: PathBuf,
    /// Current status. Never persisted; restored sessions start idle.
    #[serde(default)]
    pub status: SessionStatus,
    /// Continuity handle returned by the backend after a completed turn.
    /// Kept server-side; never sent to clients.
    #[serde(default, skip_serializing)]
    pub resume_token: Option<String>,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Create a new idle session with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>, working_dir: PathBuf) -> Self {
        Self {
            id: new_session_id(),
            name: name.into(),
            working_dir,
            status: SessionStatus::Idle,
            resume_token: None,
            created_at: Utc::now(),
        }
    }
}
