//! Execution context handed to assistant adapters.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::session::{Session, SessionId};

/// What an adapter needs to know to open a handle for a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionContext {
    /// Owning session, for log correlation.
    pub session_id: SessionId,
    /// Working directory for the assistant process.
    pub working_dir: PathBuf,
}

impl ExecutionContext {
    #[must_use]
    pub const fn new(session_id: SessionId, working_dir: PathBuf) -> Self {
        Self {
            session_id,
            working_dir,
        }
    }
}

impl From<&Session> for ExecutionContext {
    fn from(session: &Session) -> Self {
        Self::new(session.id.clone(), session.working_dir.clone())
    }
}
