//! Core traits for transcript storage and assistant adapters.

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::{
    ExecutionContext,
    event::AdapterEvent,
    message::Message,
    session::{Session, SessionId},
};

/// Storage error.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Storage error: {0}")]
    Internal(String),
}

/// Durable storage of sessions and their ordered transcripts.
///
/// Appends for different sessions may arrive concurrently; appends for one
/// session always arrive in order with increasing `seq`.
#[async_trait]
pub trait TranscriptStore: Send + Sync {
    /// Persist a newly created session.
    async fn save_session(&self, session: &Session) -> Result<(), StorageError>;

    /// All sessions in creation order.
    async fn load_sessions(&self) -> Result<Vec<Session>, StorageError>;

    /// Record the continuity handle returned by the backend.
    async fn set_resume_token(&self, id: &str, token: &str) -> Result<(), StorageError>;

    /// Change the display name.
    async fn rename_session(&self, id: &str, name: &str) -> Result<(), StorageError>;

    /// Append one message at position `seq`.
    async fn append_message(&self, id: &str, seq: u64, message: &Message)
    -> Result<(), StorageError>;

    /// Full history of a session, ordered by `seq`.
    async fn load_messages(&self, id: &str) -> Result<Vec<Message>, StorageError>;

    /// Delete a session and all of its messages.
    async fn delete_session(&self, id: &str) -> Result<(), StorageError>;
}

/// Adapter error.
#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("Spawn failed: {0}")]
    Spawn(String),
    #[error("Stream failed: {0}")]
    Stream(String),
    #[error("Close failed: {0}")]
    Close(String),
    #[error("Handle is closed")]
    Closed,
}

/// User decision on a parked tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Deny { reason: Option<String> },
}

/// Lazy, finite, non-restartable stream of backend events for one turn.
pub type AdapterStream = BoxStream<'static, Result<AdapterEvent, AdapterError>>;

/// Opens assistant handles.
#[async_trait]
pub trait AssistantAdapter: Send + Sync {
    /// Open a handle rooted at the context's working directory.
    async fn open(&self, ctx: &ExecutionContext) -> Result<Box<dyn AdapterHandle>, AdapterError>;
}

/// Live backend connection owned by one session.
#[async_trait]
pub trait AdapterHandle: Send + Sync {
    /// Submit a prompt, continuing the conversation named by `resume_token`.
    async fn interact(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
    ) -> Result<AdapterStream, AdapterError>;

    /// Resolve a pending approval. Returns `false` if nothing is pending for
    /// `tool_use_id`.
    async fn resolve_approval(&self, tool_use_id: &str, decision: ApprovalDecision) -> bool;

    /// Terminate the backend. Best-effort.
    async fn close(&self) -> Result<(), AdapterError>;
}
