//! In-memory transcript storage.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use async_trait::async_trait;
use octopus_core::{Message, Session, StorageError, TranscriptStore};

#[derive(Default)]
struct Inner {
    /// Sessions in creation order.
    sessions: Vec<Session>,
    messages: HashMap<String, Vec<(u64, Message)>>,
}

impl Inner {
    fn session_mut(&mut self, id: &str) -> Result<&mut Session, StorageError> {
        self.sessions
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))
    }
}

/// In-memory storage implementation.
///
/// Useful for development and tests.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Create a new in-memory storage.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

fn poisoned<T>(e: PoisonError<T>) -> StorageError {
    StorageError::Internal(e.to_string())
}

#[async_trait]
impl TranscriptStore for MemoryStore {
    async fn save_session(&self, session: &Session) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        if inner.sessions.iter().any(|s| s.id == session.id) {
            return Ok(());
        }
        inner.sessions.push(session.clone());
        inner.messages.insert(session.id.clone(), Vec::new());
        Ok(())
    }

    async fn load_sessions(&self) -> Result<Vec<Session>, StorageError> {
        Ok(self.inner.read().map_err(poisoned)?.sessions.clone())
    }

    async fn set_resume_token(&self, id: &str, token: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.session_mut(id)?.resume_token = Some(token.to_string());
        Ok(())
    }

    async fn rename_session(&self, id: &str, name: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.session_mut(id)?.name = name.to_string();
        Ok(())
    }

    async fn append_message(
        &self,
        id: &str,
        seq: u64,
        message: &Message,
    ) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        let messages = inner
            .messages
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        messages.push((seq, message.clone()));
        Ok(())
    }

    async fn load_messages(&self, id: &str) -> Result<Vec<Message>, StorageError> {
        let inner = self.inner.read().map_err(poisoned)?;
        let mut messages = inner
            .messages
            .get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        messages.sort_by_key(|(seq, _)| *seq);
        Ok(messages.into_iter().map(|(_, m)| m).collect())
    }

    async fn delete_session(&self, id: &str) -> Result<(), StorageError> {
        let mut inner = self.inner.write().map_err(poisoned)?;
        inner.sessions.retain(|s| s.id != id);
        inner.messages.remove(id);
        Ok(())
    }
}
