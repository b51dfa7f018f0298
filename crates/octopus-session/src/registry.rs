//! Session registry: the orchestration core.
//!
//! The registry owns every live session. Each session lives in a slot holding
//! its metadata, its adapter handle (opened lazily on the first turn), a
//! message counter and the subscriber fan-out. Turns are admitted by
//! checking and setting the slot's status under the slot's own mutex, so
//! unrelated sessions never contend and a session never runs two turns.
//!
//! An admitted turn is driven by a spawned task. The task appends each event
//! to the transcript and then broadcasts it, strictly in the order the adapter
//! produced it, and always returns the session to `idle`.

use std::{
    collections::{HashMap, HashSet},
    path::PathBuf,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use futures::{StreamExt, stream::BoxStream};
use octopus_core::{
    AdapterError, AdapterEvent, AdapterHandle, ApprovalDecision, AssistantAdapter, Completion,
    EventFrame, EventSink, ExecutionContext, Fanout, Message, Session, SessionEvent, SessionId,
    SessionStatus, StorageError, SubscriberId, TranscriptStore,
};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

#[cfg(test)]
mod tests;

/// Default bound on how long deletion waits for an adapter handle to close.
const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Registry error.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session {0} is already running")]
    Conflict(SessionId),
    #[error(transparent)]
    Persistence(StorageError),
}

impl From<StorageError> for RegistryError {
    fn from(err: StorageError) -> Self {
        match err {
            // The store lost the session, e.g. a concurrent delete.
            StorageError::NotFound(id) => Self::NotFound(id),
            other => Self::Persistence(other),
        }
    }
}

/// Events of one turn, as seen by the caller that started it.
///
/// The same events are broadcast to every subscriber of the session.
/// Dropping the stream does not cancel the turn.
pub type TurnStream = BoxStream<'static, SessionEvent>;

/// Session metadata with its transcript length.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    #[serde(flatten)]
    pub session: Session,
    pub message_count: u64,
}

/// Session metadata with its full transcript.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDetail {
    #[serde(flatten)]
    pub session: Session,
    pub message_count: u64,
    pub messages: Vec<Message>,
}

struct SlotState {
    session: Session,
    message_count: u64,
    handle: Option<Arc<dyn AdapterHandle>>,
    deleted: bool,
}

struct SessionSlot {
    ordinal: u64,
    state: Mutex<SlotState>,
    fanout: Fanout,
    watchers: Arc<Fanout>,
}

impl SessionSlot {
    fn new(ordinal: u64, session: Session, message_count: u64, watchers: Arc<Fanout>) -> Self {
        Self {
            ordinal,
            state: Mutex::new(SlotState {
                session,
                message_count,
                handle: None,
                deleted: false,
            }),
            fanout: Fanout::new(),
            watchers,
        }
    }

    fn state(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn summary(&self) -> SessionSummary {
        let state = self.state();
        SessionSummary {
            session: state.session.clone(),
            message_count: state.message_count,
        }
    }
}

/// Owns all sessions of the process.
pub struct SessionRegistry {
    store: Arc<dyn TranscriptStore>,
    adapter: Arc<dyn AssistantAdapter>,
    default_working_dir: PathBuf,
    close_timeout: Duration,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    watchers: Arc<Fanout>,
    next_ordinal: AtomicU64,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(
        store: Arc<dyn TranscriptStore>,
        adapter: Arc<dyn AssistantAdapter>,
        default_working_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            adapter,
            default_working_dir,
            close_timeout: DEFAULT_CLOSE_TIMEOUT,
            sessions: RwLock::new(HashMap::new()),
            watchers: Arc::new(Fanout::new()),
            next_ordinal: AtomicU64::new(0),
        }
    }

    /// Set how long deletion waits for an adapter handle to close.
    #[must_use]
    pub const fn with_close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    async fn insert(&self, session: Session, message_count: u64) {
        let ordinal = self.next_ordinal.fetch_add(1, Ordering::SeqCst);
        let id = session.id.clone();
        let slot = Arc::new(SessionSlot::new(
            ordinal,
            session,
            message_count,
            Arc::clone(&self.watchers),
        ));
        self.sessions.write().await.insert(id, slot);
    }

    async fn slot(&self, id: &str) -> Result<Arc<SessionSlot>, RegistryError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    /// Rehydrate session metadata from the store.
    ///
    /// Restored sessions are idle and have no adapter handle.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn restore(&self) -> Result<usize, RegistryError> {
        let sessions = self.store.load_sessions().await?;
        let mut restored = Vec::with_capacity(sessions.len());
        for mut session in sessions {
            session.status = SessionStatus::Idle;
            let count = self.store.load_messages(&session.id).await?.len() as u64;
            restored.push((session, count));
        }

        let total = restored.len();
        for (session, count) in restored {
            self.insert(session, count).await;
        }
        tracing::info!(sessions = total, "Restored sessions from store");
        Ok(total)
    }

    /// Create an idle session. No assistant process is started.
    ///
    /// # Errors
    /// Returns error if the session cannot be persisted.
    pub async fn create_session(
        &self,
        name: &str,
        working_dir: Option<PathBuf>,
    ) -> Result<Session, RegistryError> {
        let working_dir = working_dir.unwrap_or_else(|| self.default_working_dir.clone());
        let session = Session::new(name, working_dir);
        self.store.save_session(&session).await?;
        self.insert(session.clone(), 0).await;
        tracing::info!(session_id = %session.id, name = %session.name, "Created session");
        Ok(session)
    }

    /// Create a session pre-populated with a transcript, continuing an
    /// existing backend conversation.
    ///
    /// # Errors
    /// Returns error if the session or its messages cannot be persisted.
    pub async fn import_session(
        &self,
        name: &str,
        working_dir: Option<PathBuf>,
        resume_token: Option<String>,
        messages: Vec<Message>,
    ) -> Result<Session, RegistryError> {
        let working_dir = working_dir.unwrap_or_else(|| self.default_working_dir.clone());
        let mut session = Session::new(name, working_dir);
        session.resume_token = resume_token;
        self.store.save_session(&session).await?;

        for (seq, message) in (0_u64..).zip(&messages) {
            if let Err(e) = self.store.append_message(&session.id, seq, message).await {
                if let Err(cleanup) = self.store.delete_session(&session.id).await {
                    tracing::warn!(session_id = %session.id, "Failed to roll back import: {cleanup}");
                }
                return Err(e.into());
            }
        }

        self.insert(session.clone(), messages.len() as u64).await;
        tracing::info!(
            session_id = %session.id,
            messages = messages.len(),
            resumable = session.resume_token.is_some(),
            "Imported session"
        );
        Ok(session)
    }

    /// All sessions in creation order.
    pub async fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut slots: Vec<Arc<SessionSlot>> =
            self.sessions.read().await.values().cloned().collect();
        slots.sort_by_key(|slot| slot.ordinal);
        slots.iter().map(|slot| slot.summary()).collect()
    }

    /// Session metadata and full transcript.
    ///
    /// # Errors
    /// Returns error if the session is unknown or its transcript cannot be read.
    pub async fn get_session(&self, id: &str) -> Result<SessionDetail, RegistryError> {
        let session = self.slot(id).await?.summary().session;
        let messages = self.store.load_messages(id).await?;
        Ok(SessionDetail {
            session,
            message_count: messages.len() as u64,
            messages,
        })
    }

    /// Change a session's display name.
    ///
    /// # Errors
    /// Returns error if the session is unknown or the store rejects the update.
    pub async fn rename_session(
        &self,
        id: &str,
        name: &str,
    ) -> Result<SessionSummary, RegistryError> {
        let slot = self.slot(id).await?;
        self.store.rename_session(id, name).await?;
        slot.state().session.name = name.to_string();
        Ok(slot.summary())
    }

    /// Delete a session, terminating its assistant process first.
    ///
    /// Closing the handle is bounded by the close timeout; failures are logged
    /// and do not prevent removal.
    ///
    /// # Errors
    /// Returns error if the session is unknown or cannot be removed from the store.
    pub async fn delete_session(&self, id: &str) -> Result<(), RegistryError> {
        let slot = self.slot(id).await?;
        let handle = {
            let mut state = slot.state();
            if state.deleted {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            state.deleted = true;
            state.handle.take()
        };

        if let Some(handle) = handle {
            self.close_handle(id, handle.as_ref()).await;
        }

        if let Err(e) = self.store.delete_session(id).await {
            slot.state().deleted = false;
            return Err(e.into());
        }
        self.sessions.write().await.remove(id);
        tracing::info!(session_id = %id, "Deleted session");
        Ok(())
    }

    /// Close every live adapter handle, leaving the sessions in place.
    ///
    /// Returns how many handles were closed. The next turn of each session
    /// opens a fresh handle.
    pub async fn close_all(&self) -> usize {
        let slots: Vec<Arc<SessionSlot>> = self.sessions.read().await.values().cloned().collect();
        let mut handles = Vec::new();
        for slot in slots {
            let mut state = slot.state();
            if let Some(handle) = state.handle.take() {
                handles.push((state.session.id.clone(), handle));
            }
        }

        futures::future::join_all(
            handles
                .iter()
                .map(|(id, handle)| self.close_handle(id, handle.as_ref())),
        )
        .await;
        handles.len()
    }

    /// Close a handle within the close timeout. Failures are only logged.
    async fn close_handle(&self, id: &str, handle: &dyn AdapterHandle) {
        match tokio::time::timeout(self.close_timeout, handle.close()).await {
            Ok(Ok(())) => tracing::debug!(session_id = %id, "Closed adapter handle"),
            Ok(Err(e)) => tracing::warn!(session_id = %id, "Failed to close adapter handle: {e}"),
            Err(_) => tracing::warn!(session_id = %id, "Timed out closing adapter handle"),
        }
    }

    /// Start a turn.
    ///
    /// The user's message is persisted before this returns; everything after
    /// that runs in the background and is reported through the returned stream
    /// and the session's subscribers. Adapter failures never surface here:
    /// they arrive as an `error` event and the session returns to `idle`.
    ///
    /// # Errors
    /// Returns error if the session is unknown, already has a turn in flight,
    /// or the user's message cannot be persisted.
    pub async fn send_message(&self, id: &str, content: &str) -> Result<TurnStream, RegistryError> {
        let slot = self.slot(id).await?;
        let (tx, rx) = mpsc::unbounded_channel();

        let (resume_token, seq) = {
            let mut state = slot.state();
            if state.deleted {
                return Err(RegistryError::NotFound(id.to_string()));
            }
            if state.session.status.is_busy() {
                return Err(RegistryError::Conflict(id.to_string()));
            }
            state.session.status = SessionStatus::Running;
            publish(id, &slot, &tx, SessionEvent::Status {
                status: SessionStatus::Running,
            });
            (state.session.resume_token.clone(), state.message_count)
        };

        let user = Message::user_text(content);
        if let Err(e) = self.store.append_message(id, seq, &user).await {
            let mut state = slot.state();
            state.session.status = SessionStatus::Idle;
            publish(id, &slot, &tx, SessionEvent::Status {
                status: SessionStatus::Idle,
            });
            return Err(e.into());
        }
        slot.state().message_count += 1;
        publish(id, &slot, &tx, SessionEvent::UserMessage {
            content: content.to_string(),
        });

        let turn = Turn {
            id: id.to_string(),
            slot,
            store: Arc::clone(&self.store),
            adapter: Arc::clone(&self.adapter),
            tx,
        };
        tokio::spawn(turn.run(content.to_string(), resume_token));

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    /// Approve a parked tool invocation.
    ///
    /// Returns `false` if nothing is pending for `tool_use_id`.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn approve_tool(&self, id: &str, tool_use_id: &str) -> Result<bool, RegistryError> {
        self.resolve(id, tool_use_id, ApprovalDecision::Approve).await
    }

    /// Deny a parked tool invocation.
    ///
    /// Returns `false` if nothing is pending for `tool_use_id`.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn deny_tool(
        &self,
        id: &str,
        tool_use_id: &str,
        reason: Option<String>,
    ) -> Result<bool, RegistryError> {
        self.resolve(id, tool_use_id, ApprovalDecision::Deny { reason })
            .await
    }

    async fn resolve(
        &self,
        id: &str,
        tool_use_id: &str,
        decision: ApprovalDecision,
    ) -> Result<bool, RegistryError> {
        let handle = self.slot(id).await?.state().handle.clone();
        let Some(handle) = handle else {
            tracing::debug!(session_id = %id, tool_use_id, "No adapter handle; ignoring approval decision");
            return Ok(false);
        };
        let resolved = handle.resolve_approval(tool_use_id, decision).await;
        if !resolved {
            tracing::debug!(session_id = %id, tool_use_id, "No pending approval for tool use");
        }
        Ok(resolved)
    }

    /// Register a sink for every event of a session.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn subscribe(&self, id: &str, sink: EventSink) -> Result<SubscriberId, RegistryError> {
        Ok(self.slot(id).await?.fanout.subscribe(sink))
    }

    /// Remove a sink. Returns `false` if it was not registered.
    ///
    /// # Errors
    /// Returns error if the session is unknown.
    pub async fn unsubscribe(
        &self,
        id: &str,
        subscriber: SubscriberId,
    ) -> Result<bool, RegistryError> {
        Ok(self.slot(id).await?.fanout.unsubscribe(subscriber))
    }

    /// Register a sink for the events of every session, including sessions
    /// created later.
    pub fn watch(&self, sink: EventSink) -> SubscriberId {
        self.watchers.subscribe(sink)
    }

    /// Remove a registry-wide sink. Returns `false` if it was not registered.
    pub fn unwatch(&self, watcher: SubscriberId) -> bool {
        self.watchers.unsubscribe(watcher)
    }
}

/// Broadcast to the session's subscribers, the registry's watchers and the
/// turn's own caller.
fn publish(
    id: &str,
    slot: &SessionSlot,
    tx: &mpsc::UnboundedSender<SessionEvent>,
    event: SessionEvent,
) {
    let frame = EventFrame::new(id, event.clone());
    slot.fanout.broadcast(&frame);
    slot.watchers.broadcast(&frame);
    // The caller may have dropped its stream; the turn carries on.
    let _ = tx.send(event);
}

/// One admitted turn, driven in its own task.
struct Turn {
    id: SessionId,
    slot: Arc<SessionSlot>,
    store: Arc<dyn TranscriptStore>,
    adapter: Arc<dyn AssistantAdapter>,
    tx: mpsc::UnboundedSender<SessionEvent>,
}

impl Turn {
    async fn run(self, prompt: String, resume_token: Option<String>) {
        if let Err(e) = self.stream(&prompt, resume_token.as_deref()).await {
            tracing::warn!(session_id = %self.id, "Turn failed: {e}");
            self.emit(SessionEvent::Error {
                message: e.to_string(),
            })
            .await;
        }
        self.transition(SessionStatus::Idle);
        tracing::debug!(session_id = %self.id, "Turn finished");
    }

    async fn stream(&self, prompt: &str, resume_token: Option<&str>) -> Result<(), AdapterError> {
        let handle = self.handle().await?;
        let mut events = handle.interact(prompt, resume_token).await?;
        let mut pending_approvals = HashSet::new();

        while let Some(event) = events.next().await {
            if self.slot.state().deleted {
                return Ok(());
            }
            match event? {
                AdapterEvent::Text { text } => {
                    self.emit(SessionEvent::AssistantText { content: text })
                        .await;
                }
                AdapterEvent::ToolUse { id, name, input } => {
                    self.emit(SessionEvent::ToolUse {
                        tool: name,
                        input,
                        tool_use_id: id,
                    })
                    .await;
                }
                AdapterEvent::ToolResult {
                    tool_use_id,
                    output,
                    is_error,
                } => {
                    self.emit(SessionEvent::ToolResult {
                        tool_use_id,
                        output,
                        is_error,
                    })
                    .await;
                }
                AdapterEvent::ApprovalRequested {
                    tool_use_id,
                    tool_name,
                    tool_input,
                } => {
                    pending_approvals.insert(tool_use_id.clone());
                    self.emit(SessionEvent::ToolApprovalRequest {
                        tool_name,
                        tool_input,
                        tool_use_id,
                    })
                    .await;
                    self.transition(SessionStatus::WaitingApproval);
                }
                AdapterEvent::ApprovalResolved {
                    tool_use_id,
                    approved,
                } => {
                    pending_approvals.remove(&tool_use_id);
                    tracing::debug!(
                        session_id = %self.id,
                        tool_use_id = %tool_use_id,
                        approved,
                        still_pending = pending_approvals.len(),
                        "Approval resolved"
                    );
                    if pending_approvals.is_empty() {
                        self.transition(SessionStatus::Running);
                    }
                }
                AdapterEvent::Completed(completion) => {
                    self.complete(completion).await;
                    return Ok(());
                }
                AdapterEvent::Ignored { kind } => {
                    tracing::trace!(session_id = %self.id, kind = %kind, "Ignoring adapter event");
                }
            }
        }

        Err(AdapterError::Stream(
            "assistant stream ended before the turn completed".to_string(),
        ))
    }

    /// The session's handle, opening one on first use.
    async fn handle(&self) -> Result<Arc<dyn AdapterHandle>, AdapterError> {
        let ctx = {
            let state = self.slot.state();
            if let Some(handle) = &state.handle {
                return Ok(Arc::clone(handle));
            }
            ExecutionContext::from(&state.session)
        };

        let handle: Arc<dyn AdapterHandle> = Arc::from(self.adapter.open(&ctx).await?);

        let orphaned = {
            let mut state = self.slot.state();
            if state.deleted {
                true
            } else {
                state.handle = Some(Arc::clone(&handle));
                false
            }
        };
        if orphaned {
            // Deleted while opening; nobody else will close this handle.
            if let Err(e) = handle.close().await {
                tracing::warn!(session_id = %self.id, "Failed to close orphaned handle: {e}");
            }
            return Err(AdapterError::Closed);
        }
        Ok(handle)
    }

    async fn complete(&self, completion: Completion) {
        let Completion {
            resume_token,
            cost,
            turns,
            duration_ms,
            is_error,
        } = completion;

        if let Some(token) = &resume_token {
            // The in-memory token drives the next turn even if persisting it fails.
            self.slot.state().session.resume_token = Some(token.clone());
            if let Err(e) = self.store.set_resume_token(&self.id, token).await {
                tracing::error!(session_id = %self.id, "Failed to persist resume token: {e}");
            }
        }

        self.emit(SessionEvent::Result {
            claude_session_id: resume_token,
            cost,
            turns,
            duration_ms,
            is_error,
        })
        .await;
    }

    /// Append then broadcast one event.
    ///
    /// Persistence failures mid-turn are logged and delivery continues.
    async fn emit(&self, event: SessionEvent) {
        let seq = {
            let state = self.slot.state();
            if state.deleted {
                return;
            }
            state.message_count
        };

        if let Some(message) = event.to_message() {
            match self.store.append_message(&self.id, seq, &message).await {
                Ok(()) => self.slot.state().message_count += 1,
                Err(e) => {
                    tracing::error!(session_id = %self.id, kind = message.body.kind(), "Failed to persist message: {e}");
                }
            }
        }

        publish(&self.id, &self.slot, &self.tx, event);
    }

    /// Set the status and announce it while holding the slot, so a following
    /// turn cannot announce `running` ahead of this turn's `idle`.
    fn transition(&self, status: SessionStatus) {
        let mut state = self.slot.state();
        state.session.status = status;
        if !state.deleted {
            publish(&self.id, &self.slot, &self.tx, SessionEvent::Status {
                status,
            });
        }
    }
}
