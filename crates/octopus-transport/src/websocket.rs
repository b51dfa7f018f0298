//! WebSocket chat endpoint.
//!
//! Every connection watches the whole registry. `status` and
//! `tool_approval_request` frames of every session reach every connection, so
//! a tab that did not start a turn still sees it finish or stall on an
//! approval. The remaining frames of a session are delivered once the
//! connection has sent a message to it or subscribed to it. Each frame reaches
//! a connection at most once.

use std::{collections::HashSet, sync::Arc};

use axum::{
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use octopus_core::{EventFrame, SessionEvent, SessionId, SubscriberId};
use octopus_session::{RegistryError, SessionRegistry};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::{
    auth,
    protocol::{ClientMessage, ServerMessage},
    router::AppState,
};

/// Close code sent when the `token` query parameter is missing or wrong.
pub const UNAUTHORIZED_CLOSE_CODE: u16 = 4001;

/// Query parameters of the upgrade request.
#[derive(Debug, Deserialize)]
pub struct WsParams {
    #[serde(default)]
    pub token: Option<String>,
}

/// `GET /ws?token=...`
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    let authorized = params
        .token
        .as_deref()
        .is_some_and(|token| auth::token_matches(&state.auth_token, token));

    if !authorized {
        tracing::warn!("Rejecting WebSocket connection with invalid token");
        return ws.on_upgrade(|mut socket| async move {
            let close = Message::Close(Some(CloseFrame {
                code: UNAUTHORIZED_CLOSE_CODE,
                reason: "Unauthorized".into(),
            }));
            let _ = socket.send(close).await;
        });
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    tracing::info!("WebSocket client connected");
    let (mut sender, mut receiver) = socket.split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<ServerMessage>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = outgoing_rx.recv().await {
            let json = match serde_json::to_string(&msg) {
                Ok(j) => j,
                Err(e) => {
                    tracing::error!("Failed to serialize message: {e}");
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let (mut connection, mut frames) = Connection::open(Arc::clone(&state.registry), outgoing_tx);
    loop {
        tokio::select! {
            Some(frame) = frames.recv() => connection.forward(frame),
            msg = receiver.next() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data.to_vec()) {
                        Ok(s) => s,
                        Err(_) => continue,
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error: {e}");
                        break;
                    }
                };
                connection.handle_text(&text).await;
            }
        }
    }

    connection.close();
    send_task.abort();
    tracing::info!("WebSocket client disconnected");
}

/// Frames every connection receives, whatever it is subscribed to.
const fn reaches_every_client(event: &SessionEvent) -> bool {
    matches!(
        event,
        SessionEvent::Status { .. } | SessionEvent::ToolApprovalRequest { .. }
    )
}

/// Per-connection command handling and frame filtering.
pub struct Connection {
    registry: Arc<SessionRegistry>,
    outgoing: mpsc::UnboundedSender<ServerMessage>,
    watcher: SubscriberId,
    subscriptions: HashSet<SessionId>,
}

impl Connection {
    /// Start watching the registry.
    ///
    /// Every frame of every session arrives on the returned receiver and must
    /// be passed to [`Connection::forward`], which decides what the client sees.
    #[must_use]
    pub fn open(
        registry: Arc<SessionRegistry>,
        outgoing: mpsc::UnboundedSender<ServerMessage>,
    ) -> (Self, mpsc::UnboundedReceiver<EventFrame>) {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let watcher = registry.watch(frames_tx);
        let connection = Self {
            registry,
            outgoing,
            watcher,
            subscriptions: HashSet::new(),
        };
        (connection, frames_rx)
    }

    fn reply(&self, msg: ServerMessage) {
        let _ = self.outgoing.send(msg);
    }

    /// Relay a registry frame if this client should see it.
    pub fn forward(&self, frame: EventFrame) {
        if reaches_every_client(&frame.event) || self.subscriptions.contains(&frame.session_id) {
            self.reply(ServerMessage::from(frame));
        }
    }

    /// Handle one raw text frame.
    pub async fn handle_text(&mut self, text: &str) {
        let value: Value = match serde_json::from_str(text) {
            Ok(v) => v,
            Err(_) => {
                self.reply(ServerMessage::error("Invalid JSON"));
                return;
            }
        };
        match serde_json::from_value::<ClientMessage>(value) {
            Ok(msg) => self.handle(msg).await,
            Err(e) => {
                tracing::warn!("Invalid client message: {e}");
                self.reply(ServerMessage::error(format!("Invalid message: {e}")));
            }
        }
    }

    /// Handle one decoded client message.
    pub async fn handle(&mut self, msg: ClientMessage) {
        match msg {
            ClientMessage::SendMessage {
                session_id,
                content,
            } => {
                if session_id.is_empty() || content.is_empty() {
                    self.reply(ServerMessage::error("session_id and content required"));
                    return;
                }
                // Output arrives through the registry watch.
                let newly_subscribed = self.subscriptions.insert(session_id.clone());
                if let Err(e) = self.registry.send_message(&session_id, &content).await {
                    if newly_subscribed && matches!(e, RegistryError::NotFound(_)) {
                        self.subscriptions.remove(&session_id);
                    }
                    self.reply(ServerMessage::session_error(session_id, e.to_string()));
                }
            }
            ClientMessage::ApproveTool {
                session_id,
                tool_use_id,
            } => {
                let result = self.registry.approve_tool(&session_id, &tool_use_id).await;
                self.report_decision(session_id, result);
            }
            ClientMessage::DenyTool {
                session_id,
                tool_use_id,
                reason,
            } => {
                let result = self
                    .registry
                    .deny_tool(&session_id, &tool_use_id, reason)
                    .await;
                self.report_decision(session_id, result);
            }
            ClientMessage::Subscribe { session_id } => {
                match self.registry.get_session(&session_id).await {
                    Ok(_) => {
                        self.subscriptions.insert(session_id);
                    }
                    Err(e) => self.reply(ServerMessage::session_error(session_id, e.to_string())),
                }
            }
            ClientMessage::Unsubscribe { session_id } => {
                self.subscriptions.remove(&session_id);
            }
            ClientMessage::Unknown => {
                tracing::debug!("Ignoring unknown client message type");
            }
        }
    }

    fn report_decision(&self, session_id: SessionId, result: Result<bool, RegistryError>) {
        match result {
            Ok(true) => {}
            Ok(false) => self.reply(ServerMessage::session_error(
                session_id,
                "No pending approval found",
            )),
            Err(e) => self.reply(ServerMessage::session_error(session_id, e.to_string())),
        }
    }

    /// Stop watching the registry.
    pub fn close(self) {
        self.registry.unwatch(self.watcher);
    }
}
