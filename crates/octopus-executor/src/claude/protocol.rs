//! Claude Code control protocol handler.

use std::sync::Arc;

use futures::FutureExt;
use octopus_core::AdapterError;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader},
    sync::{Mutex, oneshot},
};

use super::client::ClaudeClient;
use super::events::translate;
use super::types::{
    CLIMessage, ControlRequestType, ControlResponseMessage, ControlResponseType, Decoded, Message,
    SDKControlRequest, SDKControlRequestType,
};

/// Protocol error.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stdin already closed")]
    StdinClosed,
}

type Stdin = Box<dyn AsyncWrite + Send + Unpin>;

/// Handles bidirectional control protocol communication for one turn.
#[derive(Clone)]
pub struct ProtocolPeer {
    stdin: Arc<Mutex<Option<Stdin>>>,
}

impl ProtocolPeer {
    /// Spawn a new protocol peer.
    ///
    /// This starts a background task that reads stdout, answers control
    /// requests and forwards everything else to the client as events. The
    /// task ends after the `result` message, on EOF or on read failure.
    #[must_use]
    pub fn spawn<W, R>(
        stdin: W,
        stdout: R,
        client: Arc<ClaudeClient>,
        interrupt_rx: oneshot::Receiver<()>,
    ) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let peer = Self {
            stdin: Arc::new(Mutex::new(Some(Box::new(stdin)))),
        };

        let reader_peer = peer.clone();
        tokio::spawn(async move {
            reader_peer.read_loop(stdout, client, interrupt_rx).await;
        });

        peer
    }

    async fn read_loop<R>(
        &self,
        stdout: R,
        client: Arc<ClaudeClient>,
        interrupt_rx: oneshot::Receiver<()>,
    ) where
        R: AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(stdout);
        let mut buffer = String::new();
        let mut interrupt_rx = interrupt_rx.fuse();

        loop {
            buffer.clear();
            tokio::select! {
                line_result = reader.read_line(&mut buffer) => {
                    match line_result {
                        Ok(0) => {
                            client.fail(AdapterError::Stream(
                                "assistant process exited before completing the turn".to_string(),
                            ));
                            break;
                        }
                        Ok(_) => {
                            let line = buffer.trim();
                            if line.is_empty() {
                                continue;
                            }
                            match Decoded::from_line(line) {
                                Ok(Decoded { message: CLIMessage::ControlRequest { request_id, request }, .. }) => {
                                    let peer = self.clone();
                                    let client = Arc::clone(&client);
                                    tokio::spawn(async move {
                                        peer.handle_control_request(&client, request_id, request).await;
                                    });
                                }
                                Ok(Decoded { message: CLIMessage::ControlResponse { .. }, .. }) => {}
                                Ok(Decoded { kind, message }) => {
                                    let finished = matches!(message, CLIMessage::Result(_));
                                    for event in translate(&kind, message) {
                                        client.emit(event);
                                    }
                                    if finished {
                                        self.close_stdin().await;
                                        break;
                                    }
                                }
                                Err(e) => {
                                    tracing::warn!("Skipping unparseable CLI line: {e}");
                                }
                            }
                        }
                        Err(e) => {
                            tracing::error!("Error reading stdout: {e}");
                            client.fail(AdapterError::Stream(format!("reading assistant output: {e}")));
                            break;
                        }
                    }
                }
                Ok(()) = &mut interrupt_rx => {
                    if let Err(e) = self.interrupt().await {
                        tracing::debug!("Failed to send interrupt to Claude: {e}");
                    }
                }
            }
        }
    }

    async fn handle_control_request(
        &self,
        client: &Arc<ClaudeClient>,
        request_id: String,
        request: ControlRequestType,
    ) {
        match request {
            ControlRequestType::CanUseTool {
                tool_name,
                input,
                tool_use_id,
                ..
            } => match client.on_can_use_tool(tool_name, input, tool_use_id).await {
                Ok(result) => {
                    let sent = match serde_json::to_value(result) {
                        Ok(value) => self.send_hook_response(request_id, value).await,
                        Err(e) => Err(e.into()),
                    };
                    if let Err(e) = sent {
                        tracing::error!("Failed to send permission result: {e}");
                    }
                }
                Err(e) => {
                    tracing::error!("Error in on_can_use_tool: {e}");
                    if let Err(e2) = self.send_error(request_id, e.to_string()).await {
                        tracing::error!("Failed to send error response: {e2}");
                    }
                }
            },
            ControlRequestType::Unsupported => {
                tracing::debug!("Rejecting unsupported control request {request_id}");
                if let Err(e) = self
                    .send_error(request_id, "unsupported control request".to_string())
                    .await
                {
                    tracing::error!("Failed to send error response: {e}");
                }
            }
        }
    }

    /// Send a successful control response.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn send_hook_response(
        &self,
        request_id: String,
        response: serde_json::Value,
    ) -> Result<(), ProtocolError> {
        self.send_json(&ControlResponseMessage::new(ControlResponseType::Success {
            request_id,
            response: Some(response),
        }))
        .await
    }

    async fn send_error(&self, request_id: String, error: String) -> Result<(), ProtocolError> {
        self.send_json(&ControlResponseMessage::new(ControlResponseType::Error {
            request_id,
            error: Some(error),
        }))
        .await
    }

    async fn send_json<T: serde::Serialize>(&self, message: &T) -> Result<(), ProtocolError> {
        let json = serde_json::to_string(message)?;
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProtocolError::StdinClosed)?;
        stdin.write_all(json.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin so the CLI exits once the turn is over.
    pub async fn close_stdin(&self) {
        if let Some(mut stdin) = self.stdin.lock().await.take() {
            let _ = stdin.shutdown().await;
        }
    }

    /// Send a user message.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn send_user_message(&self, content: String) -> Result<(), ProtocolError> {
        let message = Message::new_user(content);
        self.send_json(&message).await
    }

    /// Initialize the protocol.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn initialize(&self, hooks: Option<serde_json::Value>) -> Result<(), ProtocolError> {
        self.send_json(&SDKControlRequest::new(SDKControlRequestType::Initialize {
            hooks,
        }))
        .await
    }

    /// Send interrupt request.
    ///
    /// # Errors
    /// Returns error if write fails.
    pub async fn interrupt(&self) -> Result<(), ProtocolError> {
        self.send_json(&SDKControlRequest::new(SDKControlRequestType::Interrupt {}))
            .await
    }
}
