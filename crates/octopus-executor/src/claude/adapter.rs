//! Claude Code CLI as an [`AssistantAdapter`].

use std::{
    path::Path,
    process::Stdio,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use futures::StreamExt;
use octopus_core::{
    AdapterError, AdapterHandle, AdapterStream, ApprovalDecision, AssistantAdapter,
    ExecutionContext,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    process::Command,
    sync::{Mutex, mpsc, oneshot},
};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::{client::ClaudeClient, protocol::ProtocolPeer, types::PermissionMode};
use crate::{
    approvals::{ApprovalBroker, ApprovalMode},
    command::{CommandBuilder, CommandParts},
};

/// Default base command.
pub const DEFAULT_CLAUDE_COMMAND: &str = "claude";

/// Arguments that put the CLI into bidirectional stream-json mode.
const STREAM_JSON_PARAMS: [&str; 4] = [
    "-p",
    "--verbose",
    "--output-format=stream-json",
    "--input-format=stream-json",
];

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct ClaudeConfig {
    /// Base command, parsed with shell quoting rules.
    pub command: String,
    /// How permission prompts are answered.
    pub approval_mode: ApprovalMode,
    /// How long a closing handle waits for the process after interrupting it.
    pub close_grace: Duration,
}

impl Default for ClaudeConfig {
    fn default() -> Self {
        Self {
            command: DEFAULT_CLAUDE_COMMAND.to_string(),
            approval_mode: ApprovalMode::Auto,
            close_grace: Duration::from_secs(3),
        }
    }
}

impl ClaudeConfig {
    /// Command builder for every turn of a handle.
    #[must_use]
    pub fn command_builder(&self) -> CommandBuilder {
        let mode = match self.approval_mode {
            ApprovalMode::Auto => PermissionMode::BypassPermissions,
            ApprovalMode::Interactive => PermissionMode::Default,
        };
        let builder = CommandBuilder::new(self.command.clone())
            .params(STREAM_JSON_PARAMS)
            .extend_params([format!("--permission-mode={}", mode.as_str())]);
        match self.approval_mode {
            ApprovalMode::Auto => builder,
            ApprovalMode::Interactive => builder.extend_params(["--permission-prompt-tool=stdio"]),
        }
    }
}

/// Spawns Claude Code processes.
#[derive(Debug, Clone, Default)]
pub struct ClaudeAdapter {
    config: ClaudeConfig,
}

impl ClaudeAdapter {
    #[must_use]
    pub const fn new(config: ClaudeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl AssistantAdapter for ClaudeAdapter {
    async fn open(&self, ctx: &ExecutionContext) -> Result<Box<dyn AdapterHandle>, AdapterError> {
        if !ctx.working_dir.is_dir() {
            return Err(AdapterError::Spawn(format!(
                "working directory does not exist: {}",
                ctx.working_dir.display()
            )));
        }

        let command = self.config.command_builder();
        // Fail at open rather than on the first prompt if the CLI is missing.
        command
            .build_initial()
            .map_err(|e| AdapterError::Spawn(e.to_string()))?
            .into_resolved()
            .await
            .map_err(|e| AdapterError::Spawn(e.to_string()))?;

        let approvals = match self.config.approval_mode {
            ApprovalMode::Auto => None,
            ApprovalMode::Interactive => Some(Arc::new(ApprovalBroker::new())),
        };

        tracing::info!(session_id = %ctx.session_id, working_dir = %ctx.working_dir.display(), "Opened Claude handle");
        Ok(Box::new(ClaudeHandle {
            ctx: ctx.clone(),
            command,
            approvals,
            close_grace: self.config.close_grace,
            turn: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }
}

/// The process serving the current (or most recent) turn.
struct RunningTurn {
    child: AsyncGroupChild,
    interrupt_tx: Option<oneshot::Sender<()>>,
}

impl RunningTurn {
    /// Ask the CLI to stop, then kill the process group if it lingers.
    async fn shutdown(mut self, grace: Duration) -> std::io::Result<()> {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return Ok(());
        }
        if let Some(tx) = self.interrupt_tx.take() {
            let _ = tx.send(());
        }
        if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
            return Ok(());
        }
        self.child.start_kill()?;
        let _ = tokio::time::timeout(grace, self.child.wait()).await;
        Ok(())
    }
}

/// One session's connection to Claude Code.
///
/// The CLI runs one process per turn; continuity across turns comes from the
/// resume token. The handle owns whichever process is current so closing it
/// terminates an in-flight turn.
pub struct ClaudeHandle {
    ctx: ExecutionContext,
    command: CommandBuilder,
    approvals: Option<Arc<ApprovalBroker>>,
    close_grace: Duration,
    turn: Mutex<Option<RunningTurn>>,
    closed: AtomicBool,
}

impl ClaudeHandle {
    fn spawn_child(&self, program: &Path, args: &[String]) -> Result<AsyncGroupChild, AdapterError> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(&self.ctx.working_dir)
            .env_remove("CLAUDECODE")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        command
            .group_spawn()
            .map_err(|e| AdapterError::Spawn(format!("{}: {e}", program.display())))
    }
}

#[async_trait]
impl AdapterHandle for ClaudeHandle {
    async fn interact(
        &self,
        prompt: &str,
        resume_token: Option<&str>,
    ) -> Result<AdapterStream, AdapterError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AdapterError::Closed);
        }

        let mut turn = self.turn.lock().await;
        if let Some(previous) = turn.take() {
            if let Err(e) = previous.shutdown(self.close_grace).await {
                tracing::warn!(session_id = %self.ctx.session_id, "Failed to reap previous Claude process: {e}");
            }
        }

        let parts: CommandParts = match resume_token {
            Some(token) => self.command.build_follow_up(token),
            None => self.command.build_initial(),
        }
        .map_err(|e| AdapterError::Spawn(e.to_string()))?;
        let (program, args) = parts
            .into_resolved()
            .await
            .map_err(|e| AdapterError::Spawn(e.to_string()))?;

        let mut child = self.spawn_child(&program, &args)?;
        let (Some(stdin), Some(stdout)) = (child.inner().stdin.take(), child.inner().stdout.take())
        else {
            let _ = child.start_kill();
            return Err(AdapterError::Spawn("assistant stdio not captured".to_string()));
        };

        if let Some(stderr) = child.inner().stderr.take() {
            let session_id = self.ctx.session_id.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(session_id = %session_id, "claude stderr: {line}");
                }
            });
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let client = ClaudeClient::new(events_tx, self.approvals.clone());
        let (interrupt_tx, interrupt_rx) = oneshot::channel();
        let peer = ProtocolPeer::spawn(stdin, stdout, client, interrupt_rx);

        let started = async {
            peer.initialize(None).await?;
            peer.send_user_message(prompt.to_string()).await
        }
        .await;
        if let Err(e) = started {
            let _ = child.start_kill();
            return Err(AdapterError::Stream(format!("sending prompt: {e}")));
        }

        tracing::debug!(
            session_id = %self.ctx.session_id,
            resumed = resume_token.is_some(),
            "Claude turn started"
        );
        *turn = Some(RunningTurn {
            child,
            interrupt_tx: Some(interrupt_tx),
        });

        Ok(UnboundedReceiverStream::new(events_rx).boxed())
    }

    async fn resolve_approval(&self, tool_use_id: &str, decision: ApprovalDecision) -> bool {
        self.approvals
            .as_ref()
            .is_some_and(|broker| broker.resolve(tool_use_id, decision))
    }

    async fn close(&self) -> Result<(), AdapterError> {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(broker) = &self.approvals {
            broker.cancel_all("Session closed");
        }
        let Some(turn) = self.turn.lock().await.take() else {
            return Ok(());
        };
        tracing::info!(session_id = %self.ctx.session_id, "Stopping Claude process");
        turn.shutdown(self.close_grace)
            .await
            .map_err(|e| AdapterError::Close(e.to_string()))
    }
}
