//! Claude Code agent client.

use std::sync::Arc;

use octopus_core::{AdapterError, AdapterEvent};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::approvals::{ApprovalBroker, ApprovalError, ApprovalResult};

/// Channel carrying one turn's events to the registry.
pub type EventSender = mpsc::UnboundedSender<Result<AdapterEvent, AdapterError>>;

/// Per-turn client: forwards events and answers permission prompts.
pub struct ClaudeClient {
    events: EventSender,
    approvals: Option<Arc<ApprovalBroker>>,
}

impl ClaudeClient {
    /// Create a new client. Without a broker every tool call is allowed.
    #[must_use]
    pub fn new(events: EventSender, approvals: Option<Arc<ApprovalBroker>>) -> Arc<Self> {
        Arc::new(Self { events, approvals })
    }

    /// Forward an event. A dropped receiver only means nobody is listening.
    pub(crate) fn emit(&self, event: AdapterEvent) {
        let _ = self.events.send(Ok(event));
    }

    /// Terminate the stream with an error.
    pub(crate) fn fail(&self, error: AdapterError) {
        let _ = self.events.send(Err(error));
    }

    /// Handle a `can_use_tool` request.
    pub(crate) async fn on_can_use_tool(
        &self,
        tool_name: String,
        input: Value,
        tool_use_id: Option<String>,
    ) -> Result<ApprovalResult, ClientError> {
        let Some(broker) = self.approvals.as_ref() else {
            return Ok(ApprovalResult::Allow {
                updated_input: input,
            });
        };

        let tool_use_id = tool_use_id.unwrap_or_else(|| {
            let generated = uuid::Uuid::new_v4().simple().to_string();
            tracing::warn!("No tool_use_id for tool '{tool_name}', using {generated}");
            generated
        });

        let decision = broker.register(&tool_use_id, input.clone())?;
        self.emit(AdapterEvent::ApprovalRequested {
            tool_use_id: tool_use_id.clone(),
            tool_name,
            tool_input: input,
        });

        let result = decision
            .await
            .map_err(|_| ApprovalError::Abandoned(tool_use_id.clone()))?;

        self.emit(AdapterEvent::ApprovalResolved {
            tool_use_id,
            approved: result.is_allow(),
        });
        Ok(result)
    }
}

/// Client error.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Approval failed: {0}")]
    Approval(#[from] ApprovalError),
}
