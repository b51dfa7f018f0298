//! Approval handling for tool invocations.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use octopus_core::ApprovalDecision;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;

/// Default message sent to the CLI when a tool call is denied without reason.
const DEFAULT_DENY_MESSAGE: &str = "Denied by user";

/// How tool permission prompts are answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    /// Every tool call is allowed without asking.
    #[default]
    Auto,
    /// Tool calls are parked until a user approves or denies them.
    Interactive,
}

/// Result of an approval request, in the CLI's permission result shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "behavior", rename_all = "camelCase")]
pub enum ApprovalResult {
    /// Allow the tool invocation.
    Allow {
        #[serde(rename = "updatedInput")]
        updated_input: Value,
    },
    /// Deny the tool invocation.
    Deny {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        interrupt: Option<bool>,
    },
}

impl ApprovalResult {
    #[must_use]
    pub const fn is_allow(&self) -> bool {
        matches!(self, Self::Allow { .. })
    }
}

/// Approval error.
#[derive(Debug, Error)]
pub enum ApprovalError {
    #[error("Approval request {0} is already pending")]
    Duplicate(String),
    #[error("Approval request {0} was abandoned")]
    Abandoned(String),
}

struct Pending {
    tool_input: Value,
    reply: oneshot::Sender<ApprovalResult>,
}

/// Parks tool invocations until a decision arrives.
#[derive(Default)]
pub struct ApprovalBroker {
    pending: Mutex<HashMap<String, Pending>>,
}

impl ApprovalBroker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn pending(&self) -> MutexGuard<'_, HashMap<String, Pending>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a pending approval and return the receiver for its result.
    ///
    /// # Errors
    /// Returns error if an approval with the same id is already pending.
    pub fn register(
        &self,
        tool_use_id: &str,
        tool_input: Value,
    ) -> Result<oneshot::Receiver<ApprovalResult>, ApprovalError> {
        let mut pending = self.pending();
        if pending.contains_key(tool_use_id) {
            return Err(ApprovalError::Duplicate(tool_use_id.to_string()));
        }
        let (reply, rx) = oneshot::channel();
        pending.insert(tool_use_id.to_string(), Pending { tool_input, reply });
        Ok(rx)
    }

    /// Deliver a decision. Returns `false` if nothing is pending for the id.
    pub fn resolve(&self, tool_use_id: &str, decision: ApprovalDecision) -> bool {
        let Some(pending) = self.pending().remove(tool_use_id) else {
            return false;
        };
        let result = match decision {
            ApprovalDecision::Approve => ApprovalResult::Allow {
                updated_input: pending.tool_input,
            },
            ApprovalDecision::Deny { reason } => ApprovalResult::Deny {
                message: reason
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| DEFAULT_DENY_MESSAGE.to_string()),
                interrupt: None,
            },
        };
        pending.reply.send(result).is_ok()
    }

    /// Deny everything still pending, e.g. when the handle closes.
    pub fn cancel_all(&self, message: &str) {
        let drained: Vec<Pending> = self.pending().drain().map(|(_, p)| p).collect();
        for pending in drained {
            let _ = pending.reply.send(ApprovalResult::Deny {
                message: message.to_string(),
                interrupt: Some(true),
            });
        }
    }

    /// Number of approvals awaiting a decision.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending().len()
    }
}
