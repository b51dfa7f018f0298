//! Claude Code adapter with stream-json control protocol support.
//!
//! Provides:
//! - `ClaudeAdapter` - spawns the CLI and implements `AssistantAdapter`
//! - Claude Code SDK protocol types and translation into adapter events
//! - Command building utilities
//! - Tool approval broker

pub mod approvals;
pub mod claude;
pub mod command;

pub use approvals::{ApprovalBroker, ApprovalMode, ApprovalResult};
pub use claude::{ClaudeAdapter, ClaudeConfig};
pub use command::{CommandBuilder, CommandParts};
