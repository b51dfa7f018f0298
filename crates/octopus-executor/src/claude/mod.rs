//! Claude Code adapter and SDK protocol.

pub mod adapter;
pub mod client;
pub mod events;
pub mod protocol;
pub mod types;

pub use adapter::{ClaudeAdapter, ClaudeConfig, ClaudeHandle};
pub use client::ClaudeClient;
pub use protocol::ProtocolPeer;
pub use types::PermissionMode;
