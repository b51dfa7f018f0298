//! Core abstractions for Octopus session orchestration.
//!
//! This crate provides the fundamental building blocks:
//! - `Session`, `Message` - the persisted data model
//! - `SessionEvent`, `EventFrame` - what a turn streams to clients
//! - `AdapterEvent` - backend-neutral events produced by assistant adapters
//! - `Fanout` - per-session broadcast to connected subscribers
//! - Storage and adapter traits

pub mod context;
pub mod event;
pub mod fanout;
pub mod message;
pub mod session;
pub mod traits;

pub use context::ExecutionContext;
pub use event::{AdapterEvent, Completion, EventFrame, SessionEvent};
pub use fanout::{EventSink, Fanout, SubscriberId};
pub use message::{Message, MessageBody, MessageRole};
pub use session::{Session, SessionId, SessionStatus};
pub use traits::{
    AdapterError, AdapterHandle, AdapterStream, ApprovalDecision, AssistantAdapter, StorageError,
    TranscriptStore,
};
