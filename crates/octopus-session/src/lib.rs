//! Session orchestration and transcript storage for Octopus.
//!
//! Provides:
//! - `SessionRegistry` - owns live sessions, serializes turns per session and
//!   fans their events out to subscribers
//! - Storage implementations (memory, SQLite)

pub mod registry;
pub mod storage;

pub use registry::{RegistryError, SessionDetail, SessionRegistry, SessionSummary, TurnStream};
