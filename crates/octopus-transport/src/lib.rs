//! Transport layer for browser clients.
//!
//! Provides:
//! - Wire protocol (JSON, tagged with `type`)
//! - REST session API and WebSocket chat endpoint (feature: http)

pub mod protocol;

#[cfg(feature = "http")]
pub mod auth;
#[cfg(feature = "http")]
pub mod rest;
#[cfg(feature = "http")]
mod router;
#[cfg(feature = "http")]
pub mod websocket;

#[cfg(all(test, feature = "http"))]
mod test_support;

pub use protocol::{ClientMessage, ServerMessage};

#[cfg(feature = "http")]
pub use router::{AppState, cors_layer, router};
