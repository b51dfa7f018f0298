//! In-process fixtures for transport tests.

use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use axum::Router;
use futures::StreamExt;
use octopus_core::{
    AdapterError, AdapterEvent, AdapterHandle, AdapterStream, ApprovalDecision, AssistantAdapter,
    Completion, ExecutionContext,
};
use octopus_session::{SessionRegistry, storage::MemoryStore};

use crate::{AppState, router};

pub const TOKEN: &str = "test-token";

/// Adapter that answers every prompt with `echo: <prompt>`.
struct EchoAdapter;

struct EchoHandle {
    session_id: String,
}

#[async_trait]
impl AssistantAdapter for EchoAdapter {
    async fn open(&self, ctx: &ExecutionContext) -> Result<Box<dyn AdapterHandle>, AdapterError> {
        Ok(Box::new(EchoHandle {
            session_id: ctx.session_id.clone(),
        }))
    }
}

#[async_trait]
impl AdapterHandle for EchoHandle {
    async fn interact(
        &self,
        prompt: &str,
        _resume_token: Option<&str>,
    ) -> Result<AdapterStream, AdapterError> {
        let events = vec![
            Ok(AdapterEvent::Text {
                text: format!("echo: {prompt}"),
            }),
            Ok(AdapterEvent::Completed(Completion {
                resume_token: Some(format!("c-{}", self.session_id)),
                ..Completion::default()
            })),
        ];
        Ok(futures::stream::iter(events).boxed())
    }

    async fn resolve_approval(&self, _tool_use_id: &str, _decision: ApprovalDecision) -> bool {
        false
    }

    async fn close(&self) -> Result<(), AdapterError> {
        Ok(())
    }
}

pub fn test_registry() -> Arc<SessionRegistry> {
    Arc::new(SessionRegistry::new(
        Arc::new(MemoryStore::new()),
        Arc::new(EchoAdapter),
        PathBuf::from("/tmp"),
    ))
}

pub fn test_app() -> (Router, Arc<SessionRegistry>) {
    let registry = test_registry();
    let state = AppState::new(Arc::clone(&registry), TOKEN);
    (router(state, &["http://localhost:5173".to_string()]), registry)
}
