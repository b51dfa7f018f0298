//! REST session API.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use octopus_session::{RegistryError, SessionDetail, SessionSummary};
use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;

use crate::{
    protocol::{CreateSessionRequest, ImportSessionRequest, RenameSessionRequest},
    router::AppState,
};

/// API error, rendered as `{"detail": ...}`.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(String),
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NotFound(_) => Self::NotFound("Session not found".into()),
            RegistryError::Conflict(_) => Self::Conflict(err.to_string()),
            RegistryError::Persistence(e) => Self::Internal(e.to_string()),
        }
    }
}

#[derive(Serialize)]
struct ErrorBody {
    detail: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self {
            Self::Internal(msg) => tracing::error!(message = %msg, "API error"),
            _ => tracing::debug!(status = %status, message = %self, "Client error"),
        }
        (status, Json(ErrorBody {
            detail: self.to_string(),
        }))
            .into_response()
    }
}

/// `GET /health`
pub async fn health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

/// `GET /api/sessions`
pub async fn list_sessions(State(state): State<AppState>) -> Json<Vec<SessionSummary>> {
    Json(state.registry.list_sessions().await)
}

/// `POST /api/sessions`
///
/// # Errors
/// Returns error if the session cannot be persisted.
pub async fn create_session(
    State(state): State<AppState>,
    Json(req): Json<CreateSessionRequest>,
) -> Result<(StatusCode, Json<SessionSummary>), ApiError> {
    let session = state
        .registry
        .create_session(&req.name, req.working_dir)
        .await?;
    Ok((StatusCode::CREATED, Json(SessionSummary {
        session,
        message_count: 0,
    })))
}

/// `POST /api/sessions/import`
///
/// # Errors
/// Returns error if the session or its transcript cannot be persisted.
pub async fn import_session(
    State(state): State<AppState>,
    Json(req): Json<ImportSessionRequest>,
) -> Result<(StatusCode, Json<SessionDetail>), ApiError> {
    let session = state
        .registry
        .import_session(
            &req.name,
            req.working_dir,
            req.claude_session_id,
            req.messages,
        )
        .await?;
    let detail = state.registry.get_session(&session.id).await?;
    Ok((StatusCode::CREATED, Json(detail)))
}

/// `GET /api/sessions/{id}`
///
/// # Errors
/// Returns 404 for unknown sessions.
pub async fn get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, ApiError> {
    Ok(Json(state.registry.get_session(&id).await?))
}

/// `PATCH /api/sessions/{id}`
///
/// # Errors
/// Returns 404 for unknown sessions.
pub async fn rename_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RenameSessionRequest>,
) -> Result<Json<SessionSummary>, ApiError> {
    Ok(Json(state.registry.rename_session(&id, &req.name).await?))
}

/// `DELETE /api/sessions/{id}`
///
/// # Errors
/// Returns 404 for unknown sessions.
pub async fn delete_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.registry.delete_session(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}
