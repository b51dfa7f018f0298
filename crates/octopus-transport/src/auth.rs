//! Shared-secret authentication.
//!
//! REST requests carry the token as `Authorization: Bearer <token>`; the
//! WebSocket endpoint takes it as a `token` query parameter because browsers
//! cannot set headers on upgrade requests.

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::Response,
};

use crate::{rest::ApiError, router::AppState};

/// Extract the token from an `Authorization` header value.
fn bearer_token(value: &str) -> Option<&str> {
    let (scheme, token) = value.split_once(' ')?;
    scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
}

/// Whether `candidate` matches the configured token.
#[must_use]
pub fn token_matches(expected: &str, candidate: &str) -> bool {
    !expected.is_empty() && expected == candidate
}

/// Middleware rejecting requests without the configured bearer token.
///
/// # Errors
/// Returns `401 Unauthorized` if the header is missing or the token is wrong.
pub async fn require_bearer(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token);

    match token {
        Some(token) if token_matches(&state.auth_token, token) => Ok(next.run(request).await),
        Some(_) => Err(ApiError::Unauthorized("Invalid token".into())),
        None => Err(ApiError::Unauthorized("Not authenticated".into())),
    }
}
