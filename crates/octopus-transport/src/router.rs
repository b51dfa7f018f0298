//! HTTP application assembly.

use std::sync::Arc;

use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{get, post},
};
use octopus_session::SessionRegistry;
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer},
    trace::TraceLayer,
};

use crate::{auth, rest, websocket};

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub auth_token: Arc<str>,
}

impl AppState {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, auth_token: impl Into<Arc<str>>) -> Self {
        Self {
            registry,
            auth_token: auth_token.into(),
        }
    }
}

/// CORS policy for the browser UI.
///
/// Credentials are allowed, so methods and headers mirror the request and a
/// `*` origin mirrors the caller's origin rather than using a wildcard.
#[must_use]
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let allow_origin = if origins.iter().any(|o| o == "*") {
        AllowOrigin::mirror_request()
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|origin| match HeaderValue::from_str(origin) {
                Ok(value) => Some(value),
                Err(e) => {
                    tracing::warn!(origin = %origin, "Ignoring invalid CORS origin: {e}");
                    None
                }
            })
            .collect();
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods(AllowMethods::mirror_request())
        .allow_headers(AllowHeaders::mirror_request())
}

/// Build the application router.
///
/// `/api/*` requires the bearer token; `/ws` checks its `token` query
/// parameter itself; `/health` is public.
pub fn router(state: AppState, cors_origins: &[String]) -> Router {
    let api = Router::new()
        .route(
            "/api/sessions",
            get(rest::list_sessions).post(rest::create_session),
        )
        .route("/api/sessions/import", post(rest::import_session))
        .route(
            "/api/sessions/{id}",
            get(rest::get_session)
                .patch(rest::rename_session)
                .delete(rest::delete_session),
        )
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_bearer,
        ));

    Router::new()
        .merge(api)
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(rest::health))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(cors_layer(cors_origins)),
        )
        .with_state(state)
}
