//! API Router and Application State
//!
//! Central routing configuration and shared state.

use std::sync::Arc;

use axum::{extract::State, middleware::from_fn_with_state, routing::get, Json, Router};
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use utoipa::OpenApi;

use crate::{auth, auth::JwtVerifier, config::Config, voice, voice::VoicePresence, ws};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration
    pub config: Arc<Config>,
    /// Presence coordinator
    pub voice: Arc<VoicePresence>,
    /// Access token verifier
    pub jwt: Arc<JwtVerifier>,
}

impl AppState {
    /// Create new application state.
    #[must_use]
    pub fn new(config: Config, voice: Arc<VoicePresence>, jwt: JwtVerifier) -> Self {
        Self {
            config: Arc::new(config),
            voice,
            jwt: Arc::new(jwt),
        }
    }
}

/// OpenAPI document of the REST surface.
#[derive(OpenApi)]
#[openapi(
    paths(
        voice::handlers::request_token,
        voice::handlers::leave_channel,
        voice::handlers::heartbeat,
        voice::handlers::moderate,
        voice::handlers::participants,
    ),
    components(schemas(voice::handlers::LeaveResponse)),
    tags((name = "voice", description = "Voice presence and call tokens")),
)]
pub struct ApiDoc;

/// Create the main application router.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Protected routes that require authentication
    let protected_routes = Router::new()
        .nest("/voice", voice::router())
        .layer(from_fn_with_state(state.clone(), auth::require_auth));

    Router::new()
        // Health check
        .route("/health", get(health_check))
        .merge(protected_routes)
        // WebSocket (authenticates via query param)
        .route("/ws", get(ws::handler))
        // API documentation
        .route("/api/openapi.json", get(openapi_json))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // State
        .with_state(state)
}

/// Health check response.
#[derive(Serialize)]
struct HealthResponse {
    /// Service status
    status: &'static str,
    /// Whether a call provider is configured
    provider_configured: bool,
}

/// Health check endpoint.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        provider_configured: state.voice.gateway().is_configured(),
    })
}

/// Serve the OpenAPI document.
async fn openapi_json() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}
