// Module: http
// REST surface for live metadata, WebSocket signaling endpoint and health probe

pub mod error;
pub mod health;
pub mod lives;
pub mod websocket;

use axum::{
    routing::{get, patch},
    Router,
};
use livecast_core::{Config, CredentialVerifier, LiveStore};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::signaling::SignalingContext;

pub use error::{AppError, AppResult};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn LiveStore>,
    pub verifier: Arc<dyn CredentialVerifier>,
    pub signaling: Arc<SignalingContext>,
    pub config: Arc<Config>,
}

/// Create the HTTP router with all routes
pub fn create_router(state: AppState) -> Router {
    let cors_permissive = state.config.server.cors_permissive;

    let mut router = Router::new()
        .merge(health::create_health_router())
        .route("/api/lives", get(lives::list_lives).post(lives::create_live))
        .route("/api/lives/{id}", get(lives::get_live))
        .route("/api/lives/{id}/end", patch(lives::end_live))
        .route("/ws", get(websocket::signaling_handler));

    if cors_permissive {
        router = router.layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );
    }

    router.layer(TraceLayer::new_for_http()).with_state(state)
}
