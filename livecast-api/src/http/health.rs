//! Health check endpoint for monitoring probes

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use livecast_sfu::EngineHealth;

use crate::http::AppState;

pub fn create_health_router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}

/// `OK` while the media engine runs
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    match &*state.signaling.engine.health().borrow() {
        EngineHealth::Running => (StatusCode::OK, "OK".to_string()),
        EngineHealth::Dead(reason) => (
            StatusCode::SERVICE_UNAVAILABLE,
            format!("media engine down: {reason}"),
        ),
    }
}
