//! Axum Router Configuration
//!
//! The gateway exposes the voice WebSocket and a health probe.

use crate::{state::AppState, ws::ws_handler};
use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct HealthResponse {
    pub status: &'static str,
    pub active_sessions: usize,
}

/// Reports liveness and the number of connected voice sessions.
pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        active_sessions: state.active_sessions(),
    })
}

/// Creates the main Axum router for the application.
pub fn create_router(app_state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .with_state(app_state)
}
