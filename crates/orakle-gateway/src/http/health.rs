use std::sync::Arc;

use axum::{extract::State, Json};

use orakle_protocol::http::HealthResponse;

use crate::app::AppState;

/// `GET /health` — liveness probe (§6).
pub async fn health_handler(State(_state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse::ok())
}
