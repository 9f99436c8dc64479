//! `POST /chat` — the NDJSON conversation endpoint (§6). Body is
//! `{"session_id": string, "message": string}`; the response streams
//! `orakle_protocol::Event` lines, terminated by `signal/completed`
//! whether the turn succeeded or failed partway through.

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::warn;

use orakle_protocol::frames::Event;
use orakle_protocol::http::ChatRequest;

use crate::app::AppState;

pub async fn chat_handler(State(state): State<Arc<AppState>>, headers: HeaderMap, Json(req): Json<ChatRequest>) -> Response {
    if !is_authorized(&state, &headers) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({"error": "unauthorized"})),
        )
            .into_response();
    }

    if req.message.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({"error": "message cannot be empty"})),
        )
            .into_response();
    }

    let conversation = match state.session(&req.session_id) {
        Ok(c) => c,
        Err(e) => {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({"error": e.to_string()})),
            )
                .into_response();
        }
    };

    let (tx, rx) = mpsc::channel::<Event>(64);
    let message = req.message;
    tokio::spawn(async move {
        if let Err(e) = conversation.handle_turn(&message, tx.clone()).await {
            warn!(error = %e, code = e.code(), "turn failed");
            let _ = tx.send(Event::error(e.to_string())).await;
            let _ = tx.send(Event::completed()).await;
        }
    });

    let body = Body::from_stream(ReceiverStream::new(rx).map(|event| Ok::<_, std::io::Error>(event.to_ndjson_line())));

    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/x-ndjson")
        .body(body)
        .expect("static status and headers always build a valid response")
}

/// A missing `gateway.auth.token` means unauthenticated access is allowed —
/// intended for local development only (§6).
fn is_authorized(state: &AppState, headers: &HeaderMap) -> bool {
    match &state.config.gateway.auth.token {
        None => true,
        Some(expected) => extract_bearer(headers).map(|t| t == expected).unwrap_or(false),
    }
}

fn extract_bearer(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
}
