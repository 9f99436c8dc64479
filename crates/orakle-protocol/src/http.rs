use serde::{Deserialize, Serialize};

/// `POST /chat` request body (§6, `orakle-gateway`'s only conversational
/// route). The response is an NDJSON stream of [`crate::frames::Event`]
/// lines, not a single JSON payload — there is no synchronous variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub session_id: String,
    pub message: String,
}

/// `GET /health` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub protocol_version: u32,
}

impl HealthResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
            protocol_version: orakle_core::config::PROTOCOL_VERSION,
        }
    }
}
