use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single NDJSON line sent to the client (§6: "newline-terminated JSON
/// object with required fields `{type, event}` and optional `content`").
/// The middleware and Conversation Manager construct these directly rather
/// than going through a generic envelope, so `content` stays untyped here
/// and is validated by the constructors below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(rename = "type")]
    pub event_type: String,
    pub event: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
}

impl Event {
    pub fn to_ndjson_line(&self) -> String {
        let mut s = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        s.push('\n');
        s
    }

    fn new(event_type: &str, event: &str, content: Option<Value>) -> Self {
        Self {
            event_type: event_type.to_string(),
            event: event.to_string(),
            content,
        }
    }

    pub fn loading_start() -> Self {
        Self::new("signal", "loading", Some(serde_json::json!({"state": "start"})))
    }

    pub fn loading_start_reasoning(reasoning: f32) -> Self {
        Self::new(
            "signal",
            "loading",
            Some(serde_json::json!({"state": "start", "reasoning": reasoning})),
        )
    }

    pub fn loading_start_skill(skill_id: &str) -> Self {
        Self::new(
            "signal",
            "loading",
            Some(serde_json::json!({"state": "start", "type": "skill", "skill_id": skill_id})),
        )
    }

    pub fn loading_stop() -> Self {
        Self::new("signal", "loading", Some(serde_json::json!({"state": "stop"})))
    }

    pub fn thinking_start() -> Self {
        Self::new("signal", "thinking", Some(serde_json::json!({"state": "start"})))
    }

    pub fn thinking_stop() -> Self {
        Self::new("signal", "thinking", Some(serde_json::json!({"state": "stop"})))
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new("signal", "error", Some(serde_json::json!({"message": message.into()})))
    }

    pub fn info_message(message: impl Into<String>) -> Self {
        Self::new(
            "signal",
            "infoMessage",
            Some(serde_json::json!({"message": message.into()})),
        )
    }

    pub fn completed() -> Self {
        Self::new("signal", "completed", None)
    }

    pub fn message_stream(content: impl Into<String>, flags: StreamFlags) -> Self {
        Self::new(
            "message",
            "stream",
            Some(serde_json::json!({
                "content": content.into(),
                "flags": flags,
            })),
        )
    }

    pub fn message_stream_with_audio(
        content: impl Into<String>,
        flags: StreamFlags,
        audio_url: impl Into<String>,
        audio_format: impl Into<String>,
    ) -> Self {
        Self::new(
            "message",
            "stream",
            Some(serde_json::json!({
                "content": content.into(),
                "flags": flags,
                "audio": {"url": audio_url.into(), "format": audio_format.into()},
            })),
        )
    }

    pub fn set_view_document(format: impl Into<String>) -> Self {
        Self::new(
            "ui",
            "setView",
            Some(serde_json::json!({"view": "document", "format": format.into()})),
        )
    }

    pub fn set_memory_state(enabled: bool) -> Self {
        Self::new("ui", "setMemoryState", Some(serde_json::json!({"enabled": enabled})))
    }

    pub fn render_nexus(component_path: impl Into<String>, data: Value, query: impl Into<String>) -> Self {
        Self::new(
            "ui",
            "renderNexus",
            Some(serde_json::json!({
                "component_path": component_path.into(),
                "data": data,
                "query": query.into(),
            })),
        )
    }

    pub fn content_full(content: impl Into<String>) -> Self {
        Self::new("content", "full", Some(serde_json::json!({"content": content.into()})))
    }
}

/// Flags accompanying a `message/stream` chunk (§6 table).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct StreamFlags {
    pub command: bool,
    pub audio: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skill: Option<bool>,
}
