use orakle_protocol::frames::{Event, StreamFlags};
use orakle_protocol::http::{ChatRequest, HealthResponse};
use orakle_protocol::skill_wire::{CapabilitiesResponse, RunResult};

#[test]
fn loading_start_serialization() {
    let ev = Event::loading_start();
    let json = serde_json::to_string(&ev).unwrap();

    assert!(json.contains(r#""type":"signal""#));
    assert!(json.contains(r#""event":"loading""#));
    assert!(json.contains(r#""state":"start""#));
}

#[test]
fn loading_start_skill_carries_skill_id() {
    let ev = Event::loading_start_skill("weather");
    let json = serde_json::to_string(&ev).unwrap();

    assert!(json.contains(r#""type":"skill""#));
    assert!(json.contains(r#""skill_id":"weather""#));
}

#[test]
fn completed_has_no_content_field() {
    let ev = Event::completed();
    let json = serde_json::to_string(&ev).unwrap();

    assert_eq!(json, r#"{"type":"signal","event":"completed"}"#);
}

#[test]
fn message_stream_carries_flags() {
    let ev = Event::message_stream(
        "hello",
        StreamFlags {
            command: false,
            audio: false,
            duration: None,
            skill: None,
        },
    );
    let json = serde_json::to_string(&ev).unwrap();

    assert!(json.contains(r#""content":"hello""#));
    assert!(json.contains(r#""command":false"#));
}

#[test]
fn ndjson_line_is_newline_terminated() {
    let line = Event::completed().to_ndjson_line();
    assert!(line.ends_with('\n'));
    assert_eq!(line.matches('\n').count(), 1);
}

#[test]
fn chat_request_round_trip() {
    let json = r#"{"session_id":"abc-123","message":"hello"}"#;
    let req: ChatRequest = serde_json::from_str(json).unwrap();
    assert_eq!(req.session_id, "abc-123");
    assert_eq!(req.message, "hello");
}

#[test]
fn health_response_reports_protocol_version() {
    let health = HealthResponse::ok();
    let json = serde_json::to_string(&health).unwrap();
    assert!(json.contains(r#""status":"ok""#));
    assert!(json.contains(&format!(r#""protocol_version":{}"#, orakle_core::config::PROTOCOL_VERSION)));
}

#[test]
fn capabilities_response_parses_manifest_map() {
    let json = r#"{
        "weather": {
            "description": "look up current weather",
            "run_info": {"parameters": {"city": {"type": "string", "required": true}}}
        }
    }"#;
    let caps: CapabilitiesResponse = serde_json::from_str(json).unwrap();
    let entry = caps.get("weather").unwrap();
    assert_eq!(entry.description, "look up current weather");
    assert!(entry.run_info.parameters.get("city").unwrap().required);
}

#[test]
fn run_result_accepts_plain_string_or_json() {
    let as_text: RunResult = serde_json::from_str(r#""72F and sunny""#).unwrap();
    assert!(matches!(as_text, RunResult::Text(_)));

    let as_json: RunResult = serde_json::from_str(r#"{"temp_f": 72}"#).unwrap();
    assert!(matches!(as_json, RunResult::Json(_)));
}
