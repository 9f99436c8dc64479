use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// `GET /capabilities` response: a map keyed by skill name (§6).
pub type CapabilitiesResponse = HashMap<String, SkillManifestEntry>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillManifestEntry {
    pub description: String,
    #[serde(default)]
    pub matcher_info: MatcherInfo,
    pub run_info: RunInfo,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub skill_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ui: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vendor: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embeddings_boost_factor: Option<f32>,
}

/// Free-form hints the semantic matcher folds into the embedded text —
/// keywords get repeated verbatim to bias cosine similarity (§4.1, §9:
/// `**keyword**` markup repeated 6x, domain path repeated 2x).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MatcherInfo {
    #[serde(default)]
    pub keywords: Vec<String>,
    #[serde(default)]
    pub domain_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default)]
    pub parameters: HashMap<String, RunParameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunParameter {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<Value>,
}

/// `POST /run/<skill_id>` request body — named arguments, passed through
/// verbatim to the skill server.
pub type RunRequest = HashMap<String, Value>;

/// A skill invocation's successful result is either a JSON value or a plain
/// string (§6); callers distinguish by inspecting the response
/// `Content-Type` header before deserializing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RunResult {
    Text(String),
    Json(Value),
}
