use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 8420;
pub const DEFAULT_BIND: &str = "127.0.0.1";

/// Top-level config (orakle.toml + ORAKLE_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrakleConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub skills: SkillsConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub conversation: ConversationConfig,
}

impl OrakleConfig {
    /// Load config from a TOML file with ORAKLE_* env var overrides.
    ///
    /// Checks in order:
    ///   1. Explicit path argument
    ///   2. ~/.orakle/orakle.toml
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: OrakleConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("ORAKLE_").split("__"))
            .extract()
            .map_err(|e| crate::error::OrakleError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.orakle/orakle.toml", home)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            auth: AuthConfig::default(),
        }
    }
}

/// Bearer-token auth only (§6: no Tailscale/device-token/trusted-proxy modes
/// — those are transport-shell concerns this engine does not own).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    /// When unset, the gateway accepts unauthenticated requests. Intended
    /// for local development only.
    pub token: Option<String>,
}

/// LLM provider selection and credentials. Exactly one of the provider
/// fields should be set; `active` picks which one `orakle-engine::registry`
/// builds at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub active: String,
    pub anthropic: Option<AnthropicConfig>,
    pub openai: Option<OpenAiConfig>,
    pub ollama: Option<OllamaConfig>,
    /// Maximum tokens of context the active model accepts; drives the
    /// piecewise top-k tables in §9 (small/medium/large tiers).
    #[serde(default = "default_context_window")]
    pub context_window: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    pub api_key: String,
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,
    #[serde(default = "default_anthropic_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    pub api_key: String,
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,
    pub model: String,
}

/// Skill registry client config (C1). `servers` is tried in order on every
/// request — each entry is a base URL, not a pool member; there is no
/// load-balancing, only priority fallback (§4.1, §9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillsConfig {
    #[serde(default)]
    pub servers: Vec<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub matcher: MatcherConfig,
}

impl Default for SkillsConfig {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            timeout_secs: default_timeout_secs(),
            matcher: MatcherConfig::default(),
        }
    }
}

/// Semantic matcher thresholds (C2, §4.1).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatcherConfig {
    #[serde(default = "default_match_threshold")]
    pub similarity_threshold: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    /// Name of the embedding model passed to `fastembed`; configuration-
    /// selectable per §4.1's "embedding model is configuration-selectable".
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_match_threshold(),
            top_k: default_top_k(),
            embedding_model: default_embedding_model(),
        }
    }
}

/// GREEN memory engine scoring constants (§9). Every constant here has a
/// named default matching the original's hardcoded values; all are
/// overridable so the weighting can be tuned without a rebuild.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Multiplier applied to key memories during retrieval scoring.
    #[serde(default = "default_key_memory_boost")]
    pub key_memory_boost: f32,
    /// Weight of intrinsic relevance in the hybrid retrieval score.
    #[serde(default = "default_relevance_weight")]
    pub relevance_weight: f32,
    /// Multiplier applied to memories with status=past during retrieval.
    #[serde(default = "default_past_memory_penalty")]
    pub past_memory_penalty: f32,
    /// B_max: ceiling on the recency boost term.
    #[serde(default = "default_max_recency_boost")]
    pub max_recency_boost: f32,
    /// k: exponential decay rate of the recency boost over elapsed turns.
    #[serde(default = "default_recency_decay_rate")]
    pub recency_decay_rate: f32,
    /// Per-decay-pass multiplicative factor applied to current memories.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,
    /// Number of conversation turns between background decay passes.
    #[serde(default = "default_decay_interval_turns")]
    pub decay_interval_turns: u32,
    /// Amount added to a memory's relevance when it is reinforced by a
    /// later assimilation pass, capped by `relevance_cap`.
    #[serde(default = "default_reinforce_increment")]
    pub reinforce_increment: f32,
    /// Ceiling a memory's relevance may never exceed.
    #[serde(default = "default_relevance_cap")]
    pub relevance_cap: f32,
    /// Floor below which a key memory is dropped from the profile summary.
    #[serde(default = "default_min_key_memory_relevance")]
    pub min_key_memory_relevance: f32,
    /// How many of the most recent turns are passed to the assimilation
    /// prompt as context for ignore/reinforce/create decisions.
    #[serde(default = "default_extraction_context_turns")]
    pub extraction_context_turns: u32,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            key_memory_boost: default_key_memory_boost(),
            relevance_weight: default_relevance_weight(),
            past_memory_penalty: default_past_memory_penalty(),
            max_recency_boost: default_max_recency_boost(),
            recency_decay_rate: default_recency_decay_rate(),
            decay_factor: default_decay_factor(),
            decay_interval_turns: default_decay_interval_turns(),
            reinforce_increment: default_reinforce_increment(),
            relevance_cap: default_relevance_cap(),
            min_key_memory_relevance: default_min_key_memory_relevance(),
            extraction_context_turns: default_extraction_context_turns(),
        }
    }
}

/// Conversation Manager knobs (C9, §4.5, §4.3 "Guardrails").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Ceiling the reasoning heuristic scales its [0,1] raw score by
    /// before it is turned into a `ThinkingLevel` hint.
    #[serde(default = "default_reasoning_max_level")]
    pub reasoning_max_level: f32,
    /// How many times a guardrail-triggered reply is regenerated before
    /// the marker is stripped and the turn surfaces anyway.
    #[serde(default = "default_max_guardrail_retries")]
    pub max_guardrail_retries: u32,
    /// Number of most-recent non-system messages folded into the
    /// command-interpretation prompt's optional chat context (§4.3 step 7).
    #[serde(default = "default_interpretation_context_messages")]
    pub interpretation_context_messages: usize,
    /// Whether contextual memory retrieval is active by default; toggled
    /// per-conversation by `/memory` and `/nomemory` (§4.5 step 1).
    #[serde(default = "default_memory_enabled")]
    pub memory_enabled_default: bool,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            reasoning_max_level: default_reasoning_max_level(),
            max_guardrail_retries: default_max_guardrail_retries(),
            interpretation_context_messages: default_interpretation_context_messages(),
            memory_enabled_default: default_memory_enabled(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_dir")]
    pub dir: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dir: default_db_dir(),
        }
    }
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_context_window() -> u32 {
    128_000
}
fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_anthropic_model() -> String {
    "claude-3-5-sonnet-20241022".to_string()
}
fn default_openai_base_url() -> String {
    "https://api.openai.com".to_string()
}
fn default_openai_model() -> String {
    "gpt-4o".to_string()
}
fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_match_threshold() -> f32 {
    0.3
}
fn default_top_k() -> usize {
    5
}
fn default_embedding_model() -> String {
    "BAAI/bge-small-en-v1.5".to_string()
}
fn default_key_memory_boost() -> f32 {
    1.5
}
fn default_relevance_weight() -> f32 {
    0.3
}
fn default_past_memory_penalty() -> f32 {
    0.5
}
fn default_max_recency_boost() -> f32 {
    1.5
}
fn default_recency_decay_rate() -> f32 {
    0.01
}
fn default_decay_factor() -> f32 {
    0.998
}
fn default_decay_interval_turns() -> u32 {
    10
}
fn default_reinforce_increment() -> f32 {
    1.0
}
fn default_relevance_cap() -> f32 {
    200.0
}
fn default_min_key_memory_relevance() -> f32 {
    0.2
}
fn default_extraction_context_turns() -> u32 {
    2
}
fn default_reasoning_max_level() -> f32 {
    0.6
}
fn default_max_guardrail_retries() -> u32 {
    2
}
fn default_interpretation_context_messages() -> usize {
    4
}
fn default_memory_enabled() -> bool {
    true
}
fn default_db_dir() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.orakle/contexts", home)
}
