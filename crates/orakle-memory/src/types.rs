use orakle_core::types::{MemoryId, MemoryKind, MemoryStatus, MessageId, Role};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single logged message (data model §3). `tokens` is pre-computed at
/// insertion using the active LLM's tokenizer (or the `orakle_core::tokens`
/// heuristic when the provider doesn't expose one).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub tokens: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// A GREEN memory (data model §3). `text` is the raw, unnormalized memory;
/// the vector store embeds [`crate::normalize::normalize`] of this text, but
/// `text` itself is authoritative and is what retrieval callers see.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: MemoryId,
    #[serde(rename = "type")]
    pub kind: MemoryKind,
    pub topic: String,
    pub text: String,
    pub relevance: f32,
    pub status: MemoryStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_updated: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub source_message_ids: Vec<MessageId>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Memory {
    pub fn new(kind: MemoryKind, topic: impl Into<String>, text: impl Into<String>) -> Self {
        let now = chrono::Utc::now();
        Self {
            id: MemoryId::new(),
            kind,
            topic: topic.into(),
            text: text.into(),
            relevance: 1.0,
            status: MemoryStatus::Current,
            created_at: now,
            last_updated: now,
            source_message_ids: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

/// A memory scored and annotated for a single retrieval call (§4.4 step 4).
/// `display_text` carries the "PAST MEMORY DON'T CONSIDER..." caution prefix
/// when `memory.status == Past`; everywhere else callers should prefer
/// `memory.text`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoredMemory {
    pub memory: Memory,
    pub score: f32,
    pub display_text: String,
}

/// Reserved keys in `db_metadata` (§3 Persisted Metadata, §4.4, §9).
pub mod metadata_keys {
    pub const PROFILE_LAST_PROCESSED_TIMESTAMP: &str = "profile_last_processed_timestamp";
    pub const PROFILE_DECAY_TURN_COUNTER: &str = "profile_decay_turn_counter";
    pub const VECTOR_DB_NEEDS_RESET: &str = "vector_db_needs_reset";
}
