use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("memory not found: {id}")]
    NotFound { id: String },

    #[error("vector index inconsistent with relational store: {0}")]
    IndexInconsistency(String),

    #[error("embedding backend error: {0}")]
    Embedding(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An injected `MemorySynthesizer`/`MemoryAssimilator` adapter failed —
    /// the LLM call itself errored, or its reply didn't parse as the
    /// expected shape (§4.4 "Narratives", "Turn ingestion").
    #[error("memory LLM adapter error: {0}")]
    Llm(String),
}

impl From<MemoryError> for orakle_core::OrakleError {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::IndexInconsistency(msg) => orakle_core::OrakleError::IndexInconsistency(msg),
            MemoryError::Llm(msg) => orakle_core::OrakleError::LlmFormatError(msg),
            other => orakle_core::OrakleError::Database(other.to_string()),
        }
    }
}
