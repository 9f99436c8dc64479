use thiserror::Error;

/// Error kinds shared across the engine (spec §7: "Error kinds, not
/// types"). Each variant maps onto a propagation policy decided by the
/// caller, not by this enum — `code()` exists only so callers can surface
/// a stable string in error events without matching on the variant twice.
#[derive(Debug, Error)]
pub enum OrakleError {
    #[error("configuration error: {0}")]
    Config(String),

    /// A skill server or LLM endpoint could not be reached; the caller
    /// should try the next configured server or surface the failure.
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// A skill invocation returned a non-2xx response or a network error
    /// after all configured servers were exhausted.
    #[error("skill invocation failed: {0}")]
    SkillInvocationFailed(String),

    /// The LLM's selection or assimilation response could not be parsed
    /// as the expected JSON shape.
    #[error("malformed LLM output: {0}")]
    LlmFormatError(String),

    /// The `[AINARA GUARDRAIL]` marker appeared in streamed output and
    /// retries were exhausted.
    #[error("guardrail retries exhausted: {0}")]
    GuardrailTriggered(String),

    /// SQLite row count and vector store count disagree; the vector index
    /// must be rebuilt from SQLite before further retrieval.
    #[error("vector index inconsistent with relational store: {0}")]
    IndexInconsistency(String),

    /// The conversation exceeded the model's context window and could not
    /// be trimmed further without violating an invariant.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Unrecoverable — abort the turn with a user-visible message.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrakleError {
    /// Short error code string sent to clients in `signal/error` events.
    pub fn code(&self) -> &'static str {
        match self {
            OrakleError::Config(_) => "CONFIG_ERROR",
            OrakleError::TransientNetwork(_) => "TRANSIENT_NETWORK",
            OrakleError::SkillInvocationFailed(_) => "SKILL_INVOCATION_FAILED",
            OrakleError::LlmFormatError(_) => "LLM_FORMAT_ERROR",
            OrakleError::GuardrailTriggered(_) => "GUARDRAIL_TRIGGERED",
            OrakleError::IndexInconsistency(_) => "INDEX_INCONSISTENCY",
            OrakleError::CapacityExceeded(_) => "CAPACITY_EXCEEDED",
            OrakleError::Fatal(_) => "FATAL",
            OrakleError::Database(_) => "DATABASE_ERROR",
            OrakleError::Serialization(_) => "SERIALIZATION_ERROR",
            OrakleError::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, OrakleError>;
