use thiserror::Error;

#[derive(Debug, Error)]
pub enum SkillsError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every configured server was unreachable (§7 "TransientNetwork").
    #[error("no skill server responded: {0}")]
    AllServersUnavailable(String),

    /// A server responded but rejected the call (§4.2: "non-2xx returns a
    /// formatted error string including the server's body").
    #[error("skill '{skill_id}' invocation failed ({status}): {body}")]
    InvocationFailed {
        skill_id: String,
        status: u16,
        body: String,
    },

    #[error("embedding backend error: {0}")]
    Embedding(String),

    #[error("skill not found: {0}")]
    NotFound(String),
}

impl From<orakle_memory::error::MemoryError> for SkillsError {
    fn from(e: orakle_memory::error::MemoryError) -> Self {
        SkillsError::Embedding(e.to_string())
    }
}

impl From<SkillsError> for orakle_core::OrakleError {
    fn from(e: SkillsError) -> Self {
        match e {
            SkillsError::AllServersUnavailable(msg) => orakle_core::OrakleError::TransientNetwork(msg),
            SkillsError::InvocationFailed { skill_id, status, body } => {
                orakle_core::OrakleError::SkillInvocationFailed(format!(
                    "{skill_id} ({status}): {body}"
                ))
            }
            SkillsError::Http(e) => orakle_core::OrakleError::TransientNetwork(e.to_string()),
            SkillsError::Serialization(e) => orakle_core::OrakleError::Serialization(e),
            SkillsError::Embedding(msg) => orakle_core::OrakleError::Fatal(msg),
            SkillsError::NotFound(msg) => orakle_core::OrakleError::SkillInvocationFailed(msg),
        }
    }
}
