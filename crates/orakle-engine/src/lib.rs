pub mod anthropic;
pub mod anthropic_stream;
pub mod conversation;
pub mod heuristic;
pub mod middleware;
pub mod ollama;
pub mod openai;
pub mod provider;
pub mod stream;
pub mod template;
pub mod thinking;
pub mod trim;
pub mod workers;

use std::sync::Arc;

use orakle_core::config::LlmConfig;
use orakle_core::error::OrakleError;

use crate::anthropic::AnthropicProvider;
use crate::ollama::OllamaProvider;
use crate::openai::OpenAiProvider;
use crate::provider::LlmProvider;

/// Builds the active provider from config, per `llm.active` (§4.4, §9).
pub fn build_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, OrakleError> {
    match config.active.as_str() {
        "anthropic" => {
            let cfg = config
                .anthropic
                .as_ref()
                .ok_or_else(|| OrakleError::Config("llm.active is \"anthropic\" but llm.anthropic is unset".to_string()))?;
            Ok(Arc::new(AnthropicProvider::new(cfg.api_key.clone(), Some(cfg.base_url.clone()))))
        }
        "openai" => {
            let cfg = config
                .openai
                .as_ref()
                .ok_or_else(|| OrakleError::Config("llm.active is \"openai\" but llm.openai is unset".to_string()))?;
            Ok(Arc::new(OpenAiProvider::new(cfg.api_key.clone(), Some(cfg.base_url.clone()))))
        }
        "ollama" => {
            let cfg = config
                .ollama
                .as_ref()
                .ok_or_else(|| OrakleError::Config("llm.active is \"ollama\" but llm.ollama is unset".to_string()))?;
            Ok(Arc::new(OllamaProvider::new(Some(cfg.base_url.clone()))))
        }
        other => Err(OrakleError::Config(format!("unknown llm.active provider: {other}"))),
    }
}

/// Resolves the configured model name for whichever provider is active,
/// so callers building a [`provider::ChatRequest`] don't need to re-match
/// on `llm.active` themselves.
pub fn active_model(config: &LlmConfig) -> Result<String, OrakleError> {
    match config.active.as_str() {
        "anthropic" => config
            .anthropic
            .as_ref()
            .map(|c| c.model.clone())
            .ok_or_else(|| OrakleError::Config("llm.active is \"anthropic\" but llm.anthropic is unset".to_string())),
        "openai" => config
            .openai
            .as_ref()
            .map(|c| c.model.clone())
            .ok_or_else(|| OrakleError::Config("llm.active is \"openai\" but llm.openai is unset".to_string())),
        "ollama" => config
            .ollama
            .as_ref()
            .map(|c| c.model.clone())
            .ok_or_else(|| OrakleError::Config("llm.active is \"ollama\" but llm.ollama is unset".to_string())),
        other => Err(OrakleError::Config(format!("unknown llm.active provider: {other}"))),
    }
}
