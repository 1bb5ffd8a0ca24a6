//! LLM integration.
//!
//! A single OpenAI-compatible backend reached over `reqwest`. The pipeline
//! only sees the `LlmProvider` trait.

pub mod openai;
pub mod provider;

pub use openai::OpenAiProvider;
pub use provider::*;

use std::sync::Arc;
use std::time::Duration;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
    /// Overrides the public OpenAI endpoint (e.g. a local proxy).
    pub base_url: Option<String>,
    pub timeout: Duration,
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    let provider = OpenAiProvider::new(
        config.api_key.clone(),
        config.model.clone(),
        config.base_url.clone(),
        config.timeout,
    )?;
    tracing::info!(model = %config.model, "Using OpenAI-compatible provider");
    Ok(Arc::new(provider))
}
