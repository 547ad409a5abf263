//! Summarization backend.
//!
//! Uses the rig-core crate for HTTP transport and the `RigAdapter` to bridge
//! rig's `CompletionModel` trait to our `LlmProvider` trait. Production talks
//! to Gemini.

pub mod provider;
mod rig_adapter;

pub use provider::*;
pub use rig_adapter::RigAdapter;

use std::sync::Arc;

use rig::client::CompletionClient;
use secrecy::ExposeSecret;

use crate::error::LlmError;

/// Configuration for creating an LLM provider.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub api_key: secrecy::SecretString,
    pub model: String,
}

impl LlmConfig {
    pub fn new(api_key: secrecy::SecretString, model: impl Into<String>) -> Self {
        Self {
            api_key,
            model: model.into(),
        }
    }
}

/// Create an LLM provider from configuration.
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>, LlmError> {
    use rig::providers::gemini;

    let client: rig::client::Client<gemini::client::GeminiExt> =
        gemini::Client::new(config.api_key.expose_secret()).map_err(|e| LlmError::RequestFailed {
            provider: "gemini".to_string(),
            reason: format!("Failed to create Gemini client: {e}"),
        })?;

    let model = client.completion_model(&config.model);
    tracing::info!("Using Gemini (model: {})", config.model);
    Ok(Arc::new(RigAdapter::new(model, &config.model, "gemini")))
}

/// Send `prompt` and return the generated text.
pub async fn summarize(llm: &dyn LlmProvider, prompt: &str) -> Result<String, LlmError> {
    let response = llm.complete(CompletionRequest::new(prompt)).await?;
    tracing::debug!(
        model = llm.model_name(),
        input_tokens = response.input_tokens,
        output_tokens = response.output_tokens,
        "Summary generated"
    );
    Ok(response.content)
}
