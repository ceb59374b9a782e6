pub mod providers;
pub mod retry;

use std::sync::Arc;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::LlmClient;

pub use providers::echo::EchoClient;
pub use providers::openai::OpenAiClient;
pub use retry::RetryingClient;

/// Providers served by the OpenAI-compatible client.
const OPENAI_COMPATIBLE: &[&str] = &[
    "openai", "ollama", "vllm", "groq", "together", "openrouter", "lmstudio",
];

/// Create an LLM client based on the provider name.
pub fn create_client(config: &ModelConfig) -> Result<Box<dyn LlmClient>> {
    match config.provider.as_str() {
        "echo" => Ok(Box::new(EchoClient::new())),
        p if OPENAI_COMPATIBLE.contains(&p) => Ok(Box::new(OpenAiClient::new())),
        other => Err(StepwiseError::UnsupportedProvider(other.to_string())),
    }
}

/// Create a client, wrapped in [`RetryingClient`] when the config asks for retries.
pub fn create_shared_client(config: &ModelConfig) -> Result<Arc<dyn LlmClient>> {
    let client = create_client(config)?;
    Ok(match config.retry {
        Some(ref retry) => Arc::new(RetryingClient::new(client, retry.clone())),
        None => Arc::from(client),
    })
}
