use std::sync::Arc;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::Result;
use stepwise_core::traits::LlmClient;

/// Supplies the LLM capability for a node's merged model config.
pub trait ClientProvider: Send + Sync {
    fn client_for(&self, config: &ModelConfig) -> Result<Arc<dyn LlmClient>>;
}

/// Picks a client per provider name through [`stepwise_llm::create_shared_client`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ProviderClients;

impl ClientProvider for ProviderClients {
    fn client_for(&self, config: &ModelConfig) -> Result<Arc<dyn LlmClient>> {
        stepwise_llm::create_shared_client(config)
    }
}

/// Uses one injected client for every node, whatever the provider says.
#[derive(Clone)]
pub struct SharedClient(pub Arc<dyn LlmClient>);

impl ClientProvider for SharedClient {
    fn client_for(&self, _config: &ModelConfig) -> Result<Arc<dyn LlmClient>> {
        Ok(self.0.clone())
    }
}
