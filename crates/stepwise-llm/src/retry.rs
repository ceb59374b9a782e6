use std::time::Duration;

use futures::future::BoxFuture;
use tracing::warn;

use stepwise_core::config::{ModelConfig, RetryConfig};
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::LlmClient;
use stepwise_core::types::*;

/// An LLM client that retries transient failures with jittered backoff.
///
/// Only installed when the engine config carries a `[model.retry]` section;
/// the graph engine itself never retries a node.
pub struct RetryingClient {
    inner: Box<dyn LlmClient>,
    retry_config: RetryConfig,
}

impl RetryingClient {
    pub fn new(inner: Box<dyn LlmClient>, retry_config: RetryConfig) -> Self {
        Self {
            inner,
            retry_config,
        }
    }
}

fn is_retryable(e: &StepwiseError) -> bool {
    match e {
        StepwiseError::LlmRequest(msg) => {
            msg.contains("429")
                || msg.contains("500")
                || msg.contains("502")
                || msg.contains("503")
                || msg.contains("timeout")
                || msg.contains("connection")
        }
        StepwiseError::LlmTimeout { .. } => true,
        _ => false,
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = (config.initial_backoff_ms * 2u64.pow(attempt)).min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl LlmClient for RetryingClient {
    fn complete_structured(
        &self,
        config: &ModelConfig,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<StructuredResponse>> {
        let config = config.clone();

        Box::pin(async move {
            let max_retries = self.retry_config.max_retries;

            let mut attempt = 0;
            loop {
                match self.inner.complete_structured(&config, request.clone()).await {
                    Ok(response) => return Ok(response),
                    Err(e) if is_retryable(&e) && attempt < max_retries => {
                        let backoff = calculate_backoff(attempt, &self.retry_config);
                        warn!(
                            attempt = attempt + 1,
                            max_retries,
                            backoff_ms = backoff.as_millis() as u64,
                            error = %e,
                            "Retrying LLM request"
                        );
                        tokio::time::sleep(backoff).await;
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        })
    }
}
