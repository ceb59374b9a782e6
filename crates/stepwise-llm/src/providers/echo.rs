use futures::future::BoxFuture;

use stepwise_core::config::ModelConfig;
use stepwise_core::error::Result;
use stepwise_core::traits::LlmClient;
use stepwise_core::types::*;

/// Offline client that answers every structured request with the prompt.
///
/// String fields receive the rendered prompt verbatim; other fields receive
/// the zero value of their schema type. Token counts are whitespace word
/// counts. Used for dry runs (`provider = "echo"`) and tests.
pub struct EchoClient;

impl EchoClient {
    pub fn new() -> Self {
        Self
    }
}

impl Default for EchoClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the echo answer for an object schema.
pub fn echo_output(prompt: &str, schema: &serde_json::Value) -> serde_json::Value {
    let mut out = serde_json::Map::new();
    if let Some(props) = schema.get("properties").and_then(|p| p.as_object()) {
        for (name, prop) in props {
            out.insert(name.clone(), zero_value(prompt, prop));
        }
    }
    serde_json::Value::Object(out)
}

fn zero_value(prompt: &str, prop: &serde_json::Value) -> serde_json::Value {
    match prop.get("type").and_then(|t| t.as_str()) {
        Some("string") => serde_json::Value::String(prompt.to_string()),
        Some("integer") => serde_json::json!(0),
        Some("number") => serde_json::json!(0.0),
        Some("boolean") => serde_json::Value::Bool(false),
        Some("array") => serde_json::json!([]),
        Some("object") => serde_json::json!({}),
        _ => serde_json::Value::Null,
    }
}

impl LlmClient for EchoClient {
    fn complete_structured(
        &self,
        _config: &ModelConfig,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<StructuredResponse>> {
        Box::pin(async move {
            let output = echo_output(&request.prompt, &request.output_schema);
            let input_tokens = request.prompt.split_whitespace().count() as u64;
            let output_tokens = output
                .as_object()
                .map(|o| o.len() as u64 * input_tokens)
                .unwrap_or(0);
            Ok(StructuredResponse {
                output,
                usage: Usage::new(input_tokens, output_tokens),
            })
        })
    }
}
