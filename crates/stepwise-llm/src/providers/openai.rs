use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{LlmClient, Tool};
use stepwise_core::types::*;

const OPENAI_API_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Maximum tool-call rounds before the model must produce its final answer.
const MAX_TOOL_ROUNDS: usize = 8;

/// OpenAI-compatible client. Works with OpenAI, Ollama, vLLM, Groq, OpenRouter, etc.
///
/// Structured output is requested through `response_format: json_schema`.
/// Tool calls are executed in-process and fed back until the model answers.
pub struct OpenAiClient {
    http: Client,
}

impl OpenAiClient {
    pub fn new() -> Self {
        Self {
            http: Client::new(),
        }
    }
}

impl Default for OpenAiClient {
    fn default() -> Self {
        Self::new()
    }
}

// Request types
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [OaiMessage],
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<OaiTool>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    r#type: &'static str,
    json_schema: JsonSchemaFormat,
}

#[derive(Serialize)]
struct JsonSchemaFormat {
    name: String,
    schema: serde_json::Value,
    strict: bool,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiMessage {
    role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<OaiToolCall>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

impl OaiMessage {
    fn user(text: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: Some(text.into()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn tool(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            role: "tool".to_string(),
            content: Some(content.into()),
            tool_calls: None,
            tool_call_id: Some(id.into()),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiToolCall {
    id: String,
    #[serde(default = "default_call_type")]
    r#type: String,
    function: OaiFunction,
}

fn default_call_type() -> String {
    "function".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub(crate) struct OaiFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Serialize)]
pub(crate) struct OaiTool {
    r#type: String,
    function: OaiToolDef,
}

#[derive(Serialize)]
pub(crate) struct OaiToolDef {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

// Response types
#[derive(Deserialize, Debug)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<OaiUsage>,
}

#[derive(Deserialize, Debug)]
struct Choice {
    message: OaiMessage,
}

#[derive(Deserialize, Debug)]
struct OaiUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

pub(crate) fn convert_tools(tools: &[ToolDefinition]) -> Vec<OaiTool> {
    tools
        .iter()
        .map(|t| OaiTool {
            r#type: "function".to_string(),
            function: OaiToolDef {
                name: t.name.clone(),
                description: t.description.clone(),
                parameters: t.input_schema.clone(),
            },
        })
        .collect()
}

/// Parse the model's final answer as a JSON object.
///
/// Tolerates markdown code fences some compatible servers wrap JSON in.
pub(crate) fn parse_structured(content: &str) -> Result<serde_json::Value> {
    let trimmed = content.trim();
    let unfenced = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.strip_suffix("```"))
        .unwrap_or(trimmed)
        .trim();

    let value: serde_json::Value = serde_json::from_str(unfenced)
        .map_err(|e| StepwiseError::LlmParse(format!("response is not valid JSON: {}", e)))?;
    if !value.is_object() {
        return Err(StepwiseError::LlmParse(format!(
            "expected a JSON object, got: {}",
            value
        )));
    }
    Ok(value)
}

async fn run_tool_call(
    call: &OaiToolCall,
    tools: &[Arc<dyn Tool>],
    ctx: &ToolContext,
) -> String {
    let Some(tool) = tools.iter().find(|t| t.name() == call.function.name) else {
        return format!("Error: tool '{}' is not bound to this node", call.function.name);
    };

    let input: serde_json::Value = match serde_json::from_str(&call.function.arguments) {
        Ok(v) => v,
        Err(e) => return format!("Error: invalid tool arguments: {}", e),
    };

    let timeout = Duration::from_secs(tool.timeout_secs());
    match tokio::time::timeout(timeout, tool.execute(input, ctx.clone())).await {
        Ok(Ok(result)) if result.is_error => format!("Error: {}", result.content),
        Ok(Ok(result)) => result.content,
        Ok(Err(e)) => format!("Error: {}", e),
        Err(_) => format!("Error: tool timed out after {}s", tool.timeout_secs()),
    }
}

impl LlmClient for OpenAiClient {
    fn complete_structured(
        &self,
        config: &ModelConfig,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<StructuredResponse>> {
        let config = config.clone();

        Box::pin(async move {
            let url = config.base_url.as_deref().unwrap_or(OPENAI_API_URL);
            let tool_defs = request.tool_definitions();
            let tool_ctx = request.tool_context.clone().unwrap_or_else(|| ToolContext {
                run_id: RunId::new(),
                node_id: request.output_name.clone(),
                working_dir: std::env::temp_dir(),
            });

            let mut messages = vec![OaiMessage::user(request.prompt.clone())];
            let mut usage = Usage::default();

            for round in 0..=MAX_TOOL_ROUNDS {
                // Last round: withhold tools so the model has to answer.
                let offer_tools = round < MAX_TOOL_ROUNDS;
                let body = ChatRequest {
                    model: &config.model_id,
                    messages: &messages,
                    max_tokens: config.max_tokens,
                    temperature: if config.temperature > 0.0 {
                        Some(config.temperature)
                    } else {
                        None
                    },
                    tools: if offer_tools { convert_tools(&tool_defs) } else { vec![] },
                    response_format: ResponseFormat {
                        r#type: "json_schema",
                        json_schema: JsonSchemaFormat {
                            name: request.output_name.clone(),
                            schema: request.output_schema.clone(),
                            strict: true,
                        },
                    },
                };

                let mut req = self.http.post(url).json(&body);
                if let Some(api_key) = &config.api_key {
                    req = req.header("Authorization", format!("Bearer {}", api_key));
                }

                let response = req
                    .send()
                    .await
                    .map_err(|e| StepwiseError::LlmRequest(e.to_string()))?;

                if !response.status().is_success() {
                    let status = response.status();
                    let body = response
                        .text()
                        .await
                        .unwrap_or_else(|_| "unknown".to_string());
                    return Err(StepwiseError::LlmRequest(format!("HTTP {}: {}", status, body)));
                }

                let parsed: ChatResponse = response
                    .json()
                    .await
                    .map_err(|e| StepwiseError::LlmParse(e.to_string()))?;

                if let Some(u) = parsed.usage {
                    usage.add(Usage::new(u.prompt_tokens, u.completion_tokens));
                }

                let message = parsed
                    .choices
                    .into_iter()
                    .next()
                    .map(|c| c.message)
                    .ok_or_else(|| StepwiseError::LlmParse("response has no choices".into()))?;

                let calls = message.tool_calls.clone().unwrap_or_default();
                if calls.is_empty() {
                    let content = message.content.unwrap_or_default();
                    let output = parse_structured(&content)?;
                    debug!(
                        model = %config.model_id,
                        rounds = round + 1,
                        input_tokens = usage.input_tokens,
                        output_tokens = usage.output_tokens,
                        "Structured completion finished"
                    );
                    return Ok(StructuredResponse { output, usage });
                }

                messages.push(message);
                for call in &calls {
                    debug!(tool = %call.function.name, "Executing tool call");
                    let result = run_tool_call(call, &request.tools, &tool_ctx).await;
                    messages.push(OaiMessage::tool(call.id.clone(), result));
                }
            }

            warn!(model = %config.model_id, "Model kept calling tools without answering");
            Err(StepwiseError::LlmParse(format!(
                "no structured answer after {} tool rounds",
                MAX_TOOL_ROUNDS
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_structured_plain() {
        let v = parse_structured(r#"{"result": "ok"}"#).unwrap();
        assert_eq!(v["result"], "ok");
    }

    #[test]
    fn test_parse_structured_fenced() {
        let v = parse_structured("```json\n{\"score\": 7}\n```").unwrap();
        assert_eq!(v["score"], 7);
    }

    #[test]
    fn test_parse_structured_rejects_non_object() {
        assert!(matches!(
            parse_structured("[1, 2]"),
            Err(StepwiseError::LlmParse(_))
        ));
        assert!(matches!(
            parse_structured("not json"),
            Err(StepwiseError::LlmParse(_))
        ));
    }

    #[test]
    fn test_request_serialization() {
        let messages = vec![OaiMessage::user("hello")];
        let body = ChatRequest {
            model: "gpt-4o-mini",
            messages: &messages,
            max_tokens: 100,
            temperature: None,
            tools: vec![],
            response_format: ResponseFormat {
                r#type: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: "echo".into(),
                    schema: serde_json::json!({"type": "object"}),
                    strict: true,
                },
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["model"], "gpt-4o-mini");
        assert!(json.get("tools").is_none());
        assert!(json.get("temperature").is_none());
        assert_eq!(json["response_format"]["type"], "json_schema");
        assert_eq!(json["response_format"]["json_schema"]["name"], "echo");
    }

    #[test]
    fn test_response_with_tool_calls_deserializes() {
        let raw = r#"{
            "choices": [{"message": {"role": "assistant", "content": null,
                "tool_calls": [{"id": "c1", "type": "function",
                    "function": {"name": "search", "arguments": "{\"q\":\"rust\"}"}}]}}],
            "usage": {"prompt_tokens": 12, "completion_tokens": 3}
        }"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        let calls = parsed.choices[0].message.tool_calls.clone().unwrap();
        assert_eq!(calls[0].function.name, "search");
        assert_eq!(parsed.usage.unwrap().prompt_tokens, 12);
    }
}
