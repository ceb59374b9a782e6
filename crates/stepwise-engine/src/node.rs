use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tracing::{debug, warn};

use stepwise_core::config::ModelConfig;
use stepwise_core::error::StepwiseError;
use stepwise_core::traits::{LlmClient, Tool};
use stepwise_core::types::{RunId, StructuredRequest, ToolContext, Usage};
use stepwise_tools::ToolRegistry;

use crate::clients::ClientProvider;
use crate::error::{GraphBuilderError, NodeExecutionError, NodeFailure, NodePhase};
use crate::output::{OutputModel, SCALAR_FIELD};
use crate::template::{self, FanOutScope, TemplateContext};
use crate::types::{BasicType, TypeDescriptor};
use crate::workflow::{CrewSpec, LlmOverride, NodeSpec, OutputSchema};

/// Shared inputs for binding nodes.
pub struct NodeBuildContext<'a> {
    /// Engine `[model]` with the workflow's `config.llm` applied.
    pub base_model: &'a ModelConfig,
    pub crews: &'a BTreeMap<String, CrewSpec>,
    pub tools: &'a ToolRegistry,
    pub clients: &'a dyn ClientProvider,
    /// Node timeout when neither the node nor its model sets one (0 = none).
    pub default_timeout_secs: u64,
    pub working_dir: &'a Path,
}

/// Merge LLM settings: node over crew over workflow over engine.
pub fn merge_model_config(
    base: &ModelConfig,
    workflow: Option<&LlmOverride>,
    crew: Option<&LlmOverride>,
    node: Option<&LlmOverride>,
) -> ModelConfig {
    let mut merged = base.clone();
    for layer in [workflow, crew, node].into_iter().flatten() {
        layer.apply(&mut merged);
    }
    merged
}

/// What one node execution produced.
#[derive(Debug, Clone)]
pub struct NodeOutput {
    pub node_id: String,
    /// State fields to merge.
    pub delta: Map<String, Value>,
    /// Validated structured result, in declared field order.
    pub result: Map<String, Value>,
    pub usage: Usage,
    pub elapsed_ms: u64,
}

/// A node bound to its prompt, output model, tools and LLM client.
pub struct NodeExecutor {
    id: String,
    prompt: String,
    inputs: BTreeMap<String, String>,
    outputs: Vec<String>,
    output: OutputModel,
    tools: Vec<Arc<dyn Tool>>,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
    timeout: Option<Duration>,
    working_dir: PathBuf,
}

impl NodeExecutor {
    /// Bind a node. Tools, crew and output model are resolved here so that
    /// mistakes surface before the run starts.
    pub fn build(spec: &NodeSpec, ctx: &NodeBuildContext<'_>) -> Result<Self, GraphBuilderError> {
        let crew_llm = match spec.crew {
            Some(ref name) => {
                let crew = ctx.crews.get(name).ok_or_else(|| GraphBuilderError::UnknownCrew {
                    node_id: spec.id.clone(),
                    crew: name.clone(),
                })?;
                crew.llm.as_ref()
            }
            None => None,
        };
        let model = merge_model_config(ctx.base_model, None, crew_llm, spec.llm.as_ref());

        let tools = spec
            .tools
            .iter()
            .map(|name| {
                ctx.tools.get(name).ok_or_else(|| GraphBuilderError::UnknownTool {
                    node_id: spec.id.clone(),
                    tool: name.clone(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let schema = spec
            .output_schema
            .clone()
            .unwrap_or_else(|| OutputSchema::scalar(TypeDescriptor::Basic(BasicType::Str), ""));
        let output = OutputModel::build(&schema, &spec.id)?;

        let llm = ctx
            .clients
            .client_for(&model)
            .map_err(|source| GraphBuilderError::LlmClient {
                node_id: spec.id.clone(),
                source,
            })?;

        let timeout_secs = spec
            .timeout_secs
            .or(model.timeout_secs)
            .unwrap_or(ctx.default_timeout_secs);

        debug!(
            node_id = %spec.id,
            provider = %model.provider,
            model = %model.model_id,
            tools = tools.len(),
            timeout_secs,
            "Node bound"
        );

        Ok(Self {
            id: spec.id.clone(),
            prompt: spec.prompt.clone(),
            inputs: spec.inputs.clone(),
            outputs: spec.outputs.clone(),
            output,
            tools,
            llm,
            model,
            timeout: (timeout_secs > 0).then(|| Duration::from_secs(timeout_secs)),
            working_dir: ctx.working_dir.to_path_buf(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn model(&self) -> &ModelConfig {
        &self.model
    }

    pub fn output_model(&self) -> &OutputModel {
        &self.output
    }

    pub fn outputs(&self) -> &[String] {
        &self.outputs
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Run the node against the current state.
    pub async fn execute(
        &self,
        state: &Map<String, Value>,
        scope: Option<&FanOutScope>,
        run_id: &RunId,
    ) -> Result<NodeOutput, NodeExecutionError> {
        let start = Instant::now();

        // 1. Inputs are template expressions over state (and the fan-out scope).
        let no_inputs = Map::new();
        let input_ctx = TemplateContext::new(&no_inputs, state).with_scope(scope);
        let mut resolved = Map::new();
        for (name, expr) in &self.inputs {
            let value = template::resolve(expr, &input_ctx)
                .map_err(|e| NodeExecutionError::new(&self.id, NodePhase::Input, e))?;
            resolved.insert(name.clone(), value);
        }

        // 2. Prompt sees resolved inputs first, then scope, then state.
        let prompt_ctx = TemplateContext::new(&resolved, state).with_scope(scope);
        let prompt = template::render(&self.prompt, &prompt_ctx)
            .map_err(|e| NodeExecutionError::new(&self.id, NodePhase::Prompt, e))?;

        // 3. Structured call.
        let mut request =
            StructuredRequest::new(prompt, self.output.schema_name(), self.output.json_schema());
        if !self.tools.is_empty() {
            request = request.with_tools(
                self.tools.clone(),
                ToolContext {
                    run_id: run_id.clone(),
                    node_id: self.id.clone(),
                    working_dir: self.working_dir.clone(),
                },
            );
        }

        let call = self.llm.complete_structured(&self.model, request);
        let response = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, call).await {
                Ok(r) => r,
                Err(_) => {
                    warn!(node_id = %self.id, timeout_secs = limit.as_secs(), "Node timed out");
                    return Err(NodeExecutionError::new(
                        &self.id,
                        NodePhase::Llm,
                        NodeFailure::Timeout {
                            timeout_secs: limit.as_secs(),
                        },
                    ));
                }
            },
            None => call.await,
        }
        .map_err(|e| {
            let phase = match e {
                StepwiseError::ToolNotFound(_)
                | StepwiseError::ToolExecution { .. }
                | StepwiseError::ToolTimeout { .. } => NodePhase::Tool,
                _ => NodePhase::Llm,
            };
            NodeExecutionError::new(&self.id, phase, e)
        })?;

        // 4. Validate and map onto state fields.
        let result = self.output.validate(&response.output).map_err(|violations| {
            NodeExecutionError::new(&self.id, NodePhase::Output, NodeFailure::InvalidOutput { violations })
        })?;
        let delta = self.map_outputs(&result)?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        debug!(
            node_id = %self.id,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            elapsed_ms,
            "Node executed"
        );

        Ok(NodeOutput {
            node_id: self.id.clone(),
            delta,
            result,
            usage: response.usage,
            elapsed_ms,
        })
    }

    fn map_outputs(&self, result: &Map<String, Value>) -> Result<Map<String, Value>, NodeExecutionError> {
        let mut delta = Map::new();

        if self.outputs.len() == 1 && result.len() == 1 {
            if let Some(value) = result.values().next() {
                delta.insert(self.outputs[0].clone(), value.clone());
            }
            return Ok(delta);
        }

        for name in &self.outputs {
            let value = result.get(name).ok_or_else(|| {
                NodeExecutionError::new(
                    &self.id,
                    NodePhase::Output,
                    NodeFailure::MissingOutput {
                        output: name.clone(),
                        available: self.output.field_names(),
                    },
                )
            })?;
            delta.insert(name.clone(), value.clone());
        }
        Ok(delta)
    }

    /// Value a fan-out worker contributes to the collect list.
    pub fn worker_value(&self, result: &Map<String, Value>) -> Value {
        if self.output.is_scalar() {
            result.get(SCALAR_FIELD).cloned().unwrap_or(Value::Null)
        } else {
            Value::Object(result.clone())
        }
    }
}
