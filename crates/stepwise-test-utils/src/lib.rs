//! Test doubles and fixtures shared by the Stepwise crates.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};

use stepwise_core::config::ModelConfig;
use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::{LlmClient, Tool};
use stepwise_core::types::*;
use stepwise_llm::providers::echo::echo_output;

/// Unwrap a JSON object literal into a map.
pub fn json_map(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        other => panic!("expected a JSON object, got {}", other),
    }
}

/// LLM that returns pre-recorded outputs in order and fails once they run out.
pub struct ScriptedLlm {
    outputs: Mutex<Vec<Value>>,
    usage: Usage,
    delay: Option<Duration>,
    prompts: Mutex<Vec<String>>,
    tool_names: Mutex<Vec<Vec<String>>>,
}

impl ScriptedLlm {
    pub fn new(outputs: Vec<Value>) -> Self {
        let mut outputs = outputs;
        outputs.reverse();
        Self {
            outputs: Mutex::new(outputs),
            usage: Usage::default(),
            delay: None,
            prompts: Mutex::new(vec![]),
            tool_names: Mutex::new(vec![]),
        }
    }

    /// Usage reported for every call.
    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = usage;
        self
    }

    /// Sleep before answering (tokio time, so paused clocks apply).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every prompt received, in call order.
    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    /// Names of the tools bound to each call.
    pub fn tool_names(&self) -> Vec<Vec<String>> {
        self.tool_names.lock().unwrap().clone()
    }

    pub fn remaining(&self) -> usize {
        self.outputs.lock().unwrap().len()
    }
}

impl LlmClient for ScriptedLlm {
    fn complete_structured(
        &self,
        _config: &ModelConfig,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<StructuredResponse>> {
        Box::pin(async move {
            self.prompts.lock().unwrap().push(request.prompt.clone());
            self.tool_names
                .lock()
                .unwrap()
                .push(request.tools.iter().map(|t| t.name().to_string()).collect());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            let output = self
                .outputs
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| StepwiseError::LlmRequest("script exhausted".into()))?;
            Ok(StructuredResponse {
                output,
                usage: self.usage,
            })
        })
    }
}

/// LLM that answers like the echo provider after a per-prompt delay, and
/// records concurrency.
pub struct DelayedLlm {
    delay_for: Box<dyn Fn(&str) -> Duration + Send + Sync>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    completed: Mutex<Vec<String>>,
}

impl DelayedLlm {
    pub fn new(delay_for: impl Fn(&str) -> Duration + Send + Sync + 'static) -> Self {
        Self {
            delay_for: Box::new(delay_for),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            completed: Mutex::new(vec![]),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of calls that were running at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Prompts in the order their calls finished.
    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }
}

impl LlmClient for DelayedLlm {
    fn complete_structured(
        &self,
        _config: &ModelConfig,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<StructuredResponse>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            tokio::time::sleep((self.delay_for)(&request.prompt)).await;

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.completed.lock().unwrap().push(request.prompt.clone());
            Ok(StructuredResponse {
                output: echo_output(&request.prompt, &request.output_schema),
                usage: Usage::new(1, 1),
            })
        })
    }
}

/// LLM whose answer is computed from the prompt.
pub struct FnLlm {
    answer: Box<dyn Fn(&str) -> Value + Send + Sync>,
}

impl FnLlm {
    pub fn new(answer: impl Fn(&str) -> Value + Send + Sync + 'static) -> Self {
        Self {
            answer: Box::new(answer),
        }
    }
}

impl LlmClient for FnLlm {
    fn complete_structured(
        &self,
        _config: &ModelConfig,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<StructuredResponse>> {
        Box::pin(async move {
            Ok(StructuredResponse {
                output: (self.answer)(&request.prompt),
                usage: Usage::new(1, 1),
            })
        })
    }
}

/// Tool that always returns the same content.
pub struct StaticTool {
    name: String,
    content: String,
    calls: Arc<AtomicUsize>,
}

impl StaticTool {
    pub fn new(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared call counter, readable after the tool moves into a registry.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

impl Tool for StaticTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        "Returns a fixed string"
    }

    fn input_schema(&self) -> Value {
        serde_json::json!({"type": "object", "properties": {}})
    }

    fn execute(&self, _input: Value, _ctx: ToolContext) -> BoxFuture<'_, Result<ToolResult>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ToolResult::success(self.content.clone()))
        })
    }
}

/// One node that echoes `message` into `echoed`.
pub const ECHO_WORKFLOW: &str = r#"
schema_version: "1.0"
flow:
  name: echo
  description: Echo the input message
state:
  fields:
    message: {type: str, required: true}
    echoed: {type: str}
nodes:
  - id: echo
    prompt: "Echo: {message}"
    inputs:
      message: "{state.message}"
    output_schema: {type: str}
    outputs: [echoed]
edges:
  - {from: START, to: echo}
  - {from: echo, to: END}
"#;

/// A judge that loops on itself until `score >= 8`.
pub const LOOP_WORKFLOW: &str = r#"
schema_version: "1.0"
flow:
  name: refine
state:
  fields:
    draft: {type: str, required: true}
    score: {type: int, default: 0}
nodes:
  - id: judge
    prompt: "Score this draft from 0 to 10: {state.draft}"
    output_schema: {type: int, description: quality score}
    outputs: [score]
edges:
  - {from: START, to: judge}
  - from: judge
    routes:
      - condition: {logic: "score >= 8"}
        to: END
      - condition: default
        to: judge
"#;

/// Fan-out over `topics` into `summaries`.
pub const FANOUT_WORKFLOW: &str = r#"
schema_version: "1.0"
flow:
  name: digest
state:
  fields:
    topics: {type: "list[str]", required: true}
    summaries: {type: "list[str]"}
nodes:
  - id: split
    description: One summary per topic
    parallel:
      items_field: topics
      target_node: summarize
      collect_field: summaries
  - id: summarize
    prompt: "Summarize {item}"
    output_schema: {type: str}
edges:
  - {from: START, to: split}
  - {from: split, to: END}
"#;

/// Write a workflow file into `dir` and return its path.
pub fn write_workflow(dir: &Path, name: &str, content: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// A temp dir holding one workflow file. Keep the dir alive while using the path.
pub fn temp_workflow(name: &str, content: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = write_workflow(dir.path(), name, content);
    (dir, path)
}
