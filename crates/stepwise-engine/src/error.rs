use std::fmt;

use serde_json::Value;
use thiserror::Error;

use stepwise_core::error::StepwiseError;

/// A type string that does not describe a known type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid type '{input}': {reason}")]
pub struct TypeParseError {
    pub input: String,
    pub reason: String,
}

impl TypeParseError {
    pub(crate) fn new(input: &str, reason: impl Into<String>) -> Self {
        Self {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// A `{placeholder}` that matched neither an input, the fan-out scope nor state.
#[derive(Debug, Clone, Error)]
pub struct TemplateResolutionError {
    pub variable: String,
    pub template: String,
    pub available_inputs: Vec<String>,
    pub state_fields: Vec<String>,
    pub suggestion: Option<String>,
}

impl fmt::Display for TemplateResolutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cannot resolve '{{{}}}' in template '{}'",
            self.variable, self.template
        )?;
        if let Some(ref s) = self.suggestion {
            write!(f, "; did you mean '{}'?", s)?;
        }
        write!(
            f,
            " (inputs: [{}]; state fields: [{}])",
            self.available_inputs.join(", "),
            self.state_fields.join(", ")
        )
    }
}

/// Errors raised while turning a state schema into a [`crate::state::StateModel`].
#[derive(Debug, Clone, Error)]
pub enum StateBuilderError {
    #[error("state schema '{model}' declares no fields")]
    EmptySchema { model: String },

    #[error("state field '{field}' is an object but has no nested schema")]
    MissingNestedSchema { field: String },

    #[error("state field '{field}' has an empty nested schema")]
    EmptyNestedSchema { field: String },

    #[error("state field '{field}' has a nested schema but type '{ty}' is not object")]
    UnexpectedNestedSchema { field: String, ty: String },

    #[error("state field '{field}' is required and cannot declare a default")]
    RequiredWithDefault { field: String },

    #[error("default for state field '{field}' does not match type {expected}: {value}")]
    InvalidDefault {
        field: String,
        expected: String,
        value: Value,
    },

    #[error("node '{node_id}' writes undeclared field '{field}' as {second}, but another node writes it as {first}")]
    ConflictingOutputType {
        field: String,
        node_id: String,
        first: String,
        second: String,
    },
}

/// Errors raised when a concrete value does not fit the state model.
#[derive(Debug, Clone, Error)]
pub enum StateError {
    #[error("missing required state fields: {}", .fields.join(", "))]
    MissingRequired { fields: Vec<String> },

    #[error("unknown state field '{field}' (known fields: {})", .known.join(", "))]
    UnknownField { field: String, known: Vec<String> },

    #[error("state field '{field}' expects {expected}, got {value}")]
    TypeMismatch {
        field: String,
        expected: String,
        value: Value,
    },

    #[error("state field '{field}' expects an object, got {value}")]
    NotAnObject { field: String, value: Value },
}

/// Errors raised while building a node's structured-output model.
#[derive(Debug, Clone, Error)]
pub enum OutputBuilderError {
    #[error("node '{node_id}': object output schema must declare at least one field")]
    EmptyObject { node_id: String },

    #[error("node '{node_id}': nested object field '{field}' in output schema is not supported")]
    NestedObject { node_id: String, field: String },

    #[error("node '{node_id}': output type '{ty}' cannot declare fields (only object outputs can)")]
    FieldsOnScalar { node_id: String, ty: String },

    #[error("node '{node_id}': output field '{field}' is declared twice")]
    DuplicateField { node_id: String, field: String },
}

/// The step of node execution that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodePhase {
    Input,
    Prompt,
    Tool,
    Llm,
    Output,
}

impl NodePhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Prompt => "prompt",
            Self::Tool => "tool",
            Self::Llm => "llm",
            Self::Output => "output",
        }
    }
}

impl fmt::Display for NodePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Underlying cause of a [`NodeExecutionError`].
#[derive(Debug, Error)]
pub enum NodeFailure {
    #[error(transparent)]
    Template(#[from] TemplateResolutionError),

    #[error(transparent)]
    Capability(#[from] StepwiseError),

    #[error("LLM call exceeded the {timeout_secs}s node timeout")]
    Timeout { timeout_secs: u64 },

    #[error("structured output rejected: {}", .violations.join("; "))]
    InvalidOutput { violations: Vec<String> },

    #[error("result has no field '{output}' (fields: {})", .available.join(", "))]
    MissingOutput {
        output: String,
        available: Vec<String>,
    },

    #[error("run cancelled")]
    Cancelled,

    #[error("fan-out items field '{field}' holds {value}, expected a list")]
    ItemsNotList { field: String, value: Value },

    #[error(transparent)]
    State(#[from] StateError),
}

/// A node failed while executing. Carries the node id and the phase.
#[derive(Debug, Error)]
#[error("node '{node_id}' failed during {phase}: {source}")]
pub struct NodeExecutionError {
    pub node_id: String,
    pub phase: NodePhase,
    #[source]
    pub source: NodeFailure,
}

impl NodeExecutionError {
    pub fn new(node_id: impl Into<String>, phase: NodePhase, source: impl Into<NodeFailure>) -> Self {
        Self {
            node_id: node_id.into(),
            phase,
            source: source.into(),
        }
    }
}

/// Structural problems found while compiling the graph.
#[derive(Debug, Error)]
pub enum GraphBuilderError {
    #[error("graph has no START edge")]
    MissingEntry,

    #[error("graph has {count} START edges; exactly one is allowed")]
    MultipleEntries { count: usize },

    #[error("the START edge must name its entry node with 'to', not 'routes'")]
    RoutedEntry,

    #[error("node id '{node_id}' is declared more than once")]
    DuplicateNode { node_id: String },

    #[error("edge from '{from}' references unknown node '{reference}'")]
    UnknownNode { from: String, reference: String },

    #[error("edge from '{from}' must set exactly one of 'to' or 'routes'")]
    AmbiguousEdge { from: String },

    #[error("node '{from}' has {count} outgoing edges; use 'routes' for branching")]
    MultipleOutgoing { from: String, count: usize },

    #[error("edge from '{from}' points back at START")]
    EdgeIntoStart { from: String },

    #[error("END cannot have outgoing edges")]
    EdgeFromEnd,

    #[error("nodes unreachable from the entry node: {}", .nodes.join(", "))]
    Unreachable { nodes: Vec<String> },

    #[error("routes from '{from}' must end with a 'default' route")]
    MissingDefaultRoute { from: String },

    #[error("routes from '{from}' declare 'default' before the last route")]
    DefaultNotLast { from: String },

    #[error("invalid condition on edge from '{from}': {reason} in '{condition}'")]
    InvalidCondition {
        from: String,
        condition: String,
        reason: String,
    },

    #[error("fan-out on node '{node_id}': {reason}")]
    InvalidFanOut { node_id: String, reason: String },

    #[error("node '{node_id}' writes unknown state field '{field}'")]
    UnknownOutputField { node_id: String, field: String },

    #[error("node '{node_id}' binds unknown tool '{tool}'")]
    UnknownTool { node_id: String, tool: String },

    #[error("node '{node_id}' joins unknown crew '{crew}'")]
    UnknownCrew { node_id: String, crew: String },

    #[error("node '{node_id}': cannot create LLM client: {source}")]
    LlmClient {
        node_id: String,
        #[source]
        source: StepwiseError,
    },

    #[error(transparent)]
    Output(#[from] OutputBuilderError),
}

/// Errors while loading a workflow document from disk or text.
#[derive(Debug, Error)]
pub enum WorkflowLoadError {
    #[error("cannot read workflow '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported workflow extension '{extension}' (expected .yaml, .yml or .json)")]
    UnsupportedFormat { extension: String },

    #[error("invalid YAML workflow: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON workflow: {0}")]
    Json(#[from] serde_json::Error),
}

/// Cross-reference problems in an otherwise well-formed workflow document.
#[derive(Debug, Clone, Error)]
#[error("workflow '{workflow}' is invalid: {}", .issues.join("; "))]
pub struct ValidationError {
    pub workflow: String,
    pub issues: Vec<String>,
}

/// Failures while the compiled graph is running.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Node(#[from] NodeExecutionError),

    #[error("iteration limit of {limit} node executions reached at node '{node_id}'")]
    IterationLimit { limit: usize, node_id: String },

    #[error("run exceeded the {timeout_secs}s execution timeout")]
    Timeout { timeout_secs: u64 },

    #[error("run cancelled before node '{at_node}'")]
    Cancelled { at_node: String },

    #[error("run store failure: {0}")]
    Store(#[source] StepwiseError),

    #[error("graph has no node '{node_id}'")]
    UnknownNode { node_id: String },
}

/// Pipeline phase an [`ExecutionError`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ConfigLoad,
    ConfigValidation,
    FeatureGate,
    StateBuild,
    StateInitialization,
    GraphBuild,
    WorkflowExecution,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfigLoad => "config_load",
            Self::ConfigValidation => "config_validation",
            Self::FeatureGate => "feature_gate",
            Self::StateBuild => "state_build",
            Self::StateInitialization => "state_initialization",
            Self::GraphBuild => "graph_build",
            Self::WorkflowExecution => "workflow_execution",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level runtime error, tagged with the pipeline phase that failed.
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("config load failed: {0}")]
    ConfigLoad(#[source] WorkflowLoadError),

    #[error("config validation failed: {0}")]
    ConfigValidation(#[source] ValidationError),

    #[error(
        "feature '{feature}' is not supported by this engine (ships in {available_in}){}",
        .workaround.as_deref().map(|w| format!("; workaround: {}", w)).unwrap_or_default()
    )]
    FeatureGate {
        feature: String,
        available_in: String,
        workaround: Option<String>,
    },

    #[error("state model build failed: {0}")]
    StateBuild(#[source] StateBuilderError),

    #[error("state initialization failed: {0}")]
    StateInitialization(#[source] StateError),

    #[error("graph build failed: {0}")]
    GraphBuild(#[source] GraphBuilderError),

    #[error("workflow execution failed: {0}")]
    WorkflowExecution(#[source] WorkflowError),
}

impl ExecutionError {
    pub fn phase(&self) -> Phase {
        match self {
            Self::ConfigLoad(_) => Phase::ConfigLoad,
            Self::ConfigValidation(_) => Phase::ConfigValidation,
            Self::FeatureGate { .. } => Phase::FeatureGate,
            Self::StateBuild(_) => Phase::StateBuild,
            Self::StateInitialization(_) => Phase::StateInitialization,
            Self::GraphBuild(_) => Phase::GraphBuild,
            Self::WorkflowExecution(_) => Phase::WorkflowExecution,
        }
    }
}
