//! Declarative LLM workflow engine.
//!
//! A workflow document (YAML or JSON) declares a typed state schema, LLM
//! nodes with prompt templates and structured outputs, and edges between
//! them. [`WorkflowRuntime`] loads, validates, feature-gates and compiles the
//! document into a [`graph::CompiledGraph`], then drives it from `START` to
//! `END`.

pub mod clients;
pub mod error;
pub mod features;
pub mod graph;
pub mod heartbeat;
pub mod node;
pub mod orchestrator;
pub mod output;
pub mod runtime;
pub mod state;
pub mod template;
pub mod types;
pub mod workflow;

pub use clients::{ClientProvider, ProviderClients, SharedClient};
pub use error::{
    ExecutionError, GraphBuilderError, NodeExecutionError, NodePhase, Phase, StateBuilderError,
    StateError, TemplateResolutionError, TypeParseError, WorkflowError,
};
pub use graph::{CompiledGraph, GraphBuilder};
pub use heartbeat::WorkflowHeartbeat;
pub use node::NodeExecutor;
pub use orchestrator::Orchestrator;
pub use output::OutputModel;
pub use runtime::{run_workflow, run_workflow_from_config, validate_workflow, RunOutcome, WorkflowRuntime};
pub use state::StateModel;
pub use types::TypeDescriptor;
pub use workflow::WorkflowConfig;
