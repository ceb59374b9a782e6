use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use stepwise_core::config::AppConfig;
use stepwise_core::event::EventBus;
use stepwise_core::traits::{LlmClient, RunStore};
use stepwise_core::types::{RunId, RunRecord, RunStatus, Usage, WorkflowEvent};
use stepwise_tools::ToolRegistry;

use crate::clients::{ClientProvider, ProviderClients, SharedClient};
use crate::error::{ExecutionError, WorkflowError};
use crate::features::{self, FeatureReport, IgnoredFeature};
use crate::graph::{CompiledGraph, GraphBuilder, NodeResult, RunContext};
use crate::state::StateModel;
use crate::workflow::{self, WorkflowConfig};

/// Everything a finished run produced.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub workflow: String,
    pub state: Map<String, Value>,
    /// One entry per graph step, in execution order.
    pub node_results: Vec<NodeResult>,
    pub usage: Usage,
    pub ignored_features: Vec<IgnoredFeature>,
    pub elapsed_ms: u64,
}

/// Loads, validates, compiles and runs workflows.
///
/// Capabilities (LLM clients, tools, run store, event bus) are injected;
/// nothing is global. Each run compiles a fresh graph and owns its state.
pub struct WorkflowRuntime {
    config: AppConfig,
    clients: Arc<dyn ClientProvider>,
    tools: Arc<ToolRegistry>,
    store: Option<Arc<dyn RunStore>>,
    event_bus: Arc<EventBus>,
    cancel: CancellationToken,
}

impl WorkflowRuntime {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clients: Arc::new(ProviderClients),
            tools: Arc::new(ToolRegistry::new()),
            store: None,
            event_bus: Arc::new(EventBus::default()),
            cancel: CancellationToken::new(),
        }
    }

    /// Route every node to one client regardless of provider settings.
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.clients = Arc::new(SharedClient(llm));
        self
    }

    pub fn with_clients(mut self, clients: Arc<dyn ClientProvider>) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Arc::new(tools);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Token checked at node boundaries; cancelling it stops every run of
    /// this runtime.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Phase 1: read and parse a workflow document.
    pub fn load(&self, path: &Path) -> Result<WorkflowConfig, ExecutionError> {
        workflow::load(path).map_err(ExecutionError::ConfigLoad)
    }

    /// Phases 2-3: cross-reference validation and feature gating.
    pub fn check(&self, config: &WorkflowConfig) -> Result<FeatureReport, ExecutionError> {
        workflow::validate(config).map_err(ExecutionError::ConfigValidation)?;
        let report = features::check(config)?;
        for ignored in &report.ignored {
            self.event_bus.publish(WorkflowEvent::FeatureIgnored {
                feature: ignored.feature.clone(),
                reason: ignored.reason.clone(),
            });
        }
        Ok(report)
    }

    /// Phase 4. Node outputs missing from the schema become optional fields.
    pub fn build_state_model(&self, config: &WorkflowConfig) -> Result<Arc<StateModel>, ExecutionError> {
        let mut model = StateModel::build(&config.state).map_err(ExecutionError::StateBuild)?;
        model
            .declare_outputs(&config.nodes)
            .map_err(ExecutionError::StateBuild)?;
        Ok(Arc::new(model))
    }

    /// Phase 6.
    pub fn build_graph(
        &self,
        config: &WorkflowConfig,
        state_model: Arc<StateModel>,
    ) -> Result<CompiledGraph, ExecutionError> {
        GraphBuilder::new(config, state_model)
            .with_model(self.config.model.clone())
            .with_execution_defaults(self.config.execution.clone())
            .with_tools(&self.tools)
            .with_clients(self.clients.as_ref())
            .with_working_dir(self.config.workspace_dir())
            .build()
            .map_err(ExecutionError::GraphBuild)
    }

    /// Every static phase (validation, gate, state model, graph) without
    /// running anything.
    pub fn compile(&self, config: &WorkflowConfig) -> Result<CompiledGraph, ExecutionError> {
        self.check(config)?;
        let model = self.build_state_model(config)?;
        self.build_graph(config, model)
    }

    /// Whether a workflow file passes every phase up to graph build.
    pub fn validate_workflow(&self, path: &Path) -> bool {
        match self.load(path).and_then(|config| self.compile(&config)) {
            Ok(graph) => {
                info!(workflow = %graph.name(), nodes = graph.node_ids().len(), "Workflow is valid");
                true
            }
            Err(e) => {
                error!(path = %path.display(), phase = %e.phase(), error = %e, "Workflow is invalid");
                false
            }
        }
    }

    pub async fn run_workflow(
        &self,
        path: &Path,
        inputs: Map<String, Value>,
    ) -> Result<RunOutcome, ExecutionError> {
        let config = self.load(path)?;
        self.run_workflow_from_config(&config, inputs).await
    }

    pub async fn run_workflow_from_config(
        &self,
        config: &WorkflowConfig,
        inputs: Map<String, Value>,
    ) -> Result<RunOutcome, ExecutionError> {
        let run_id = RunId::new();
        let result = self.execute(&run_id, config, inputs).await;
        if let Err(ref e) = result {
            error!(
                run_id = %run_id,
                workflow = %config.flow.name,
                phase = %e.phase(),
                error = %e,
                "Workflow run failed"
            );
            self.event_bus.publish(WorkflowEvent::RunFailed {
                run_id,
                phase: e.phase().to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn execute(
        &self,
        run_id: &RunId,
        config: &WorkflowConfig,
        inputs: Map<String, Value>,
    ) -> Result<RunOutcome, ExecutionError> {
        let start = Instant::now();

        let report = self.check(config)?;
        let state_model = self.build_state_model(config)?;
        let state = state_model
            .instantiate(&inputs)
            .map_err(ExecutionError::StateInitialization)?;
        let graph = self.build_graph(config, state_model)?;

        info!(
            run_id = %run_id,
            workflow = %config.flow.name,
            entry = %graph.entry(),
            "Starting workflow run"
        );

        let mut ctx = RunContext::new(run_id.clone())
            .with_cancellation(self.cancel.child_token())
            .with_events(self.event_bus.clone());
        if let Some(ref store) = self.store {
            let record = RunRecord::new(run_id.clone(), &config.flow.name, Value::Object(inputs));
            store
                .add(&record)
                .await
                .map_err(|e| ExecutionError::WorkflowExecution(WorkflowError::Store(e)))?;
            store
                .update_status(run_id, RunStatus::Running, None)
                .await
                .map_err(|e| ExecutionError::WorkflowExecution(WorkflowError::Store(e)))?;
            ctx = ctx.with_store(store.clone());
        }

        self.event_bus.publish(WorkflowEvent::RunStarted {
            run_id: run_id.clone(),
            workflow: config.flow.name.clone(),
        });

        let limits = graph.limits();
        let invocation = graph.invoke(state, &ctx);
        let result = if limits.timeout_secs > 0 {
            match tokio::time::timeout(Duration::from_secs(limits.timeout_secs), invocation).await {
                Ok(r) => r,
                Err(_) => Err(WorkflowError::Timeout {
                    timeout_secs: limits.timeout_secs,
                }),
            }
        } else {
            invocation.await
        };

        self.finish_record(run_id, &result).await;
        let outcome = result.map_err(ExecutionError::WorkflowExecution)?;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        info!(
            run_id = %run_id,
            workflow = %config.flow.name,
            steps = outcome.node_results.len(),
            input_tokens = outcome.usage.input_tokens,
            output_tokens = outcome.usage.output_tokens,
            elapsed_ms,
            "Workflow run completed"
        );
        self.event_bus.publish(WorkflowEvent::RunCompleted {
            run_id: run_id.clone(),
            nodes_executed: outcome.node_results.len(),
            usage: outcome.usage,
        });

        Ok(RunOutcome {
            run_id: run_id.clone(),
            workflow: config.flow.name.clone(),
            state: outcome.state,
            node_results: outcome.node_results,
            usage: outcome.usage,
            ignored_features: report.ignored,
            elapsed_ms,
        })
    }

    async fn finish_record<T>(&self, run_id: &RunId, result: &Result<T, WorkflowError>) {
        let Some(ref store) = self.store else {
            return;
        };
        let (status, error) = match result {
            Ok(_) => (RunStatus::Completed, None),
            Err(WorkflowError::Cancelled { .. }) => (RunStatus::Cancelled, None),
            Err(e) => (RunStatus::Failed, Some(e.to_string())),
        };
        if let Err(e) = store.update_status(run_id, status, error).await {
            warn!(run_id = %run_id, error = %e, "Failed to record final run status");
        }
    }
}

/// Run a workflow file with an engine config taken from the environment.
pub async fn run_workflow(
    path: &Path,
    inputs: Map<String, Value>,
) -> Result<RunOutcome, ExecutionError> {
    WorkflowRuntime::new(AppConfig::from_env())
        .run_workflow(path, inputs)
        .await
}

/// Run an already parsed workflow with an engine config taken from the environment.
pub async fn run_workflow_from_config(
    config: &WorkflowConfig,
    inputs: Map<String, Value>,
) -> Result<RunOutcome, ExecutionError> {
    WorkflowRuntime::new(AppConfig::from_env())
        .run_workflow_from_config(config, inputs)
        .await
}

pub fn validate_workflow(path: &Path) -> bool {
    WorkflowRuntime::new(AppConfig::from_env()).validate_workflow(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{NodePhase, Phase};
    use crate::workflow::{parse, Format};
    use serde_json::json;
    use stepwise_store::SqliteStore;
    use stepwise_test_utils::{json_map, write_workflow, ScriptedLlm, ECHO_WORKFLOW, LOOP_WORKFLOW};

    fn runtime(llm: Arc<dyn LlmClient>) -> WorkflowRuntime {
        WorkflowRuntime::new(AppConfig::default()).with_llm(llm)
    }

    #[tokio::test]
    async fn test_echo_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_workflow(dir.path(), "echo.yaml", ECHO_WORKFLOW);
        let rt = runtime(Arc::new(stepwise_llm::EchoClient::new()));

        let outcome = rt
            .run_workflow(&path, json_map(json!({"message": "HelloWorld"})))
            .await
            .unwrap();
        assert_eq!(outcome.state["echoed"], "Echo: HelloWorld");
        assert_eq!(outcome.node_results.len(), 1);
        assert_eq!(outcome.workflow, "echo");
    }

    #[tokio::test]
    async fn test_phase_tags() {
        let rt = runtime(Arc::new(ScriptedLlm::new(vec![])));

        let err = rt
            .run_workflow(Path::new("/nonexistent/flow.yaml"), Map::new())
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Phase::ConfigLoad);

        let config = parse(ECHO_WORKFLOW, Format::Yaml).unwrap();
        let err = rt.run_workflow_from_config(&config, Map::new()).await.unwrap_err();
        assert_eq!(err.phase(), Phase::StateInitialization);
        assert!(err.to_string().contains("message"));

        let mut invalid = config.clone();
        invalid.flow.name.clear();
        let err = rt
            .run_workflow_from_config(&invalid, json_map(json!({"message": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Phase::ConfigValidation);

        let mut gated = config.clone();
        gated.config.memory = Some(json!({"backend": "vector"}));
        let err = rt
            .run_workflow_from_config(&gated, json_map(json!({"message": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Phase::FeatureGate);
    }

    #[tokio::test]
    async fn test_llm_failure_is_execution_phase() {
        let rt = runtime(Arc::new(ScriptedLlm::new(vec![])));
        let config = parse(ECHO_WORKFLOW, Format::Yaml).unwrap();
        let err = rt
            .run_workflow_from_config(&config, json_map(json!({"message": "x"})))
            .await
            .unwrap_err();
        assert_eq!(err.phase(), Phase::WorkflowExecution);
        match err {
            ExecutionError::WorkflowExecution(WorkflowError::Node(node)) => {
                assert_eq!(node.node_id, "echo");
                assert_eq!(node.phase, NodePhase::Llm);
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_loop_ends_when_condition_holds() {
        let rt = runtime(Arc::new(ScriptedLlm::new(vec![json!({"result": 9})])));
        let config = parse(LOOP_WORKFLOW, Format::Yaml).unwrap();
        let outcome = rt
            .run_workflow_from_config(&config, json_map(json!({"draft": "d"})))
            .await
            .unwrap();
        assert_eq!(outcome.state["score"], 9);
        assert_eq!(outcome.node_results.len(), 1);
    }

    #[tokio::test]
    async fn test_loop_hits_iteration_cap() {
        let answers = vec![json!({"result": 3}); 10];
        let rt = runtime(Arc::new(ScriptedLlm::new(answers)));
        let mut config = parse(LOOP_WORKFLOW, Format::Yaml).unwrap();
        config.config.execution.max_iterations = Some(4);

        let err = rt
            .run_workflow_from_config(&config, json_map(json!({"draft": "d"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::WorkflowExecution(WorkflowError::IterationLimit { limit: 4, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_timeout() {
        let llm = ScriptedLlm::new(vec![json!({"result": 3}); 10]).with_delay(Duration::from_secs(5));
        let rt = runtime(Arc::new(llm));
        let mut config = parse(LOOP_WORKFLOW, Format::Yaml).unwrap();
        config.config.execution.timeout_secs = Some(12);

        let err = rt
            .run_workflow_from_config(&config, json_map(json!({"draft": "d"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::WorkflowExecution(WorkflowError::Timeout { timeout_secs: 12 })
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_node() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let rt = runtime(Arc::new(ScriptedLlm::new(vec![])))
            .with_cancellation(cancel)
            .with_store(store.clone());
        let config = parse(ECHO_WORKFLOW, Format::Yaml).unwrap();

        let err = rt
            .run_workflow_from_config(&config, json_map(json!({"message": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecutionError::WorkflowExecution(WorkflowError::Cancelled { ref at_node }) if at_node == "echo"
        ));

        let runs = store.list_by_workflow("echo", 10).await.unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_store_records_run_and_snapshots() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let rt = runtime(Arc::new(stepwise_llm::EchoClient::new())).with_store(store.clone());
        let config = parse(ECHO_WORKFLOW, Format::Yaml).unwrap();

        let outcome = rt
            .run_workflow_from_config(&config, json_map(json!({"message": "HelloWorld"})))
            .await
            .unwrap();

        let record = store.get(&outcome.run_id).await.unwrap().unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.inputs, json!({"message": "HelloWorld"}));

        let latest = store.get_latest_state(&outcome.run_id).await.unwrap().unwrap();
        assert_eq!(latest.node_id, "echo");
        assert_eq!(latest.state["echoed"], "Echo: HelloWorld");
    }

    #[tokio::test]
    async fn test_events_published() {
        let rt = runtime(Arc::new(stepwise_llm::EchoClient::new()));
        let mut rx = rt.event_bus().subscribe();
        let config = parse(ECHO_WORKFLOW, Format::Yaml).unwrap();
        rt.run_workflow_from_config(&config, json_map(json!({"message": "hi"})))
            .await
            .unwrap();

        let mut kinds = Vec::new();
        while let Ok(event) = rx.try_recv() {
            kinds.push(match event {
                WorkflowEvent::RunStarted { .. } => "run_started",
                WorkflowEvent::NodeStarted { .. } => "node_started",
                WorkflowEvent::NodeCompleted { .. } => "node_completed",
                WorkflowEvent::RunCompleted { .. } => "run_completed",
                _ => "other",
            });
        }
        assert_eq!(kinds, vec!["run_started", "node_started", "node_completed", "run_completed"]);
    }

    #[tokio::test]
    async fn test_injected_llm_overrides_workflow_provider() {
        let yaml = ECHO_WORKFLOW.replace(
            "nodes:\n",
            "config:\n  llm: {provider: openai, base_url: \"http://127.0.0.1:9\"}\nnodes:\n",
        );
        let config = parse(&yaml, Format::Yaml).unwrap();
        let rt = runtime(Arc::new(stepwise_llm::EchoClient::new()));
        let outcome = rt
            .run_workflow_from_config(&config, json_map(json!({"message": "HelloWorld"})))
            .await
            .unwrap();
        assert_eq!(outcome.state["echoed"], "Echo: HelloWorld");
    }

    #[tokio::test]
    async fn test_ignored_feature_reported_once() {
        let yaml = ECHO_WORKFLOW.replace("nodes:\n", "config:\n  llm: {stream: true}\nnodes:\n");
        let config = parse(&yaml, Format::Yaml).unwrap();
        let rt = runtime(Arc::new(stepwise_llm::EchoClient::new()));
        let mut rx = rt.event_bus().subscribe();

        let outcome = rt
            .run_workflow_from_config(&config, json_map(json!({"message": "hi"})))
            .await
            .unwrap();
        assert_eq!(outcome.ignored_features.len(), 1);
        assert_eq!(outcome.ignored_features[0].location, "config.llm.stream");

        let mut ignored = 0;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, WorkflowEvent::FeatureIgnored { .. }) {
                ignored += 1;
            }
        }
        assert_eq!(ignored, 1);
    }

    #[test]
    fn test_validate_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let good = write_workflow(dir.path(), "good.yaml", ECHO_WORKFLOW);
        let bad = write_workflow(
            dir.path(),
            "bad.yaml",
            &ECHO_WORKFLOW.replace("{from: echo, to: END}", "{from: echo, to: nowhere}"),
        );
        let rt = runtime(Arc::new(ScriptedLlm::new(vec![])));
        assert!(rt.validate_workflow(&good));
        assert!(!rt.validate_workflow(&bad));
    }
}
