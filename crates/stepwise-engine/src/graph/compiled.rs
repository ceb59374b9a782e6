use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use stepwise_core::event::EventBus;
use stepwise_core::traits::RunStore;
use stepwise_core::types::{RunId, RunStatus, StateSnapshot, Usage, WorkflowEvent};

use super::condition::Condition;
use super::fanout::FanOutDispatcher;
use crate::error::{NodeExecutionError, NodeFailure, NodePhase, WorkflowError};
use crate::node::NodeExecutor;
use crate::state::StateModel;
use crate::workflow::{DEFAULT_ROUTE, END};

/// Where a transition leads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Node(String),
    End,
}

impl Target {
    pub(crate) fn from_id(id: &str) -> Self {
        if id == END {
            Self::End
        } else {
            Self::Node(id.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Node(id) => id,
            Self::End => END,
        }
    }
}

#[derive(Debug, Clone)]
pub enum RouteCondition {
    Default,
    Expr(Condition),
}

#[derive(Debug, Clone)]
pub struct Route {
    pub condition: RouteCondition,
    /// Condition text as written.
    pub source: String,
    pub target: Target,
}

static END_TARGET: Target = Target::End;

/// Outgoing transition of a node.
#[derive(Debug, Clone)]
pub enum Transition {
    Next(Target),
    /// Ordered routes; first match wins. The last one is always `default`.
    Routes(Vec<Route>),
}

impl Transition {
    pub fn next(&self, state: &Map<String, Value>) -> &Target {
        match self {
            Self::Next(target) => target,
            Self::Routes(routes) => {
                for route in routes {
                    let hit = match route.condition {
                        RouteCondition::Default => true,
                        RouteCondition::Expr(ref cond) => cond.evaluate(state),
                    };
                    if hit {
                        return &route.target;
                    }
                }
                &END_TARGET
            }
        }
    }
}

/// What runs when the graph reaches a node.
pub enum CompiledNode {
    Llm(Arc<NodeExecutor>),
    /// Dispatcher plus the worker it invokes per item.
    FanOut {
        dispatcher: FanOutDispatcher,
        target: Arc<NodeExecutor>,
    },
}

/// Run-wide limits, already merged from engine and workflow config.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionLimits {
    /// Maximum graph steps per run. Fan-out workers are not counted.
    pub max_iterations: usize,
    /// Whole-run timeout (0 = none). Enforced by the runtime.
    pub timeout_secs: u64,
    pub max_parallel: usize,
}

/// Per-run plumbing handed to [`CompiledGraph::invoke`].
#[derive(Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub cancel: CancellationToken,
    pub events: Option<Arc<EventBus>>,
    pub store: Option<Arc<dyn RunStore>>,
}

impl RunContext {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            cancel: CancellationToken::new(),
            events: None,
            store: None,
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_events(mut self, events: Arc<EventBus>) -> Self {
        self.events = Some(events);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn RunStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn publish(&self, event: WorkflowEvent) {
        if let Some(ref bus) = self.events {
            bus.publish(event);
        }
    }

    /// Whether the token fired or the stored record was marked cancelled.
    /// A failed store read counts as not cancelled.
    async fn cancelled(&self) -> bool {
        if self.cancel.is_cancelled() {
            return true;
        }
        let Some(ref store) = self.store else {
            return false;
        };
        match store.get(&self.run_id).await {
            Ok(record) => record.is_some_and(|r| r.status == RunStatus::Cancelled),
            Err(e) => {
                warn!(run_id = %self.run_id, error = %e, "Failed to read run status for cancellation");
                false
            }
        }
    }

    fn cancel_at(&self, node_id: String) -> WorkflowError {
        warn!(run_id = %self.run_id, node_id = %node_id, "Run cancelled");
        self.publish(WorkflowEvent::RunCancelled {
            run_id: self.run_id.clone(),
            at_node: node_id.clone(),
        });
        WorkflowError::Cancelled { at_node: node_id }
    }
}

/// Result of one graph step.
#[derive(Debug, Clone)]
pub struct NodeResult {
    pub node_id: String,
    pub usage: Usage,
    pub elapsed_ms: u64,
    /// Fan-out worker invocations, 0 for plain nodes.
    pub invocations: usize,
}

/// Final state and bookkeeping of a finished graph run.
#[derive(Debug, Clone)]
pub struct GraphOutcome {
    pub state: Map<String, Value>,
    pub node_results: Vec<NodeResult>,
    pub usage: Usage,
}

/// An immutable, invocable workflow graph.
pub struct CompiledGraph {
    pub(crate) name: String,
    pub(crate) entry: String,
    /// Node ids in declaration order.
    pub(crate) order: Vec<String>,
    pub(crate) nodes: HashMap<String, CompiledNode>,
    pub(crate) transitions: HashMap<String, Transition>,
    pub(crate) state_model: Arc<StateModel>,
    pub(crate) limits: ExecutionLimits,
}

impl std::fmt::Debug for CompiledGraph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledGraph")
            .field("name", &self.name)
            .field("entry", &self.entry)
            .field("order", &self.order)
            .field("transitions", &self.transitions)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

impl CompiledGraph {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> &str {
        &self.entry
    }

    pub fn node_ids(&self) -> &[String] {
        &self.order
    }

    pub fn node(&self, id: &str) -> Option<&CompiledNode> {
        self.nodes.get(id)
    }

    pub fn transition(&self, id: &str) -> Option<&Transition> {
        self.transitions.get(id)
    }

    pub fn state_model(&self) -> &StateModel {
        &self.state_model
    }

    pub fn limits(&self) -> ExecutionLimits {
        self.limits
    }

    /// The node that follows `node_id` for the given state.
    pub fn next(&self, node_id: &str, state: &Map<String, Value>) -> Target {
        self.transitions
            .get(node_id)
            .map(|t| t.next(state).clone())
            .unwrap_or(Target::End)
    }

    /// Human-readable node and transition table.
    pub fn describe(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "workflow: {}", self.name);
        let _ = writeln!(out, "entry:    {}", self.entry);
        let _ = writeln!(
            out,
            "limits:   max_iterations={} timeout_secs={} max_parallel={}",
            self.limits.max_iterations, self.limits.timeout_secs, self.limits.max_parallel
        );
        out.push('\n');

        for id in &self.order {
            let kind = match self.nodes.get(id) {
                Some(CompiledNode::Llm(node)) => {
                    let outputs = node.outputs().join(", ");
                    format!("llm -> [{}]", outputs)
                }
                Some(CompiledNode::FanOut { dispatcher: d, .. }) => format!(
                    "fan-out {} -> {} -> [{}]",
                    d.items_field, d.target_node, d.collect_field
                ),
                None => continue,
            };
            let _ = writeln!(out, "{} ({})", id, kind);

            match self.transitions.get(id) {
                Some(Transition::Next(target)) => {
                    let _ = writeln!(out, "  -> {}", target.as_str());
                }
                Some(Transition::Routes(routes)) => {
                    for route in routes {
                        let label = match route.condition {
                            RouteCondition::Default => DEFAULT_ROUTE,
                            RouteCondition::Expr(_) => route.source.as_str(),
                        };
                        let _ = writeln!(out, "  [{}] -> {}", label, route.target.as_str());
                    }
                }
                None => {
                    let _ = writeln!(out, "  -> {}", END);
                }
            }
        }
        out
    }

    /// Drive the graph from the entry node until END.
    pub async fn invoke(
        &self,
        mut state: Map<String, Value>,
        ctx: &RunContext,
    ) -> Result<GraphOutcome, WorkflowError> {
        let mut node_results = Vec::new();
        let mut usage = Usage::default();
        let mut current = Target::Node(self.entry.clone());
        let mut steps = 0usize;

        while let Target::Node(node_id) = current {
            if ctx.cancelled().await {
                return Err(ctx.cancel_at(node_id));
            }
            if steps >= self.limits.max_iterations {
                warn!(
                    run_id = %ctx.run_id,
                    node_id = %node_id,
                    limit = self.limits.max_iterations,
                    "Iteration limit reached"
                );
                return Err(WorkflowError::IterationLimit {
                    limit: self.limits.max_iterations,
                    node_id,
                });
            }
            let node = self
                .nodes
                .get(&node_id)
                .ok_or_else(|| WorkflowError::UnknownNode {
                    node_id: node_id.clone(),
                })?;
            steps += 1;

            info!(run_id = %ctx.run_id, node_id = %node_id, step = steps, "Executing graph node");
            ctx.publish(WorkflowEvent::NodeStarted {
                run_id: ctx.run_id.clone(),
                node_id: node_id.clone(),
            });

            let result = match self.step(&node_id, &mut state, ctx, node).await {
                Ok(result) => result,
                Err(e) if matches!(e.source, NodeFailure::Cancelled) => {
                    return Err(ctx.cancel_at(node_id));
                }
                Err(e) => {
                    error!(run_id = %ctx.run_id, node_id = %node_id, error = %e, "Graph node failed");
                    ctx.publish(WorkflowEvent::NodeFailed {
                        run_id: ctx.run_id.clone(),
                        node_id: node_id.clone(),
                        error: e.to_string(),
                    });
                    return Err(e.into());
                }
            };

            usage.add(result.usage);
            ctx.publish(WorkflowEvent::NodeCompleted {
                run_id: ctx.run_id.clone(),
                node_id: node_id.clone(),
                usage: result.usage,
                elapsed_ms: result.elapsed_ms,
            });
            self.snapshot(ctx, &node_id, steps as u64, &state).await;
            node_results.push(result);

            current = self.next(&node_id, &state);
            debug!(run_id = %ctx.run_id, from = %node_id, to = %current.as_str(), "Transition");
        }

        info!(run_id = %ctx.run_id, steps, total_tokens = usage.total(), "Graph reached END");
        Ok(GraphOutcome {
            state,
            node_results,
            usage,
        })
    }

    async fn step(
        &self,
        node_id: &str,
        state: &mut Map<String, Value>,
        ctx: &RunContext,
        node: &CompiledNode,
    ) -> Result<NodeResult, NodeExecutionError> {
        let (delta, usage, elapsed_ms, invocations) = match node {
            CompiledNode::Llm(executor) => {
                let out = executor.execute(state, None, &ctx.run_id).await?;
                (out.delta, out.usage, out.elapsed_ms, 0)
            }
            CompiledNode::FanOut { dispatcher, target } => {
                ctx.publish(WorkflowEvent::FanOutDispatched {
                    run_id: ctx.run_id.clone(),
                    node_id: node_id.to_string(),
                    target_node: dispatcher.target_node.clone(),
                    items: dispatcher.items(state)?.len(),
                });
                let out = dispatcher.dispatch(target, state, &ctx.run_id, &ctx.cancel).await?;
                (out.delta, out.usage, out.elapsed_ms, out.invocations)
            }
        };

        let merge_start = Instant::now();
        self.state_model
            .merge(state, &delta)
            .map_err(|e| NodeExecutionError::new(node_id, NodePhase::Output, e))?;

        Ok(NodeResult {
            node_id: node_id.to_string(),
            usage,
            elapsed_ms: elapsed_ms + merge_start.elapsed().as_millis() as u64,
            invocations,
        })
    }

    async fn snapshot(&self, ctx: &RunContext, node_id: &str, sequence: u64, state: &Map<String, Value>) {
        let Some(ref store) = ctx.store else {
            return;
        };
        let snapshot = StateSnapshot {
            run_id: ctx.run_id.clone(),
            node_id: node_id.to_string(),
            sequence,
            state: Value::Object(state.clone()),
            created_at: Utc::now(),
        };
        if let Err(e) = store.save_state(&snapshot).await {
            warn!(run_id = %ctx.run_id, node_id, error = %e, "Failed to save state snapshot");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::SharedClient;
    use crate::graph::GraphBuilder;
    use crate::workflow::{parse, Format};
    use futures::future::BoxFuture;
    use serde_json::json;
    use stepwise_core::error::{Result as StoreResult, StepwiseError};
    use stepwise_core::types::RunRecord;
    use stepwise_store::SqliteStore;
    use std::time::Duration;
    use stepwise_test_utils::{json_map, ScriptedLlm, FANOUT_WORKFLOW, LOOP_WORKFLOW};

    fn loop_graph(llm: ScriptedLlm) -> CompiledGraph {
        let config = parse(LOOP_WORKFLOW, Format::Yaml).unwrap();
        let model = Arc::new(StateModel::build(&config.state).unwrap());
        let clients = SharedClient(Arc::new(llm));
        GraphBuilder::new(&config, model)
            .with_clients(&clients)
            .build()
            .unwrap()
    }

    /// Store whose every call fails.
    struct BrokenStore;

    fn broken<T: Send + 'static>() -> BoxFuture<'static, StoreResult<T>> {
        Box::pin(async { Err(StepwiseError::Database("disk I/O error".into())) })
    }

    impl RunStore for BrokenStore {
        fn add(&self, _: &RunRecord) -> BoxFuture<'_, StoreResult<()>> {
            broken()
        }
        fn get(&self, _: &RunId) -> BoxFuture<'_, StoreResult<Option<RunRecord>>> {
            broken()
        }
        fn update_status(&self, _: &RunId, _: RunStatus, _: Option<String>) -> BoxFuture<'_, StoreResult<()>> {
            broken()
        }
        fn list_by_workflow(&self, _: &str, _: usize) -> BoxFuture<'_, StoreResult<Vec<RunRecord>>> {
            broken()
        }
        fn save_state(&self, _: &StateSnapshot) -> BoxFuture<'_, StoreResult<()>> {
            broken()
        }
        fn get_latest_state(&self, _: &RunId) -> BoxFuture<'_, StoreResult<Option<StateSnapshot>>> {
            broken()
        }
        fn get_state_history(&self, _: &RunId) -> BoxFuture<'_, StoreResult<Vec<StateSnapshot>>> {
            broken()
        }
    }

    fn initial() -> Map<String, Value> {
        json_map(json!({"draft": "d", "score": 0}))
    }

    #[tokio::test]
    async fn test_invoke_follows_routes_and_sums_usage() {
        let llm = ScriptedLlm::new(vec![json!({"result": 3}), json!({"result": 9})])
            .with_usage(Usage::new(2, 1));
        let graph = loop_graph(llm);

        let outcome = graph
            .invoke(initial(), &RunContext::new(RunId::new()))
            .await
            .unwrap();
        assert_eq!(outcome.state["score"], 9);
        assert_eq!(outcome.node_results.len(), 2);
        assert!(outcome.node_results.iter().all(|r| r.node_id == "judge"));
        assert_eq!(outcome.usage.input_tokens, 4);
        assert_eq!(outcome.usage.output_tokens, 2);
    }

    #[tokio::test]
    async fn test_snapshots_follow_step_order() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let run_id = RunId::new();
        store
            .add(&RunRecord::new(run_id.clone(), "refine", json!({"draft": "d"})))
            .await
            .unwrap();

        let graph = loop_graph(ScriptedLlm::new(vec![json!({"result": 5}), json!({"result": 8})]));
        let ctx = RunContext::new(run_id.clone()).with_store(store.clone());
        graph.invoke(initial(), &ctx).await.unwrap();

        let history = store.get_state_history(&run_id).await.unwrap();
        let sequences: Vec<u64> = history.iter().map(|s| s.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(history[0].state["score"], 5);
        assert_eq!(history[1].state["score"], 8);
    }

    #[tokio::test]
    async fn test_stored_cancellation_stops_before_node() {
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let run_id = RunId::new();
        store
            .add(&RunRecord::new(run_id.clone(), "refine", json!({})))
            .await
            .unwrap();
        store
            .update_status(&run_id, RunStatus::Cancelled, None)
            .await
            .unwrap();

        let llm = ScriptedLlm::new(vec![json!({"result": 9})]);
        let graph = loop_graph(llm);
        let ctx = RunContext::new(run_id).with_store(store);
        let err = graph.invoke(initial(), &ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled { ref at_node } if at_node == "judge"));
    }

    #[tokio::test]
    async fn test_unreadable_store_does_not_abort_run() {
        let graph = loop_graph(ScriptedLlm::new(vec![json!({"result": 9})]));
        let ctx = RunContext::new(RunId::new()).with_store(Arc::new(BrokenStore));
        let outcome = graph.invoke(initial(), &ctx).await.unwrap();
        assert_eq!(outcome.state["score"], 9);
        assert_eq!(outcome.node_results.len(), 1);
    }

    #[tokio::test]
    async fn test_cancel_during_fan_out_reports_dispatcher() {
        let config = parse(FANOUT_WORKFLOW, Format::Yaml).unwrap();
        let model = Arc::new(StateModel::build(&config.state).unwrap());
        let llm = ScriptedLlm::new(vec![json!({"result": "a"}), json!({"result": "b"})])
            .with_delay(Duration::from_millis(200));
        let clients = SharedClient(Arc::new(llm));
        let graph = GraphBuilder::new(&config, model)
            .with_clients(&clients)
            .build()
            .unwrap();

        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let cancel = CancellationToken::new();
        let ctx = RunContext::new(RunId::new())
            .with_cancellation(cancel.clone())
            .with_events(bus.clone());
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let state = json_map(json!({"topics": ["x", "y"], "summaries": []}));
        let err = graph.invoke(state, &ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Cancelled { ref at_node } if at_node == "split"));

        let mut saw_cancel = false;
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, WorkflowEvent::NodeFailed { .. }));
            if matches!(event, WorkflowEvent::RunCancelled { .. }) {
                saw_cancel = true;
            }
        }
        assert!(saw_cancel);
    }

    #[tokio::test]
    async fn test_node_failure_publishes_event() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let graph = loop_graph(ScriptedLlm::new(vec![]));
        let ctx = RunContext::new(RunId::new()).with_events(bus.clone());

        let err = graph.invoke(initial(), &ctx).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Node(_)));

        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            if let WorkflowEvent::NodeFailed { node_id, .. } = event {
                assert_eq!(node_id, "judge");
                failed = true;
            }
        }
        assert!(failed);
    }

    #[test]
    fn test_describe_lists_nodes_and_routes() {
        let text = loop_graph(ScriptedLlm::new(vec![])).describe();
        assert!(text.starts_with("workflow: refine\n"));
        assert!(text.contains("entry:    judge"));
        assert!(text.contains("judge (llm -> [score])"));
        assert!(text.contains("  [score >= 8] -> END"));
        assert!(text.contains("  [default] -> judge"));
    }
}
