use std::time::Instant;

use futures::stream::{self, StreamExt, TryStreamExt};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stepwise_core::types::{RunId, Usage};

use crate::error::{NodeExecutionError, NodeFailure, NodePhase};
use crate::node::{NodeExecutor, NodeOutput};
use crate::template::FanOutScope;

/// A node that runs another node once per list element.
#[derive(Debug, Clone)]
pub struct FanOutDispatcher {
    pub node_id: String,
    pub items_field: String,
    pub target_node: String,
    pub collect_field: String,
    pub max_parallel: usize,
}

/// Collected results of one fan-out.
#[derive(Debug, Clone)]
pub struct FanOutOutput {
    /// `{collect_field: [...]}` in item order.
    pub delta: Map<String, Value>,
    pub invocations: usize,
    pub usage: Usage,
    pub elapsed_ms: u64,
}

impl FanOutDispatcher {
    /// Read the items list from state. Missing or null means no items.
    pub fn items(&self, state: &Map<String, Value>) -> Result<Vec<Value>, NodeExecutionError> {
        match state.get(&self.items_field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => Ok(items.clone()),
            Some(other) => Err(NodeExecutionError::new(
                &self.node_id,
                NodePhase::Input,
                NodeFailure::ItemsNotList {
                    field: self.items_field.clone(),
                    value: other.clone(),
                },
            )),
        }
    }

    /// Invoke `target` for every item, at most `max_parallel` at a time.
    ///
    /// Results are placed by item index whatever order they finish in. The
    /// first failure drops every invocation still in flight and is returned
    /// as is. Cancelling `cancel` does the same with a
    /// [`NodeFailure::Cancelled`] error.
    pub async fn dispatch(
        &self,
        target: &NodeExecutor,
        state: &Map<String, Value>,
        run_id: &RunId,
        cancel: &CancellationToken,
    ) -> Result<FanOutOutput, NodeExecutionError> {
        let start = Instant::now();
        let items = self.items(state)?;
        let count = items.len();

        info!(
            node_id = %self.node_id,
            target_node = %self.target_node,
            items = count,
            max_parallel = self.max_parallel,
            "Dispatching fan-out"
        );

        let scopes: Vec<FanOutScope> = items
            .into_iter()
            .enumerate()
            .map(|(index, item)| FanOutScope {
                item,
                index,
                source_field: self.items_field.clone(),
            })
            .collect();

        let mut results: Vec<(usize, NodeOutput)> = stream::iter(scopes.iter())
            .map(|scope| async move {
                let out = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(NodeExecutionError::new(
                        &self.node_id,
                        NodePhase::Llm,
                        NodeFailure::Cancelled,
                    )),
                    out = target.execute(state, Some(scope), run_id) => out,
                };
                debug!(node_id = %self.node_id, index = scope.index, ok = out.is_ok(), "Fan-out invocation finished");
                out.map(|out| (scope.index, out))
            })
            .buffer_unordered(self.max_parallel.max(1))
            .try_collect()
            .await
            .map_err(|e| {
                warn!(node_id = %self.node_id, error = %e, "Fan-out aborted");
                e
            })?;
        results.sort_by_key(|(index, _)| *index);

        let mut collected = Vec::with_capacity(count);
        let mut usage = Usage::default();
        for (_, out) in results {
            usage.add(out.usage);
            collected.push(target.worker_value(&out.result));
        }

        let mut delta = Map::new();
        delta.insert(self.collect_field.clone(), Value::Array(collected));

        Ok(FanOutOutput {
            delta,
            invocations: count,
            usage,
            elapsed_ms: start.elapsed().as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use stepwise_core::config::ModelConfig;
    use stepwise_core::traits::LlmClient;
    use stepwise_test_utils::{json_map, DelayedLlm, ScriptedLlm};
    use stepwise_tools::ToolRegistry;

    use crate::clients::SharedClient;
    use crate::node::NodeBuildContext;
    use crate::types::parse;
    use crate::workflow::{NodeSpec, OutputSchema};

    fn dispatcher(max_parallel: usize) -> FanOutDispatcher {
        FanOutDispatcher {
            node_id: "split".into(),
            items_field: "topics".into(),
            target_node: "summarize".into(),
            collect_field: "summaries".into(),
            max_parallel,
        }
    }

    fn worker(llm: Arc<dyn LlmClient>) -> NodeExecutor {
        let spec = NodeSpec::new("summarize", "Summarize {item} (#{index})")
            .with_output(OutputSchema::scalar(parse("str").unwrap(), ""), vec![]);
        let base = ModelConfig::default();
        let crews = BTreeMap::new();
        let tools = ToolRegistry::new();
        let clients = SharedClient(llm);
        let ctx = NodeBuildContext {
            base_model: &base,
            crews: &crews,
            tools: &tools,
            clients: &clients,
            default_timeout_secs: 0,
            working_dir: Path::new("."),
        };
        NodeExecutor::build(&spec, &ctx).unwrap()
    }

    #[tokio::test]
    async fn test_results_keep_item_order() {
        // Earlier items take longer, so they finish last.
        let llm = Arc::new(DelayedLlm::new(|prompt: &str| {
            if prompt.contains("#0") {
                Duration::from_millis(60)
            } else if prompt.contains("#1") {
                Duration::from_millis(30)
            } else {
                Duration::from_millis(1)
            }
        }));
        let target = worker(llm.clone());
        let state = json_map(json!({"topics": ["a", "b", "c"]}));

        let out = dispatcher(4)
            .dispatch(&target, &state, &RunId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.invocations, 3);
        assert_eq!(
            out.delta["summaries"],
            json!(["Summarize a (#0)", "Summarize b (#1)", "Summarize c (#2)"])
        );
        assert_eq!(llm.calls(), 3);
        assert!(llm.max_in_flight() > 1);
        assert_eq!(llm.completed()[0], "Summarize c (#2)");
    }

    #[tokio::test]
    async fn test_max_parallel_bounds_concurrency() {
        let llm = Arc::new(DelayedLlm::new(|_: &str| Duration::from_millis(5)));
        let target = worker(llm.clone());
        let state = json_map(json!({"topics": ["a", "b", "c", "d", "e"]}));
        dispatcher(2)
            .dispatch(&target, &state, &RunId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(llm.calls(), 5);
        assert!(llm.max_in_flight() <= 2);
    }

    #[tokio::test]
    async fn test_missing_items_is_empty() {
        let target = worker(Arc::new(ScriptedLlm::new(vec![])));
        let state = json_map(json!({"topics": null}));
        let out = dispatcher(4)
            .dispatch(&target, &state, &RunId::new(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.invocations, 0);
        assert_eq!(out.delta["summaries"], json!([]));
    }

    #[tokio::test]
    async fn test_items_must_be_a_list() {
        let target = worker(Arc::new(ScriptedLlm::new(vec![])));
        let state = json_map(json!({"topics": "a,b"}));
        let err = dispatcher(4)
            .dispatch(&target, &state, &RunId::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.node_id, "split");
        assert_eq!(err.phase, NodePhase::Input);
        assert!(matches!(err.source, NodeFailure::ItemsNotList { .. }));
    }

    #[tokio::test]
    async fn test_worker_failure_propagates() {
        // Only one scripted answer for two items.
        let target = worker(Arc::new(ScriptedLlm::new(vec![json!({"result": "ok"})])));
        let state = json_map(json!({"topics": ["a", "b"]}));
        let err = dispatcher(1)
            .dispatch(&target, &state, &RunId::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.node_id, "summarize");
        assert_eq!(err.phase, NodePhase::Llm);
    }

    #[tokio::test]
    async fn test_first_failure_stops_remaining_items() {
        // One scripted answer for five items: the second call fails.
        let llm = Arc::new(ScriptedLlm::new(vec![json!({"result": "ok"})]));
        let target = worker(llm.clone());
        let state = json_map(json!({"topics": ["a", "b", "c", "d", "e"]}));
        let err = dispatcher(1)
            .dispatch(&target, &state, &RunId::new(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.node_id, "summarize");
        assert_eq!(llm.prompts().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_fan_out() {
        let llm = Arc::new(DelayedLlm::new(|_: &str| Duration::from_millis(50)));
        let target = worker(llm.clone());
        let state = json_map(json!({"topics": ["a", "b", "c", "d", "e"]}));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(75)).await;
            trigger.cancel();
        });

        let err = dispatcher(1)
            .dispatch(&target, &state, &RunId::new(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.node_id, "split");
        assert!(matches!(err.source, NodeFailure::Cancelled));
        assert_eq!(llm.calls(), 2);
        assert_eq!(llm.completed().len(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_token_starts_nothing() {
        let llm = Arc::new(DelayedLlm::new(|_: &str| Duration::from_millis(1)));
        let target = worker(llm.clone());
        let state = json_map(json!({"topics": ["a", "b"]}));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = dispatcher(4)
            .dispatch(&target, &state, &RunId::new(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err.source, NodeFailure::Cancelled));
        assert_eq!(llm.calls(), 0);
    }
}
