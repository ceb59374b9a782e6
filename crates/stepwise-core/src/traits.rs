use chrono::{DateTime, Utc};
use futures::future::BoxFuture;

use crate::config::ModelConfig;
use crate::error::Result;
use crate::types::*;

/// LLM capability: prompt in, schema-conforming JSON out.
pub trait LlmClient: Send + Sync + 'static {
    /// Run one structured completion.
    ///
    /// Implementations may call the request's tools any number of times
    /// before producing the final structured answer.
    fn complete_structured(
        &self,
        config: &ModelConfig,
        request: StructuredRequest,
    ) -> BoxFuture<'_, Result<StructuredResponse>>;
}

/// A capability plugin a node can bind by name.
pub trait Tool: Send + Sync + 'static {
    /// Tool name (used in LLM tool calls).
    fn name(&self) -> &str;

    /// Human-readable description.
    fn description(&self) -> &str;

    /// JSON Schema for tool input.
    fn input_schema(&self) -> serde_json::Value;

    /// Execute the tool with given input and context.
    fn execute(
        &self,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> BoxFuture<'_, Result<ToolResult>>;

    /// Timeout in seconds for this tool.
    fn timeout_secs(&self) -> u64 {
        30
    }
}

/// Persistence for run records and per-node state snapshots.
pub trait RunStore: Send + Sync + 'static {
    /// Insert a new run record.
    fn add(&self, record: &RunRecord) -> BoxFuture<'_, Result<()>>;

    /// Fetch a run record.
    fn get(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<RunRecord>>>;

    /// Transition a run to a new status, optionally recording an error.
    fn update_status(
        &self,
        run_id: &RunId,
        status: RunStatus,
        error: Option<String>,
    ) -> BoxFuture<'_, Result<()>>;

    /// Most recent runs of a workflow, newest first.
    fn list_by_workflow(
        &self,
        workflow_name: &str,
        limit: usize,
    ) -> BoxFuture<'_, Result<Vec<RunRecord>>>;

    /// Append a state snapshot.
    fn save_state(&self, snapshot: &StateSnapshot) -> BoxFuture<'_, Result<()>>;

    /// Latest snapshot of a run.
    fn get_latest_state(&self, run_id: &RunId) -> BoxFuture<'_, Result<Option<StateSnapshot>>>;

    /// All snapshots of a run in sequence order.
    fn get_state_history(&self, run_id: &RunId) -> BoxFuture<'_, Result<Vec<StateSnapshot>>>;
}

/// TTL-based announcement of live workflow instances.
pub trait RegistryStore: Send + Sync + 'static {
    /// Insert or replace an entry.
    fn register(&self, entry: &RegistryEntry) -> BoxFuture<'_, Result<()>>;

    /// Refresh an entry's heartbeat. Returns false if it no longer exists.
    fn heartbeat(&self, instance_id: &str, at: DateTime<Utc>) -> BoxFuture<'_, Result<bool>>;

    /// Remove an entry. Returns false if it did not exist.
    fn deregister(&self, instance_id: &str) -> BoxFuture<'_, Result<bool>>;

    /// Entries whose TTL has not elapsed at `now`.
    fn list_live(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<Vec<RegistryEntry>>>;

    /// Delete expired entries, returning how many were removed.
    fn prune_expired(&self, now: DateTime<Utc>) -> BoxFuture<'_, Result<usize>>;
}
