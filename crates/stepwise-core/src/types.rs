use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::traits::Tool;

/// Unique identifier of a single workflow run.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Token usage reported by an LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl Usage {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
        }
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: Usage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Result of a tool execution.
#[derive(Debug, Clone)]
pub struct ToolResult {
    pub content: String,
    pub is_error: bool,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// Tool definition for sending to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl ToolDefinition {
    pub fn of(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            input_schema: tool.input_schema(),
        }
    }
}

/// Context passed to tools during execution.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub run_id: RunId,
    pub node_id: String,
    pub working_dir: std::path::PathBuf,
}

/// A structured-output request handed to the LLM capability.
///
/// `output_schema` is a JSON Schema object; the capability must return a JSON
/// object conforming to it.
#[derive(Clone)]
pub struct StructuredRequest {
    pub prompt: String,
    pub output_name: String,
    pub output_schema: serde_json::Value,
    pub tools: Vec<Arc<dyn Tool>>,
    pub tool_context: Option<ToolContext>,
}

impl StructuredRequest {
    pub fn new(
        prompt: impl Into<String>,
        output_name: impl Into<String>,
        output_schema: serde_json::Value,
    ) -> Self {
        Self {
            prompt: prompt.into(),
            output_name: output_name.into(),
            output_schema,
            tools: vec![],
            tool_context: None,
        }
    }

    pub fn with_tools(mut self, tools: Vec<Arc<dyn Tool>>, ctx: ToolContext) -> Self {
        self.tools = tools;
        self.tool_context = Some(ctx);
        self
    }

    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| ToolDefinition::of(t.as_ref())).collect()
    }
}

impl fmt::Debug for StructuredRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StructuredRequest")
            .field("prompt", &self.prompt)
            .field("output_name", &self.output_name)
            .field("output_schema", &self.output_schema)
            .field(
                "tools",
                &self.tools.iter().map(|t| t.name()).collect::<Vec<_>>(),
            )
            .field("tool_context", &self.tool_context)
            .finish()
    }
}

/// Structured result plus usage metadata.
#[derive(Debug, Clone)]
pub struct StructuredResponse {
    pub output: serde_json::Value,
    pub usage: Usage,
}

/// Lifecycle status of a stored run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: RunId,
    pub workflow_name: String,
    pub status: RunStatus,
    pub inputs: serde_json::Value,
    #[serde(default)]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRecord {
    pub fn new(run_id: RunId, workflow_name: impl Into<String>, inputs: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            run_id,
            workflow_name: workflow_name.into(),
            status: RunStatus::Pending,
            inputs,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// State captured after a node finished.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub run_id: RunId,
    pub node_id: String,
    pub sequence: u64,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// A live workflow instance announced to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryEntry {
    pub instance_id: String,
    pub workflow_name: String,
    pub version: String,
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl RegistryEntry {
    pub fn new(
        workflow_name: impl Into<String>,
        version: impl Into<String>,
        ttl_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            instance_id: Uuid::new_v4().to_string(),
            workflow_name: workflow_name.into(),
            version: version.into(),
            endpoint: None,
            capabilities: vec![],
            registered_at: now,
            last_heartbeat: now,
            ttl_secs,
        }
    }

    /// When this entry stops being live unless refreshed.
    pub fn expires_at(&self) -> DateTime<Utc> {
        self.last_heartbeat + chrono::Duration::seconds(self.ttl_secs as i64)
    }

    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at() > now
    }
}

/// Workflow lifecycle event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum WorkflowEvent {
    /// A run passed validation and started executing.
    RunStarted { run_id: RunId, workflow: String },
    /// A feature was soft-blocked and ignored.
    FeatureIgnored { feature: String, reason: String },
    /// A node started executing.
    NodeStarted { run_id: RunId, node_id: String },
    /// A node finished and its delta was merged.
    NodeCompleted {
        run_id: RunId,
        node_id: String,
        usage: Usage,
        elapsed_ms: u64,
    },
    /// A node failed; the run is about to fail.
    NodeFailed {
        run_id: RunId,
        node_id: String,
        error: String,
    },
    /// A fan-out dispatcher launched its invocations.
    FanOutDispatched {
        run_id: RunId,
        node_id: String,
        target_node: String,
        items: usize,
    },
    /// The run reached the terminal node.
    RunCompleted {
        run_id: RunId,
        nodes_executed: usize,
        usage: Usage,
    },
    /// The run stopped with an error.
    RunFailed {
        run_id: RunId,
        phase: String,
        error: String,
    },
    /// The run observed a cancellation request at a node boundary.
    RunCancelled { run_id: RunId, at_node: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates() {
        let mut total = Usage::default();
        total.add(Usage::new(10, 5));
        total.add(Usage::new(3, 2));
        assert_eq!(total, Usage::new(13, 7));
        assert_eq!(total.total(), 20);
    }

    #[test]
    fn test_run_status_roundtrip() {
        for status in [
            RunStatus::Pending,
            RunStatus::Running,
            RunStatus::Completed,
            RunStatus::Failed,
            RunStatus::Cancelled,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("bogus"), None);
        assert!(RunStatus::Cancelled.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_registry_entry_liveness() {
        let entry = RegistryEntry::new("research", "1.0", 30);
        assert!(entry.is_live(entry.last_heartbeat));
        assert!(entry.is_live(entry.last_heartbeat + chrono::Duration::seconds(29)));
        assert!(!entry.is_live(entry.last_heartbeat + chrono::Duration::seconds(30)));
    }
}
