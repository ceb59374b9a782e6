use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use stepwise_core::error::{Result, StepwiseError};
use stepwise_core::traits::Tool;
use stepwise_core::types::{ToolContext, ToolDefinition, ToolResult};

/// Registry of available tool capabilities.
///
/// Built once at startup and handed to the graph compiler; nodes bind tools
/// from it by name.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool.
    pub fn register(&mut self, tool: impl Tool) {
        self.register_arc(Arc::new(tool));
    }

    /// Register an already shared tool.
    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        debug!(tool = %name, "Registering tool");
        self.tools.insert(name, tool);
    }

    /// Unregister a tool by name.
    pub fn unregister(&mut self, name: &str) -> bool {
        self.tools.remove(name).is_some()
    }

    /// Get a tool by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Resolve a list of tool names, failing on the first unknown name.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<Arc<dyn Tool>>> {
        names
            .iter()
            .map(|name| {
                self.get(name)
                    .ok_or_else(|| StepwiseError::ToolNotFound(name.clone()))
            })
            .collect()
    }

    /// List all registered tool names, sorted.
    pub fn list(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Get tool definitions for sending to the LLM.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|t| ToolDefinition::of(t.as_ref()))
            .collect()
    }

    /// Execute a tool by name.
    pub async fn execute(
        &self,
        name: &str,
        input: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult> {
        let tool = self
            .get(name)
            .ok_or_else(|| StepwiseError::ToolNotFound(name.to_string()))?;
        execute_with_timeout(tool.as_ref(), input, ctx).await
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a tool under its own timeout.
pub async fn execute_with_timeout(
    tool: &dyn Tool,
    input: serde_json::Value,
    ctx: ToolContext,
) -> Result<ToolResult> {
    let timeout = std::time::Duration::from_secs(tool.timeout_secs());

    match tokio::time::timeout(timeout, tool.execute(input, ctx)).await {
        Ok(result) => result,
        Err(_) => Err(StepwiseError::ToolTimeout {
            tool: tool.name().to_string(),
            timeout_secs: tool.timeout_secs(),
        }),
    }
}
