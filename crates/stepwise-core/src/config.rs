use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StepwiseError};

/// Top-level engine configuration (`stepwise.toml`).
///
/// This configures the engine itself; workflow documents carry their own
/// `config` block which is layered on top at run time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_workspace")]
    pub workspace: String,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub execution: ExecutionDefaults,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            workspace: default_workspace(),
            model: ModelConfig::default(),
            execution: ExecutionDefaults::default(),
            storage: StorageConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

fn default_workspace() -> String { "~/.stepwise".to_string() }

/// Default LLM settings. Workflow, crew and node settings override these.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Per-call timeout. Falls back to the execution node timeout when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model_id: default_model_id(),
            api_key: None,
            base_url: None,
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            timeout_secs: None,
            retry: None,
        }
    }
}

fn default_provider() -> String { "openai".to_string() }
fn default_model_id() -> String { "gpt-4o-mini".to_string() }
fn default_max_tokens() -> u32 { 4096 }
fn default_temperature() -> f32 { 0.0 }

/// Retry configuration for LLM requests. Off unless present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

fn default_max_retries() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 1000 }
fn default_max_backoff() -> u64 { 30000 }

/// Engine-wide execution limits, used when a workflow does not set its own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionDefaults {
    /// Maximum node executions per run (bounds loop-back edges).
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    /// Whole-run timeout in seconds (0 = unlimited).
    #[serde(default = "default_run_timeout")]
    pub timeout_secs: u64,
    /// Maximum concurrent fan-out invocations.
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Per-node LLM/tool call timeout in seconds (0 = unlimited).
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
}

impl Default for ExecutionDefaults {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            timeout_secs: default_run_timeout(),
            max_parallel: default_max_parallel(),
            node_timeout_secs: default_node_timeout(),
        }
    }
}

fn default_max_iterations() -> usize { 50 }
fn default_run_timeout() -> u64 { 1800 }
fn default_max_parallel() -> usize { 4 }
fn default_node_timeout() -> u64 { 300 }

/// Run/state persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_enabled")]
    pub enabled: bool,
    /// Database path. Default: <workspace>/runs.db
    #[serde(default)]
    pub path: Option<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: default_storage_enabled(),
            path: None,
        }
    }
}

fn default_storage_enabled() -> bool { true }

/// Instance registry and heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_secs: u64,
    /// Address other processes can reach this instance at.
    #[serde(default)]
    pub endpoint: Option<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            ttl_secs: default_ttl(),
            heartbeat_interval_secs: default_heartbeat_interval(),
            endpoint: None,
        }
    }
}

fn default_ttl() -> u64 { 60 }
fn default_heartbeat_interval() -> u64 { 20 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| StepwiseError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self = toml::from_str(&expanded)
            .map_err(|e| StepwiseError::Config(e.to_string()))?;
        tracing::debug!(path = %path.display(), provider = %config.model.provider, "Engine config loaded");
        Ok(config)
    }

    /// Build a config from `STEPWISE_*` / `OPENAI_*` environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(provider) = std::env::var("STEPWISE_PROVIDER") {
            config.model.provider = provider;
        }
        if let Ok(model) = std::env::var("STEPWISE_MODEL") {
            config.model.model_id = model;
        }
        config.model.api_key = std::env::var("STEPWISE_API_KEY")
            .or_else(|_| std::env::var("OPENAI_API_KEY"))
            .ok();
        config.model.base_url = std::env::var("STEPWISE_BASE_URL").ok();
        config
    }

    /// Resolve the workspace directory (expand ~).
    pub fn workspace_dir(&self) -> PathBuf {
        let ws = &self.workspace;
        if let Some(rest) = ws.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(ws)
    }

    /// Resolve the run database path.
    pub fn storage_path(&self) -> PathBuf {
        match self.storage.path {
            Some(ref p) => PathBuf::from(p),
            None => self.workspace_dir().join("runs.db"),
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
pub fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_reports_bad_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"[execution]\nmax_iterations = \"many\"\n").unwrap();
        assert!(matches!(
            AppConfig::load(file.path()),
            Err(StepwiseError::Config(_))
        ));
        assert!(matches!(
            AppConfig::load(Path::new("/nonexistent/stepwise.toml")),
            Err(StepwiseError::ConfigNotFound(_))
        ));
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_STEPWISE_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_STEPWISE_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_STEPWISE_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_STEPWISE_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_STEPWISE_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.model.provider, "openai");
        assert_eq!(config.execution.max_iterations, 50);
        assert_eq!(config.execution.max_parallel, 4);
        assert!(config.storage.enabled);
        assert!(!config.registry.enabled);
        assert!(config.model.retry.is_none());
    }

    #[test]
    fn test_partial_sections() {
        let toml_str = r#"
workspace = "/tmp/stepwise-test"

[model]
provider = "echo"
temperature = 0.7

[execution]
max_iterations = 5

[registry]
enabled = true
ttl_secs = 10
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.model.provider, "echo");
        assert_eq!(config.model.model_id, "gpt-4o-mini");
        assert_eq!(config.execution.max_iterations, 5);
        assert_eq!(config.execution.node_timeout_secs, 300);
        assert_eq!(config.registry.ttl_secs, 10);
        assert_eq!(config.registry.heartbeat_interval_secs, 20);
        assert_eq!(config.storage_path(), PathBuf::from("/tmp/stepwise-test/runs.db"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = AppConfig::load(Path::new("/nonexistent/stepwise.toml")).unwrap_err();
        assert!(matches!(err, StepwiseError::ConfigNotFound(_)));
    }
}
