use std::path::Path;

use tracing::debug;

use crate::error::WorkflowLoadError;

use super::schema::WorkflowConfig;

/// Document format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Yaml,
    Json,
}

impl Format {
    pub fn from_path(path: &Path) -> Result<Self, WorkflowLoadError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default()
            .to_ascii_lowercase();
        match ext.as_str() {
            "yaml" | "yml" => Ok(Self::Yaml),
            "json" => Ok(Self::Json),
            _ => Err(WorkflowLoadError::UnsupportedFormat { extension: ext }),
        }
    }
}

/// Load a workflow document from disk.
pub fn load(path: &Path) -> Result<WorkflowConfig, WorkflowLoadError> {
    let format = Format::from_path(path)?;
    let content = std::fs::read_to_string(path).map_err(|source| WorkflowLoadError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let config = parse(&content, format)?;
    debug!(
        path = %path.display(),
        workflow = %config.flow.name,
        nodes = config.nodes.len(),
        edges = config.edges.len(),
        "Workflow loaded"
    );
    Ok(config)
}

/// Parse a workflow document from text.
pub fn parse(content: &str, format: Format) -> Result<WorkflowConfig, WorkflowLoadError> {
    Ok(match format {
        Format::Yaml => serde_yaml::from_str(content)?,
        Format::Json => serde_json::from_str(content)?,
    })
}

/// Serialize a workflow document.
pub fn dump(config: &WorkflowConfig, format: Format) -> Result<String, WorkflowLoadError> {
    Ok(match format {
        Format::Yaml => serde_yaml::to_string(config)?,
        Format::Json => serde_json::to_string_pretty(config)?,
    })
}
