//! Version-aware feature gate.
//!
//! Workflow documents may use keys this engine parses but does not act on.
//! Soft-blocked features are harmless to skip and only warn; hard-blocked
//! features would change results if skipped, so the run is refused before
//! any LLM call.

use tracing::warn;

use crate::error::ExecutionError;
use crate::workflow::{parse_schema_version, WorkflowConfig};

/// Version of this engine.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Highest workflow schema version this engine fully understands.
pub const SUPPORTED_SCHEMA: (u64, u64) = (1, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Soft,
    Hard,
}

/// A gated feature and where it ships.
#[derive(Debug, Clone, Copy)]
pub struct Feature {
    pub name: &'static str,
    pub gate: Gate,
    pub available_in: &'static str,
    pub workaround: Option<&'static str>,
    pub note: &'static str,
}

pub const STREAMING: Feature = Feature {
    name: "streaming",
    gate: Gate::Soft,
    available_in: "0.4.0",
    workaround: None,
    note: "structured output is returned in one piece",
};

pub const OBSERVABILITY_EXPORT: Feature = Feature {
    name: "observability.export",
    gate: Gate::Soft,
    available_in: "0.4.0",
    workaround: None,
    note: "traces are written to the log only",
};

pub const MEMORY: Feature = Feature {
    name: "memory",
    gate: Gate::Hard,
    available_in: "0.5.0",
    workaround: Some("pass earlier results in through workflow inputs or state fields"),
    note: "",
};

pub const INTERRUPTS: Feature = Feature {
    name: "interrupts",
    gate: Gate::Hard,
    available_in: "0.5.0",
    workaround: Some("split the workflow at the approval point and run each part separately"),
    note: "",
};

/// A soft-blocked feature that will be ignored for this run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoredFeature {
    pub feature: String,
    pub location: String,
    pub reason: String,
}

/// Outcome of a successful gate check.
#[derive(Debug, Clone, Default)]
pub struct FeatureReport {
    pub ignored: Vec<IgnoredFeature>,
}

/// Gate a workflow against this engine's feature set.
pub fn check(config: &WorkflowConfig) -> Result<FeatureReport, ExecutionError> {
    let mut uses: Vec<(Feature, String)> = Vec::new();

    if let Some(version) = parse_schema_version(&config.schema_version) {
        let (major, minor) = SUPPORTED_SCHEMA;
        if version.major > major {
            return Err(ExecutionError::FeatureGate {
                feature: format!("schema_version {}", config.schema_version),
                available_in: format!("a release supporting schema {}.x", version.major),
                workaround: Some(format!("declare schema_version {}.{}", major, minor)),
            });
        }
        if version.major == major && version.minor > minor {
            uses.push((
                Feature {
                    name: "schema_version",
                    gate: Gate::Soft,
                    available_in: "a later 1.x release",
                    workaround: None,
                    note: "keys newer than this engine are ignored",
                },
                format!("schema_version {}", config.schema_version),
            ));
        }
    }

    if config.config.memory.is_some() {
        uses.push((MEMORY, "config.memory".to_string()));
    }
    if config.config.observability.export.is_some() {
        uses.push((OBSERVABILITY_EXPORT, "config.observability.export".to_string()));
    }
    if config.config.llm.as_ref().and_then(|l| l.stream) == Some(true) {
        uses.push((STREAMING, "config.llm.stream".to_string()));
    }
    for (name, crew) in &config.crews {
        if crew.llm.as_ref().and_then(|l| l.stream) == Some(true) {
            uses.push((STREAMING, format!("crews.{}.llm.stream", name)));
        }
    }
    for node in &config.nodes {
        if node.interrupt.is_some() {
            uses.push((INTERRUPTS, format!("nodes.{}.interrupt", node.id)));
        }
        if node.llm.as_ref().and_then(|l| l.stream) == Some(true) {
            uses.push((STREAMING, format!("nodes.{}.llm.stream", node.id)));
        }
    }

    if let Some((feature, location)) = uses.iter().find(|(f, _)| f.gate == Gate::Hard) {
        warn!(feature = feature.name, location = %location, "Hard-blocked feature in workflow");
        return Err(ExecutionError::FeatureGate {
            feature: feature.name.to_string(),
            available_in: feature.available_in.to_string(),
            workaround: feature.workaround.map(str::to_string),
        });
    }

    let ignored = uses
        .into_iter()
        .map(|(feature, location)| {
            warn!(
                feature = feature.name,
                location = %location,
                available_in = feature.available_in,
                engine = ENGINE_VERSION,
                "Ignoring unsupported feature"
            );
            IgnoredFeature {
                feature: feature.name.to_string(),
                location,
                reason: format!("{} (supported from {})", feature.note, feature.available_in),
            }
        })
        .collect();

    Ok(FeatureReport { ignored })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Phase;
    use crate::workflow::{parse, Format, LlmOverride};

    fn workflow() -> WorkflowConfig {
        parse(
            r#"
flow: {name: gate}
state: {fields: {topic: {type: str, required: true}, text: {type: str}}}
nodes:
  - id: write
    prompt: "Write about {topic}"
    inputs: {topic: "{state.topic}"}
    output_schema: {type: str}
    outputs: [text]
edges:
  - {from: START, to: write}
"#,
            Format::Yaml,
        )
        .unwrap()
    }

    #[test]
    fn test_plain_workflow_passes() {
        let report = check(&workflow()).unwrap();
        assert!(report.ignored.is_empty());
    }

    #[test]
    fn test_soft_features_are_ignored() {
        let mut config = workflow();
        config.config.observability.export = Some("otlp".into());
        config.nodes[0].llm = Some(LlmOverride {
            stream: Some(true),
            ..Default::default()
        });

        let report = check(&config).unwrap();
        let names: Vec<&str> = report.ignored.iter().map(|f| f.feature.as_str()).collect();
        assert_eq!(names, vec!["observability.export", "streaming"]);
        assert_eq!(report.ignored[1].location, "nodes.write.llm.stream");
    }

    #[test]
    fn test_hard_feature_aborts_with_workaround() {
        let mut config = workflow();
        config.nodes[0].interrupt = Some(serde_json::json!({"before": true}));

        let err = check(&config).unwrap_err();
        assert_eq!(err.phase(), Phase::FeatureGate);
        match err {
            ExecutionError::FeatureGate {
                feature,
                available_in,
                workaround,
            } => {
                assert_eq!(feature, "interrupts");
                assert_eq!(available_in, "0.5.0");
                assert!(workaround.is_some());
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_schema_versions() {
        let mut config = workflow();
        config.schema_version = "1.3".into();
        let report = check(&config).unwrap();
        assert_eq!(report.ignored[0].feature, "schema_version");

        config.schema_version = "2.0".into();
        assert!(matches!(check(&config), Err(ExecutionError::FeatureGate { .. })));
    }
}
