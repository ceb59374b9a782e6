use std::collections::HashSet;

use crate::error::ValidationError;

use super::schema::{WorkflowConfig, END, START};

/// Check a parsed workflow for document-level mistakes.
///
/// Graph structure (reachability, dangling edges, route order) is checked by
/// the graph builder; this pass covers everything that can be judged from
/// the document alone and reports all problems at once.
pub fn validate(config: &WorkflowConfig) -> Result<(), ValidationError> {
    let mut issues = Vec::new();

    if config.flow.name.trim().is_empty() {
        issues.push("flow.name must not be empty".to_string());
    }
    if super::parse_schema_version(&config.schema_version).is_none() {
        issues.push(format!(
            "schema_version '{}' is not a version number",
            config.schema_version
        ));
    }
    if config.nodes.is_empty() {
        issues.push("workflow declares no nodes".to_string());
    }
    if config.edges.is_empty() {
        issues.push("workflow declares no edges".to_string());
    }

    let mut seen = HashSet::new();
    for node in &config.nodes {
        if node.id.trim().is_empty() {
            issues.push("node id must not be empty".to_string());
            continue;
        }
        if node.id == START || node.id == END {
            issues.push(format!("node id '{}' is reserved", node.id));
        }
        if !seen.insert(node.id.as_str()) {
            issues.push(format!("node id '{}' is declared more than once", node.id));
        }

        if node.is_dispatcher() {
            if node.output_schema.is_some() || !node.outputs.is_empty() {
                issues.push(format!(
                    "node '{}': a fan-out node cannot declare output_schema or outputs",
                    node.id
                ));
            }
        } else {
            if node.prompt.trim().is_empty() {
                issues.push(format!("node '{}' has an empty prompt", node.id));
            }
            if node.output_schema.is_none() {
                issues.push(format!("node '{}' has no output_schema", node.id));
            }
        }

        for name in node.inputs.keys() {
            if !is_identifier(name) {
                issues.push(format!(
                    "node '{}': input name '{}' is not an identifier",
                    node.id, name
                ));
            }
        }
        if let Some(ref crew) = node.crew {
            if !config.crews.contains_key(crew) {
                issues.push(format!("node '{}' joins unknown crew '{}'", node.id, crew));
            }
        }
        if node.timeout_secs == Some(0) {
            issues.push(format!("node '{}': timeout_secs must be positive", node.id));
        }
    }

    for edge in &config.edges {
        match (&edge.to, &edge.routes) {
            (Some(_), None) => {}
            (None, Some(routes)) if routes.is_empty() => {
                issues.push(format!("edge from '{}' has an empty routes list", edge.from));
            }
            (None, Some(_)) => {}
            _ => issues.push(format!(
                "edge from '{}' must set exactly one of 'to' or 'routes'",
                edge.from
            )),
        }
    }

    if config.config.execution.max_iterations == Some(0) {
        issues.push("config.execution.max_iterations must be positive".to_string());
    }
    if config.config.execution.max_parallel == Some(0) {
        issues.push("config.execution.max_parallel must be positive".to_string());
    }

    if issues.is_empty() {
        Ok(())
    } else {
        Err(ValidationError {
            workflow: config.flow.name.clone(),
            issues,
        })
    }
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::loader::{parse, Format};

    fn base() -> WorkflowConfig {
        parse(
            r#"
flow: {name: echo}
state:
  fields:
    message: {type: str, required: true}
    echoed: {type: str}
nodes:
  - id: echo
    prompt: "Echo: {message}"
    inputs: {message: "{state.message}"}
    output_schema: {type: str}
    outputs: [echoed]
edges:
  - {from: START, to: echo}
  - {from: echo, to: END}
"#,
            Format::Yaml,
        )
        .unwrap()
    }

    #[test]
    fn test_valid_workflow_passes() {
        assert!(validate(&base()).is_ok());
    }

    #[test]
    fn test_collects_every_issue() {
        let mut config = base();
        config.flow.name = " ".into();
        config.schema_version = "one".into();
        config.nodes[0].crew = Some("writers".into());
        config.nodes[0].inputs.insert("bad-name".into(), "{state.message}".into());
        config.edges[1].routes = Some(vec![]);

        let err = validate(&config).unwrap_err();
        assert_eq!(err.issues.len(), 5, "{:?}", err.issues);
        assert!(err.to_string().contains("unknown crew 'writers'"));
    }

    #[test]
    fn test_reserved_and_duplicate_ids() {
        let mut config = base();
        let mut dup = config.nodes[0].clone();
        config.nodes.push(dup.clone());
        dup.id = "END".into();
        config.nodes.push(dup);

        let err = validate(&config).unwrap_err();
        assert!(err.issues.iter().any(|i| i.contains("more than once")));
        assert!(err.issues.iter().any(|i| i.contains("reserved")));
    }

    #[test]
    fn test_dispatcher_cannot_declare_outputs() {
        let mut config = base();
        config.nodes[0].parallel = Some(crate::workflow::ParallelSpec {
            items_field: "message".into(),
            target_node: "echo".into(),
            collect_field: "echoed".into(),
        });
        let err = validate(&config).unwrap_err();
        assert!(err.issues[0].contains("fan-out node"));
    }

    #[test]
    fn test_identifier() {
        assert!(is_identifier("topic"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1x"));
        assert!(!is_identifier("a.b"));
        assert!(!is_identifier(""));
    }
}
