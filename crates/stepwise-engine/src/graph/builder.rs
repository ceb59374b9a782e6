use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use stepwise_core::config::{ExecutionDefaults, ModelConfig};
use stepwise_tools::ToolRegistry;

use super::compiled::{
    CompiledGraph, CompiledNode, ExecutionLimits, Route, RouteCondition, Target, Transition,
};
use super::condition::Condition;
use super::fanout::FanOutDispatcher;
use crate::clients::{ClientProvider, ProviderClients};
use crate::error::GraphBuilderError;
use crate::node::{merge_model_config, NodeBuildContext, NodeExecutor};
use crate::output::OutputModel;
use crate::state::StateModel;
use crate::types::{BasicType, TypeDescriptor};
use crate::workflow::{
    EdgeSpec, NodeSpec, OutputSchema, ParallelSpec, RouteSpec, WorkflowConfig, END, START,
};

/// Compiles a workflow document and its state model into a [`CompiledGraph`].
pub struct GraphBuilder<'a> {
    config: &'a WorkflowConfig,
    state_model: Arc<StateModel>,
    model: ModelConfig,
    defaults: ExecutionDefaults,
    tools: Option<&'a ToolRegistry>,
    clients: &'a dyn ClientProvider,
    working_dir: PathBuf,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(config: &'a WorkflowConfig, state_model: Arc<StateModel>) -> Self {
        Self {
            config,
            state_model,
            model: ModelConfig::default(),
            defaults: ExecutionDefaults::default(),
            tools: None,
            clients: &ProviderClients,
            working_dir: PathBuf::from("."),
        }
    }

    /// Engine-level model config; the workflow's `config.llm` is applied on top.
    pub fn with_model(mut self, model: ModelConfig) -> Self {
        self.model = model;
        self
    }

    pub fn with_execution_defaults(mut self, defaults: ExecutionDefaults) -> Self {
        self.defaults = defaults;
        self
    }

    pub fn with_tools(mut self, tools: &'a ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_clients(mut self, clients: &'a dyn ClientProvider) -> Self {
        self.clients = clients;
        self
    }

    pub fn with_working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = dir.as_ref().to_path_buf();
        self
    }

    /// Execution limits: workflow overrides over engine defaults.
    pub fn limits(&self) -> ExecutionLimits {
        let exec = &self.config.config.execution;
        ExecutionLimits {
            max_iterations: exec.max_iterations.unwrap_or(self.defaults.max_iterations),
            timeout_secs: exec.timeout_secs.unwrap_or(self.defaults.timeout_secs),
            max_parallel: exec.max_parallel.unwrap_or(self.defaults.max_parallel).max(1),
        }
    }

    pub fn build(self) -> Result<CompiledGraph, GraphBuilderError> {
        let config = self.config;

        let mut specs: HashMap<&str, &NodeSpec> = HashMap::with_capacity(config.nodes.len());
        for node in &config.nodes {
            if specs.insert(node.id.as_str(), node).is_some() {
                return Err(GraphBuilderError::DuplicateNode {
                    node_id: node.id.clone(),
                });
            }
        }

        let entry = find_entry(&config.edges, &specs)?;
        let transitions = self.compile_edges(&specs)?;

        for node in &config.nodes {
            if let Some(ref parallel) = node.parallel {
                self.check_fan_out(node, parallel, &specs)?;
            }
            for output in &node.outputs {
                if self.state_model.field(output).is_none() {
                    return Err(GraphBuilderError::UnknownOutputField {
                        node_id: node.id.clone(),
                        field: output.clone(),
                    });
                }
            }
        }

        let unreachable = unreachable_nodes(&entry, &config.nodes, &transitions);
        if !unreachable.is_empty() {
            return Err(GraphBuilderError::Unreachable { nodes: unreachable });
        }

        // Bind nodes.
        let limits = self.limits();
        let base_model = merge_model_config(&self.model, config.config.llm.as_ref(), None, None);
        let empty_tools = ToolRegistry::new();
        let ctx = NodeBuildContext {
            base_model: &base_model,
            crews: &config.crews,
            tools: self.tools.unwrap_or(&empty_tools),
            clients: self.clients,
            default_timeout_secs: config
                .config
                .execution
                .node_timeout_secs
                .unwrap_or(self.defaults.node_timeout_secs),
            working_dir: &self.working_dir,
        };

        let mut executors: HashMap<String, Arc<NodeExecutor>> = HashMap::new();
        for node in config.nodes.iter().filter(|n| !n.is_dispatcher()) {
            executors.insert(node.id.clone(), Arc::new(NodeExecutor::build(node, &ctx)?));
        }

        let mut nodes = HashMap::with_capacity(config.nodes.len());
        for node in &config.nodes {
            let compiled = match node.parallel {
                Some(ref parallel) => {
                    let target = executors.get(&parallel.target_node).cloned().ok_or_else(|| {
                        GraphBuilderError::InvalidFanOut {
                            node_id: node.id.clone(),
                            reason: format!("target '{}' is not an LLM node", parallel.target_node),
                        }
                    })?;
                    CompiledNode::FanOut {
                        dispatcher: FanOutDispatcher {
                            node_id: node.id.clone(),
                            items_field: parallel.items_field.clone(),
                            target_node: parallel.target_node.clone(),
                            collect_field: parallel.collect_field.clone(),
                            max_parallel: limits.max_parallel,
                        },
                        target,
                    }
                }
                None => match executors.get(&node.id) {
                    Some(executor) => CompiledNode::Llm(executor.clone()),
                    None => continue,
                },
            };
            nodes.insert(node.id.clone(), compiled);
        }

        info!(
            workflow = %config.flow.name,
            entry = %entry,
            nodes = nodes.len(),
            max_iterations = limits.max_iterations,
            "Graph compiled"
        );

        Ok(CompiledGraph {
            name: config.flow.name.clone(),
            entry,
            order: config.nodes.iter().map(|n| n.id.clone()).collect(),
            nodes,
            transitions,
            state_model: self.state_model,
            limits,
        })
    }

    fn compile_edges(
        &self,
        specs: &HashMap<&str, &NodeSpec>,
    ) -> Result<HashMap<String, Transition>, GraphBuilderError> {
        let mut transitions: HashMap<String, Transition> = HashMap::new();
        let mut outgoing: HashMap<&str, usize> = HashMap::new();

        for edge in &self.config.edges {
            if edge.from == END {
                return Err(GraphBuilderError::EdgeFromEnd);
            }
            if edge.from != START && !specs.contains_key(edge.from.as_str()) {
                return Err(GraphBuilderError::UnknownNode {
                    from: edge.from.clone(),
                    reference: edge.from.clone(),
                });
            }
            for target in edge.targets() {
                if target == START {
                    return Err(GraphBuilderError::EdgeIntoStart {
                        from: edge.from.clone(),
                    });
                }
                if target != END && !specs.contains_key(target) {
                    return Err(GraphBuilderError::UnknownNode {
                        from: edge.from.clone(),
                        reference: target.to_string(),
                    });
                }
            }
            if edge.from == START {
                continue;
            }
            *outgoing.entry(edge.from.as_str()).or_default() += 1;

            let transition = match (&edge.to, &edge.routes) {
                (Some(to), None) => Transition::Next(Target::from_id(to)),
                (None, Some(routes)) => Transition::Routes(self.compile_routes(edge, routes)?),
                _ => {
                    return Err(GraphBuilderError::AmbiguousEdge {
                        from: edge.from.clone(),
                    })
                }
            };
            transitions.insert(edge.from.clone(), transition);
        }

        if let Some((from, count)) = outgoing.into_iter().find(|(_, count)| *count > 1) {
            return Err(GraphBuilderError::MultipleOutgoing {
                from: from.to_string(),
                count,
            });
        }

        for id in specs.keys() {
            if !transitions.contains_key(*id) {
                debug!(node_id = %id, "No outgoing edge, transitions to END");
                transitions.insert(id.to_string(), Transition::Next(Target::End));
            }
        }
        Ok(transitions)
    }

    fn compile_routes(
        &self,
        edge: &EdgeSpec,
        routes: &[RouteSpec],
    ) -> Result<Vec<Route>, GraphBuilderError> {
        let last_is_default = routes.last().is_some_and(|r| r.condition.is_default());
        let defaults = routes.iter().filter(|r| r.condition.is_default()).count();
        if !last_is_default {
            return Err(if defaults > 0 {
                GraphBuilderError::DefaultNotLast {
                    from: edge.from.clone(),
                }
            } else {
                GraphBuilderError::MissingDefaultRoute {
                    from: edge.from.clone(),
                }
            });
        }
        if defaults > 1 {
            return Err(GraphBuilderError::DefaultNotLast {
                from: edge.from.clone(),
            });
        }

        routes
            .iter()
            .map(|route| {
                let source = route.condition.expression().trim().to_string();
                let condition = if route.condition.is_default() {
                    RouteCondition::Default
                } else {
                    let parsed = Condition::parse(&source).map_err(|reason| {
                        GraphBuilderError::InvalidCondition {
                            from: edge.from.clone(),
                            condition: source.clone(),
                            reason,
                        }
                    })?;
                    for field in parsed.fields() {
                        if self.state_model.field(field).is_none() {
                            warn!(
                                from = %edge.from,
                                condition = %source,
                                field,
                                "Condition reads a field that is not in the state schema"
                            );
                        }
                    }
                    RouteCondition::Expr(parsed)
                };
                Ok(Route {
                    condition,
                    source,
                    target: Target::from_id(&route.to),
                })
            })
            .collect()
    }

    fn check_fan_out(
        &self,
        node: &NodeSpec,
        parallel: &ParallelSpec,
        specs: &HashMap<&str, &NodeSpec>,
    ) -> Result<(), GraphBuilderError> {
        let invalid = |reason: String| GraphBuilderError::InvalidFanOut {
            node_id: node.id.clone(),
            reason,
        };

        for (role, name) in [
            ("items_field", &parallel.items_field),
            ("collect_field", &parallel.collect_field),
        ] {
            match self.state_model.field(name) {
                None => return Err(invalid(format!("{} '{}' is not a state field", role, name))),
                Some(field) if !field.ty.is_list() => {
                    return Err(invalid(format!(
                        "{} '{}' must be a list, found {}",
                        role, name, field.ty
                    )))
                }
                Some(_) => {}
            }
        }

        if parallel.target_node == node.id {
            return Err(invalid("a node cannot fan out to itself".to_string()));
        }
        match specs.get(parallel.target_node.as_str()) {
            None => Err(invalid(format!(
                "target node '{}' is not declared",
                parallel.target_node
            ))),
            Some(target) if target.is_dispatcher() => Err(invalid(format!(
                "target node '{}' is itself a fan-out dispatcher",
                parallel.target_node
            ))),
            Some(target) => self.check_collect_type(target, parallel).map_err(invalid),
        }
    }

    /// The worker's contribution must fit the item type of `collect_field`,
    /// so a mismatch fails before any LLM call is paid for.
    fn check_collect_type(&self, target: &NodeSpec, parallel: &ParallelSpec) -> Result<(), String> {
        let item_ty = match self.state_model.field(&parallel.collect_field).map(|f| &f.ty) {
            Some(TypeDescriptor::List(Some(item))) => item.as_ref(),
            _ => return Ok(()),
        };
        let schema = target
            .output_schema
            .clone()
            .unwrap_or_else(|| OutputSchema::scalar(TypeDescriptor::Basic(BasicType::Str), ""));
        // An invalid output schema is reported when the target is bound.
        let Ok(output) = OutputModel::build(&schema, &target.id) else {
            return Ok(());
        };

        let fits = if output.is_scalar() {
            output.fields().iter().all(|f| item_ty.accepts(&f.ty))
        } else {
            match item_ty {
                TypeDescriptor::Object | TypeDescriptor::Dict(None) => true,
                TypeDescriptor::Dict(Some(kv)) => {
                    kv.0.accepts(&TypeDescriptor::Basic(BasicType::Str))
                        && output.fields().iter().all(|f| kv.1.accepts(&f.ty))
                }
                _ => false,
            }
        };
        if fits {
            return Ok(());
        }

        let produced = if output.is_scalar() {
            output.fields().iter().map(|f| f.ty.to_string()).collect::<Vec<_>>().join(", ")
        } else {
            format!(
                "object {{{}}}",
                output
                    .fields()
                    .iter()
                    .map(|f| format!("{}: {}", f.name, f.ty))
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        Err(format!(
            "target node '{}' produces {}, but collect_field '{}' holds {}",
            target.id, produced, parallel.collect_field, item_ty
        ))
    }
}

fn find_entry(
    edges: &[EdgeSpec],
    specs: &HashMap<&str, &NodeSpec>,
) -> Result<String, GraphBuilderError> {
    let starts: Vec<&EdgeSpec> = edges.iter().filter(|e| e.from == START).collect();
    let edge = match starts.as_slice() {
        [] => return Err(GraphBuilderError::MissingEntry),
        [edge] => *edge,
        many => return Err(GraphBuilderError::MultipleEntries { count: many.len() }),
    };
    let entry = match (&edge.to, &edge.routes) {
        (Some(to), None) => to,
        (None, Some(_)) => return Err(GraphBuilderError::RoutedEntry),
        _ => {
            return Err(GraphBuilderError::AmbiguousEdge {
                from: START.to_string(),
            })
        }
    };
    if !specs.contains_key(entry.as_str()) {
        return Err(GraphBuilderError::UnknownNode {
            from: START.to_string(),
            reference: entry.clone(),
        });
    }
    Ok(entry.clone())
}

/// Declared nodes not reachable from `entry`, in declaration order.
/// A fan-out target is reachable through its dispatcher.
fn unreachable_nodes(
    entry: &str,
    nodes: &[NodeSpec],
    transitions: &HashMap<String, Transition>,
) -> Vec<String> {
    let fan_out: HashMap<&str, &str> = nodes
        .iter()
        .filter_map(|n| n.parallel.as_ref().map(|p| (n.id.as_str(), p.target_node.as_str())))
        .collect();

    let mut seen: HashSet<&str> = HashSet::new();
    let mut queue: VecDeque<&str> = VecDeque::from([entry]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if let Some(target) = fan_out.get(id) {
            queue.push_back(*target);
        }
        let next: Vec<&Target> = match transitions.get(id) {
            Some(Transition::Next(t)) => vec![t],
            Some(Transition::Routes(routes)) => routes.iter().map(|r| &r.target).collect(),
            None => vec![],
        };
        for target in next {
            if let Target::Node(ref id) = target {
                queue.push_back(id.as_str());
            }
        }
    }

    nodes
        .iter()
        .filter(|n| !seen.contains(n.id.as_str()))
        .map(|n| n.id.clone())
        .collect()
}
