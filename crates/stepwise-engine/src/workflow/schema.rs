use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

use stepwise_core::config::ModelConfig;

use crate::types::TypeDescriptor;

/// Entry node sentinel.
pub const START: &str = "START";
/// Terminal node sentinel.
pub const END: &str = "END";
/// Route condition that always matches.
pub const DEFAULT_ROUTE: &str = "default";

/// A declarative workflow document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default = "default_schema_version")]
    pub schema_version: String,
    pub flow: FlowMeta,
    pub state: StateSchema,
    pub nodes: Vec<NodeSpec>,
    pub edges: Vec<EdgeSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub crews: BTreeMap<String, CrewSpec>,
    #[serde(default)]
    pub config: WorkflowSettings,
}

fn default_schema_version() -> String {
    "1.0".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowMeta {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_flow_version")]
    pub version: String,
}

fn default_flow_version() -> String {
    "0.1.0".to_string()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateSchema {
    #[serde(default)]
    pub fields: FieldMap<FieldSpec>,
}

/// One state field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    #[serde(rename = "type")]
    pub ty: TypeDescriptor,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Fields of a nested `object`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<FieldMap<FieldSpec>>,
}

impl FieldSpec {
    pub fn new(ty: TypeDescriptor) -> Self {
        Self {
            ty,
            required: false,
            default: None,
            description: String::new(),
            schema: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A named LLM configuration shared by several nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrewSpec {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub llm: Option<LlmOverride>,
}

/// A partial LLM configuration. Unset fields fall through to the level below.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LlmOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, alias = "model", skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Token streaming. Not supported by the structured-output path.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
}

impl LlmOverride {
    /// Overlay the set fields onto `base`.
    pub fn apply(&self, base: &mut ModelConfig) {
        if let Some(ref v) = self.provider {
            base.provider = v.clone();
        }
        if let Some(ref v) = self.model_id {
            base.model_id = v.clone();
        }
        if let Some(ref v) = self.api_key {
            base.api_key = Some(v.clone());
        }
        if let Some(ref v) = self.base_url {
            base.base_url = Some(v.clone());
        }
        if let Some(v) = self.max_tokens {
            base.max_tokens = v;
        }
        if let Some(v) = self.temperature {
            base.temperature = v;
        }
        if let Some(v) = self.timeout_secs {
            base.timeout_secs = Some(v);
        }
    }
}

/// One step of the workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(default)]
    pub prompt: String,
    /// Placeholder name -> template expression evaluated against state.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<OutputSchema>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmOverride>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crew: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel: Option<ParallelSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Human-in-the-loop pause. Not supported by this engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interrupt: Option<Value>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            prompt: prompt.into(),
            inputs: BTreeMap::new(),
            output_schema: None,
            outputs: vec![],
            tools: vec![],
            llm: None,
            crew: None,
            parallel: None,
            timeout_secs: None,
            interrupt: None,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, expr: impl Into<String>) -> Self {
        self.inputs.insert(name.into(), expr.into());
        self
    }

    pub fn with_output(mut self, schema: OutputSchema, outputs: Vec<String>) -> Self {
        self.output_schema = Some(schema);
        self.outputs = outputs;
        self
    }

    pub fn with_parallel(mut self, parallel: ParallelSpec) -> Self {
        self.parallel = Some(parallel);
        self
    }

    pub fn is_dispatcher(&self) -> bool {
        self.parallel.is_some()
    }
}

/// Structured output a node's LLM call must produce.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSchema {
    #[serde(rename = "type")]
    pub ty: TypeDescriptor,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
    /// Ordered fields of an `object` output.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<OutputFieldSpec>,
}

impl OutputSchema {
    pub fn scalar(ty: TypeDescriptor, description: impl Into<String>) -> Self {
        Self {
            ty,
            description: description.into(),
            fields: vec![],
        }
    }

    pub fn object(fields: Vec<OutputFieldSpec>) -> Self {
        Self {
            ty: TypeDescriptor::Object,
            description: String::new(),
            fields,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeDescriptor,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl OutputFieldSpec {
    pub fn new(name: impl Into<String>, ty: TypeDescriptor) -> Self {
        Self {
            name: name.into(),
            ty,
            description: String::new(),
        }
    }
}

/// Fan-out: run `target_node` once per element of `items_field`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParallelSpec {
    pub items_field: String,
    pub target_node: String,
    pub collect_field: String,
}

/// A transition. Exactly one of `to` and `routes` must be set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteSpec>>,
}

impl EdgeSpec {
    pub fn direct(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: Some(to.into()),
            routes: None,
        }
    }

    pub fn routed(from: impl Into<String>, routes: Vec<RouteSpec>) -> Self {
        Self {
            from: from.into(),
            to: None,
            routes: Some(routes),
        }
    }

    /// Every node this edge can lead to.
    pub fn targets(&self) -> Vec<&str> {
        let mut out: Vec<&str> = self.to.iter().map(|s| s.as_str()).collect();
        if let Some(ref routes) = self.routes {
            out.extend(routes.iter().map(|r| r.to.as_str()));
        }
        out
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteSpec {
    pub condition: ConditionSpec,
    pub to: String,
}

impl RouteSpec {
    pub fn new(condition: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            condition: ConditionSpec::Logic {
                logic: condition.into(),
            },
            to: to.into(),
        }
    }

    pub fn default_to(to: impl Into<String>) -> Self {
        Self::new(DEFAULT_ROUTE, to)
    }
}

/// A route condition, written either as a bare string or as `{logic: ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConditionSpec {
    Logic { logic: String },
    Bare(String),
}

impl ConditionSpec {
    pub fn expression(&self) -> &str {
        match self {
            Self::Logic { logic } => logic,
            Self::Bare(s) => s,
        }
    }

    pub fn is_default(&self) -> bool {
        self.expression().trim() == DEFAULT_ROUTE
    }
}

/// The optional `config` block of a workflow.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm: Option<LlmOverride>,
    #[serde(default)]
    pub execution: ExecutionSettings,
    #[serde(default)]
    pub observability: ObservabilitySettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageSettings>,
    /// Long-term memory between runs. Not supported by this engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory: Option<Value>,
}

/// Per-workflow overrides of the engine's `[execution]` defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_iterations: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservabilitySettings {
    /// Log level used when `RUST_LOG` is not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
    /// Trace exporter (e.g. "otlp"). Not supported by this engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub export: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

/// Name-keyed map that keeps declaration order.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldMap<T>(pub Vec<(String, T)>);

impl<T> FieldMap<T> {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn insert(&mut self, name: impl Into<String>, value: T) {
        let name = name.into();
        match self.0.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: T) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&T> {
        self.0.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &T)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<T> Default for FieldMap<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Serialize> Serialize for FieldMap<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (k, v) in &self.0 {
            map.serialize_entry(k, v)?;
        }
        map.end()
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for FieldMap<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct FieldMapVisitor<T>(PhantomData<T>);

        impl<'de, T: Deserialize<'de>> Visitor<'de> for FieldMapVisitor<T> {
            type Value = FieldMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a map of field names to definitions")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<Self::Value, A::Error> {
                let mut out = FieldMap::new();
                while let Some((k, v)) = access.next_entry::<String, T>()? {
                    if out.get(&k).is_some() {
                        return Err(serde::de::Error::custom(format!("duplicate field '{}'", k)));
                    }
                    out.0.push((k, v));
                }
                Ok(out)
            }
        }

        deserializer.deserialize_map(FieldMapVisitor(PhantomData))
    }
}
