use serde_json::{json, Map, Value};
use tracing::debug;

use crate::error::{StateBuilderError, StateError};
use crate::output::OutputModel;
use crate::types::{BasicType, TypeDescriptor};
use crate::workflow::{FieldMap, FieldSpec, NodeSpec, OutputSchema, StateSchema};

/// A resolved state field.
#[derive(Debug, Clone)]
pub struct StateField {
    pub name: String,
    pub ty: TypeDescriptor,
    pub required: bool,
    /// Value used when the field is not supplied. `Null` for optional fields
    /// without an explicit default.
    pub default: Value,
    pub description: String,
    /// Sub-model for `object` fields.
    pub nested: Option<Box<StateModel>>,
}

/// Schema-driven record model for workflow state.
///
/// Field order follows the schema. Nested object fields get a sub-model named
/// after the parent field.
#[derive(Debug, Clone)]
pub struct StateModel {
    name: String,
    fields: Vec<StateField>,
}

impl StateModel {
    /// Build the top-level state model.
    pub fn build(schema: &StateSchema) -> Result<Self, StateBuilderError> {
        let model = Self::build_named("State", "", &schema.fields)?;
        debug!(fields = model.fields.len(), "State model built");
        Ok(model)
    }

    fn build_named(
        name: &str,
        prefix: &str,
        specs: &FieldMap<FieldSpec>,
    ) -> Result<Self, StateBuilderError> {
        if specs.is_empty() {
            return Err(if prefix.is_empty() {
                StateBuilderError::EmptySchema {
                    model: name.to_string(),
                }
            } else {
                StateBuilderError::EmptyNestedSchema {
                    field: prefix.trim_end_matches('.').to_string(),
                }
            });
        }

        let mut fields = Vec::with_capacity(specs.len());
        for (field_name, spec) in specs.iter() {
            let path = format!("{}{}", prefix, field_name);

            let nested = match (&spec.ty, &spec.schema) {
                (TypeDescriptor::Object, Some(schema)) => {
                    if schema.is_empty() {
                        return Err(StateBuilderError::EmptyNestedSchema { field: path });
                    }
                    Some(Box::new(Self::build_named(
                        field_name,
                        &format!("{}.", path),
                        schema,
                    )?))
                }
                (TypeDescriptor::Object, None) => {
                    return Err(StateBuilderError::MissingNestedSchema { field: path });
                }
                (ty, Some(_)) => {
                    return Err(StateBuilderError::UnexpectedNestedSchema {
                        field: path,
                        ty: ty.to_string(),
                    });
                }
                (_, None) => None,
            };

            let default = match (&spec.default, spec.required) {
                (Some(_), true) => {
                    return Err(StateBuilderError::RequiredWithDefault { field: path });
                }
                (Some(value), false) => {
                    let valid = value.is_null()
                        || match nested {
                            Some(ref model) => value
                                .as_object()
                                .is_some_and(|obj| model.coerce(obj, &path).is_ok()),
                            None => spec.ty.matches(value),
                        };
                    if !valid {
                        return Err(StateBuilderError::InvalidDefault {
                            field: path,
                            expected: spec.ty.to_string(),
                            value: value.clone(),
                        });
                    }
                    value.clone()
                }
                (None, _) => Value::Null,
            };

            fields.push(StateField {
                name: field_name.to_string(),
                ty: spec.ty.clone(),
                required: spec.required,
                default,
                description: spec.description.clone(),
                nested,
            });
        }

        Ok(Self {
            name: name.to_string(),
            fields,
        })
    }

    /// Declare node outputs the schema does not name as optional fields,
    /// typed from the writing node's output schema. Returns the added names.
    ///
    /// Outputs that cannot be typed (no matching output field, or an invalid
    /// output schema) are left undeclared for the graph builder to report.
    pub fn declare_outputs(&mut self, nodes: &[NodeSpec]) -> Result<Vec<String>, StateBuilderError> {
        let declared = self.fields.len();
        for node in nodes.iter().filter(|n| !n.is_dispatcher()) {
            let schema = node
                .output_schema
                .clone()
                .unwrap_or_else(|| OutputSchema::scalar(TypeDescriptor::Basic(BasicType::Str), ""));
            let Ok(output) = OutputModel::build(&schema, &node.id) else {
                continue;
            };

            for name in &node.outputs {
                let ty = match output.fields() {
                    [only] if node.outputs.len() == 1 => Some(&only.ty),
                    fields => fields.iter().find(|f| &f.name == name).map(|f| &f.ty),
                };
                let Some(ty) = ty else {
                    continue;
                };

                match self.fields.iter().position(|f| &f.name == name) {
                    Some(i) if i < declared => {}
                    Some(i) => {
                        if self.fields[i].ty != *ty {
                            return Err(StateBuilderError::ConflictingOutputType {
                                field: name.clone(),
                                node_id: node.id.clone(),
                                first: self.fields[i].ty.to_string(),
                                second: ty.to_string(),
                            });
                        }
                    }
                    None => self.fields.push(StateField {
                        name: name.clone(),
                        ty: ty.clone(),
                        required: false,
                        default: Value::Null,
                        description: format!("output of node '{}'", node.id),
                        nested: None,
                    }),
                }
            }
        }

        let added: Vec<String> = self.fields[declared..].iter().map(|f| f.name.clone()).collect();
        if !added.is_empty() {
            debug!(fields = ?added, "Node outputs declared as state fields");
        }
        Ok(added)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[StateField] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&StateField> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Create the initial state from run inputs.
    pub fn instantiate(&self, inputs: &Map<String, Value>) -> Result<Map<String, Value>, StateError> {
        self.coerce(inputs, "")
    }

    /// Merge a node's delta into `state`, type-checking every field first.
    /// On error `state` is left untouched.
    pub fn merge(
        &self,
        state: &mut Map<String, Value>,
        delta: &Map<String, Value>,
    ) -> Result<(), StateError> {
        let mut checked = Vec::with_capacity(delta.len());
        for (name, value) in delta {
            let field = self.field(name).ok_or_else(|| StateError::UnknownField {
                field: name.clone(),
                known: self.field_names(),
            })?;
            checked.push((name.clone(), field.check(value, name)?));
        }
        for (name, value) in checked {
            state.insert(name, value);
        }
        Ok(())
    }

    /// Validate a full record: reject unknown keys, report every missing
    /// required field, type-check values and fill defaults.
    fn coerce(&self, values: &Map<String, Value>, prefix: &str) -> Result<Map<String, Value>, StateError> {
        if let Some(unknown) = values.keys().find(|k| self.field(k).is_none()) {
            return Err(StateError::UnknownField {
                field: format!("{}{}", prefix, unknown),
                known: self.field_names(),
            });
        }

        let missing: Vec<String> = self
            .fields
            .iter()
            .filter(|f| f.required && values.get(&f.name).map_or(true, Value::is_null))
            .map(|f| format!("{}{}", prefix, f.name))
            .collect();
        if !missing.is_empty() {
            return Err(StateError::MissingRequired { fields: missing });
        }

        let mut out = Map::new();
        for field in &self.fields {
            let path = format!("{}{}", prefix, field.name);
            let value = match values.get(&field.name) {
                Some(v) => field.check(v, &path)?,
                None => field.default.clone(),
            };
            out.insert(field.name.clone(), value);
        }
        Ok(out)
    }

    /// JSON Schema of the whole state, for tooling.
    pub fn json_schema(&self) -> Value {
        let mut props = Map::new();
        for f in &self.fields {
            let mut schema = match f.nested {
                Some(ref nested) => nested.json_schema(),
                None => f.ty.json_schema(),
            };
            if !f.description.is_empty() {
                schema["description"] = json!(f.description);
            }
            props.insert(f.name.clone(), schema);
        }
        let required: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.required)
            .map(|f| f.name.as_str())
            .collect();
        json!({
            "title": self.name,
            "type": "object",
            "properties": props,
            "required": required,
        })
    }
}

impl StateField {
    fn check(&self, value: &Value, path: &str) -> Result<Value, StateError> {
        if value.is_null() {
            if self.required {
                return Err(StateError::MissingRequired {
                    fields: vec![path.to_string()],
                });
            }
            return Ok(Value::Null);
        }

        if let Some(ref nested) = self.nested {
            let obj = value.as_object().ok_or_else(|| StateError::NotAnObject {
                field: path.to_string(),
                value: value.clone(),
            })?;
            return nested.coerce(obj, &format!("{}.", path)).map(Value::Object);
        }

        if self.ty.matches(value) {
            Ok(value.clone())
        } else {
            Err(StateError::TypeMismatch {
                field: path.to_string(),
                expected: self.ty.to_string(),
                value: value.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse;

    fn field(ty: &str) -> FieldSpec {
        FieldSpec::new(parse(ty).unwrap())
    }

    fn topic_schema() -> StateSchema {
        StateSchema {
            fields: FieldMap::new()
                .with("topic", field("str").required())
                .with("score", field("int").with_default(json!(0)))
                .with("notes", field("list[str]")),
        }
    }

    fn inputs(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_missing_required_field_fails() {
        let model = StateModel::build(&topic_schema()).unwrap();
        let err = model.instantiate(&Map::new()).unwrap_err();
        match err {
            StateError::MissingRequired { fields } => assert_eq!(fields, vec!["topic"]),
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_defaults_applied() {
        let model = StateModel::build(&topic_schema()).unwrap();
        let state = model.instantiate(&inputs(json!({"topic": "rust"}))).unwrap();
        assert_eq!(state["topic"], "rust");
        assert_eq!(state["score"], 0);
        assert_eq!(state["notes"], Value::Null);
    }

    #[test]
    fn test_instantiate_rejects_unknown_and_mistyped() {
        let model = StateModel::build(&topic_schema()).unwrap();
        assert!(matches!(
            model.instantiate(&inputs(json!({"topic": "x", "extra": 1}))),
            Err(StateError::UnknownField { .. })
        ));
        assert!(matches!(
            model.instantiate(&inputs(json!({"topic": "x", "score": "high"}))),
            Err(StateError::TypeMismatch { ref field, .. }) if field == "score"
        ));
    }

    #[test]
    fn test_merge_type_checks_and_is_atomic() {
        let model = StateModel::build(&topic_schema()).unwrap();
        let mut state = model.instantiate(&inputs(json!({"topic": "rust"}))).unwrap();

        model
            .merge(&mut state, &inputs(json!({"score": 7, "notes": ["a"]})))
            .unwrap();
        assert_eq!(state["score"], 7);

        let err = model
            .merge(&mut state, &inputs(json!({"score": 9, "notes": [1]})))
            .unwrap_err();
        assert!(matches!(err, StateError::TypeMismatch { .. }));
        assert_eq!(state["score"], 7);
    }

    #[test]
    fn test_nested_object_fields() {
        let author = FieldMap::new()
            .with("name", field("str").required())
            .with("age", field("int"));
        let mut meta = field("object");
        meta.schema = Some(author);
        let schema = StateSchema {
            fields: FieldMap::new().with("meta", meta),
        };
        let model = StateModel::build(&schema).unwrap();
        let nested = model.field("meta").unwrap().nested.as_ref().unwrap();
        assert_eq!(nested.name(), "meta");

        let state = model
            .instantiate(&inputs(json!({"meta": {"name": "Ada"}})))
            .unwrap();
        assert_eq!(state["meta"], json!({"name": "Ada", "age": null}));

        let err = model.instantiate(&inputs(json!({"meta": {}}))).unwrap_err();
        assert!(err.to_string().contains("meta.name"));
    }

    #[test]
    fn test_builder_errors() {
        assert!(matches!(
            StateModel::build(&StateSchema::default()),
            Err(StateBuilderError::EmptySchema { .. })
        ));

        let schema = StateSchema {
            fields: FieldMap::new().with("meta", field("object")),
        };
        assert!(matches!(
            StateModel::build(&schema),
            Err(StateBuilderError::MissingNestedSchema { ref field }) if field == "meta"
        ));

        let mut meta = field("object");
        meta.schema = Some(FieldMap::new());
        let schema = StateSchema {
            fields: FieldMap::new().with("meta", meta),
        };
        assert!(matches!(
            StateModel::build(&schema),
            Err(StateBuilderError::EmptyNestedSchema { .. })
        ));

        let schema = StateSchema {
            fields: FieldMap::new().with("score", field("int").with_default(json!("zero"))),
        };
        assert!(matches!(
            StateModel::build(&schema),
            Err(StateBuilderError::InvalidDefault { .. })
        ));
    }

    #[test]
    fn test_json_schema_lists_required() {
        let model = StateModel::build(&topic_schema()).unwrap();
        let schema = model.json_schema();
        assert_eq!(schema["required"], json!(["topic"]));
        assert_eq!(schema["properties"]["notes"]["items"]["type"], "string");
    }

    #[test]
    fn test_undeclared_outputs_become_optional_fields() {
        let mut model = StateModel::build(&topic_schema()).unwrap();
        let nodes = vec![
            NodeSpec::new("echo", "Echo: {state.topic}")
                .with_output(OutputSchema::scalar(parse("str").unwrap(), ""), vec!["result".into()]),
            NodeSpec::new("judge", "Rate {state.topic}").with_output(
                OutputSchema::object(vec![
                    crate::workflow::OutputFieldSpec::new("score", parse("int").unwrap()),
                    crate::workflow::OutputFieldSpec::new("tags", parse("list[str]").unwrap()),
                ]),
                vec!["score".into(), "tags".into()],
            ),
        ];

        let added = model.declare_outputs(&nodes).unwrap();
        // `score` is already in the schema and keeps its declaration.
        assert_eq!(added, vec!["result", "tags"]);
        assert_eq!(model.field("result").unwrap().ty, parse("str").unwrap());
        assert_eq!(model.field("tags").unwrap().ty, parse("list[str]").unwrap());
        assert!(!model.field("result").unwrap().required);
        assert_eq!(model.field("score").unwrap().default, json!(0));

        let state = model.instantiate(&inputs(json!({"topic": "rust"}))).unwrap();
        assert_eq!(state["result"], Value::Null);
    }

    #[test]
    fn test_conflicting_undeclared_output_types() {
        let mut model = StateModel::build(&topic_schema()).unwrap();
        let nodes = vec![
            NodeSpec::new("a", "x")
                .with_output(OutputSchema::scalar(parse("str").unwrap(), ""), vec!["answer".into()]),
            NodeSpec::new("b", "y")
                .with_output(OutputSchema::scalar(parse("int").unwrap(), ""), vec!["answer".into()]),
        ];
        assert!(matches!(
            model.declare_outputs(&nodes),
            Err(StateBuilderError::ConflictingOutputType { ref field, ref node_id, .. })
                if field == "answer" && node_id == "b"
        ));
    }
}
