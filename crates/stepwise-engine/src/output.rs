use serde_json::{json, Map, Value};

use crate::error::OutputBuilderError;
use crate::types::TypeDescriptor;
use crate::workflow::OutputSchema;

/// Field name used when a node's output is a single scalar.
pub const SCALAR_FIELD: &str = "result";

#[derive(Debug, Clone)]
pub struct OutputField {
    pub name: String,
    pub ty: TypeDescriptor,
    pub description: String,
}

/// The structured-output contract of one node's LLM call.
#[derive(Debug, Clone)]
pub struct OutputModel {
    node_id: String,
    fields: Vec<OutputField>,
    scalar: bool,
}

impl OutputModel {
    pub fn build(schema: &OutputSchema, node_id: &str) -> Result<Self, OutputBuilderError> {
        if !schema.ty.is_object() {
            if !schema.fields.is_empty() {
                return Err(OutputBuilderError::FieldsOnScalar {
                    node_id: node_id.to_string(),
                    ty: schema.ty.to_string(),
                });
            }
            return Ok(Self {
                node_id: node_id.to_string(),
                fields: vec![OutputField {
                    name: SCALAR_FIELD.to_string(),
                    ty: schema.ty.clone(),
                    description: schema.description.clone(),
                }],
                scalar: true,
            });
        }

        if schema.fields.is_empty() {
            return Err(OutputBuilderError::EmptyObject {
                node_id: node_id.to_string(),
            });
        }

        let mut fields: Vec<OutputField> = Vec::with_capacity(schema.fields.len());
        for spec in &schema.fields {
            if spec.ty.is_object() {
                return Err(OutputBuilderError::NestedObject {
                    node_id: node_id.to_string(),
                    field: spec.name.clone(),
                });
            }
            if fields.iter().any(|f| f.name == spec.name) {
                return Err(OutputBuilderError::DuplicateField {
                    node_id: node_id.to_string(),
                    field: spec.name.clone(),
                });
            }
            fields.push(OutputField {
                name: spec.name.clone(),
                ty: spec.ty.clone(),
                description: spec.description.clone(),
            });
        }

        Ok(Self {
            node_id: node_id.to_string(),
            fields,
            scalar: false,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn fields(&self) -> &[OutputField] {
        &self.fields
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Whether this model wraps a single scalar as `result`.
    pub fn is_scalar(&self) -> bool {
        self.scalar
    }

    /// Name sent along with the schema to the LLM.
    pub fn schema_name(&self) -> String {
        format!("{}_output", self.node_id)
    }

    /// Strict JSON Schema: every field required, nothing extra.
    pub fn json_schema(&self) -> Value {
        let mut props = Map::new();
        for f in &self.fields {
            let mut schema = f.ty.json_schema();
            if !f.description.is_empty() {
                schema["description"] = json!(f.description);
            }
            props.insert(f.name.clone(), schema);
        }
        json!({
            "type": "object",
            "properties": props,
            "required": self.field_names(),
            "additionalProperties": false,
        })
    }

    /// Check a structured result, returning its fields in declared order.
    pub fn validate(&self, value: &Value) -> Result<Map<String, Value>, Vec<String>> {
        let Some(obj) = value.as_object() else {
            return Err(vec![format!("expected a JSON object, got {}", value)]);
        };

        let mut violations = Vec::new();
        let mut out = Map::new();
        for f in &self.fields {
            match obj.get(&f.name) {
                None | Some(Value::Null) => violations.push(format!("missing field '{}'", f.name)),
                Some(v) if !f.ty.matches(v) => {
                    violations.push(format!("field '{}' expects {}, got {}", f.name, f.ty, v))
                }
                Some(v) => {
                    out.insert(f.name.clone(), v.clone());
                }
            }
        }
        for key in obj.keys() {
            if !self.fields.iter().any(|f| &f.name == key) {
                violations.push(format!("unexpected field '{}'", key));
            }
        }

        if violations.is_empty() {
            Ok(out)
        } else {
            Err(violations)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::parse;
    use crate::workflow::OutputFieldSpec;

    #[test]
    fn test_scalar_wraps_as_result() {
        let schema = OutputSchema::scalar(parse("int").unwrap(), "quality score");
        let model = OutputModel::build(&schema, "judge").unwrap();
        assert!(model.is_scalar());
        assert_eq!(model.field_names(), vec!["result"]);

        let js = model.json_schema();
        assert_eq!(js["properties"]["result"]["type"], "integer");
        assert_eq!(js["properties"]["result"]["description"], "quality score");
        assert_eq!(js["required"], json!(["result"]));
        assert_eq!(js["additionalProperties"], json!(false));
    }

    #[test]
    fn test_object_keeps_declared_order() {
        let schema = OutputSchema::object(vec![
            OutputFieldSpec::new("title", parse("str").unwrap()),
            OutputFieldSpec::new("body", parse("str").unwrap()),
            OutputFieldSpec::new("tags", parse("list[str]").unwrap()),
        ]);
        let model = OutputModel::build(&schema, "writer").unwrap();
        assert_eq!(model.field_names(), vec!["title", "body", "tags"]);
        assert_eq!(model.json_schema()["required"], json!(["title", "body", "tags"]));
    }

    #[test]
    fn test_empty_object_fails() {
        let err = OutputModel::build(&OutputSchema::object(vec![]), "writer").unwrap_err();
        assert!(matches!(err, OutputBuilderError::EmptyObject { ref node_id } if node_id == "writer"));
    }

    #[test]
    fn test_nested_object_field_not_supported() {
        let schema = OutputSchema::object(vec![OutputFieldSpec::new("meta", parse("object").unwrap())]);
        let err = OutputModel::build(&schema, "writer").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("not supported"));
        assert!(msg.contains("writer"));
    }

    #[test]
    fn test_validate_reports_violations() {
        let schema = OutputSchema::object(vec![
            OutputFieldSpec::new("score", parse("int").unwrap()),
            OutputFieldSpec::new("reason", parse("str").unwrap()),
        ]);
        let model = OutputModel::build(&schema, "judge").unwrap();

        let ok = model.validate(&json!({"reason": "fine", "score": 8})).unwrap();
        let keys: Vec<&String> = ok.keys().collect();
        assert_eq!(keys.len(), 2);

        let violations = model
            .validate(&json!({"score": "eight", "extra": true}))
            .unwrap_err();
        assert_eq!(violations.len(), 3, "{:?}", violations);
    }
}
