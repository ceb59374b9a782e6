//! Type strings used by state and output schemas.
//!
//! Grammar: `str | int | float | bool | object | list | list[T] | dict | dict[K, V]`,
//! with whitespace allowed around the whole string and around parameters.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::TypeParseError;

/// Scalar base types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BasicType {
    Str,
    Int,
    Float,
    Bool,
}

impl BasicType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Str => "str",
            Self::Int => "int",
            Self::Float => "float",
            Self::Bool => "bool",
        }
    }
}

/// Parsed form of a type string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TypeDescriptor {
    Basic(BasicType),
    List(Option<Box<TypeDescriptor>>),
    Dict(Option<Box<(TypeDescriptor, TypeDescriptor)>>),
    /// Structured record; its fields come from a nested schema.
    Object,
}

/// Native representation a descriptor maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeType {
    String,
    Integer,
    Float,
    Boolean,
    Array,
    Map,
}

/// Parse a type string.
pub fn parse(input: &str) -> Result<TypeDescriptor, TypeParseError> {
    parse_inner(input, input)
}

/// Whether `input` is a valid type string. Never fails.
pub fn validate(input: &str) -> bool {
    parse(input).is_ok()
}

/// Map a descriptor to its native representation.
pub fn get_native_type(descriptor: &TypeDescriptor) -> NativeType {
    match descriptor {
        TypeDescriptor::Basic(BasicType::Str) => NativeType::String,
        TypeDescriptor::Basic(BasicType::Int) => NativeType::Integer,
        TypeDescriptor::Basic(BasicType::Float) => NativeType::Float,
        TypeDescriptor::Basic(BasicType::Bool) => NativeType::Boolean,
        TypeDescriptor::List(_) => NativeType::Array,
        TypeDescriptor::Dict(_) | TypeDescriptor::Object => NativeType::Map,
    }
}

fn parse_inner(whole: &str, input: &str) -> Result<TypeDescriptor, TypeParseError> {
    let s = input.trim();
    if s.is_empty() {
        return Err(TypeParseError::new(whole, "empty type"));
    }

    let (base, params) = match s.find('[') {
        Some(open) => {
            let inner = s[open + 1..]
                .strip_suffix(']')
                .ok_or_else(|| TypeParseError::new(whole, format!("unterminated '[' in '{}'", s)))?;
            (s[..open].trim(), Some(inner))
        }
        None => {
            if s.contains(']') {
                return Err(TypeParseError::new(whole, format!("unbalanced ']' in '{}'", s)));
            }
            (s, None)
        }
    };

    match (base, params) {
        ("str", None) => Ok(TypeDescriptor::Basic(BasicType::Str)),
        ("int", None) => Ok(TypeDescriptor::Basic(BasicType::Int)),
        ("float", None) => Ok(TypeDescriptor::Basic(BasicType::Float)),
        ("bool", None) => Ok(TypeDescriptor::Basic(BasicType::Bool)),
        ("object", None) => Ok(TypeDescriptor::Object),
        ("list", None) => Ok(TypeDescriptor::List(None)),
        ("dict", None) => Ok(TypeDescriptor::Dict(None)),
        ("list", Some(inner)) => {
            if split_top_level(inner).len() != 1 {
                return Err(TypeParseError::new(whole, "list takes exactly one item type"));
            }
            let item = parse_inner(whole, inner)?;
            Ok(TypeDescriptor::List(Some(Box::new(item))))
        }
        ("dict", Some(inner)) => {
            let parts = split_top_level(inner);
            if parts.len() != 2 {
                return Err(TypeParseError::new(
                    whole,
                    "dict takes a key and a value type separated by one comma",
                ));
            }
            let key = parse_inner(whole, parts[0])?;
            let value = parse_inner(whole, parts[1])?;
            Ok(TypeDescriptor::Dict(Some(Box::new((key, value)))))
        }
        ("str" | "int" | "float" | "bool" | "object", Some(_)) => Err(TypeParseError::new(
            whole,
            format!("'{}' does not take type parameters", base),
        )),
        (other, _) => Err(TypeParseError::new(whole, format!("unknown type '{}'", other))),
    }
}

/// Split on commas that are not nested inside brackets.
fn split_top_level(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

impl TypeDescriptor {
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object)
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List(_))
    }

    /// Whether values of type `other` always fit this type. Containers
    /// without a declared item type are compatible with any item type.
    pub fn accepts(&self, other: &TypeDescriptor) -> bool {
        match (self, other) {
            (Self::Basic(BasicType::Float), Self::Basic(BasicType::Int)) => true,
            (Self::Basic(a), Self::Basic(b)) => a == b,
            (Self::List(a), Self::List(b)) => match (a, b) {
                (Some(a), Some(b)) => a.accepts(b),
                _ => true,
            },
            (Self::Dict(a), Self::Dict(b)) => match (a, b) {
                (Some(a), Some(b)) => a.0.accepts(&b.0) && a.1.accepts(&b.1),
                _ => true,
            },
            (Self::Object, Self::Object | Self::Dict(_)) => true,
            _ => false,
        }
    }

    /// Check a JSON value against this type. `null` never matches; callers
    /// decide whether a field may be null.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Basic(BasicType::Str) => value.is_string(),
            Self::Basic(BasicType::Int) => value.is_i64() || value.is_u64(),
            Self::Basic(BasicType::Float) => value.is_number(),
            Self::Basic(BasicType::Bool) => value.is_boolean(),
            Self::List(item) => match (value.as_array(), item) {
                (Some(items), Some(t)) => items.iter().all(|v| t.matches(v)),
                (Some(_), None) => true,
                (None, _) => false,
            },
            Self::Dict(kv) => match (value.as_object(), kv) {
                (Some(map), Some(kv)) => map
                    .iter()
                    .all(|(k, v)| key_matches(&kv.0, k) && kv.1.matches(v)),
                (Some(_), None) => true,
                (None, _) => false,
            },
            Self::Object => value.is_object(),
        }
    }

    /// JSON Schema fragment describing this type.
    pub fn json_schema(&self) -> Value {
        match self {
            Self::Basic(BasicType::Str) => json!({"type": "string"}),
            Self::Basic(BasicType::Int) => json!({"type": "integer"}),
            Self::Basic(BasicType::Float) => json!({"type": "number"}),
            Self::Basic(BasicType::Bool) => json!({"type": "boolean"}),
            Self::List(None) => json!({"type": "array"}),
            Self::List(Some(item)) => json!({"type": "array", "items": item.json_schema()}),
            Self::Dict(None) | Self::Object => json!({"type": "object"}),
            Self::Dict(Some(kv)) => json!({
                "type": "object",
                "additionalProperties": kv.1.json_schema(),
            }),
        }
    }
}

/// Dict keys are always strings in JSON; check they parse as the key type.
fn key_matches(key_type: &TypeDescriptor, key: &str) -> bool {
    match key_type {
        TypeDescriptor::Basic(BasicType::Str) => true,
        TypeDescriptor::Basic(BasicType::Int) => key.parse::<i64>().is_ok(),
        TypeDescriptor::Basic(BasicType::Float) => key.parse::<f64>().is_ok(),
        TypeDescriptor::Basic(BasicType::Bool) => key == "true" || key == "false",
        _ => false,
    }
}

impl fmt::Display for TypeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic(b) => f.write_str(b.as_str()),
            Self::List(None) => f.write_str("list"),
            Self::List(Some(item)) => write!(f, "list[{}]", item),
            Self::Dict(None) => f.write_str("dict"),
            Self::Dict(Some(kv)) => write!(f, "dict[{}, {}]", kv.0, kv.1),
            Self::Object => f.write_str("object"),
        }
    }
}

impl FromStr for TypeDescriptor {
    type Err = TypeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

impl TryFrom<String> for TypeDescriptor {
    type Error = TypeParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        parse(&s)
    }
}

impl From<TypeDescriptor> for String {
    fn from(t: TypeDescriptor) -> Self {
        t.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_types() {
        assert_eq!(parse("str").unwrap(), TypeDescriptor::Basic(BasicType::Str));
        assert_eq!(parse("  int ").unwrap(), TypeDescriptor::Basic(BasicType::Int));
        assert_eq!(parse("float").unwrap(), TypeDescriptor::Basic(BasicType::Float));
        assert_eq!(parse("bool").unwrap(), TypeDescriptor::Basic(BasicType::Bool));
        assert_eq!(parse("object").unwrap(), TypeDescriptor::Object);
        assert_eq!(parse("list").unwrap(), TypeDescriptor::List(None));
        assert_eq!(parse("dict").unwrap(), TypeDescriptor::Dict(None));
    }

    #[test]
    fn test_parse_nested_types() {
        let t = parse("list[int]").unwrap();
        assert_eq!(t.to_string(), "list[int]");

        let t = parse("dict[ str , list[ int ] ]").unwrap();
        assert_eq!(t.to_string(), "dict[str, list[int]]");

        let t = parse("list[dict[str,int]]").unwrap();
        assert_eq!(t.to_string(), "list[dict[str, int]]");
    }

    #[test]
    fn test_parse_rejects_malformed() {
        for bad in [
            "",
            "   ",
            "list[",
            "list[]",
            "dict[str",
            "dict[str]",
            "dict[str, int, int]",
            "unknowntype",
            "Str",
            "int[str]",
            "list]int",
            "list[int]x",
        ] {
            assert!(parse(bad).is_err(), "expected '{}' to fail", bad);
            assert!(!validate(bad));
        }
    }

    #[test]
    fn test_parse_error_names_input() {
        let err = parse("unknowntype").unwrap_err();
        assert_eq!(err.input, "unknowntype");
        assert!(err.to_string().contains("unknown type"));
    }

    #[test]
    fn test_native_type_is_deterministic() {
        let cases = [
            ("str", NativeType::String),
            ("int", NativeType::Integer),
            ("float", NativeType::Float),
            ("bool", NativeType::Boolean),
            ("list[str]", NativeType::Array),
            ("dict[str, int]", NativeType::Map),
            ("object", NativeType::Map),
        ];
        for (s, native) in cases {
            let t = parse(s).unwrap();
            assert_eq!(get_native_type(&t), native);
            assert_eq!(get_native_type(&t), get_native_type(&parse(s).unwrap()));
        }
    }

    #[test]
    fn test_matches_values() {
        assert!(parse("int").unwrap().matches(&json!(3)));
        assert!(!parse("int").unwrap().matches(&json!(3.5)));
        assert!(parse("float").unwrap().matches(&json!(3)));
        assert!(!parse("str").unwrap().matches(&Value::Null));
        assert!(parse("list[str]").unwrap().matches(&json!(["a", "b"])));
        assert!(!parse("list[str]").unwrap().matches(&json!(["a", 1])));
        assert!(parse("dict[int, bool]").unwrap().matches(&json!({"1": true})));
        assert!(!parse("dict[int, bool]").unwrap().matches(&json!({"one": true})));
        assert!(parse("object").unwrap().matches(&json!({"any": 1})));
    }

    #[test]
    fn test_json_schema() {
        assert_eq!(
            parse("list[int]").unwrap().json_schema(),
            json!({"type": "array", "items": {"type": "integer"}})
        );
        assert_eq!(
            parse("dict[str, float]").unwrap().json_schema(),
            json!({"type": "object", "additionalProperties": {"type": "number"}})
        );
    }

    #[test]
    fn test_serde_uses_type_strings() {
        let t: TypeDescriptor = serde_json::from_value(json!("list[str]")).unwrap();
        assert_eq!(t, TypeDescriptor::List(Some(Box::new(TypeDescriptor::Basic(BasicType::Str)))));
        assert_eq!(serde_json::to_value(&t).unwrap(), json!("list[str]"));
        assert!(serde_json::from_value::<TypeDescriptor>(json!("lst[str]")).is_err());
    }

    #[test]
    fn test_accepts() {
        let t = |s: &str| parse(s).unwrap();
        assert!(t("float").accepts(&t("int")));
        assert!(!t("int").accepts(&t("float")));
        assert!(!t("str").accepts(&t("int")));
        assert!(t("list[float]").accepts(&t("list[int]")));
        assert!(t("list").accepts(&t("list[str]")));
        assert!(!t("list[str]").accepts(&t("dict[str, str]")));
        assert!(t("object").accepts(&t("dict[str, int]")));
        assert!(!t("dict[str, int]").accepts(&t("dict[str, str]")));
    }
}
