//! `{placeholder}` resolution against node inputs, fan-out scope and state.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::TemplateResolutionError;

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)*)\}")
            .expect("placeholder pattern is valid")
    })
}

/// Per-invocation context of a fan-out worker. Never written to state.
#[derive(Debug, Clone, PartialEq)]
pub struct FanOutScope {
    pub item: Value,
    pub index: usize,
    pub source_field: String,
}

impl FanOutScope {
    fn lookup(&self, path: &str) -> Option<Value> {
        let (head, rest) = split_head(path);
        match head {
            "item" => match rest {
                Some(rest) => walk(&self.item, rest).cloned(),
                None => Some(self.item.clone()),
            },
            "index" if rest.is_none() => Some(Value::from(self.index)),
            "source_field" if rest.is_none() => Some(Value::String(self.source_field.clone())),
            _ => None,
        }
    }
}

/// Everything a template may read from.
#[derive(Debug, Clone, Copy)]
pub struct TemplateContext<'a> {
    pub inputs: &'a Map<String, Value>,
    pub scope: Option<&'a FanOutScope>,
    pub state: &'a Map<String, Value>,
}

impl<'a> TemplateContext<'a> {
    pub fn new(inputs: &'a Map<String, Value>, state: &'a Map<String, Value>) -> Self {
        Self {
            inputs,
            scope: None,
            state,
        }
    }

    pub fn with_scope(mut self, scope: Option<&'a FanOutScope>) -> Self {
        self.scope = scope;
        self
    }

    fn lookup(&self, var: &str) -> Option<Value> {
        if let Some(path) = var.strip_prefix("state.") {
            return lookup_map(self.state, path);
        }
        if let Some(v) = self.inputs.get(var) {
            return Some(v.clone());
        }
        if let Some(v) = lookup_map(self.inputs, var) {
            return Some(v);
        }
        if let Some(v) = self.scope.and_then(|s| s.lookup(var)) {
            return Some(v);
        }
        lookup_map(self.state, var)
    }

    fn error(&self, template: &str, var: &str) -> TemplateResolutionError {
        let mut available_inputs: Vec<String> = self.inputs.keys().cloned().collect();
        if self.scope.is_some() {
            available_inputs.extend(["item", "index", "source_field"].map(String::from));
        }
        let state_fields: Vec<String> = self.state.keys().cloned().collect();

        let candidates = available_inputs
            .iter()
            .cloned()
            .chain(state_fields.iter().cloned())
            .chain(state_fields.iter().map(|f| format!("state.{}", f)));
        let suggestion = suggest(var, candidates);
        TemplateResolutionError {
            variable: var.to_string(),
            template: template.to_string(),
            available_inputs,
            state_fields,
            suggestion,
        }
    }
}

/// Names of all placeholders in a template, in order of appearance.
pub fn placeholders(template: &str) -> Vec<&str> {
    placeholder_re()
        .captures_iter(template)
        .filter_map(|c| c.get(1).map(|m| m.as_str()))
        .collect()
}

/// Resolve a template.
///
/// A template that is exactly one placeholder yields the referenced value
/// unchanged; any other template yields a string.
pub fn resolve(template: &str, ctx: &TemplateContext<'_>) -> Result<Value, TemplateResolutionError> {
    let re = placeholder_re();

    if let Some(caps) = re.captures(template) {
        if let Some(whole) = caps.get(0) {
            if whole.start() == 0 && whole.end() == template.len() {
                let var = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
                return ctx.lookup(var).ok_or_else(|| ctx.error(template, var));
            }
        }
    }

    render(template, ctx).map(Value::String)
}

/// Render a template to text, substituting every placeholder.
pub fn render(template: &str, ctx: &TemplateContext<'_>) -> Result<String, TemplateResolutionError> {
    let mut out = String::with_capacity(template.len());
    let mut last = 0;
    for caps in placeholder_re().captures_iter(template) {
        let (Some(whole), Some(var)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let value = ctx
            .lookup(var.as_str())
            .ok_or_else(|| ctx.error(template, var.as_str()))?;
        out.push_str(&template[last..whole.start()]);
        out.push_str(&display_value(&value));
        last = whole.end();
    }
    out.push_str(&template[last..]);
    Ok(out)
}

/// Text form of a value inside a rendered template.
pub fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn split_head(path: &str) -> (&str, Option<&str>) {
    match path.split_once('.') {
        Some((head, rest)) => (head, Some(rest)),
        None => (path, None),
    }
}

fn lookup_map(map: &Map<String, Value>, path: &str) -> Option<Value> {
    let (head, rest) = split_head(path);
    let root = map.get(head)?;
    match rest {
        Some(rest) => walk(root, rest).cloned(),
        None => Some(root.clone()),
    }
}

/// Follow a dotted path through nested objects (and list indices).
pub fn walk<'v>(value: &'v Value, path: &str) -> Option<&'v Value> {
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Closest candidate within edit distance 2.
fn suggest(var: &str, candidates: impl Iterator<Item = String>) -> Option<String> {
    candidates
        .filter(|c| c != var)
        .map(|c| (levenshtein(var, &c), c))
        .filter(|(d, _)| *d <= 2)
        .min_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, c)| c)
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    let mut cur = vec![0; b.len() + 1];
    for (i, ca) in a.chars().enumerate() {
        cur[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            cur[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(cur[j] + 1);
        }
        std::mem::swap(&mut prev, &mut cur);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_literal_resolves_to_itself() {
        let empty = Map::new();
        let ctx = TemplateContext::new(&empty, &empty);
        assert_eq!(resolve("plain text", &ctx).unwrap(), json!("plain text"));
        assert_eq!(resolve("", &ctx).unwrap(), json!(""));
        assert_eq!(resolve("{ not a placeholder }", &ctx).unwrap(), json!("{ not a placeholder }"));
    }

    #[test]
    fn test_single_placeholder_keeps_native_value() {
        let state = map(json!({"scores": [1, 2, 3], "meta": {"author": {"name": "Ada"}}}));
        let inputs = Map::new();
        let ctx = TemplateContext::new(&inputs, &state);
        assert_eq!(resolve("{scores}", &ctx).unwrap(), json!([1, 2, 3]));
        assert_eq!(resolve("{state.meta.author.name}", &ctx).unwrap(), json!("Ada"));
        assert_eq!(resolve("{scores.1}", &ctx).unwrap(), json!(2));
    }

    #[test]
    fn test_mixed_template_renders_text() {
        let inputs = map(json!({"topic": "rust", "n": 3, "none": null}));
        let state = map(json!({"tags": ["a", "b"]}));
        let ctx = TemplateContext::new(&inputs, &state);
        assert_eq!(
            resolve("Write {n} posts on {topic} tagged {tags} ({none})", &ctx).unwrap(),
            json!("Write 3 posts on rust tagged [\"a\",\"b\"] (null)")
        );
    }

    #[test]
    fn test_inputs_win_over_state() {
        let inputs = map(json!({"topic": "from inputs", "a.b": "dotted key"}));
        let state = map(json!({"topic": "from state"}));
        let ctx = TemplateContext::new(&inputs, &state);
        assert_eq!(resolve("{topic}", &ctx).unwrap(), json!("from inputs"));
        assert_eq!(resolve("{state.topic}", &ctx).unwrap(), json!("from state"));
        assert_eq!(resolve("{a.b}", &ctx).unwrap(), json!("dotted key"));
    }

    #[test]
    fn test_fan_out_scope() {
        let inputs = Map::new();
        let state = map(json!({"item": "shadowed"}));
        let scope = FanOutScope {
            item: json!({"title": "Intro"}),
            index: 2,
            source_field: "sections".into(),
        };
        let ctx = TemplateContext::new(&inputs, &state).with_scope(Some(&scope));
        assert_eq!(
            render("#{index} {item.title} from {source_field}", &ctx).unwrap(),
            "#2 Intro from sections"
        );
        assert_eq!(resolve("{state.item}", &ctx).unwrap(), json!("shadowed"));
    }

    #[test]
    fn test_unknown_variable_suggests_closest() {
        let inputs = map(json!({"topic": "rust"}));
        let state = Map::new();
        let ctx = TemplateContext::new(&inputs, &state);
        let err = resolve("Write about {topik}", &ctx).unwrap_err();
        assert_eq!(err.variable, "topik");
        assert_eq!(err.suggestion.as_deref(), Some("topic"));
        assert!(err.to_string().contains("topic"));
    }

    #[test]
    fn test_unknown_variable_without_close_match() {
        let inputs = Map::new();
        let state = map(json!({"draft": "..."}));
        let ctx = TemplateContext::new(&inputs, &state);
        let err = resolve("{completely_different}", &ctx).unwrap_err();
        assert!(err.suggestion.is_none());
        assert_eq!(err.state_fields, vec!["draft"]);
    }

    #[test]
    fn test_error_lists_every_name_and_suggests_state_path() {
        let inputs = map(json!({"topic": "rust"}));
        let state = map(json!({"summary": ""}));
        let scope = FanOutScope {
            item: json!("x"),
            index: 0,
            source_field: "topics".into(),
        };
        let ctx = TemplateContext::new(&inputs, &state).with_scope(Some(&scope));
        let err = resolve("{state.sumary}", &ctx).unwrap_err();
        assert_eq!(err.available_inputs, vec!["topic", "item", "index", "source_field"]);
        assert_eq!(err.state_fields, vec!["summary"]);
        assert_eq!(err.suggestion.as_deref(), Some("state.summary"));
    }

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders("{a} and {b.c} but not {1x}"), vec!["a", "b.c"]);
    }

    #[test]
    fn test_levenshtein() {
        assert_eq!(levenshtein("topik", "topic"), 1);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }
}
