/// `{{…}}` placeholder resolution
///
/// Config strings are resolved against the accumulated node outputs, the run inputs
/// and the node's own incoming handles before the node executes. Lookups:
/// - `{{input.x}}` / `{{inputs.x}}`: field `x` of the local input, else run input `x`
/// - `{{node.handle.path}}`: an output handle, then a dotted path into it
/// - `{{node}}`: the node's primary text
/// - `{{name}}`: a local handle, else a run input
///
/// Placeholders that do not resolve are left verbatim.

use crate::workflow::value::{NodeOutput, NodeValue};
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, LazyLock};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{\{\s*([^{}]+?)\s*\}\}").expect("placeholder pattern is valid"));

/// Everything a placeholder may refer to
pub struct TemplateScope<'a> {
    pub outputs: &'a HashMap<String, Arc<NodeOutput>>,
    pub run_inputs: &'a Map<String, Value>,
    pub local: &'a BTreeMap<String, NodeValue>,
}

impl TemplateScope<'_> {
    /// Resolve one placeholder expression to a JSON value
    pub fn lookup(&self, expr: &str) -> Option<Value> {
        let parts: Vec<&str> = expr.split('.').map(str::trim).collect();
        let (head, rest) = parts.split_first()?;

        if matches!(*head, "input" | "inputs") && !rest.is_empty() {
            if let Some(found) = self.local.get("input").and_then(|v| descend(&v.to_json(), rest)) {
                return Some(found);
            }
            if let Some(found) = self.local.get(rest[0]).and_then(|v| descend(&v.to_json(), &rest[1..])) {
                return Some(found);
            }
            return self.run_inputs.get(rest[0]).and_then(|v| descend(v, &rest[1..]));
        }

        if rest.is_empty() {
            if let Some(v) = self.local.get(*head) {
                return Some(v.to_json());
            }
            if let Some(output) = self.outputs.get(*head) {
                return Some(Value::String(output.primary_text()));
            }
            return self.run_inputs.get(*head).cloned();
        }

        if let Some(output) = self.outputs.get(*head) {
            return lookup_output(output, rest);
        }
        if let Some(v) = self.local.get(*head) {
            return descend(&v.to_json(), rest);
        }
        self.run_inputs.get(*head).and_then(|v| descend(v, rest))
    }
}

fn lookup_output(output: &NodeOutput, path: &[&str]) -> Option<Value> {
    let (handle, rest) = path.split_first()?;
    if let Some(value) = output.get(handle) {
        return descend(&value.to_json(), rest);
    }
    if rest.is_empty() && matches!(*handle, "output" | "result") {
        return Some(Value::String(output.primary_text()));
    }
    // `node.field` reaches into the node's primary value
    let primary = output.resolve("value").to_json();
    descend(&primary, path)
}

fn descend(value: &Value, path: &[&str]) -> Option<Value> {
    let mut current = value;
    for key in path {
        current = match current {
            Value::Object(map) => map.get(*key)?,
            Value::Array(items) => items.get(key.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current.clone())
}

fn render(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Resolve every placeholder in `template`, producing text
pub fn resolve_template(template: &str, scope: &TemplateScope<'_>) -> String {
    if !template.contains("{{") {
        return template.to_string();
    }
    PLACEHOLDER
        .replace_all(template, |caps: &regex::Captures<'_>| match scope.lookup(&caps[1]) {
            Some(value) => render(&value),
            None => {
                tracing::debug!("🔍 Unresolved template placeholder: {}", &caps[0]);
                caps[0].to_string()
            }
        })
        .into_owned()
}

/// Resolve placeholders in every string of a config document.
/// A string that is exactly one placeholder takes the referenced value's JSON shape.
pub fn resolve_config(config: &Value, scope: &TemplateScope<'_>) -> Value {
    match config {
        Value::String(s) if s.contains("{{") => {
            if let Some(caps) = PLACEHOLDER.captures(s) {
                if caps.get(0).map(|m| m.as_str().len()) == Some(s.trim().len()) {
                    if let Some(value) = scope.lookup(&caps[1]) {
                        return value;
                    }
                }
            }
            Value::String(resolve_template(s, scope))
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| resolve_config(v, scope)).collect()),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), resolve_config(v, scope)))
                .collect(),
        ),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixture() -> (HashMap<String, Arc<NodeOutput>>, Map<String, Value>, BTreeMap<String, NodeValue>) {
        let mut outputs = HashMap::new();
        outputs.insert(
            "llm_1".to_string(),
            Arc::new(
                NodeOutput::new()
                    .with("response", "The answer")
                    .with("usage", json!({"total_tokens": 42})),
            ),
        );
        outputs.insert(
            "fetch".to_string(),
            Arc::new(NodeOutput::single("value", json!({"user": {"name": "Ada"}}))),
        );
        let mut inputs = Map::new();
        inputs.insert("topic".into(), json!("rust"));
        let mut local = BTreeMap::new();
        local.insert("input".to_string(), NodeValue::from(json!({"city": "Oslo"})));
        (outputs, inputs, local)
    }

    #[test]
    fn resolves_handles_paths_and_inputs() {
        let (outputs, inputs, local) = fixture();
        let scope = TemplateScope { outputs: &outputs, run_inputs: &inputs, local: &local };
        assert_eq!(resolve_template("{{llm_1.response}}", &scope), "The answer");
        assert_eq!(resolve_template("{{llm_1.usage.total_tokens}}", &scope), "42");
        assert_eq!(resolve_template("{{llm_1}}", &scope), "The answer");
        assert_eq!(resolve_template("{{llm_1.output}}", &scope), "The answer");
        assert_eq!(resolve_template("{{fetch.user.name}}", &scope), "Ada");
        assert_eq!(resolve_template("{{input.city}} / {{inputs.topic}}", &scope), "Oslo / rust");
        assert_eq!(resolve_template("{{ topic }}", &scope), "rust");
    }

    #[test]
    fn unresolved_placeholders_stay_verbatim() {
        let (outputs, inputs, local) = fixture();
        let scope = TemplateScope { outputs: &outputs, run_inputs: &inputs, local: &local };
        assert_eq!(resolve_template("Hi {{missing.handle}}!", &scope), "Hi {{missing.handle}}!");
        assert_eq!(resolve_template("no placeholders", &scope), "no placeholders");
    }

    #[test]
    fn whole_placeholder_config_keeps_json_shape() {
        let (outputs, inputs, local) = fixture();
        let scope = TemplateScope { outputs: &outputs, run_inputs: &inputs, local: &local };
        let resolved = resolve_config(
            &json!({"usage": "{{llm_1.usage}}", "label": "tokens: {{llm_1.usage.total_tokens}}", "n": 3}),
            &scope,
        );
        assert_eq!(resolved["usage"], json!({"total_tokens": 42}));
        assert_eq!(resolved["label"], "tokens: 42");
        assert_eq!(resolved["n"], 3);
    }
}
