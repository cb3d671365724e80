/// Dynamically typed node values
///
/// Every output handle carries a `NodeValue`. The variant is kept so connection
/// validation can reason about handle types, while `to_json` gives the plain JSON
/// shape used in run records, templates and HTTP responses.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// One value flowing along an edge
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Null,
    Text(String),
    Number(f64),
    Boolean(bool),
    Json(Value),
    Binary(Vec<u8>),
}

/// Declared type of a handle, checked loosely when edges are validated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    Any,
    Text,
    Number,
    Boolean,
    Json,
    Binary,
}

impl ValueType {
    /// Whether a value of type `source` may be connected to a handle of this type
    pub fn accepts(self, source: ValueType) -> bool {
        match (self, source) {
            (ValueType::Any, _) | (_, ValueType::Any) => true,
            (a, b) if a == b => true,
            // JSON can represent every other variant
            (ValueType::Json, _) => true,
            (ValueType::Text, ValueType::Number | ValueType::Boolean) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ValueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ValueType::Any => "any",
            ValueType::Text => "text",
            ValueType::Number => "number",
            ValueType::Boolean => "boolean",
            ValueType::Json => "json",
            ValueType::Binary => "binary",
        };
        f.write_str(name)
    }
}

impl NodeValue {
    pub fn text(s: impl Into<String>) -> Self {
        NodeValue::Text(s.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, NodeValue::Null) || matches!(self, NodeValue::Json(Value::Null))
    }

    pub fn value_type(&self) -> ValueType {
        match self {
            NodeValue::Null => ValueType::Any,
            NodeValue::Text(_) => ValueType::Text,
            NodeValue::Number(_) => ValueType::Number,
            NodeValue::Boolean(_) => ValueType::Boolean,
            NodeValue::Json(_) => ValueType::Json,
            NodeValue::Binary(_) => ValueType::Binary,
        }
    }

    /// Plain JSON rendering; binary payloads become base64 strings
    pub fn to_json(&self) -> Value {
        match self {
            NodeValue::Null => Value::Null,
            NodeValue::Text(s) => Value::String(s.clone()),
            NodeValue::Number(n) => number_to_json(*n),
            NodeValue::Boolean(b) => Value::Bool(*b),
            NodeValue::Json(v) => v.clone(),
            NodeValue::Binary(bytes) => Value::String(BASE64.encode(bytes)),
        }
    }

    /// Text form used by templates, routers and similarity checks.
    /// Strings render raw, everything else as compact JSON.
    pub fn as_text(&self) -> String {
        match self {
            NodeValue::Null => String::new(),
            NodeValue::Text(s) => s.clone(),
            NodeValue::Json(Value::String(s)) => s.clone(),
            other => other.to_json().to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            NodeValue::Text(s) => Some(s),
            NodeValue::Json(Value::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            NodeValue::Number(n) => Some(*n),
            NodeValue::Json(v) => v.as_f64(),
            NodeValue::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

fn number_to_json(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
    }
}

impl From<Value> for NodeValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => NodeValue::Null,
            Value::String(s) => NodeValue::Text(s),
            Value::Bool(b) => NodeValue::Boolean(b),
            Value::Number(n) => n.as_f64().map(NodeValue::Number).unwrap_or(NodeValue::Null),
            other => NodeValue::Json(other),
        }
    }
}

impl From<&str> for NodeValue {
    fn from(s: &str) -> Self {
        NodeValue::Text(s.to_string())
    }
}

impl From<String> for NodeValue {
    fn from(s: String) -> Self {
        NodeValue::Text(s)
    }
}

impl Serialize for NodeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Handle-keyed output of one node execution
///
/// Never collapsed to a single scalar: `llm.usage` and `llm.response` stay
/// independently addressable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeOutput {
    handles: BTreeMap<String, NodeValue>,
}

/// Handles consulted, in order, when a node's "primary" text is needed
const PRIMARY_HANDLES: [&str; 6] = ["value", "output", "response", "result", "content", "body"];

impl NodeOutput {
    pub fn new() -> Self {
        Self::default()
    }

    /// Output with a single handle
    pub fn single(handle: impl Into<String>, value: impl Into<NodeValue>) -> Self {
        Self::new().with(handle, value)
    }

    pub fn with(mut self, handle: impl Into<String>, value: impl Into<NodeValue>) -> Self {
        self.handles.insert(handle.into(), value.into());
        self
    }

    pub fn insert(&mut self, handle: impl Into<String>, value: impl Into<NodeValue>) {
        self.handles.insert(handle.into(), value.into());
    }

    pub fn get(&self, handle: &str) -> Option<&NodeValue> {
        self.handles.get(handle)
    }

    pub fn handles(&self) -> impl Iterator<Item = (&String, &NodeValue)> {
        self.handles.iter()
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Value an edge leaving `handle` carries.
    ///
    /// An exact handle match wins. Otherwise a plain `value` field is unwrapped
    /// (router branch handles and legacy single-output consumers rely on this),
    /// then a sole handle, then the whole map as a JSON object.
    pub fn resolve(&self, handle: &str) -> NodeValue {
        if let Some(v) = self.handles.get(handle) {
            return v.clone();
        }
        if let Some(v) = self.handles.get("value") {
            return v.clone();
        }
        if self.handles.len() == 1 {
            if let Some(v) = self.handles.values().next() {
                return v.clone();
            }
        }
        NodeValue::Json(self.to_json())
    }

    /// Most representative text of this output, used for previews and `{{node}}`
    pub fn primary_text(&self) -> String {
        for handle in PRIMARY_HANDLES {
            if let Some(v) = self.handles.get(handle) {
                return v.as_text();
            }
        }
        if self.handles.len() == 1 {
            if let Some(v) = self.handles.values().next() {
                return v.as_text();
            }
        }
        self.to_json().to_string()
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .handles
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect();
        Value::Object(map)
    }
}

impl Serialize for NodeOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

/// Truncate to at most `max` characters without splitting a code point
pub fn preview(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_conversion_picks_the_narrowest_variant() {
        assert_eq!(NodeValue::from(json!("hi")), NodeValue::Text("hi".into()));
        assert_eq!(NodeValue::from(json!(4)), NodeValue::Number(4.0));
        assert_eq!(NodeValue::from(json!(true)), NodeValue::Boolean(true));
        assert!(matches!(NodeValue::from(json!({"a": 1})), NodeValue::Json(_)));
        assert_eq!(NodeValue::Number(4.0).to_json(), json!(4));
        assert_eq!(NodeValue::Number(2.5).to_json(), json!(2.5));
    }

    #[test]
    fn resolve_unwraps_value_for_unknown_handles() {
        let router = NodeOutput::new()
            .with("selectedBranch", "yes")
            .with("value", "payload");
        assert_eq!(router.resolve("branch-0"), NodeValue::text("payload"));
        assert_eq!(router.resolve("selectedBranch"), NodeValue::text("yes"));

        let llm = NodeOutput::new()
            .with("response", "hello")
            .with("usage", json!({"total_tokens": 12}));
        assert_eq!(llm.resolve("response"), NodeValue::text("hello"));
        assert!(matches!(llm.resolve("output"), NodeValue::Json(_)));
        assert_eq!(llm.primary_text(), "hello");
    }

    #[test]
    fn type_compatibility_is_loose_but_not_unbounded() {
        assert!(ValueType::Json.accepts(ValueType::Binary));
        assert!(ValueType::Text.accepts(ValueType::Number));
        assert!(ValueType::Any.accepts(ValueType::Boolean));
        assert!(!ValueType::Number.accepts(ValueType::Binary));
        assert!(!ValueType::Boolean.accepts(ValueType::Text));
    }

    #[test]
    fn preview_respects_char_boundaries() {
        let text = "é".repeat(300);
        let p = preview(&text, 200);
        assert_eq!(p.chars().count(), 201);
        assert_eq!(preview("short", 200), "short");
    }
}
