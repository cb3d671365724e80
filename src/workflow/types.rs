/// Core workflow type definitions
///
/// The graph model parsed from a stored `{nodes, edges}` document. A parsed graph is
/// immutable for the duration of a run; execution state lives in the runtime.

use crate::workflow::value::ValueType;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Handle used when an edge does not name its source handle
pub const DEFAULT_SOURCE_HANDLE: &str = "output";
/// Handle used when an edge does not name its target handle
pub const DEFAULT_TARGET_HANDLE: &str = "input";

/// A stored workflow definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    /// Unique workflow identifier (e.g., "wf-digest")
    pub id: String,
    /// Human-readable workflow name
    pub name: String,
    /// Nodes and edges
    #[serde(flatten)]
    pub graph: WorkflowGraph,
}

/// The node/edge document
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowGraph {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

impl WorkflowGraph {
    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == id)
    }
}

/// A single node in the workflow graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
    /// Unique node identifier within the workflow (e.g., "llm_1")
    pub id: String,
    /// The kind of node, which selects its executor
    #[serde(rename = "type", alias = "kind")]
    pub kind: NodeKind,
    /// Kind-specific configuration; string fields may contain `{{…}}` placeholders
    #[serde(default, alias = "data")]
    pub config: Value,
    /// Owning Loop/Iterator, when the author declared it explicitly.
    /// Ownership is also derived from the graph during validation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl Node {
    pub fn new(id: impl Into<String>, kind: NodeKind, config: Value) -> Self {
        Self {
            id: id.into(),
            kind,
            config,
            container_id: None,
        }
    }

    pub fn config_str(&self, key: &str) -> Option<&str> {
        self.config.get(key).and_then(Value::as_str)
    }

    pub fn config_u64(&self, key: &str) -> Option<u64> {
        self.config.get(key).and_then(Value::as_u64)
    }

    pub fn config_f64(&self, key: &str) -> Option<f64> {
        self.config.get(key).and_then(Value::as_f64)
    }

    pub fn config_bool(&self, key: &str) -> Option<bool> {
        self.config.get(key).and_then(Value::as_bool)
    }

    /// Optional nodes do not fail the run; their error becomes their output
    pub fn is_optional(&self) -> bool {
        self.config_bool("optional").unwrap_or(false)
    }

    /// Router branch names, from a list of strings or `{name}` objects
    pub fn branch_names(&self) -> Vec<String> {
        self.config
            .get("branches")
            .and_then(Value::as_array)
            .map(|branches| {
                branches
                    .iter()
                    .filter_map(|b| match b {
                        Value::String(s) => Some(s.clone()),
                        Value::Object(o) => o.get("name").and_then(Value::as_str).map(str::to_string),
                        _ => None,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// A connection from one node's output handle to another node's input handle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(alias = "sourceId")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_handle: Option<String>,
    #[serde(alias = "targetId")]
    pub target: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_handle: Option<String>,
    /// Key used when several edges feed one multi-input handle (defaults to source id)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl Edge {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            id: None,
            source: source.into(),
            source_handle: None,
            target: target.into(),
            target_handle: None,
            key: None,
        }
    }

    pub fn from_handle(mut self, handle: impl Into<String>) -> Self {
        self.source_handle = Some(handle.into());
        self
    }

    pub fn to_handle(mut self, handle: impl Into<String>) -> Self {
        self.target_handle = Some(handle.into());
        self
    }

    pub fn source_handle(&self) -> &str {
        self.source_handle.as_deref().unwrap_or(DEFAULT_SOURCE_HANDLE)
    }

    pub fn target_handle(&self) -> &str {
        self.target_handle.as_deref().unwrap_or(DEFAULT_TARGET_HANDLE)
    }

    /// Key under which this edge's value appears in a multi-input object
    pub fn aggregation_key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.source)
    }
}

/// Available node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    /// Reads a run input. Config: { "inputName": "topic", "value": "default" }
    Input,
    /// Designated run output. Config: { "designated": true }
    Output,
    /// Template, Lua script or JSONPath transform.
    /// Config: { "template": "…" } | { "script": "return …" } | { "jsonpath": "$.items" }
    Transform,
    /// Picks one branch. Config: { "branches": ["yes", "no"], "mode": "pattern" | "llm" }
    Router,
    /// Calls the model backend. Config: { "model": "…", "prompt": "{{input}}", "systemPrompt": "…" }
    Llm,
    /// Outbound HTTP call. Config: { "url": "…", "method": "GET", "headers": {…} }
    HttpRequest,
    /// Subprocess under a time bound. Config: { "command": "echo hi", "timeoutSecs": 30 }
    ShellExec,
    /// Reads a local file. Config: { "path": "…", "mode": "text" | "json" | "csv" | "binary", "maxSize": 10 }
    FileRead,
    /// Writes a local file. Config: { "path": "…", "mode": "text", "writeMode": "overwrite" | "append" }
    FileWrite,
    /// Lists (and reads) files in a directory. Config: { "directory": "…", "pattern": "*.csv", "maxFiles": 100 }
    FileGlob,
    /// Runs another stored workflow inline. Config: { "workflowId": "…" }
    Subworkflow,
    /// Container: runs its body once per array element
    Iterator,
    /// Boundary of an Iterator; collects per-item results
    Aggregator,
    /// Container: re-runs its body feeding output back as input
    Loop,
    /// Boundary of a Loop
    Exit,
    /// Exposes the inbound webhook request to the graph
    WebhookTrigger,
    /// Exposes the cron fire to the graph
    CronTrigger,
}

/// Declared input handle of a node kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputHandle {
    pub value_type: ValueType,
    /// Whether several edges may target this handle (values keyed by source)
    pub multi: bool,
}

const fn single(value_type: ValueType) -> Option<InputHandle> {
    Some(InputHandle { value_type, multi: false })
}

const fn multi(value_type: ValueType) -> Option<InputHandle> {
    Some(InputHandle { value_type, multi: true })
}

impl NodeKind {
    pub fn is_container(self) -> bool {
        matches!(self, NodeKind::Iterator | NodeKind::Loop)
    }

    pub fn is_trigger(self) -> bool {
        matches!(self, NodeKind::WebhookTrigger | NodeKind::CronTrigger)
    }

    /// Boundary node kind that closes this container's body
    pub fn boundary_kind(self) -> Option<NodeKind> {
        match self {
            NodeKind::Iterator => Some(NodeKind::Aggregator),
            NodeKind::Loop => Some(NodeKind::Exit),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Input => "input",
            NodeKind::Output => "output",
            NodeKind::Transform => "transform",
            NodeKind::Router => "router",
            NodeKind::Llm => "llm",
            NodeKind::HttpRequest => "http_request",
            NodeKind::ShellExec => "shell_exec",
            NodeKind::FileRead => "file_read",
            NodeKind::FileWrite => "file_write",
            NodeKind::FileGlob => "file_glob",
            NodeKind::Subworkflow => "subworkflow",
            NodeKind::Iterator => "iterator",
            NodeKind::Aggregator => "aggregator",
            NodeKind::Loop => "loop",
            NodeKind::Exit => "exit",
            NodeKind::WebhookTrigger => "webhook_trigger",
            NodeKind::CronTrigger => "cron_trigger",
        }
    }

    /// Input handle declaration, or `None` if the kind has no such handle
    pub fn input_handle(self, handle: &str) -> Option<InputHandle> {
        use ValueType::*;
        match (self, handle) {
            (NodeKind::Input | NodeKind::WebhookTrigger | NodeKind::CronTrigger, _) => None,
            // transform exposes every incoming handle to its template/script
            (NodeKind::Transform, _) => multi(Any),
            (NodeKind::Aggregator, "input") => multi(Any),
            (NodeKind::Llm, "context") => multi(Any),
            (NodeKind::Llm, "input" | "prompt" | "system") => single(Text),
            (NodeKind::HttpRequest, "input" | "body") => single(Any),
            (NodeKind::HttpRequest, "url") => single(Text),
            (NodeKind::ShellExec, "input" | "command" | "stdin") => single(Text),
            (NodeKind::FileRead, "path") | (NodeKind::FileWrite, "path") => single(Text),
            (NodeKind::FileWrite, "content") => single(Any),
            (NodeKind::FileGlob, "directory") => single(Text),
            (NodeKind::Iterator, "items") => single(Json),
            // explicit feedback edge from a loop body; feedback is implicit otherwise
            (NodeKind::Loop, "feedback") => single(Any),
            (_, "input") => single(Any),
            _ => None,
        }
    }

    /// Output handle type for `handle` on `node`, or `None` if it does not exist
    pub fn output_type(self, node: &Node, handle: &str) -> Option<ValueType> {
        use ValueType::*;
        let declared = match (self, handle) {
            (NodeKind::Input, "output") => Some(Any),
            (NodeKind::Output, "value") => Some(Any),
            (NodeKind::Transform, "output") => Some(Any),
            (NodeKind::Router, "selectedBranch") => Some(Text),
            (NodeKind::Router, "value") => Some(Any),
            (NodeKind::Router, h) => h
                .strip_prefix("branch-")
                .and_then(|i| i.parse::<usize>().ok())
                .filter(|i| *i < node.branch_names().len().max(1))
                .map(|_| Any),
            (NodeKind::Llm, "response" | "model") => Some(Text),
            (NodeKind::Llm, "usage") => Some(Json),
            (NodeKind::Llm, "cost") => Some(Number),
            (NodeKind::HttpRequest, "status") => Some(Number),
            (NodeKind::HttpRequest, "body") => Some(Any),
            (NodeKind::HttpRequest, "headers") => Some(Json),
            (NodeKind::ShellExec, "stdout" | "stderr") => Some(Text),
            (NodeKind::ShellExec, "exitCode") => Some(Number),
            (NodeKind::FileRead, "content") => Some(Any),
            (NodeKind::FileRead, "rows") => Some(Json),
            (NodeKind::FileRead, "size") => Some(Number),
            (NodeKind::FileRead, "path" | "mimeType") => Some(Text),
            (NodeKind::FileWrite, "path") => Some(Text),
            (NodeKind::FileWrite, "bytes") => Some(Number),
            (NodeKind::FileGlob, "files" | "paths") => Some(Json),
            (NodeKind::FileGlob, "count") => Some(Number),
            (NodeKind::Subworkflow, "output") => Some(Any),
            (NodeKind::Subworkflow, "outputs") => Some(Json),
            (NodeKind::Iterator, "item" | "output") => Some(Any),
            (NodeKind::Iterator, "index" | "total" | "count") => Some(Number),
            (NodeKind::Aggregator, "result") => Some(Any),
            (NodeKind::Aggregator, "count") => Some(Number),
            (NodeKind::Loop, "output") => Some(Any),
            (NodeKind::Loop, "iteration") => Some(Number),
            (NodeKind::Exit, "output") => Some(Any),
            (NodeKind::Exit, "iterations") => Some(Number),
            (NodeKind::Exit, "exitReason") => Some(Text),
            (NodeKind::Exit, "exited") => Some(Boolean),
            (NodeKind::Exit, "results") => Some(Json),
            (NodeKind::WebhookTrigger, "body") => Some(Any),
            (NodeKind::WebhookTrigger, "headers" | "query") => Some(Json),
            (NodeKind::WebhookTrigger, "method") => Some(Text),
            (NodeKind::CronTrigger, "timestamp" | "schedule") => Some(Text),
            (NodeKind::CronTrigger, "iteration") => Some(Number),
            (NodeKind::CronTrigger, "input") => Some(Any),
            _ => None,
        };
        // every kind answers the legacy default handle through value/primary resolution
        declared.or_else(|| (handle == DEFAULT_SOURCE_HANDLE).then_some(Any))
    }
}

impl std::fmt::Display for NodeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_stored_graph_document() {
        let doc = json!({
            "id": "wf-1",
            "name": "demo",
            "nodes": [
                {"id": "in", "type": "input", "data": {"value": "2"}},
                {"id": "body", "type": "transform", "config": {}, "containerId": "loop_1"}
            ],
            "edges": [
                {"source": "in", "target": "body", "sourceHandle": null}
            ]
        });
        let wf: Workflow = serde_json::from_value(doc).unwrap();
        assert_eq!(wf.graph.nodes[0].kind, NodeKind::Input);
        assert_eq!(wf.graph.nodes[0].config_str("value"), Some("2"));
        assert_eq!(wf.graph.nodes[1].container_id.as_deref(), Some("loop_1"));
        assert_eq!(wf.graph.edges[0].source_handle(), "output");
        assert_eq!(wf.graph.edges[0].target_handle(), "input");
    }

    #[test]
    fn router_branch_handles_follow_configured_branches() {
        let router = Node::new("r", NodeKind::Router, json!({"branches": ["yes", {"name": "no"}]}));
        assert_eq!(router.branch_names(), vec!["yes", "no"]);
        assert!(NodeKind::Router.output_type(&router, "branch-1").is_some());
        assert!(NodeKind::Router.output_type(&router, "branch-2").is_none());
    }

    #[test]
    fn file_kinds_declare_their_handles() {
        let kind: NodeKind = serde_json::from_value(json!("file_glob")).unwrap();
        assert_eq!(kind, NodeKind::FileGlob);
        assert_eq!(NodeKind::FileRead.as_str(), "file_read");

        let write = Node::new("w", NodeKind::FileWrite, json!({}));
        assert_eq!(NodeKind::FileWrite.input_handle("content").unwrap().value_type, ValueType::Any);
        assert_eq!(NodeKind::FileWrite.output_type(&write, "bytes"), Some(ValueType::Number));
        assert!(NodeKind::FileGlob.input_handle("path").is_none());
        assert!(NodeKind::FileRead.input_handle("path").is_some());
    }

    #[test]
    fn multi_input_only_where_declared() {
        assert!(NodeKind::Aggregator.input_handle("input").unwrap().multi);
        assert!(!NodeKind::Output.input_handle("input").unwrap().multi);
        assert!(NodeKind::Input.input_handle("input").is_none());
    }
}
