/// Node executor registry
///
/// Every leaf node kind implements one contract, `NodeHandler::execute`, and returns
/// a handle-keyed `NodeOutput`. Handlers never emit lifecycle events themselves;
/// the engine wraps every invocation with the canonical envelope.
///
/// Containers (Iterator, Loop) are not handlers: the engine drives them directly
/// because they schedule other nodes.

use crate::error::NodeError;
use crate::runtime::backend::ModelBackend;
use crate::runtime::context::RunContext;
use crate::runtime::engine::GraphExecutor;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::types::{Node, NodeKind};
use crate::workflow::value::{NodeOutput, NodeValue};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

// Input, Output and trigger nodes
pub mod io;

// Template, Lua and JSONPath transforms
pub mod transform;

// Branch selection
pub mod router;

// Language-model calls
pub mod llm;

// Outbound HTTP
pub mod http;

// Subprocess execution
pub mod shell;

// Local file read, write and glob
pub mod file;

// Nested workflow calls
pub mod subworkflow;

pub use io::{AggregatorNode, CronTriggerNode, ExitNode, InputNode, OutputNode, WebhookTriggerNode};
pub use file::{FileGlobNode, FileReadNode, FileWriteNode};
pub use llm::LlmNode;
pub use http::HttpRequestNode;
pub use router::RouterNode;
pub use shell::ShellExecNode;
pub use subworkflow::SubworkflowNode;
pub use transform::TransformNode;

/// Result of executing a single node
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeResult {
    /// Full structured output, keyed by handle
    pub output: NodeOutput,
    /// Router decision: index of the branch whose `branch-{i}` edges stay live
    pub branch: Option<usize>,
    pub cost_usd: Option<f64>,
}

impl NodeResult {
    pub fn new(output: NodeOutput) -> Self {
        Self {
            output,
            branch: None,
            cost_usd: None,
        }
    }

    /// Output with a single `value` handle
    pub fn value(value: impl Into<NodeValue>) -> Self {
        Self::new(NodeOutput::single("value", value))
    }

    pub fn with_branch(mut self, branch: usize) -> Self {
        self.branch = Some(branch);
        self
    }

    pub fn with_cost(mut self, cost_usd: Option<f64>) -> Self {
        self.cost_usd = cost_usd;
        self
    }
}

/// Everything one invocation can see
pub struct NodeContext<'a> {
    pub node: &'a Node,
    /// Node config with `{{…}}` placeholders already resolved
    pub config: &'a Value,
    /// Values arriving on each input handle
    pub inputs: &'a BTreeMap<String, NodeValue>,
    pub run: &'a RunContext,
    pub engine: &'a GraphExecutor,
}

impl NodeContext<'_> {
    /// Primary input: the `input` handle, else the only connected handle
    pub fn input(&self) -> NodeValue {
        if let Some(value) = self.inputs.get("input") {
            return value.clone();
        }
        if self.inputs.len() == 1 {
            if let Some(value) = self.inputs.values().next() {
                return value.clone();
            }
        }
        NodeValue::Null
    }

    pub fn handle(&self, name: &str) -> Option<&NodeValue> {
        self.inputs.get(name)
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

    pub fn require_str(&self, key: &str) -> Result<&str, NodeError> {
        self.config_str(key)
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| {
                NodeError::config(format!("{} node '{}' is missing '{}'", self.node.kind, self.node.id, key))
            })
    }
}

/// One execution contract for every leaf node kind
#[async_trait]
pub trait NodeHandler: Send + Sync {
    fn kind(&self) -> NodeKind;

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError>;
}

/// Polymorphic set of node executors keyed by kind
#[derive(Clone, Default)]
pub struct NodeRegistry {
    handlers: HashMap<NodeKind, Arc<dyn NodeHandler>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in handler
    pub fn with_defaults(
        model: Arc<dyn ModelBackend>,
        workflows: Arc<WorkflowRegistry>,
        shell_timeout_secs: u64,
    ) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(InputNode));
        registry.register(Arc::new(OutputNode));
        registry.register(Arc::new(AggregatorNode));
        registry.register(Arc::new(ExitNode));
        registry.register(Arc::new(WebhookTriggerNode));
        registry.register(Arc::new(CronTriggerNode));
        registry.register(Arc::new(TransformNode::default()));
        registry.register(Arc::new(RouterNode::new(Arc::clone(&model))));
        registry.register(Arc::new(LlmNode::new(model)));
        registry.register(Arc::new(HttpRequestNode::new()));
        registry.register(Arc::new(ShellExecNode::new(shell_timeout_secs)));
        registry.register(Arc::new(FileReadNode));
        registry.register(Arc::new(FileWriteNode));
        registry.register(Arc::new(FileGlobNode));
        registry.register(Arc::new(SubworkflowNode::new(workflows)));
        registry
    }

    /// Register (or replace) the handler for its kind
    pub fn register(&mut self, handler: Arc<dyn NodeHandler>) {
        self.handlers.insert(handler.kind(), handler);
    }

    pub fn get(&self, kind: NodeKind) -> Option<Arc<dyn NodeHandler>> {
        self.handlers.get(&kind).cloned()
    }

    pub fn kinds(&self) -> Vec<NodeKind> {
        self.handlers.keys().copied().collect()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::runtime::context::{RunRequest, TriggerPayload};
    use crate::runtime::engine::EngineLimits;
    use crate::runtime::events::CollectingEventSink;
    use serde_json::Map;
    use tokio_util::sync::CancellationToken;

    pub fn run_context(inputs: Map<String, Value>) -> RunContext {
        RunContext::new(
            "run-test",
            "wf-test",
            RunRequest::new().with_inputs(inputs),
            Arc::new(CollectingEventSink::default()),
            CancellationToken::new(),
        )
    }

    pub fn run_context_with(payload: TriggerPayload) -> RunContext {
        RunContext::new(
            "run-test",
            "wf-test",
            RunRequest::new().triggered_by(Some("trigger-test".into()), payload),
            Arc::new(CollectingEventSink::default()),
            CancellationToken::new(),
        )
    }

    /// Run one handler outside a graph
    pub async fn execute(
        handler: &dyn NodeHandler,
        node: &Node,
        inputs: BTreeMap<String, NodeValue>,
        run: &RunContext,
    ) -> Result<NodeResult, NodeError> {
        let engine = GraphExecutor::new(NodeRegistry::new(), EngineLimits::default());
        let ctx = NodeContext {
            node,
            config: &node.config,
            inputs: &inputs,
            run,
            engine: &engine,
        };
        handler.execute(&ctx).await
    }
}
