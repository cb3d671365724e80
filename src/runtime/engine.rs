/// Graph executor (DAG walker)
///
/// Walks a compiled `ExecutionPlan` in topological order. For each node it gathers
/// the values arriving on each input handle, resolves `{{…}}` placeholders in its
/// config, invokes the node's handler and records the full handle-keyed output.
///
/// Data-flow liveness drives skipping:
/// - an edge is live when its source produced output and the source handle was not
///   pruned by a router decision
/// - a node whose incoming edges are all dead is skipped, and so is everything
///   downstream of a failed node
///
/// Containers are driven from `runtime::container`, which re-enters `walk` for the
/// body of each iteration with an isolated scratch scope.

use crate::error::NodeError;
use crate::runtime::context::RunContext;
use crate::runtime::events::{
    ScopeTag, WORKFLOW_CANCELLED, WORKFLOW_COMPLETED, WORKFLOW_FAILED, WORKFLOW_STARTED,
};
use crate::runtime::nodes::{NodeContext, NodeRegistry, NodeResult};
use crate::runtime::template::{resolve_config, TemplateScope};
use crate::store::RunStatus;
use crate::workflow::types::{Edge, Node};
use crate::workflow::validation::ExecutionPlan;
use crate::workflow::value::{preview, NodeOutput, NodeValue};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Characters kept in event previews
pub const PREVIEW_CHARS: usize = 200;

/// Engine-wide execution bounds
#[derive(Debug, Clone)]
pub struct EngineLimits {
    /// Hard ceiling for any loop, whatever its config says
    pub max_loop_iterations: u32,
    /// Default concurrency cap for parallel iterators
    pub iterator_concurrency: usize,
}

impl Default for EngineLimits {
    fn default() -> Self {
        Self {
            max_loop_iterations: 50,
            iterator_concurrency: 4,
        }
    }
}

/// The node that stopped a run and why
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeFailure {
    pub node_id: String,
    pub message: String,
}

/// Everything a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// Output node id -> value
    pub outputs: BTreeMap<String, Value>,
    /// Value of the designated output node
    pub designated: Option<Value>,
    pub node_outputs: HashMap<String, Arc<NodeOutput>>,
    /// Top-level nodes in the order they executed
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    pub error: Option<NodeFailure>,
    pub cost_usd: f64,
    pub duration_ms: u64,
}

/// Execution state of one walk: the whole run, or one container iteration
#[derive(Debug, Default)]
pub(crate) struct Scope {
    pub outputs: HashMap<String, Arc<NodeOutput>>,
    pub executed: Vec<String>,
    pub skipped: Vec<String>,
    /// Failed nodes plus everything skipped because of them
    pub blocked: HashSet<String>,
    /// `(node, handle)` pairs pruned by router decisions
    pub dead_handles: HashSet<(String, String)>,
    pub first_error: Option<NodeFailure>,
    pub cost_usd: f64,
}

impl Scope {
    pub fn with_outputs(outputs: HashMap<String, Arc<NodeOutput>>) -> Self {
        Self {
            outputs,
            ..Self::default()
        }
    }

    pub fn is_live(&self, edge: &Edge) -> bool {
        self.outputs.contains_key(&edge.source)
            && !self
                .dead_handles
                .contains(&(edge.source.clone(), edge.source_handle().to_string()))
    }

    pub fn live_edges<'e>(&self, edges: &'e [Edge]) -> Vec<&'e Edge> {
        edges.iter().filter(|e| self.is_live(e)).collect()
    }

    /// Values per target handle; several edges on one handle become an object keyed by source
    pub fn gather_inputs(&self, edges: &[&Edge]) -> BTreeMap<String, NodeValue> {
        let mut by_handle: BTreeMap<&str, Vec<&Edge>> = BTreeMap::new();
        for edge in edges {
            by_handle.entry(edge.target_handle()).or_default().push(edge);
        }

        let mut inputs = BTreeMap::new();
        for (handle, edges) in by_handle {
            let value = match edges.as_slice() {
                [single] => self.resolve_edge(single),
                many => NodeValue::Json(Value::Object(
                    many.iter()
                        .map(|e| (e.aggregation_key().to_string(), self.resolve_edge(e).to_json()))
                        .collect(),
                )),
            };
            inputs.insert(handle.to_string(), value);
        }
        inputs
    }

    fn resolve_edge(&self, edge: &Edge) -> NodeValue {
        self.outputs
            .get(&edge.source)
            .map(|output| output.resolve(edge.source_handle()))
            .unwrap_or(NodeValue::Null)
    }

    fn skip(&mut self, node_id: &str, blocked: bool) {
        self.skipped.push(node_id.to_string());
        if blocked {
            self.blocked.insert(node_id.to_string());
        }
    }

    fn fail(&mut self, node_id: &str, message: String) {
        self.blocked.insert(node_id.to_string());
        self.first_error.get_or_insert(NodeFailure {
            node_id: node_id.to_string(),
            message,
        });
    }
}

/// Primary value of a gathered input map: `input`, else the sole handle
pub(crate) fn primary_input(inputs: &BTreeMap<String, NodeValue>) -> NodeValue {
    if let Some(value) = inputs.get("input") {
        return value.clone();
    }
    match inputs.len() {
        0 => NodeValue::Null,
        1 => inputs.values().next().cloned().unwrap_or(NodeValue::Null),
        _ => NodeValue::Json(Value::Object(
            inputs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
        )),
    }
}

/// DAG walker over compiled plans
pub struct GraphExecutor {
    nodes: NodeRegistry,
    pub(crate) limits: EngineLimits,
}

impl GraphExecutor {
    pub fn new(nodes: NodeRegistry, limits: EngineLimits) -> Self {
        Self { nodes, limits }
    }

    pub fn limits(&self) -> &EngineLimits {
        &self.limits
    }

    /// Execute a compiled plan to completion, failure or cancellation
    pub async fn execute(&self, plan: &ExecutionPlan, run: &RunContext) -> RunOutcome {
        let started = Instant::now();
        tracing::info!("🚀 Starting workflow execution: {} (run {})", plan.workflow_id, run.run_id);
        run.events.emit(
            WORKFLOW_STARTED,
            json!({ "nodeCount": plan.nodes.len(), "inputs": Value::Object(run.inputs.clone()) }),
            None,
        );

        let mut scope = Scope::default();
        self.walk(plan, &plan.order, &mut scope, run, &ScopeTag::top_level()).await;

        let status = if run.is_cancelled() {
            RunStatus::Cancelled
        } else if scope.first_error.is_some() {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };

        let output_nodes = plan.output_nodes();
        let outputs: BTreeMap<String, Value> = output_nodes
            .iter()
            .filter_map(|n| scope.outputs.get(&n.id).map(|o| (n.id.clone(), o.resolve("value").to_json())))
            .collect();
        let designated = if output_nodes.is_empty() {
            // no output node: the last top-level result stands in
            scope
                .executed
                .iter()
                .rev()
                .find_map(|id| scope.outputs.get(id))
                .map(|o| o.resolve("value").to_json())
        } else {
            output_nodes.iter().find_map(|n| outputs.get(&n.id).cloned())
        };

        let duration_ms = started.elapsed().as_millis() as u64;
        let (event, payload) = match status {
            RunStatus::Completed => (WORKFLOW_COMPLETED, json!({ "durationMs": duration_ms })),
            RunStatus::Cancelled => (WORKFLOW_CANCELLED, json!({ "durationMs": duration_ms })),
            _ => (
                WORKFLOW_FAILED,
                json!({ "durationMs": duration_ms, "error": scope.first_error }),
            ),
        };
        run.events.emit(event, payload, Some(scope.cost_usd));
        match &scope.first_error {
            Some(failure) if status == RunStatus::Failed => tracing::error!(
                "❌ Workflow {} failed at node '{}': {}",
                plan.workflow_id,
                failure.node_id,
                failure.message
            ),
            _ => tracing::info!(
                "🎉 Workflow '{}' finished ({}) in {}ms",
                plan.workflow_id,
                status.as_str(),
                duration_ms
            ),
        }

        RunOutcome {
            status,
            outputs,
            designated,
            node_outputs: scope.outputs,
            executed: scope.executed,
            skipped: scope.skipped,
            error: scope.first_error,
            cost_usd: scope.cost_usd,
            duration_ms,
        }
    }

    /// Execute `order` within `scope`. Boxed so container bodies can re-enter it.
    pub(crate) fn walk<'a>(
        &'a self,
        plan: &'a ExecutionPlan,
        order: &'a [String],
        scope: &'a mut Scope,
        run: &'a RunContext,
        tag: &'a ScopeTag,
    ) -> BoxFuture<'a, ()> {
        async move {
            for node_id in order {
                if run.is_cancelled() {
                    tracing::warn!("🛑 Run {} cancelled before node '{}'", run.run_id, node_id);
                    break;
                }
                // boundary nodes are filled in by their container
                if scope.outputs.contains_key(node_id) {
                    continue;
                }
                let Some(node) = plan.node(node_id) else { continue };

                if let Some(container) = plan.boundary_owner.get(node_id) {
                    let blocked = scope.blocked.contains(container);
                    scope.skip(node_id, blocked);
                    run.events.node_skipped(node_id, &format!("container '{}' did not complete", container), tag);
                    continue;
                }

                let incoming = plan.incoming(node_id);
                if let Some(blocker) = incoming.iter().find(|e| scope.blocked.contains(&e.source)) {
                    let reason = format!("upstream node '{}' failed", blocker.source);
                    scope.skip(node_id, true);
                    run.events.node_skipped(node_id, &reason, tag);
                    continue;
                }
                let live = scope.live_edges(incoming);
                if !incoming.is_empty() && live.is_empty() {
                    tracing::debug!("⏭️ Skipping '{}': no active inputs", node_id);
                    scope.skip(node_id, false);
                    run.events.node_skipped(node_id, "no active inputs", tag);
                    continue;
                }

                let inputs = scope.gather_inputs(&live);
                let config = resolve_config(
                    &node.config,
                    &TemplateScope {
                        outputs: &scope.outputs,
                        run_inputs: &run.inputs,
                        local: &inputs,
                    },
                );

                tracing::info!("📍 Executing node '{}' (type: {})", node_id, node.kind);
                run.events.node_started(node_id, node.kind.as_str(), tag);
                let node_started = Instant::now();

                let result = if node.kind.is_container() {
                    self.run_container(plan, node, &config, &inputs, &scope.outputs, run)
                        .await
                        .map(|c| (NodeResult::new(c.output).with_cost(Some(c.cost_usd)), Some((c.boundary_id, c.boundary_output))))
                } else {
                    self.invoke(node, &config, &inputs, run).await.map(|r| (r, None))
                };
                let duration_ms = node_started.elapsed().as_millis() as u64;

                match result {
                    Ok((result, boundary)) => {
                        let cost = result.cost_usd.filter(|c| *c > 0.0);
                        scope.cost_usd += cost.unwrap_or(0.0);
                        if let Some(selected) = result.branch {
                            for i in (0..node.branch_names().len()).filter(|i| *i != selected) {
                                scope.dead_handles.insert((node_id.clone(), format!("branch-{}", i)));
                            }
                        }
                        run.events.node_completed(
                            node_id,
                            preview(&result.output.primary_text(), PREVIEW_CHARS),
                            duration_ms,
                            cost,
                            tag,
                        );
                        tracing::info!("✅ Node '{}' completed in {}ms", node_id, duration_ms);
                        scope.outputs.insert(node_id.clone(), Arc::new(result.output));
                        scope.executed.push(node_id.clone());

                        if let Some((boundary_id, boundary_output)) = boundary {
                            run.events.node_completed(
                                &boundary_id,
                                preview(&boundary_output.primary_text(), PREVIEW_CHARS),
                                0,
                                None,
                                tag,
                            );
                            scope.outputs.insert(boundary_id.clone(), Arc::new(boundary_output));
                            scope.executed.push(boundary_id);
                        }
                    }
                    Err(NodeError::Cancelled) => {
                        run.events.node_error(node_id, "cancelled", duration_ms, tag);
                        break;
                    }
                    Err(err) => {
                        let message = err.to_string();
                        run.events.node_error(node_id, &message, duration_ms, tag);
                        if node.is_optional() {
                            tracing::warn!("⚠️ Optional node '{}' failed: {}", node_id, message);
                            scope
                                .outputs
                                .insert(node_id.clone(), Arc::new(NodeOutput::single("error", message)));
                            scope.executed.push(node_id.clone());
                        } else {
                            tracing::error!("❌ Node '{}' failed in {}ms: {}", node_id, duration_ms, message);
                            scope.fail(node_id, message);
                        }
                    }
                }
            }
        }
        .boxed()
    }

    /// Run one leaf node under its timeout and the run's cancellation
    async fn invoke(
        &self,
        node: &Node,
        config: &Value,
        inputs: &BTreeMap<String, NodeValue>,
        run: &RunContext,
    ) -> Result<NodeResult, NodeError> {
        let handler = self
            .nodes
            .get(node.kind)
            .ok_or_else(|| NodeError::config(format!("no executor registered for node kind '{}'", node.kind)))?;
        let ctx = NodeContext {
            node,
            config,
            inputs,
            run,
            engine: self,
        };

        let execution = async {
            match node.config_u64("timeoutSecs").filter(|secs| *secs > 0) {
                Some(secs) => tokio::time::timeout(Duration::from_secs(secs), handler.execute(&ctx))
                    .await
                    .unwrap_or(Err(NodeError::Timeout { secs })),
                None => handler.execute(&ctx).await,
            }
        };
        tokio::select! {
            result = execution => result,
            _ = run.cancel.cancelled() => Err(NodeError::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::context::RunRequest;
    use crate::runtime::events::{CollectingEventSink, NODE_SKIPPED};
    use crate::runtime::nodes::{InputNode, OutputNode, RouterNode, TransformNode};
    use crate::runtime::backend::UnconfiguredModelBackend;
    use crate::workflow::types::{Edge, NodeKind, Workflow, WorkflowGraph};
    use crate::workflow::validation::compile;
    use serde_json::Map;
    use tokio_util::sync::CancellationToken;

    fn executor() -> GraphExecutor {
        let mut nodes = NodeRegistry::new();
        nodes.register(Arc::new(InputNode));
        nodes.register(Arc::new(OutputNode));
        nodes.register(Arc::new(TransformNode::default()));
        nodes.register(Arc::new(RouterNode::new(Arc::new(UnconfiguredModelBackend))));
        GraphExecutor::new(nodes, EngineLimits::default())
    }

    fn plan(nodes: Vec<Node>, edges: Vec<Edge>) -> ExecutionPlan {
        compile(&Workflow {
            id: "wf".into(),
            name: "test".into(),
            graph: WorkflowGraph { nodes, edges },
        })
        .unwrap()
    }

    async fn run(plan: &ExecutionPlan, inputs: Map<String, Value>) -> (RunOutcome, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::default());
        let ctx = RunContext::new(
            "run-1",
            "wf",
            RunRequest::new().with_inputs(inputs),
            sink.clone(),
            CancellationToken::new(),
        );
        (executor().execute(plan, &ctx).await, sink)
    }

    #[tokio::test]
    async fn multi_input_handle_is_keyed_by_source() {
        let plan = plan(
            vec![
                Node::new("a", NodeKind::Input, json!({"value": "left"})),
                Node::new("b", NodeKind::Input, json!({"value": "right"})),
                Node::new("t", NodeKind::Transform, json!({})),
                Node::new("out", NodeKind::Output, json!({})),
            ],
            vec![
                Edge::new("a", "t"),
                Edge::new("b", "t"),
                Edge::new("t", "out"),
            ],
        );
        let (outcome, _) = run(&plan, Map::new()).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.designated, Some(json!({"a": "left", "b": "right"})));
    }

    #[tokio::test]
    async fn router_prunes_unselected_branches() {
        let plan = plan(
            vec![
                Node::new("in", NodeKind::Input, json!({"value": "please approve"})),
                Node::new("r", NodeKind::Router, json!({"branches": ["approve", "reject"]})),
                Node::new("yes", NodeKind::Output, json!({"designated": true})),
                Node::new("no", NodeKind::Output, json!({})),
            ],
            vec![
                Edge::new("in", "r"),
                Edge::new("r", "yes").from_handle("branch-0"),
                Edge::new("r", "no").from_handle("branch-1"),
            ],
        );
        let (outcome, sink) = run(&plan, Map::new()).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        assert_eq!(outcome.designated, Some(json!("please approve")));
        assert!(outcome.skipped.contains(&"no".to_string()));
        assert_eq!(sink.of_type(NODE_SKIPPED).len(), 1);
    }

    #[tokio::test]
    async fn failure_skips_dependents_but_not_unrelated_branches() {
        let plan = plan(
            vec![
                Node::new("missing", NodeKind::Input, json!({})),
                Node::new("after", NodeKind::Output, json!({})),
                Node::new("ok", NodeKind::Input, json!({"value": 1})),
                Node::new("ok_out", NodeKind::Output, json!({})),
            ],
            vec![Edge::new("missing", "after"), Edge::new("ok", "ok_out")],
        );
        let (outcome, _) = run(&plan, Map::from_iter([("x".to_string(), json!(1)), ("y".to_string(), json!(2))])).await;
        assert_eq!(outcome.status, RunStatus::Failed);
        assert_eq!(outcome.error.as_ref().map(|e| e.node_id.as_str()), Some("missing"));
        assert!(outcome.skipped.contains(&"after".to_string()));
        assert_eq!(outcome.outputs.get("ok_out"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn optional_node_failure_does_not_fail_run() {
        let plan = plan(
            vec![
                Node::new("missing", NodeKind::Input, json!({"optional": true})),
                Node::new("out", NodeKind::Output, json!({})),
            ],
            vec![Edge::new("missing", "out")],
        );
        let (outcome, _) = run(&plan, Map::from_iter([("x".to_string(), json!(1)), ("y".to_string(), json!(2))])).await;
        assert_eq!(outcome.status, RunStatus::Completed);
        let error = outcome.designated.unwrap();
        assert!(error.as_str().unwrap().contains("no run input"));
    }

    #[tokio::test]
    async fn templates_read_upstream_handles() {
        let plan = plan(
            vec![
                Node::new("name", NodeKind::Input, json!({"inputName": "name"})),
                Node::new("greet", NodeKind::Transform, json!({"template": "Hello, {{name}}!"})),
                Node::new("out", NodeKind::Output, json!({})),
            ],
            vec![Edge::new("name", "greet"), Edge::new("greet", "out")],
        );
        let (outcome, _) = run(&plan, Map::from_iter([("name".to_string(), json!("Ada"))])).await;
        assert_eq!(outcome.designated, Some(json!("Hello, Ada!")));
    }

    #[tokio::test]
    async fn cancelled_run_stops_between_nodes() {
        let plan = plan(
            vec![
                Node::new("in", NodeKind::Input, json!({"value": 1})),
                Node::new("out", NodeKind::Output, json!({})),
            ],
            vec![Edge::new("in", "out")],
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ctx = RunContext::new(
            "run-1",
            "wf",
            RunRequest::new(),
            Arc::new(CollectingEventSink::default()),
            cancel,
        );
        let outcome = executor().execute(&plan, &ctx).await;
        assert_eq!(outcome.status, RunStatus::Cancelled);
        assert!(outcome.executed.is_empty());
    }
}
