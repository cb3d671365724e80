/// Iterator and Loop containers
///
/// A container re-runs its body (the nodes between it and its boundary node) with a
/// fresh scratch scope per iteration. The scratch scope starts from the outer
/// outputs, so body nodes may read anything upstream of the container, and binds the
/// container id to the per-iteration value.
///
/// Whether an iteration reached the boundary is decided by data-flow liveness: at
/// least one live edge into the boundary. That is the exit signal evaluator loops
/// use; no sentinel values travel through outputs.

use crate::error::NodeError;
use crate::runtime::context::RunContext;
use crate::runtime::engine::{primary_input, GraphExecutor, Scope};
use crate::runtime::events::ScopeTag;
use crate::runtime::nodes::transform::select_path;
use crate::workflow::types::{Node, NodeKind};
use crate::workflow::validation::{ContainerScope, ExecutionPlan};
use crate::workflow::value::{NodeOutput, NodeValue};
use futures::stream::{self, StreamExt};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Characters compared by the stable-output exit condition
const SIMILARITY_MAX_CHARS: usize = 10_000;
const APPEND_SEPARATOR: &str = "\n---\n";

/// What a finished container hands back to the walk
pub(crate) struct ContainerOutcome {
    pub output: NodeOutput,
    pub boundary_id: String,
    pub boundary_output: NodeOutput,
    pub cost_usd: f64,
}

/// One pass over the body
struct IterationResult {
    reached_boundary: bool,
    /// Value that arrived at the boundary, `Null` if it was not reached
    value: NodeValue,
    /// Value produced for loop feedback
    body_value: NodeValue,
    cost_usd: f64,
}

impl GraphExecutor {
    pub(crate) async fn run_container(
        &self,
        plan: &ExecutionPlan,
        node: &Node,
        config: &Value,
        inputs: &BTreeMap<String, NodeValue>,
        outer: &HashMap<String, Arc<NodeOutput>>,
        run: &RunContext,
    ) -> Result<ContainerOutcome, NodeError> {
        let container = plan
            .containers
            .get(&node.id)
            .ok_or_else(|| NodeError::config(format!("container '{}' has no compiled body", node.id)))?;
        match node.kind {
            NodeKind::Iterator => self.run_iterator(plan, container, config, inputs, outer, run).await,
            NodeKind::Loop => self.run_loop(plan, container, config, inputs, outer, run).await,
            other => Err(NodeError::config(format!("{} is not a container", other))),
        }
    }

    async fn run_iteration(
        &self,
        plan: &ExecutionPlan,
        container: &ContainerScope,
        binding: NodeOutput,
        outer: &HashMap<String, Arc<NodeOutput>>,
        run: &RunContext,
        index: usize,
    ) -> Result<IterationResult, NodeError> {
        let mut scope = Scope::with_outputs(outer.clone());
        scope.outputs.insert(container.container_id.clone(), Arc::new(binding));
        let tag = ScopeTag::iteration(&container.container_id, index);
        self.walk(plan, &container.body_order, &mut scope, run, &tag).await;

        if run.is_cancelled() {
            return Err(NodeError::Cancelled);
        }
        if let Some(failure) = &scope.first_error {
            return Err(NodeError::failed(format!(
                "iteration {} of '{}' failed at node '{}': {}",
                index, container.container_id, failure.node_id, failure.message
            )));
        }

        let live = scope.live_edges(plan.incoming(&container.boundary));
        let reached_boundary = live
            .iter()
            .any(|e| e.source == container.container_id || container.body.contains(&e.source));
        let value = if reached_boundary {
            primary_input(&scope.gather_inputs(&live))
        } else {
            NodeValue::Null
        };

        let feedback = plan
            .feedback
            .get(&container.container_id)
            .map(|edges| scope.live_edges(edges))
            .unwrap_or_default();
        let body_value = if !feedback.is_empty() {
            primary_input(&scope.gather_inputs(&feedback))
        } else if reached_boundary {
            value.clone()
        } else {
            // last body node that ran
            scope
                .executed
                .iter()
                .rev()
                .find(|id| container.body.contains(*id))
                .and_then(|id| scope.outputs.get(id))
                .map(|output| output.resolve("output"))
                .unwrap_or(NodeValue::Null)
        };

        Ok(IterationResult {
            reached_boundary,
            value,
            body_value,
            cost_usd: scope.cost_usd,
        })
    }

    async fn run_iterator(
        &self,
        plan: &ExecutionPlan,
        container: &ContainerScope,
        config: &Value,
        inputs: &BTreeMap<String, NodeValue>,
        outer: &HashMap<String, Arc<NodeOutput>>,
        run: &RunContext,
    ) -> Result<ContainerOutcome, NodeError> {
        let items = extract_items(config, inputs)?;
        let total = items.len();
        let parallel = config.get("parallel").and_then(Value::as_bool).unwrap_or(false)
            || config.get("mode").and_then(Value::as_str) == Some("parallel");
        let cap = config
            .get("maxConcurrency")
            .and_then(Value::as_u64)
            .map(|c| c as usize)
            .unwrap_or(self.limits.iterator_concurrency)
            .max(1);
        tracing::info!(
            "🔂 Iterator '{}' over {} items{}",
            container.container_id,
            total,
            if parallel { format!(" (parallel, cap {})", cap) } else { String::new() }
        );

        let binding = move |index: usize, item: &Value| {
            NodeOutput::new()
                .with("item", NodeValue::from(item.clone()))
                .with("output", NodeValue::from(item.clone()))
                .with("index", NodeValue::Number(index as f64))
                .with("total", NodeValue::Number(total as f64))
        };

        let results: Vec<Result<IterationResult, NodeError>> = if parallel && total > 1 {
            // buffered keeps results in item order
            stream::iter(items.iter().cloned().enumerate())
                .map(|(i, item)| self.run_iteration(plan, container, binding(i, &item), outer, run, i))
                .buffered(cap)
                .collect()
                .await
        } else {
            let mut results = Vec::with_capacity(total);
            for (i, item) in items.iter().enumerate() {
                let result = self.run_iteration(plan, container, binding(i, item), outer, run, i).await;
                let stop = result.is_err();
                results.push(result);
                if stop {
                    break;
                }
            }
            results
        };

        let mut values = Vec::with_capacity(total);
        let mut cost_usd = 0.0;
        for result in results {
            let result = result?;
            cost_usd += result.cost_usd;
            values.push(result.value);
        }

        let boundary_config = plan
            .node(&container.boundary)
            .map(|n| n.config.clone())
            .unwrap_or(Value::Null);
        let strategy = boundary_config
            .get("strategy")
            .or_else(|| config.get("strategy"))
            .and_then(Value::as_str)
            .unwrap_or("array");
        let separator = boundary_config
            .get("separator")
            .or_else(|| config.get("separator"))
            .and_then(Value::as_str)
            .unwrap_or("\n");
        let count = values.len();
        let result = aggregate(strategy, separator, values)?;

        Ok(ContainerOutcome {
            output: NodeOutput::new()
                .with("count", NodeValue::Number(count as f64))
                .with("total", NodeValue::Number(total as f64)),
            boundary_id: container.boundary.clone(),
            boundary_output: NodeOutput::new()
                .with("result", result)
                .with("count", NodeValue::Number(count as f64)),
            cost_usd,
        })
    }

    async fn run_loop(
        &self,
        plan: &ExecutionPlan,
        container: &ContainerScope,
        config: &Value,
        inputs: &BTreeMap<String, NodeValue>,
        outer: &HashMap<String, Arc<NodeOutput>>,
        run: &RunContext,
    ) -> Result<ContainerOutcome, NodeError> {
        let max_iterations = config
            .get("maxIterations")
            .and_then(Value::as_u64)
            .unwrap_or(5)
            .clamp(1, u64::from(self.limits.max_loop_iterations.max(1)));
        let exit_condition = config
            .get("exitCondition")
            .and_then(Value::as_str)
            .unwrap_or("max_iterations");
        if !matches!(exit_condition, "max_iterations" | "evaluator" | "stable_output") {
            return Err(NodeError::config(format!("unknown exit condition '{}'", exit_condition)));
        }
        let feedback_mode = config.get("feedbackMode").and_then(Value::as_str).unwrap_or("replace");
        if !matches!(feedback_mode, "replace" | "append") {
            return Err(NodeError::config(format!("unknown feedback mode '{}'", feedback_mode)));
        }
        let threshold = config.get("stabilityThreshold").and_then(Value::as_f64).unwrap_or(0.95);

        tracing::info!(
            "🔁 Loop '{}' starting (max {} iterations, exit on {})",
            container.container_id,
            max_iterations,
            exit_condition
        );
        let mut current = primary_input(inputs);
        let mut results: Vec<NodeValue> = Vec::new();
        let mut exit_reason = "max_iterations";
        let mut cost_usd = 0.0;

        for i in 0..max_iterations as usize {
            let binding = NodeOutput::new()
                .with("output", current.clone())
                .with("input", current.clone())
                .with("iteration", NodeValue::Number((i + 1) as f64));
            let result = self.run_iteration(plan, container, binding, outer, run, i).await?;
            cost_usd += result.cost_usd;

            if exit_condition == "evaluator" && result.reached_boundary {
                results.push(result.value);
                exit_reason = "evaluator";
                break;
            }

            let produced = if result.reached_boundary { result.value } else { result.body_value };
            if exit_condition == "stable_output" {
                let stable = results
                    .last()
                    .map(|previous| levenshtein_similarity(&previous.as_text(), &produced.as_text()) >= threshold)
                    .unwrap_or(false);
                if stable {
                    results.push(produced);
                    exit_reason = "stable_output";
                    break;
                }
            }
            current = compose_feedback(feedback_mode, current, &produced);
            results.push(produced);
        }

        let iterations = results.len();
        let exited = exit_reason != "max_iterations";
        let final_value = results.last().cloned().unwrap_or(NodeValue::Null);
        tracing::info!(
            "🔁 Loop '{}' finished after {} iterations ({})",
            container.container_id,
            iterations,
            exit_reason
        );

        Ok(ContainerOutcome {
            output: NodeOutput::new()
                .with("output", final_value.clone())
                .with("iteration", NodeValue::Number(iterations as f64)),
            boundary_id: container.boundary.clone(),
            boundary_output: NodeOutput::new()
                .with("output", final_value)
                .with("iterations", NodeValue::Number(iterations as f64))
                .with("exitReason", exit_reason)
                .with("exited", NodeValue::Boolean(exited))
                .with(
                    "results",
                    NodeValue::Json(Value::Array(results.iter().map(NodeValue::to_json).collect())),
                ),
            cost_usd,
        })
    }
}

/// Items an iterator walks: the `items` handle or primary input, optionally narrowed by `expression`
fn extract_items(config: &Value, inputs: &BTreeMap<String, NodeValue>) -> Result<Vec<Value>, NodeError> {
    let mut source = inputs
        .get("items")
        .cloned()
        .unwrap_or_else(|| primary_input(inputs))
        .to_json();
    if let Some(expression) = config.get("expression").and_then(Value::as_str).filter(|e| !e.trim().is_empty()) {
        source = select_path(&source, expression)?;
    }

    Ok(match source {
        Value::Array(items) => items,
        Value::Null => Vec::new(),
        Value::String(text) => match serde_json::from_str::<Value>(&text) {
            Ok(Value::Array(items)) => items,
            _ => vec![Value::String(text)],
        },
        other => vec![other],
    })
}

/// Combine per-item results
pub fn aggregate(strategy: &str, separator: &str, values: Vec<NodeValue>) -> Result<NodeValue, NodeError> {
    match strategy {
        "array" => Ok(NodeValue::Json(Value::Array(values.iter().map(NodeValue::to_json).collect()))),
        "concat" => Ok(NodeValue::Text(
            values.iter().map(NodeValue::as_text).collect::<Vec<_>>().join(separator),
        )),
        "merge" => {
            let mut merged = Value::Object(Map::new());
            for (i, value) in values.into_iter().enumerate() {
                match value.to_json() {
                    Value::Null => {}
                    object @ Value::Object(_) => deep_merge(&mut merged, object),
                    other => {
                        return Err(NodeError::failed(format!(
                            "merge strategy needs object results, item {} was {}",
                            i, other
                        )))
                    }
                }
            }
            Ok(NodeValue::Json(merged))
        }
        other => Err(NodeError::config(format!("unknown aggregation strategy '{}'", other))),
    }
}

fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) if existing.is_object() && value.is_object() => deep_merge(existing, value),
                    _ => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

/// Next loop input under `feedbackMode`
fn compose_feedback(mode: &str, current: NodeValue, produced: &NodeValue) -> NodeValue {
    if mode != "append" {
        return produced.clone();
    }
    match current {
        NodeValue::Null => NodeValue::Json(Value::Array(vec![produced.to_json()])),
        NodeValue::Text(previous) if matches!(produced, NodeValue::Text(_)) => {
            NodeValue::Text(format!("{}{}{}", previous, APPEND_SEPARATOR, produced.as_text()))
        }
        NodeValue::Json(Value::Array(mut items)) => {
            items.push(produced.to_json());
            NodeValue::Json(Value::Array(items))
        }
        other => NodeValue::Json(Value::Array(vec![other.to_json(), produced.to_json()])),
    }
}

/// 1 - edit distance / longer length, over at most 10k characters of each side
pub fn levenshtein_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().take(SIMILARITY_MAX_CHARS).collect();
    let b: Vec<char> = b.chars().take(SIMILARITY_MAX_CHARS).collect();
    let longest = a.len().max(b.len());
    if longest == 0 {
        return 1.0;
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut row = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        row[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            row[j + 1] = substitution.min(previous[j + 1] + 1).min(row[j] + 1);
        }
        std::mem::swap(&mut previous, &mut row);
    }
    1.0 - previous[b.len()] as f64 / longest as f64
}
