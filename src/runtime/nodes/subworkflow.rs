/// Subworkflow node: runs another stored workflow inline
///
/// The child run shares the parent's event sink and cancellation. A call stack of
/// workflow ids rejects recursion and caps nesting depth.

use super::{NodeContext, NodeHandler, NodeResult};
use crate::error::NodeError;
use crate::store::RunStatus;
use crate::workflow::registry::WorkflowRegistry;
use crate::workflow::types::NodeKind;
use crate::workflow::value::{NodeOutput, NodeValue};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::sync::Arc;

/// Deepest allowed chain of nested workflow calls
pub const MAX_SUBWORKFLOW_DEPTH: usize = 8;

pub struct SubworkflowNode {
    workflows: Arc<WorkflowRegistry>,
}

impl SubworkflowNode {
    pub fn new(workflows: Arc<WorkflowRegistry>) -> Self {
        Self { workflows }
    }
}

#[async_trait]
impl NodeHandler for SubworkflowNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Subworkflow
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let workflow_id = ctx.require_str("workflowId")?;
        let run = ctx.run;
        if workflow_id == run.workflow_id || run.call_stack.iter().any(|id| id == workflow_id) {
            return Err(NodeError::failed(format!(
                "circular subworkflow reference: {} is already in the call chain",
                workflow_id
            )));
        }
        if run.call_stack.len() + 1 >= MAX_SUBWORKFLOW_DEPTH {
            return Err(NodeError::failed(format!(
                "subworkflow nesting deeper than {} levels",
                MAX_SUBWORKFLOW_DEPTH
            )));
        }

        let compiled = self
            .workflows
            .get(workflow_id)
            .await
            .map_err(|e| NodeError::failed(format!("subworkflow '{}': {}", workflow_id, e)))?;

        let mut inputs = Map::new();
        let input = ctx.input();
        if !input.is_null() {
            inputs.insert("input".to_string(), input.to_json());
        }
        if let Some(extra) = ctx.config.get("inputs").and_then(Value::as_object) {
            inputs.extend(extra.clone());
        }

        tracing::info!("🧩 Subworkflow {} -> {}", run.workflow_id, workflow_id);
        let child = run.child(workflow_id, inputs);
        let outcome = ctx.engine.execute(&compiled.plan, &child).await;
        match outcome.status {
            RunStatus::Completed => {}
            RunStatus::Cancelled => return Err(NodeError::Cancelled),
            _ => {
                let message = outcome
                    .error
                    .map(|e| format!("node '{}': {}", e.node_id, e.message))
                    .unwrap_or_else(|| "failed".to_string());
                return Err(NodeError::failed(format!("subworkflow '{}' failed at {}", workflow_id, message)));
            }
        }

        let outputs: Map<String, Value> = outcome.outputs.into_iter().collect();
        let primary = outcome.designated.unwrap_or(Value::Null);
        Ok(NodeResult::new(
            NodeOutput::new()
                .with("output", primary)
                .with("outputs", NodeValue::Json(Value::Object(outputs))),
        )
        .with_cost((outcome.cost_usd > 0.0).then_some(outcome.cost_usd)))
    }
}
