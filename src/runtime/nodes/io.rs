/// Input, Output, boundary and trigger nodes
///
/// These nodes move data in and out of a run. Trigger nodes expose the stimulus that
/// started the run; when a run was started manually they fall back to run inputs.

use super::{NodeContext, NodeHandler, NodeResult};
use crate::error::NodeError;
use crate::runtime::context::TriggerPayload;
use crate::workflow::types::NodeKind;
use crate::workflow::value::{NodeOutput, NodeValue};
use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};

/// Reads one run input
pub struct InputNode;

#[async_trait]
impl NodeHandler for InputNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Input
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let run_inputs = &ctx.run.inputs;

        let named = ["inputName", "name", "label"]
            .iter()
            .filter_map(|key| ctx.config_str(key))
            .find_map(|name| run_inputs.get(name));

        let found = run_inputs
            .get(&ctx.node.id)
            .or(named)
            .or_else(|| run_inputs.get("input"))
            .or_else(|| (run_inputs.len() == 1).then(|| run_inputs.values().next()).flatten())
            .or_else(|| {
                ["value", "defaultValue", "default"]
                    .iter()
                    .find_map(|key| ctx.config.get(*key))
            });

        match found {
            Some(value) => {
                tracing::debug!("📥 Input {} resolved", ctx.node.id);
                Ok(NodeResult::value(value.clone()))
            }
            None => Err(NodeError::failed(format!(
                "no run input for '{}' and no default value configured",
                ctx.node.id
            ))),
        }
    }
}

/// Marks a run output
pub struct OutputNode;

#[async_trait]
impl NodeHandler for OutputNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Output
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let mut value = ctx.input();
        if value.is_null() {
            if let Some(fallback) = ctx.config.get("value") {
                value = NodeValue::from(fallback.clone());
            }
        }
        Ok(NodeResult::value(value))
    }
}

/// Aggregator outside an iterator body: gathers whatever reaches it
pub struct AggregatorNode;

#[async_trait]
impl NodeHandler for AggregatorNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Aggregator
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let input = ctx.input();
        let count = match &input {
            NodeValue::Null => 0,
            NodeValue::Json(Value::Array(items)) => items.len(),
            _ => 1,
        };
        Ok(NodeResult::new(
            NodeOutput::new()
                .with("result", input)
                .with("count", NodeValue::Number(count as f64)),
        ))
    }
}

/// Exit outside a loop body: passes its input through
pub struct ExitNode;

#[async_trait]
impl NodeHandler for ExitNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Exit
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        Ok(NodeResult::new(
            NodeOutput::new()
                .with("output", ctx.input())
                .with("iterations", NodeValue::Number(0.0))
                .with("exited", NodeValue::Boolean(true)),
        ))
    }
}

/// Exposes the inbound webhook request
pub struct WebhookTriggerNode;

#[async_trait]
impl NodeHandler for WebhookTriggerNode {
    fn kind(&self) -> NodeKind {
        NodeKind::WebhookTrigger
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let output = match &ctx.run.trigger {
            Some(TriggerPayload::Webhook { body, headers, query, method, path }) => NodeOutput::new()
                .with("body", body.clone())
                .with("output", body.clone())
                .with("headers", NodeValue::Json(Value::Object(headers.clone())))
                .with("query", NodeValue::Json(Value::Object(query.clone())))
                .with("method", method.as_str())
                .with("path", path.as_str()),
            // manual run: the primary run input stands in for the request body
            _ => {
                let body = ctx.run.inputs.get("input").cloned().unwrap_or(Value::Null);
                NodeOutput::new()
                    .with("body", body.clone())
                    .with("output", body)
                    .with("headers", NodeValue::Json(Value::Object(Map::new())))
                    .with("query", NodeValue::Json(Value::Object(Map::new())))
                    .with("method", "MANUAL")
            }
        };
        Ok(NodeResult::new(output))
    }
}

/// Exposes the cron fire
pub struct CronTriggerNode;

#[async_trait]
impl NodeHandler for CronTriggerNode {
    fn kind(&self) -> NodeKind {
        NodeKind::CronTrigger
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let output = match &ctx.run.trigger {
            Some(TriggerPayload::Cron { timestamp, iteration, schedule, input, catch_up }) => NodeOutput::new()
                .with("timestamp", timestamp.to_rfc3339())
                .with("iteration", NodeValue::Number(*iteration as f64))
                .with("schedule", schedule.as_str())
                .with("input", input.clone())
                .with("output", input.clone())
                .with("catchUp", NodeValue::Boolean(*catch_up)),
            _ => {
                let input = ctx.run.inputs.get("input").cloned().unwrap_or(Value::Null);
                NodeOutput::new()
                    .with("timestamp", Utc::now().to_rfc3339())
                    .with("iteration", NodeValue::Number(0.0))
                    .with("schedule", ctx.config_str("expression").unwrap_or_default())
                    .with("input", input.clone())
                    .with("output", input)
                    .with("catchUp", NodeValue::Boolean(false))
            }
        };
        Ok(NodeResult::new(output))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::nodes::testing::{execute, run_context, run_context_with};
    use crate::workflow::types::Node;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn inputs(pairs: &[(&str, Value)]) -> Map<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test]
    async fn input_resolution_order() {
        let node = Node::new("topic_in", NodeKind::Input, json!({"inputName": "topic", "value": "fallback"}));

        let run = run_context(inputs(&[("topic_in", json!("by id")), ("topic", json!("by name"))]));
        let out = execute(&InputNode, &node, BTreeMap::new(), &run).await.unwrap();
        assert_eq!(out.output.resolve("value"), NodeValue::text("by id"));

        let run = run_context(inputs(&[("topic", json!("by name")), ("input", json!("generic"))]));
        let out = execute(&InputNode, &node, BTreeMap::new(), &run).await.unwrap();
        assert_eq!(out.output.resolve("value"), NodeValue::text("by name"));

        let run = run_context(inputs(&[("other", json!("sole"))]));
        let out = execute(&InputNode, &node, BTreeMap::new(), &run).await.unwrap();
        assert_eq!(out.output.resolve("value"), NodeValue::text("sole"));

        let run = run_context(Map::new());
        let out = execute(&InputNode, &node, BTreeMap::new(), &run).await.unwrap();
        assert_eq!(out.output.resolve("value"), NodeValue::text("fallback"));
    }

    #[tokio::test]
    async fn input_without_value_fails() {
        let node = Node::new("in", NodeKind::Input, json!({}));
        let run = run_context(Map::new());
        assert!(execute(&InputNode, &node, BTreeMap::new(), &run).await.is_err());
    }

    #[tokio::test]
    async fn webhook_trigger_exposes_request() {
        let node = Node::new("hook", NodeKind::WebhookTrigger, json!({}));
        let mut headers = Map::new();
        headers.insert("x-test".into(), json!("true"));
        let run = run_context_with(TriggerPayload::Webhook {
            body: json!({"x": 1}),
            headers,
            query: Map::new(),
            method: "POST".into(),
            path: "hook".into(),
        });
        let out = execute(&WebhookTriggerNode, &node, BTreeMap::new(), &run).await.unwrap();
        assert_eq!(out.output.resolve("body").to_json(), json!({"x": 1}));
        assert_eq!(out.output.resolve("method"), NodeValue::text("POST"));
        assert_eq!(out.output.resolve("headers").to_json()["x-test"], "true");
    }
}
