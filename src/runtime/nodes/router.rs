/// Router node: selects exactly one branch
///
/// `pattern` mode picks the first branch whose name appears in the input text
/// (case-insensitive), falling back to the last branch. `llm` mode asks the model
/// backend to classify the input. The engine prunes every `branch-{i}` edge except
/// the selected one.

use super::{NodeContext, NodeHandler, NodeResult};
use crate::error::NodeError;
use crate::runtime::backend::{ChatMessage, ModelBackend, ModelRequest};
use crate::workflow::types::NodeKind;
use crate::workflow::value::NodeOutput;
use async_trait::async_trait;
use std::sync::Arc;

pub struct RouterNode {
    model: Arc<dyn ModelBackend>,
}

impl RouterNode {
    pub fn new(model: Arc<dyn ModelBackend>) -> Self {
        Self { model }
    }

    async fn classify(&self, ctx: &NodeContext<'_>, branches: &[String], text: &str) -> Result<(usize, Option<f64>), NodeError> {
        let prompt = format!(
            "Classify the following input into exactly one of these categories: {}.\n\nInput: {}\n\nRespond with ONLY the category name, nothing else.",
            branches.join(", "),
            text
        );
        let response = self
            .model
            .complete(ModelRequest {
                model: ctx.config_str("model").unwrap_or_default().to_string(),
                messages: vec![ChatMessage::new("user", prompt)],
                temperature: Some(0.0),
            })
            .await
            .map_err(|e| NodeError::failed(format!("router classification failed: {}", e)))?;

        let answer = response.content.trim();
        let index = branches
            .iter()
            .position(|name| name.eq_ignore_ascii_case(answer))
            .unwrap_or(0);
        Ok((index, response.cost_usd))
    }
}

/// First branch named in `text`, else the last branch
pub fn match_pattern(branches: &[String], text: &str) -> usize {
    let haystack = text.to_lowercase();
    branches
        .iter()
        .position(|name| haystack.contains(&name.to_lowercase()))
        .unwrap_or(branches.len().saturating_sub(1))
}

#[async_trait]
impl NodeHandler for RouterNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Router
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let branches = ctx.node.branch_names();
        if branches.is_empty() {
            return Err(NodeError::config(format!("router '{}' has no branches configured", ctx.node.id)));
        }

        let input = ctx.input();
        let text = input.as_text();
        let (selected, cost) = match ctx.config_str("mode").unwrap_or("pattern") {
            "llm" => self.classify(ctx, &branches, &text).await?,
            "pattern" => (match_pattern(&branches, &text), None),
            other => return Err(NodeError::config(format!("unknown router mode '{}'", other))),
        };

        tracing::debug!("🔀 Router {} selected branch '{}'", ctx.node.id, branches[selected]);
        let output = NodeOutput::new()
            .with("selectedBranch", branches[selected].as_str())
            .with("value", input);
        Ok(NodeResult::new(output).with_branch(selected).with_cost(cost))
    }
}
