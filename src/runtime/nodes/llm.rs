/// LLM node: one chat completion through the model backend
///
/// The prompt comes from the `prompt` handle, else the `prompt` config, else the
/// primary input. Values on the `context` handle are appended as reference text.

use super::{NodeContext, NodeHandler, NodeResult};
use crate::error::NodeError;
use crate::runtime::backend::{ChatMessage, ModelBackend, ModelRequest};
use crate::workflow::types::NodeKind;
use crate::workflow::value::{NodeOutput, NodeValue};
use async_trait::async_trait;
use std::sync::Arc;

pub struct LlmNode {
    model: Arc<dyn ModelBackend>,
}

impl LlmNode {
    pub fn new(model: Arc<dyn ModelBackend>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl NodeHandler for LlmNode {
    fn kind(&self) -> NodeKind {
        NodeKind::Llm
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let mut prompt = match (ctx.handle("prompt"), ctx.config_str("prompt")) {
            (Some(value), _) => value.as_text(),
            (None, Some(text)) => text.to_string(),
            (None, None) => ctx.input().as_text(),
        };
        if prompt.trim().is_empty() {
            return Err(NodeError::config(format!("llm node '{}' has an empty prompt", ctx.node.id)));
        }
        if let Some(context) = ctx.handle("context") {
            prompt = format!("{}\n\nContext:\n{}", prompt, context.as_text());
        }

        let mut messages = Vec::new();
        let system = ctx
            .handle("system")
            .map(NodeValue::as_text)
            .or_else(|| ctx.config_str("systemPrompt").map(str::to_string));
        if let Some(system) = system.filter(|s| !s.trim().is_empty()) {
            messages.push(ChatMessage::new("system", system));
        }
        messages.push(ChatMessage::new("user", prompt));

        let request = ModelRequest {
            model: ctx.config_str("model").unwrap_or_default().to_string(),
            messages,
            temperature: ctx.config_f64("temperature"),
        };
        tracing::debug!("🤖 LLM node {} calling model '{}'", ctx.node.id, request.model);
        let response = self.model.complete(request).await?;

        let mut output = NodeOutput::new()
            .with("response", response.content.as_str())
            .with("output", response.content.as_str())
            .with("model", response.model.as_str())
            .with("usage", NodeValue::Json(response.usage.clone()));
        if let Some(cost) = response.cost_usd {
            output.insert("cost", NodeValue::Number(cost));
        }
        Ok(NodeResult::new(output).with_cost(response.cost_usd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::backend::ModelResponse;
    use crate::runtime::nodes::testing::{execute, run_context};
    use crate::workflow::types::Node;
    use serde_json::{json, Map};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        requests: Mutex<Vec<ModelRequest>>,
    }

    #[async_trait]
    impl ModelBackend for Recording {
        async fn complete(&self, request: ModelRequest) -> anyhow::Result<ModelResponse> {
            let reply = format!("echo: {}", request.messages.last().map(|m| m.content.as_str()).unwrap_or(""));
            self.requests.lock().unwrap().push(request);
            Ok(ModelResponse {
                content: reply,
                model: "test-model".into(),
                usage: json!({"total_tokens": 7}),
                cost_usd: Some(0.01),
            })
        }
    }

    #[tokio::test]
    async fn response_usage_and_cost_are_separate_handles() {
        let backend = Arc::new(Recording::default());
        let node = Node::new("llm_1", NodeKind::Llm, json!({"systemPrompt": "be brief", "model": "m"}));
        let run = run_context(Map::new());
        let inputs = BTreeMap::from([("input".to_string(), NodeValue::text("hello"))]);
        let out = execute(&LlmNode::new(backend.clone()), &node, inputs, &run).await.unwrap();

        assert_eq!(out.output.resolve("response"), NodeValue::text("echo: hello"));
        assert_eq!(out.output.resolve("usage").to_json(), json!({"total_tokens": 7}));
        assert_eq!(out.output.resolve("cost"), NodeValue::Number(0.01));
        assert_eq!(out.cost_usd, Some(0.01));

        let requests = backend.requests.lock().unwrap();
        assert_eq!(requests[0].messages[0].role, "system");
        assert_eq!(requests[0].model, "m");
    }

    #[tokio::test]
    async fn empty_prompt_is_a_config_error() {
        let node = Node::new("llm_1", NodeKind::Llm, json!({}));
        let run = run_context(Map::new());
        let err = execute(&LlmNode::new(Arc::new(Recording::default())), &node, BTreeMap::new(), &run)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
