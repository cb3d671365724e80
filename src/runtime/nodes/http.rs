/// HTTP request node
///
/// Config: { "url": "…", "method": "GET", "headers": {…}, "body": …, "timeoutSecs": 30 }
/// The `url` and `body` handles override config. JSON bodies are sent as JSON,
/// anything else as text. Non-2xx responses fail the node unless
/// `allowErrorStatus` is set.

use super::{NodeContext, NodeHandler, NodeResult};
use crate::error::NodeError;
use crate::workflow::types::NodeKind;
use crate::workflow::value::{NodeOutput, NodeValue};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::time::Duration;

pub struct HttpRequestNode {
    client: reqwest::Client,
}

impl Default for HttpRequestNode {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpRequestNode {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl NodeHandler for HttpRequestNode {
    fn kind(&self) -> NodeKind {
        NodeKind::HttpRequest
    }

    async fn execute(&self, ctx: &NodeContext<'_>) -> Result<NodeResult, NodeError> {
        let url = match ctx.handle("url") {
            Some(value) => value.as_text(),
            None => ctx.require_str("url")?.to_string(),
        };
        let method = ctx.config_str("method").unwrap_or("GET").to_uppercase();
        let timeout_secs = ctx.config_u64("timeoutSecs").unwrap_or(30);

        tracing::debug!("🌍 HTTP Request: {} {}", method, url);
        let mut request_builder = match method.as_str() {
            "GET" => self.client.get(&url),
            "POST" => self.client.post(&url),
            "PUT" => self.client.put(&url),
            "DELETE" => self.client.delete(&url),
            "PATCH" => self.client.patch(&url),
            _ => return Err(NodeError::config(format!("unsupported HTTP method: {}", method))),
        };
        request_builder = request_builder.timeout(Duration::from_secs(timeout_secs));

        if let Some(headers) = ctx.config.get("headers").and_then(Value::as_object) {
            for (key, value) in headers {
                if let Some(header_value) = value.as_str() {
                    request_builder = request_builder.header(key.as_str(), header_value);
                }
            }
        }

        let body = ctx
            .handle("body")
            .cloned()
            .or_else(|| ctx.config.get("body").cloned().map(NodeValue::from))
            .or_else(|| ctx.handle("input").cloned());
        if matches!(method.as_str(), "POST" | "PUT" | "PATCH") {
            match body {
                Some(NodeValue::Json(json)) => request_builder = request_builder.json(&json),
                Some(NodeValue::Null) | None => {}
                Some(other) => {
                    request_builder = request_builder
                        .header("Content-Type", "text/plain")
                        .body(other.as_text())
                }
            }
        }

        let response = request_builder
            .send()
            .await
            .map_err(|e| NodeError::failed(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let headers: Map<String, Value> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|s| (k.to_string(), Value::String(s.to_string()))))
            .collect();
        let text = response
            .text()
            .await
            .map_err(|e| NodeError::failed(format!("Failed to read response body: {}", e)))?;
        let body = serde_json::from_str::<Value>(&text)
            .map(NodeValue::from)
            .unwrap_or(NodeValue::Text(text));

        tracing::info!("✅ HTTP request completed: {} {} (status: {})", method, url, status);
        let allow_error = ctx.config.get("allowErrorStatus").and_then(Value::as_bool).unwrap_or(false);
        if !status.is_success() && !allow_error {
            return Err(NodeError::failed(format!(
                "{} {} returned {}: {}",
                method,
                url,
                status,
                crate::workflow::value::preview(&body.as_text(), 200)
            )));
        }

        Ok(NodeResult::new(
            NodeOutput::new()
                .with("status", NodeValue::Number(f64::from(status.as_u16())))
                .with("headers", NodeValue::Json(Value::Object(headers)))
                .with("body", body),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::nodes::testing::{execute, run_context};
    use crate::workflow::types::Node;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn rejects_unknown_method_before_sending() {
        let node = Node::new("h", NodeKind::HttpRequest, json!({"url": "http://127.0.0.1:9/", "method": "BREW"}));
        let run = run_context(Map::new());
        let err = execute(&HttpRequestNode::new(), &node, BTreeMap::new(), &run).await.unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }

    #[tokio::test]
    async fn missing_url_is_a_config_error() {
        let node = Node::new("h", NodeKind::HttpRequest, json!({}));
        let run = run_context(Map::new());
        let err = execute(&HttpRequestNode::new(), &node, BTreeMap::new(), &run).await.unwrap_err();
        assert!(matches!(err, NodeError::Config(_)));
    }
}
