/// Language-model backend collaborator
///
/// AI nodes talk to an opaque request/response service through `ModelBackend`.
/// `HttpModelBackend` speaks the common chat-completions JSON shape over reqwest.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

/// One chat message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

/// Request sent to a model backend
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub temperature: Option<f64>,
}

/// Backend reply
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub model: String,
    pub usage: Value,
    pub cost_usd: Option<f64>,
}

#[async_trait]
pub trait ModelBackend: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse>;
}

/// Chat-completions client
pub struct HttpModelBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpModelBackend {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl ModelBackend for HttpModelBackend {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse> {
        let url = format!("{}/chat/completions", self.endpoint.trim_end_matches('/'));
        tracing::debug!("🤖 Model request: {} ({} messages)", request.model, request.messages.len());

        let mut builder = self.client.post(&url).json(&json!({
            "model": request.model,
            "messages": request.messages,
            "temperature": request.temperature,
        }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Model request failed: {}", e))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Model response was not JSON: {}", e))?;
        if !status.is_success() {
            return Err(anyhow::anyhow!("Model backend returned {}: {}", status, body));
        }

        let content = body
            .pointer("/choices/0/message/content")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow::anyhow!("Model response has no message content"))?
            .to_string();
        Ok(ModelResponse {
            content,
            model: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&request.model)
                .to_string(),
            usage: body.get("usage").cloned().unwrap_or(Value::Null),
            cost_usd: body.get("cost_usd").and_then(Value::as_f64),
        })
    }
}

/// Backend used when no endpoint is configured; every call fails with a clear message
pub struct UnconfiguredModelBackend;

#[async_trait]
impl ModelBackend for UnconfiguredModelBackend {
    async fn complete(&self, _request: ModelRequest) -> Result<ModelResponse> {
        Err(anyhow::anyhow!(
            "No model backend configured (set WIREFLOW_MODEL_ENDPOINT)"
        ))
    }
}
