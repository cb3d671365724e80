/// Webhook listener
///
/// A single axum surface multiplexes every armed webhook path. Requests pass through
/// route lookup (404), method check (405), rate limit (429) and authentication (401)
/// in that order before a run is dispatched.

use crate::error::WebhookRejection;
use crate::runtime::TriggerPayload;
use crate::store::RunStatus;
use crate::trigger::auth::authenticate;
use crate::trigger::config::{normalize_path, ResponseMode, WebhookConfig};
use crate::trigger::dispatch::{Dispatcher, FireMode};
use crate::trigger::rate_limit::RateLimiter;
use anyhow::Result;
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Path, Query, State},
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use chrono::Utc;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;

/// An armed webhook path
#[derive(Debug, Clone)]
pub struct WebhookRoute {
    pub trigger_id: String,
    pub workflow_id: String,
    pub config: WebhookConfig,
}

/// Path -> route table shared by the manager and the listener
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: Arc<RwLock<HashMap<String, WebhookRoute>>>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert unless another trigger owns the path. Returns the owner on conflict.
    pub fn insert(&self, route: WebhookRoute) -> Result<(), String> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        match routes.get(&route.config.path) {
            Some(existing) if existing.trigger_id != route.trigger_id => Err(existing.trigger_id.clone()),
            _ => {
                routes.insert(route.config.path.clone(), route);
                Ok(())
            }
        }
    }

    /// Remove whatever path `trigger_id` owns
    pub fn remove_trigger(&self, trigger_id: &str) -> Option<WebhookRoute> {
        let mut routes = self.routes.write().unwrap_or_else(|e| e.into_inner());
        let path = routes
            .iter()
            .find(|(_, route)| route.trigger_id == trigger_id)
            .map(|(path, _)| path.clone())?;
        routes.remove(&path)
    }

    pub fn get(&self, path: &str) -> Option<WebhookRoute> {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(path)
            .cloned()
    }

    pub fn contains_trigger(&self, trigger_id: &str) -> bool {
        self.routes
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .any(|route| route.trigger_id == trigger_id)
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// State behind the webhook router
#[derive(Clone)]
pub struct WebhookState {
    pub routes: RouteTable,
    pub limiter: RateLimiter,
    pub dispatcher: Arc<Dispatcher>,
}

/// Build the listener's router: `{base}/{*path}` plus `/health`
pub fn router(state: WebhookState, base: &str) -> Router {
    let base = normalize_path(base);
    let hook_route = if base.is_empty() {
        "/{*path}".to_string()
    } else {
        format!("/{}/{{*path}}", base)
    };
    Router::new()
        .route("/health", get(health))
        .route(&hook_route, any(handle_hook))
        .with_state(state)
}

async fn health(State(state): State<WebhookState>) -> Json<Value> {
    Json(json!({ "status": "ok", "activeHooks": state.routes.len() }))
}

async fn handle_hook(
    State(state): State<WebhookState>,
    Path(path): Path<String>,
    method: Method,
    query: Result<Query<HashMap<String, String>>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, WebhookRejection> {
    let path = normalize_path(&path);
    // the route is cloned out so the table lock is released before the limiter is touched
    let route = state.routes.get(&path).ok_or(WebhookRejection::NotFound)?;

    if !route.config.allows(method.as_str()) {
        return Err(WebhookRejection::MethodNotAllowed(method.to_string()));
    }
    if !state.limiter.check(&path, route.config.max_per_minute) {
        tracing::warn!("🚦 Webhook {} rate limited", path);
        return Err(WebhookRejection::RateLimited);
    }
    authenticate(route.config.auth_mode, &route.config.secret, &headers, &body)?;

    let query = query.map(|Query(q)| q).unwrap_or_default();
    let payload = TriggerPayload::Webhook {
        body: parse_body(&body),
        headers: header_map(&headers),
        query: query.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
        method: method.to_string(),
        path: path.clone(),
    };

    let fired = state
        .dispatcher
        .fire(&route.trigger_id, &route.workflow_id, payload, Utc::now(), FireMode::Live)
        .await?;

    match route.config.response_mode {
        ResponseMode::Immediate => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "runId": fired.run_id, "status": "accepted" })),
        )
            .into_response()),
        ResponseMode::Wait => {
            let secs = route.config.timeout_secs;
            match tokio::time::timeout(Duration::from_secs(secs), fired.completion).await {
                Err(_) => {
                    tracing::warn!("⏱️ Webhook {} timed out waiting for run {}", path, fired.run_id);
                    Err(WebhookRejection::Timeout(secs))
                }
                Ok(Err(e)) => Err(WebhookRejection::Internal(e.to_string())),
                Ok(Ok(None)) => Err(WebhookRejection::Internal(format!("run {} did not report a result", fired.run_id))),
                Ok(Ok(Some(record))) if record.status == RunStatus::Completed => Ok(Json(json!({
                    "runId": record.id,
                    "status": "completed",
                    "output": record.output,
                }))
                .into_response()),
                Ok(Ok(Some(record))) => Ok((
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({
                        "runId": record.id,
                        "status": record.status.as_str(),
                        "error": record.error,
                    })),
                )
                    .into_response()),
            }
        }
    }
}

/// JSON if it parses, text otherwise, null when empty
pub fn parse_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body).unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

fn header_map(headers: &HeaderMap) -> Map<String, Value> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), Value::String(v.to_string())))
        })
        .collect()
}

/// Running state reported by the control API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub active_hooks: usize,
}

/// Network side of the listener, so tests can observe start/stop without binding
#[async_trait]
pub trait WebhookListener: Send + Sync {
    /// Start serving `app`; returns the bound address
    async fn start(&self, app: Router) -> Result<SocketAddr>;
    async fn stop(&self) -> Result<()>;
}

struct Serving {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// TCP listener with graceful shutdown
pub struct AxumWebhookListener {
    addr: SocketAddr,
    serving: Mutex<Option<Serving>>,
}

impl AxumWebhookListener {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            serving: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WebhookListener for AxumWebhookListener {
    async fn start(&self, app: Router) -> Result<SocketAddr> {
        let mut serving = self.serving.lock().await;
        if serving.is_some() {
            anyhow::bail!("webhook listener already running");
        }
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        let local = listener.local_addr()?;
        let (tx, rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async {
                    let _ = rx.await;
                })
                .await;
            if let Err(e) = result {
                tracing::error!("❌ Webhook listener failed: {}", e);
            }
        });
        tracing::info!("🪝 Webhook listener on http://{}", local);
        *serving = Some(Serving { shutdown: tx, task });
        Ok(local)
    }

    async fn stop(&self) -> Result<()> {
        if let Some(Serving { shutdown, task }) = self.serving.lock().await.take() {
            let _ = shutdown.send(());
            task.await?;
            tracing::info!("🪝 Webhook listener stopped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::config::WebhookConfig;

    fn route(trigger_id: &str, path: &str) -> WebhookRoute {
        WebhookRoute {
            trigger_id: trigger_id.into(),
            workflow_id: "wf".into(),
            config: WebhookConfig::parse(&json!({ "path": path }), 30).unwrap(),
        }
    }

    #[test]
    fn body_parsing_falls_back_to_text() {
        assert_eq!(parse_body(b""), Value::Null);
        assert_eq!(parse_body(br#"{"a":1}"#), json!({"a": 1}));
        assert_eq!(parse_body(b"plain words"), json!("plain words"));
    }

    #[test]
    fn a_path_belongs_to_one_trigger() {
        let table = RouteTable::new();
        table.insert(route("t1", "orders")).unwrap();
        // re-inserting the owner is allowed
        table.insert(route("t1", "/orders/")).unwrap();
        assert_eq!(table.insert(route("t2", "orders")), Err("t1".to_string()));
        assert_eq!(table.len(), 1);

        assert!(table.remove_trigger("t1").is_some());
        assert!(table.is_empty());
        table.insert(route("t2", "orders")).unwrap();
        assert!(table.contains_trigger("t2"));
    }
}
