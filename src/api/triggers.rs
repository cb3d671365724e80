/// Trigger REST API endpoints
///
/// Thin wrappers over `TriggerManager`; `TriggerError` renders its own status code.

use crate::{
    api::AppState,
    error::TriggerError,
    store::{RunRecord, Trigger, TriggerKind, TriggerLogEntry},
    trigger::{ListenerStatus, TriggerPatch},
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTriggerRequest {
    pub workflow_id: String,
    pub kind: TriggerKind,
    #[serde(default)]
    pub config: Value,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerListQuery {
    pub workflow_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<u32>,
}

pub fn create_trigger_routes() -> Router<AppState> {
    Router::new()
        .route("/api/triggers", post(create_trigger).get(list_triggers))
        .route(
            "/api/triggers/{id}",
            get(get_trigger).patch(update_trigger).delete(delete_trigger),
        )
        .route("/api/triggers/{id}/arm", post(arm_trigger))
        .route("/api/triggers/{id}/disarm", post(disarm_trigger))
        .route("/api/triggers/{id}/test", post(test_trigger))
        .route("/api/triggers/{id}/log", get(trigger_log))
        .route("/api/webhooks/status", get(webhook_status))
}

/// POST /api/triggers
/// Body: { "workflowId": "...", "kind": "webhook" | "cron", "config": {...} }
async fn create_trigger(
    State(state): State<AppState>,
    Json(payload): Json<CreateTriggerRequest>,
) -> Result<(StatusCode, Json<Trigger>), TriggerError> {
    let trigger = state
        .triggers
        .create(&payload.workflow_id, payload.kind, payload.config)
        .await?;
    Ok((StatusCode::CREATED, Json(trigger)))
}

/// GET /api/triggers?workflowId=...
async fn list_triggers(
    State(state): State<AppState>,
    Query(query): Query<TriggerListQuery>,
) -> Result<Json<Value>, TriggerError> {
    let triggers = state.triggers.list(query.workflow_id.as_deref()).await?;
    Ok(Json(json!({ "triggers": triggers })))
}

async fn get_trigger(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Trigger>, TriggerError> {
    Ok(Json(state.triggers.get(&id).await?))
}

/// PATCH /api/triggers/{id}
/// Body: { "config": {...}, "armed": true }
async fn update_trigger(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(patch): Json<TriggerPatch>,
) -> Result<Json<Trigger>, TriggerError> {
    Ok(Json(state.triggers.update(&id, patch).await?))
}

async fn delete_trigger(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, TriggerError> {
    state.triggers.delete(&id).await?;
    Ok(Json(json!({ "message": "Trigger deleted successfully" })))
}

async fn arm_trigger(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Trigger>, TriggerError> {
    Ok(Json(state.triggers.arm(&id).await?))
}

async fn disarm_trigger(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Trigger>, TriggerError> {
    Ok(Json(state.triggers.disarm(&id).await?))
}

/// POST /api/triggers/{id}/test
/// Fires through the normal dispatch path and waits for the run
async fn test_trigger(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<RunRecord>, TriggerError> {
    Ok(Json(state.triggers.test_fire(&id).await?))
}

/// GET /api/triggers/{id}/log?limit=50
async fn trigger_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<LogQuery>,
) -> Result<Json<Vec<TriggerLogEntry>>, TriggerError> {
    Ok(Json(state.triggers.log(&id, query.limit).await?))
}

async fn webhook_status(State(state): State<AppState>) -> Json<ListenerStatus> {
    Json(state.triggers.status().await)
}
