/// Workflow management REST API endpoints
///
/// CRUD for workflow definitions with hot-reload into the registry, structural
/// validation, and manual runs.

use crate::{
    api::AppState,
    error::EngineError,
    runtime::RunRequest,
    workflow::{types::Workflow, validation::validate},
};
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
    /// Problems found in the saved graph; a workflow with errors is stored but cannot run
    pub validation: crate::workflow::ValidationReport,
}

/// Request body for workflow creation
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub workflow: Workflow,
}

/// Request body for a manual run
#[derive(Debug, Default, Deserialize)]
pub struct RunWorkflowRequest {
    #[serde(default)]
    pub inputs: Map<String, Value>,
    /// Wait for the terminal record (default) or return as soon as the run is accepted
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

/// Create workflow management routes
pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
        .route("/api/workflows/{id}/validate", post(validate_workflow))
        .route("/api/workflows/{id}/run", post(run_workflow))
}

/// Create a new workflow
///
/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "nodes": [...], "edges": [...] } }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let workflow = payload.workflow;
    if workflow.id.is_empty() || workflow.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.store.get_workflow(&workflow.id).await {
        Ok(Some(_)) => return Err(StatusCode::CONFLICT),
        Ok(None) => {}
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    save_and_reload(&state, &workflow).await?;
    tracing::info!("🔥 Created workflow: {} ({})", workflow.id, workflow.name);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' created successfully", workflow.name),
        validation: validate(&workflow),
    }))
}

/// List all workflows
///
/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, StatusCode> {
    match state.store.list_workflows().await {
        Ok(workflows) => Ok(Json(json!({ "workflows": workflows }))),
        Err(e) => {
            tracing::error!("Failed to list workflows: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, StatusCode> {
    match state.store.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Update an existing workflow
///
/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, StatusCode> {
    let mut workflow = payload.workflow;
    workflow.id = id.clone();
    if workflow.name.is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    match state.store.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(_) => return Err(StatusCode::INTERNAL_SERVER_ERROR),
    }

    save_and_reload(&state, &workflow).await?;
    tracing::info!("🔥 Hot-reloaded workflow: {} ({})", workflow.id, workflow.name);

    Ok(Json(WorkflowResponse {
        id: workflow.id.clone(),
        message: format!("Workflow '{}' updated successfully", workflow.name),
        validation: validate(&workflow),
    }))
}

/// Persist, then swap the new plan into the registry. An invalid graph is stored
/// and its stale plan dropped, so runs fail validation instead of using old code.
async fn save_and_reload(state: &AppState, workflow: &Workflow) -> Result<(), StatusCode> {
    if let Err(e) = state.store.save_workflow(workflow).await {
        tracing::error!("Failed to save workflow: {}", e);
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    match state.registry.reload_workflow(&workflow.id).await {
        Ok(_) => Ok(()),
        Err(EngineError::Validation(e)) => {
            tracing::warn!("⚠️ Saved workflow {} does not validate: {}", workflow.id, e);
            state.registry.remove_workflow(&workflow.id);
            Ok(())
        }
        Err(e) => {
            tracing::error!("Failed to reload workflow into registry: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Delete a workflow together with its (disarmed) triggers
///
/// DELETE /api/workflows/{id}
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, StatusCode> {
    let triggers = state.triggers.list(Some(&id)).await.map_err(|e| e.status_code())?;
    for trigger in triggers {
        state.triggers.disarm(&trigger.id).await.map_err(|e| e.status_code())?;
        state.triggers.delete(&trigger.id).await.map_err(|e| e.status_code())?;
    }

    state.registry.remove_workflow(&id);

    match state.store.delete_workflow(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Deleted workflow: {}", id);
            Ok(Json(json!({ "message": "Workflow deleted successfully" })))
        }
        Ok(false) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to delete workflow: {}", e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /api/workflows/{id}/validate
async fn validate_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<crate::workflow::ValidationReport>, StatusCode> {
    match state.store.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(validate(&workflow))),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// Run a workflow by hand
///
/// POST /api/workflows/{id}/run
/// Body: { "inputs": {...}, "wait": true }
async fn run_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), StatusCode> {
    let request: RunWorkflowRequest = if body.is_empty() {
        RunWorkflowRequest {
            wait: true,
            ..RunWorkflowRequest::default()
        }
    } else {
        serde_json::from_slice(&body).map_err(|_| StatusCode::BAD_REQUEST)?
    };

    let handle = match state
        .runner
        .start(&id, RunRequest::new().with_inputs(request.inputs))
        .await
    {
        Ok(handle) => handle,
        Err(EngineError::Validation(e)) => {
            return Ok((
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "error": e.to_string(), "validation": e.0 })),
            ))
        }
        Err(EngineError::WorkflowNotFound(_)) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to start workflow {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    };

    if !request.wait {
        return Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "runId": handle.run_id, "status": "accepted" })),
        ));
    }

    match handle.wait().await {
        Ok(record) => Ok((StatusCode::OK, Json(json!(record)))),
        Err(e) => {
            tracing::error!("Run of workflow {} ended abnormally: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
