/// Run record endpoints

use crate::{api::AppState, store::RunRecord};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};

pub fn create_run_routes() -> Router<AppState> {
    Router::new()
        .route("/api/runs/{id}", get(get_run))
        .route("/api/runs/{id}/cancel", post(cancel_run))
}

/// GET /api/runs/{id}
async fn get_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<RunRecord>, StatusCode> {
    match state.store.get_run(&id).await {
        Ok(Some(run)) => Ok(Json(run)),
        Ok(None) => Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get run {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

/// POST /api/runs/{id}/cancel
/// Returns whether the run was still active; a finished run keeps its status
async fn cancel_run(State(state): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, StatusCode> {
    match state.store.get_run(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!("Failed to get run {}: {}", id, e);
            return Err(StatusCode::INTERNAL_SERVER_ERROR);
        }
    }
    match state.runner.cancel(&id).await {
        Ok(cancelled) => Ok(Json(json!({ "runId": id, "cancelled": cancelled }))),
        Err(e) => {
            tracing::error!("Failed to cancel run {}: {}", id, e);
            Err(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}
