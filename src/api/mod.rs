/// HTTP API Layer
///
/// REST control surface for the engine. It handles:
/// - Workflow CRUD, validation and manual runs
/// - Trigger create/update/delete, arm/disarm, test-fire and fire log
/// - Run lookup and cancellation
/// - Webhook listener status

use crate::runtime::WorkflowRunner;
use crate::store::Store;
use crate::trigger::TriggerManager;
use crate::workflow::registry::WorkflowRegistry;
use axum::Router;
use std::sync::Arc;

// Workflow management endpoints (POST/GET/PUT/DELETE)
pub mod workflows;

// Trigger commands and fire log
pub mod triggers;

// Run records and cancellation
pub mod runs;

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    /// Persistent storage
    pub store: Arc<dyn Store>,
    /// Hot-reload registry of compiled workflows
    pub registry: Arc<WorkflowRegistry>,
    /// Starts and cancels runs
    pub runner: Arc<WorkflowRunner>,
    /// Owner of armed triggers
    pub triggers: Arc<TriggerManager>,
}

/// All control API routes
pub fn create_api_routes() -> Router<AppState> {
    Router::new()
        .merge(workflows::create_workflow_routes())
        .merge(triggers::create_trigger_routes())
        .merge(runs::create_run_routes())
}
