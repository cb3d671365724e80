/// Error taxonomy for the engine and trigger subsystem
///
/// Internal plumbing (storage, wiring) uses `anyhow::Result`. The types here are the
/// typed errors that cross a boundary: validation reports, node failures, trigger
/// command failures and webhook rejections that map onto HTTP status codes.

use crate::workflow::validation::ValidationReport;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Structural graph problems found before any node runs
#[derive(Debug, Clone, Error)]
#[error("workflow validation failed: {}", .0.errors.join("; "))]
pub struct ValidationError(pub ValidationReport);

/// Failure of a single node executor
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// Node configuration is missing or malformed
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Executor ran and failed
    #[error("{0}")]
    Failed(String),

    /// Execution exceeded its configured bound
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    /// The run was cancelled while the node was executing
    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn failed(message: impl Into<String>) -> Self {
        NodeError::Failed(message.into())
    }

    pub fn config(message: impl Into<String>) -> Self {
        NodeError::Config(message.into())
    }
}

impl From<anyhow::Error> for NodeError {
    fn from(err: anyhow::Error) -> Self {
        NodeError::Failed(err.to_string())
    }
}

/// Errors that prevent a run from starting or finishing normally
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("run cancelled")]
    Cancelled,

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Errors returned by trigger management commands
#[derive(Debug, Error)]
pub enum TriggerError {
    #[error("trigger not found: {0}")]
    NotFound(String),

    #[error("invalid trigger config: {0}")]
    InvalidConfig(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("trigger {0} is armed; disarm it first")]
    StillArmed(String),

    #[error("webhook listener error: {0}")]
    Listener(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

impl TriggerError {
    /// HTTP status used by the control API
    pub fn status_code(&self) -> StatusCode {
        match self {
            TriggerError::NotFound(_) => StatusCode::NOT_FOUND,
            TriggerError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            TriggerError::Conflict(_) | TriggerError::StillArmed(_) => StatusCode::CONFLICT,
            TriggerError::Engine(EngineError::Validation(_)) => StatusCode::UNPROCESSABLE_ENTITY,
            TriggerError::Engine(EngineError::WorkflowNotFound(_)) => StatusCode::NOT_FOUND,
            TriggerError::Listener(_) | TriggerError::Engine(_) | TriggerError::Storage(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for TriggerError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Cron expression problems, reported at arm time and logged by the tick loop
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("cron expression must have exactly 5 fields, got {0}")]
    UnsupportedFieldCount(usize),

    #[error("invalid cron expression '{expression}': {message}")]
    InvalidExpression { expression: String, message: String },
}

/// Rejections produced by the webhook listener, one per HTTP status it can return
#[derive(Debug, Error)]
pub enum WebhookRejection {
    #[error("no armed webhook at this path")]
    NotFound,

    #[error("method {0} not allowed")]
    MethodNotAllowed(String),

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("{0}")]
    Unauthorized(String),

    #[error("workflow did not finish within {0}s")]
    Timeout(u64),

    #[error("{0}")]
    Unprocessable(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl WebhookRejection {
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookRejection::NotFound => StatusCode::NOT_FOUND,
            WebhookRejection::MethodNotAllowed(_) => StatusCode::METHOD_NOT_ALLOWED,
            WebhookRejection::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            WebhookRejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            WebhookRejection::Timeout(_) => StatusCode::REQUEST_TIMEOUT,
            WebhookRejection::Unprocessable(_) => StatusCode::UNPROCESSABLE_ENTITY,
            WebhookRejection::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for WebhookRejection {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

impl From<EngineError> for WebhookRejection {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::Validation(e) => WebhookRejection::Unprocessable(e.to_string()),
            EngineError::WorkflowNotFound(id) => {
                WebhookRejection::Internal(format!("workflow {id} no longer exists"))
            }
            other => WebhookRejection::Internal(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webhook_rejections_map_to_documented_statuses() {
        assert_eq!(WebhookRejection::NotFound.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(WebhookRejection::RateLimited.status_code(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            WebhookRejection::Unauthorized("Invalid token".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(WebhookRejection::Timeout(30).status_code(), StatusCode::REQUEST_TIMEOUT);
        assert!(WebhookRejection::Internal("boom".into()).status_code().is_server_error());
    }

    #[test]
    fn validation_failure_surfaces_as_unprocessable() {
        let report = ValidationReport {
            errors: vec!["cycle detected at node a".into()],
            warnings: vec![],
        };
        let rejection: WebhookRejection = EngineError::Validation(ValidationError(report)).into();
        assert_eq!(rejection.status_code(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(rejection.to_string().contains("cycle"));
    }
}
