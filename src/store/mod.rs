/// Persistence collaborator
///
/// The engine reads workflow definitions and reads/writes trigger records, the
/// trigger fire log and run records through the `Store` trait. `SqliteStore` is the
/// durable implementation; `MemoryStore` backs tests and `:memory:` deployments.

use crate::workflow::types::Workflow;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// SQLite implementation using sqlx
pub mod sqlite;

// In-process implementation
pub mod memory;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Default and maximum page sizes for the trigger log
pub const DEFAULT_LOG_LIMIT: u32 = 50;
pub const MAX_LOG_LIMIT: u32 = 500;

/// Kind of external stimulus a trigger listens for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Webhook,
    Cron,
}

impl TriggerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TriggerKind::Webhook => "webhook",
            TriggerKind::Cron => "cron",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "webhook" => Ok(TriggerKind::Webhook),
            "cron" => Ok(TriggerKind::Cron),
            other => Err(anyhow::anyhow!("unknown trigger kind: {}", other)),
        }
    }
}

/// Persisted trigger record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub id: String,
    pub workflow_id: String,
    pub kind: TriggerKind,
    /// Kind-specific configuration (path/auth for webhooks, expression for cron)
    pub config: Value,
    pub armed: bool,
    pub last_fired: Option<DateTime<Utc>>,
    pub fire_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One line of a trigger's fire history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerLogEntry {
    pub id: String,
    pub trigger_id: String,
    pub run_id: Option<String>,
    pub fired_at: DateTime<Utc>,
    /// fired | completed | failed | cancelled | test
    pub status: String,
    pub message: Option<String>,
}

/// Lifecycle state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "cancelled" => Ok(RunStatus::Cancelled),
            other => Err(anyhow::anyhow!("unknown run status: {}", other)),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled)
    }

    /// States a run may still leave
    pub const ACTIVE: [RunStatus; 2] = [RunStatus::Pending, RunStatus::Running];
}

/// Persisted run record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRecord {
    pub id: String,
    pub workflow_id: String,
    pub trigger_id: Option<String>,
    pub status: RunStatus,
    /// Designated output value
    pub output: Option<Value>,
    pub error: Option<String>,
    /// First failing node
    pub failed_node_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl RunRecord {
    pub fn pending(id: String, workflow_id: String, trigger_id: Option<String>) -> Self {
        Self {
            id,
            workflow_id,
            trigger_id,
            status: RunStatus::Pending,
            output: None,
            error: None,
            failed_node_id: None,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
        }
    }
}

/// Fields written by a conditional run transition
#[derive(Debug, Clone, Default)]
pub struct RunUpdate {
    pub output: Option<Value>,
    pub error: Option<String>,
    pub failed_node_id: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Summary row for workflow listings
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowSummary {
    pub id: String,
    pub name: String,
    pub updated_at: String,
}

/// Storage interface the engine and trigger subsystem depend on
#[async_trait]
pub trait Store: Send + Sync {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()>;
    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>>;
    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>>;
    async fn delete_workflow(&self, id: &str) -> Result<bool>;

    /// Insert or replace a trigger record
    async fn save_trigger(&self, trigger: &Trigger) -> Result<()>;
    async fn get_trigger(&self, id: &str) -> Result<Option<Trigger>>;
    async fn list_triggers(&self, workflow_id: Option<&str>) -> Result<Vec<Trigger>>;
    async fn delete_trigger(&self, id: &str) -> Result<bool>;
    async fn set_trigger_armed(&self, id: &str, armed: bool) -> Result<()>;
    /// Increment the fire counter and stamp `last_fired`; an older stamp never replaces a newer one
    async fn record_trigger_fire(&self, id: &str, fired_at: DateTime<Utc>) -> Result<()>;

    async fn append_trigger_log(&self, entry: &TriggerLogEntry) -> Result<()>;
    async fn update_trigger_log(&self, id: &str, status: &str, message: Option<&str>) -> Result<()>;
    /// Newest first, at most `limit` entries
    async fn list_trigger_log(&self, trigger_id: &str, limit: u32) -> Result<Vec<TriggerLogEntry>>;

    async fn create_run(&self, run: &RunRecord) -> Result<()>;
    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>>;
    /// Move a run to `to` only if its current status is one of `from`.
    /// Returns whether the transition happened.
    async fn transition_run(&self, id: &str, from: &[RunStatus], to: RunStatus, update: RunUpdate) -> Result<bool>;
}

/// Clamp a requested log page size
pub fn log_limit(requested: Option<u32>) -> u32 {
    requested.unwrap_or(DEFAULT_LOG_LIMIT).clamp(1, MAX_LOG_LIMIT)
}
