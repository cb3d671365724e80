/// Run lifecycle: records, spawning and cancellation
///
/// Every run gets a persisted record that moves pending -> running -> terminal. All
/// transitions are conditional, so a cancellation that lands first is never
/// overwritten by a late success or failure write.

use crate::error::EngineError;
use crate::runtime::context::{RunContext, RunRequest};
use crate::runtime::engine::GraphExecutor;
use crate::runtime::events::EventSink;
use crate::store::{RunRecord, RunStatus, RunUpdate, Store};
use crate::workflow::registry::{CompiledWorkflow, WorkflowRegistry};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A run that has been accepted and is executing in the background
pub struct RunHandle {
    pub run_id: String,
    completion: JoinHandle<RunRecord>,
}

impl RunHandle {
    /// Wait for the terminal run record
    pub async fn wait(self) -> Result<RunRecord, EngineError> {
        self.completion
            .await
            .map_err(|e| EngineError::Storage(anyhow::anyhow!("run task {} ended abnormally: {}", self.run_id, e)))
    }
}

/// Starts workflow runs; the trigger subsystem depends on this seam only
#[async_trait]
pub trait RunLauncher: Send + Sync {
    /// Validate, record and spawn a run. Validation errors surface before anything is recorded.
    async fn launch(&self, workflow_id: &str, request: RunRequest) -> Result<RunHandle, EngineError>;
}

type ActiveRuns = Arc<Mutex<HashMap<String, CancellationToken>>>;

pub struct WorkflowRunner {
    store: Arc<dyn Store>,
    workflows: Arc<WorkflowRegistry>,
    executor: Arc<GraphExecutor>,
    sink: Arc<dyn EventSink>,
    active: ActiveRuns,
}

impl WorkflowRunner {
    pub fn new(
        store: Arc<dyn Store>,
        workflows: Arc<WorkflowRegistry>,
        executor: Arc<GraphExecutor>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            store,
            workflows,
            executor,
            sink,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn workflows(&self) -> &Arc<WorkflowRegistry> {
        &self.workflows
    }

    /// Spawn a run and return immediately
    pub async fn start(&self, workflow_id: &str, request: RunRequest) -> Result<RunHandle, EngineError> {
        let compiled = self.workflows.get(workflow_id).await?;
        let run_id = uuid::Uuid::new_v4().to_string();
        let record = RunRecord::pending(run_id.clone(), workflow_id.to_string(), request.trigger_id.clone());
        self.store.create_run(&record).await?;

        let cancel = CancellationToken::new();
        lock(&self.active).insert(run_id.clone(), cancel.clone());
        let ctx = RunContext::new(&run_id, workflow_id, request, Arc::clone(&self.sink), cancel);

        tracing::info!("🚀 Run {} started for workflow {}", run_id, workflow_id);
        let store = Arc::clone(&self.store);
        let executor = Arc::clone(&self.executor);
        let active = Arc::clone(&self.active);
        let task_run_id = run_id.clone();
        let completion = tokio::spawn(async move {
            let fallback = record.clone();
            let finished = match AssertUnwindSafe(drive(Arc::clone(&store), executor, compiled, ctx, record))
                .catch_unwind()
                .await
            {
                Ok(finished) => finished,
                Err(_) => {
                    tracing::error!("💥 Run {} panicked", task_run_id);
                    fail_record(store.as_ref(), fallback, "run panicked").await
                }
            };
            lock(&active).remove(&task_run_id);
            finished
        });

        Ok(RunHandle { run_id, completion })
    }

    /// Start a run and wait for its terminal record
    pub async fn run(&self, workflow_id: &str, request: RunRequest) -> Result<RunRecord, EngineError> {
        self.start(workflow_id, request).await?.wait().await
    }

    /// Request cancellation. Returns whether the run was still active.
    pub async fn cancel(&self, run_id: &str) -> Result<bool, EngineError> {
        if let Some(token) = lock(&self.active).get(run_id) {
            token.cancel();
        }
        let update = RunUpdate {
            error: Some("cancelled by request".to_string()),
            finished_at: Some(Utc::now()),
            ..RunUpdate::default()
        };
        let cancelled = self
            .store
            .transition_run(run_id, &RunStatus::ACTIVE, RunStatus::Cancelled, update)
            .await?;
        if cancelled {
            tracing::info!("🛑 Run {} cancelled", run_id);
        }
        Ok(cancelled)
    }

    pub fn active_run_count(&self) -> usize {
        lock(&self.active).len()
    }
}

#[async_trait]
impl RunLauncher for WorkflowRunner {
    async fn launch(&self, workflow_id: &str, request: RunRequest) -> Result<RunHandle, EngineError> {
        self.start(workflow_id, request).await
    }
}

fn lock(active: &ActiveRuns) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    active.lock().unwrap_or_else(|e| e.into_inner())
}

async fn drive(
    store: Arc<dyn Store>,
    executor: Arc<GraphExecutor>,
    compiled: Arc<CompiledWorkflow>,
    ctx: RunContext,
    mut record: RunRecord,
) -> RunRecord {
    match store
        .transition_run(&record.id, &[RunStatus::Pending], RunStatus::Running, RunUpdate::default())
        .await
    {
        Ok(true) => record.status = RunStatus::Running,
        Ok(false) => {
            tracing::info!("⏭️ Run {} left pending before it started", record.id);
            return reload(store.as_ref(), record).await;
        }
        Err(e) => tracing::error!("❌ Failed to mark run {} running: {}", record.id, e),
    }

    let outcome = executor.execute(&compiled.plan, &ctx).await;
    let update = RunUpdate {
        output: outcome.designated.clone(),
        error: outcome.error.as_ref().map(|f| f.message.clone()),
        failed_node_id: outcome.error.as_ref().map(|f| f.node_id.clone()),
        finished_at: Some(Utc::now()),
        duration_ms: Some(outcome.duration_ms as i64),
    };

    match store
        .transition_run(&record.id, &RunStatus::ACTIVE, outcome.status, update.clone())
        .await
    {
        Ok(true) => {}
        // a cancellation got there first
        Ok(false) => return reload(store.as_ref(), record).await,
        Err(e) => tracing::error!("❌ Failed to record result of run {}: {}", record.id, e),
    }
    record.status = outcome.status;
    record.output = update.output;
    record.error = update.error;
    record.failed_node_id = update.failed_node_id;
    record.finished_at = update.finished_at;
    record.duration_ms = update.duration_ms;
    record
}

async fn reload(store: &dyn Store, record: RunRecord) -> RunRecord {
    match store.get_run(&record.id).await {
        Ok(Some(stored)) => stored,
        _ => record,
    }
}

async fn fail_record(store: &dyn Store, mut record: RunRecord, message: &str) -> RunRecord {
    let update = RunUpdate {
        error: Some(message.to_string()),
        finished_at: Some(Utc::now()),
        ..RunUpdate::default()
    };
    if let Err(e) = store
        .transition_run(&record.id, &RunStatus::ACTIVE, RunStatus::Failed, update.clone())
        .await
    {
        tracing::error!("❌ Failed to record failure of run {}: {}", record.id, e);
    }
    record.status = RunStatus::Failed;
    record.error = update.error;
    record.finished_at = update.finished_at;
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::engine::EngineLimits;
    use crate::runtime::events::CollectingEventSink;
    use crate::runtime::nodes::{InputNode, NodeRegistry, OutputNode};
    use crate::store::MemoryStore;
    use crate::workflow::types::{Edge, Node, NodeKind, Workflow, WorkflowGraph};
    use serde_json::json;

    async fn runner_with(workflow: Workflow) -> (WorkflowRunner, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store.save_workflow(&workflow).await.unwrap();
        let mut nodes = NodeRegistry::new();
        nodes.register(Arc::new(InputNode));
        nodes.register(Arc::new(OutputNode));
        let runner = WorkflowRunner::new(
            store.clone(),
            Arc::new(WorkflowRegistry::new(store.clone())),
            Arc::new(GraphExecutor::new(nodes, EngineLimits::default())),
            Arc::new(CollectingEventSink::default()),
        );
        (runner, store)
    }

    fn echo() -> Workflow {
        Workflow {
            id: "echo".into(),
            name: "echo".into(),
            graph: WorkflowGraph {
                nodes: vec![
                    Node::new("in", NodeKind::Input, json!({})),
                    Node::new("out", NodeKind::Output, json!({})),
                ],
                edges: vec![Edge::new("in", "out")],
            },
        }
    }

    #[tokio::test]
    async fn completed_run_is_persisted_with_output() {
        let (runner, store) = runner_with(echo()).await;
        let record = runner
            .run("echo", RunRequest::new().with_input("input", json!("hi")))
            .await
            .unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.output, Some(json!("hi")));

        let stored = store.get_run(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert!(stored.finished_at.is_some());
        assert_eq!(runner.active_run_count(), 0);
    }

    #[tokio::test]
    async fn failed_run_names_first_failing_node() {
        let (runner, _) = runner_with(echo()).await;
        let record = runner.run("echo", RunRequest::new()).await.unwrap();
        assert_eq!(record.status, RunStatus::Failed);
        assert_eq!(record.failed_node_id.as_deref(), Some("in"));
    }

    #[tokio::test]
    async fn cancel_after_finish_does_not_clobber_result() {
        let (runner, store) = runner_with(echo()).await;
        let record = runner
            .run("echo", RunRequest::new().with_input("input", json!(1)))
            .await
            .unwrap();
        assert!(!runner.cancel(&record.id).await.unwrap());
        let stored = store.get_run(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn unknown_workflow_is_rejected_before_recording() {
        let (runner, _) = runner_with(echo()).await;
        assert!(matches!(
            runner.start("missing", RunRequest::new()).await,
            Err(EngineError::WorkflowNotFound(_))
        ));
    }
}
