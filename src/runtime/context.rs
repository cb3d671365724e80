/// Per-run execution context
///
/// `RunRequest` is what a caller (manual run, webhook, cron) asks for; `RunContext`
/// is the read-only state every node invocation of that run shares.

use crate::runtime::events::{EventSink, RunEvents};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// The stimulus that started a run
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TriggerPayload {
    Webhook {
        body: Value,
        headers: Map<String, Value>,
        query: Map<String, Value>,
        method: String,
        path: String,
    },
    Cron {
        timestamp: DateTime<Utc>,
        iteration: i64,
        schedule: String,
        input: Value,
        catch_up: bool,
    },
}

/// Inputs for one workflow run
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub inputs: Map<String, Value>,
    pub trigger: Option<TriggerPayload>,
    pub trigger_id: Option<String>,
}

impl RunRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, key: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(key.into(), value);
        self
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs.extend(inputs);
        self
    }

    /// Attach a trigger payload; its primary value is also exposed as run input `input`
    pub fn triggered_by(mut self, trigger_id: Option<String>, payload: TriggerPayload) -> Self {
        let primary = match &payload {
            TriggerPayload::Webhook { body, .. } => body.clone(),
            TriggerPayload::Cron { input, .. } => input.clone(),
        };
        self.inputs.entry("input").or_insert(primary);
        self.trigger = Some(payload);
        self.trigger_id = trigger_id;
        self
    }
}

/// Shared, read-only state of one run
pub struct RunContext {
    pub run_id: String,
    pub workflow_id: String,
    pub inputs: Map<String, Value>,
    pub trigger: Option<TriggerPayload>,
    pub events: RunEvents,
    pub cancel: CancellationToken,
    /// Workflow ids of enclosing subworkflow calls
    pub call_stack: Vec<String>,
    sink: Arc<dyn EventSink>,
}

impl RunContext {
    pub fn new(
        run_id: impl Into<String>,
        workflow_id: impl Into<String>,
        request: RunRequest,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Self {
        let run_id = run_id.into();
        let workflow_id = workflow_id.into();
        Self {
            events: RunEvents::new(Arc::clone(&sink), &run_id, &workflow_id),
            run_id,
            workflow_id,
            inputs: request.inputs,
            trigger: request.trigger,
            cancel,
            call_stack: Vec::new(),
            sink,
        }
    }

    /// Context for a nested workflow call, sharing the sink and cancellation
    pub fn child(&self, workflow_id: &str, inputs: Map<String, Value>) -> Self {
        let mut child = RunContext::new(
            format!("{}/{}", self.run_id, uuid::Uuid::new_v4()),
            workflow_id,
            RunRequest::new().with_inputs(inputs),
            Arc::clone(&self.sink),
            self.cancel.child_token(),
        );
        child.call_stack = self.call_stack.clone();
        child.call_stack.push(self.workflow_id.clone());
        child
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
