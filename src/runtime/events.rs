/// Run lifecycle events
///
/// The engine is the only producer of envelopes: node executors return values and
/// the engine wraps every event with the same id/timestamp/sequence/cost envelope.
/// Sinks decide where events go (logs, a broadcast channel for UI streams, tests).

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Mutex,
};
use tokio::sync::broadcast;

pub const WORKFLOW_STARTED: &str = "workflow.started";
pub const WORKFLOW_COMPLETED: &str = "workflow.completed";
pub const WORKFLOW_FAILED: &str = "workflow.failed";
pub const WORKFLOW_CANCELLED: &str = "workflow.cancelled";
pub const NODE_STARTED: &str = "workflow.node.started";
pub const NODE_COMPLETED: &str = "workflow.node.completed";
pub const NODE_ERROR: &str = "workflow.node.error";
pub const NODE_SKIPPED: &str = "workflow.node.skipped";

/// Canonical event envelope
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_kind: String,
    pub sequence_number: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub run_id: String,
    pub workflow_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    pub payload: Value,
}

/// Destination for lifecycle events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: EventEnvelope);
}

/// Writes events to the tracing subscriber
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn emit(&self, event: EventEnvelope) {
        if event.event_type == NODE_ERROR || event.event_type == WORKFLOW_FAILED {
            tracing::warn!("📣 {} #{} run={} {}", event.event_type, event.sequence_number, event.run_id, event.payload);
        } else {
            tracing::debug!("📣 {} #{} run={} {}", event.event_type, event.sequence_number, event.run_id, event.payload);
        }
    }
}

/// Fans events out to subscribers (UI event streams)
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<EventEnvelope>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn emit(&self, event: EventEnvelope) {
        // no subscribers is fine
        let _ = self.sender.send(event);
    }
}

/// Forwards each event to several sinks
pub struct FanoutEventSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutEventSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self {
        Self { sinks }
    }
}

impl EventSink for FanoutEventSink {
    fn emit(&self, event: EventEnvelope) {
        for sink in &self.sinks {
            sink.emit(event.clone());
        }
    }
}

/// Keeps every event in memory
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: Mutex<Vec<EventEnvelope>>,
}

impl CollectingEventSink {
    pub fn events(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn of_type(&self, event_type: &str) -> Vec<EventEnvelope> {
        self.events().into_iter().filter(|e| e.event_type == event_type).collect()
    }
}

impl EventSink for CollectingEventSink {
    fn emit(&self, event: EventEnvelope) {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).push(event);
    }
}

/// Per-run envelope builder with a monotonically increasing sequence number
pub struct RunEvents {
    sink: Arc<dyn EventSink>,
    run_id: String,
    workflow_id: String,
    sequence: AtomicU64,
}

impl RunEvents {
    pub fn new(sink: Arc<dyn EventSink>, run_id: &str, workflow_id: &str) -> Self {
        Self {
            sink,
            run_id: run_id.to_string(),
            workflow_id: workflow_id.to_string(),
            sequence: AtomicU64::new(0),
        }
    }

    pub fn emit(&self, event_type: &str, payload: Value, cost_usd: Option<f64>) {
        let sequence_number = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        self.sink.emit(EventEnvelope {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            source_kind: "engine".to_string(),
            sequence_number,
            event_type: event_type.to_string(),
            run_id: self.run_id.clone(),
            workflow_id: self.workflow_id.clone(),
            cost_usd,
            payload,
        });
    }

    pub fn node_started(&self, node_id: &str, kind: &str, scope: &ScopeTag) {
        self.emit(NODE_STARTED, scope.decorate(json!({ "nodeId": node_id, "kind": kind })), None);
    }

    pub fn node_completed(&self, node_id: &str, preview: String, duration_ms: u64, cost_usd: Option<f64>, scope: &ScopeTag) {
        self.emit(
            NODE_COMPLETED,
            scope.decorate(json!({ "nodeId": node_id, "preview": preview, "durationMs": duration_ms })),
            cost_usd,
        );
    }

    pub fn node_error(&self, node_id: &str, message: &str, duration_ms: u64, scope: &ScopeTag) {
        self.emit(
            NODE_ERROR,
            scope.decorate(json!({ "nodeId": node_id, "error": message, "durationMs": duration_ms })),
            None,
        );
    }

    pub fn node_skipped(&self, node_id: &str, reason: &str, scope: &ScopeTag) {
        self.emit(NODE_SKIPPED, scope.decorate(json!({ "nodeId": node_id, "reason": reason })), None);
    }
}

/// Where a node executes: top level, or one iteration of a container body
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeTag {
    pub container_id: Option<String>,
    pub iteration: Option<usize>,
}

impl ScopeTag {
    pub fn top_level() -> Self {
        Self::default()
    }

    pub fn iteration(container_id: &str, iteration: usize) -> Self {
        Self {
            container_id: Some(container_id.to_string()),
            iteration: Some(iteration),
        }
    }

    fn decorate(&self, mut payload: Value) -> Value {
        if let (Some(container), Some(obj)) = (&self.container_id, payload.as_object_mut()) {
            obj.insert("containerId".into(), json!(container));
            obj.insert("iteration".into(), json!(self.iteration));
        }
        payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_sequence_increases_per_run() {
        let sink = Arc::new(CollectingEventSink::default());
        let events = RunEvents::new(sink.clone(), "run-1", "wf");
        events.node_started("a", "input", &ScopeTag::top_level());
        events.node_completed("a", "hi".into(), 3, Some(0.01), &ScopeTag::iteration("loop", 2));
        let all = sink.events();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].sequence_number, 1);
        assert_eq!(all[1].sequence_number, 2);
        assert_eq!(all[1].cost_usd, Some(0.01));
        assert_eq!(all[1].payload["containerId"], "loop");
        assert_eq!(all[1].payload["iteration"], 2);
        assert_ne!(all[0].event_id, all[1].event_id);
    }
}
