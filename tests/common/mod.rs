//! Shared fixtures for the integration tests

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use axum::Router;
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use wireflow::runtime::backend::UnconfiguredModelBackend;
use wireflow::runtime::events::CollectingEventSink;
use wireflow::runtime::{EngineLimits, GraphExecutor, NodeRegistry, RunLauncher, WorkflowRunner};
use wireflow::store::{MemoryStore, RunRecord, Store};
use wireflow::trigger::{TriggerManager, TriggerSettings, WebhookListener};
use wireflow::workflow::WorkflowRegistry;
use wireflow::{Edge, Node, Workflow, WorkflowGraph};

/// Listener that never binds a socket and counts lifecycle calls
#[derive(Default)]
pub struct CountingListener {
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
}

impl CountingListener {
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl WebhookListener for CountingListener {
    async fn start(&self, _app: Router) -> Result<SocketAddr> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(SocketAddr::from(([127, 0, 0, 1], 9876)))
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub registry: Arc<WorkflowRegistry>,
    pub runner: Arc<WorkflowRunner>,
    pub triggers: Arc<TriggerManager>,
    pub listener: Arc<CountingListener>,
    pub events: Arc<CollectingEventSink>,
}

pub fn harness() -> Harness {
    harness_with(EngineLimits::default())
}

pub fn harness_with(limits: EngineLimits) -> Harness {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let registry = Arc::new(WorkflowRegistry::new(Arc::clone(&store)));
    let nodes = NodeRegistry::with_defaults(Arc::new(UnconfiguredModelBackend), Arc::clone(&registry), 5);
    let executor = Arc::new(GraphExecutor::new(nodes, limits));
    let events = Arc::new(CollectingEventSink::default());
    let runner = Arc::new(WorkflowRunner::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        executor,
        events.clone(),
    ));
    let listener = Arc::new(CountingListener::default());
    let triggers = Arc::new(TriggerManager::new(
        Arc::clone(&store),
        Arc::clone(&registry),
        Arc::clone(&runner) as Arc<dyn RunLauncher>,
        listener.clone(),
        TriggerSettings {
            webhook_timeout_secs: 5,
            ..TriggerSettings::default()
        },
    ));
    Harness {
        store,
        registry,
        runner,
        triggers,
        listener,
        events,
    }
}

impl Harness {
    /// Persist a workflow and load its plan
    pub async fn save(&self, id: &str, nodes: Vec<Node>, edges: Vec<Edge>) {
        let workflow = Workflow {
            id: id.to_string(),
            name: id.to_string(),
            graph: WorkflowGraph { nodes, edges },
        };
        self.store.save_workflow(&workflow).await.unwrap();
        self.registry.reload_workflow(id).await.unwrap();
    }

    /// Poll until a run reaches a terminal status
    pub async fn finished_run(&self, run_id: &str) -> RunRecord {
        for _ in 0..200 {
            if let Some(run) = self.store.get_run(run_id).await.unwrap() {
                if run.status.is_terminal() {
                    return run;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("run {} did not finish", run_id);
    }
}

pub fn inputs(pairs: &[(&str, Value)]) -> serde_json::Map<String, Value> {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}
