/// Hot-reload registry of compiled workflows using ArcSwap
///
/// Compiling (validation, container extraction, topological sort) happens once per
/// stored version. Runs read the registry lock-free; saving or deleting a workflow
/// swaps in a new map so in-flight runs keep the plan they started with.

use crate::error::EngineError;
use crate::store::Store;
use crate::workflow::types::Workflow;
use crate::workflow::validation::{compile, ExecutionPlan};
use anyhow::Result;
use arc_swap::ArcSwap;
use std::{collections::HashMap, sync::Arc};

/// Workflow definition with its execution plan
#[derive(Debug, Clone)]
pub struct CompiledWorkflow {
    pub workflow: Workflow,
    pub plan: ExecutionPlan,
}

/// Lock-free cache of compiled workflows keyed by workflow id
pub struct WorkflowRegistry {
    plans: ArcSwap<HashMap<String, Arc<CompiledWorkflow>>>,
    store: Arc<dyn Store>,
}

impl WorkflowRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            plans: ArcSwap::new(Arc::new(HashMap::new())),
            store,
        }
    }

    /// Compile every stored workflow; invalid ones are logged and left out
    pub async fn init_from_storage(&self) -> Result<()> {
        let mut compiled = HashMap::new();
        for summary in self.store.list_workflows().await? {
            let Some(workflow) = self.store.get_workflow(&summary.id).await? else { continue };
            match compile(&workflow) {
                Ok(plan) => {
                    compiled.insert(summary.id.clone(), Arc::new(CompiledWorkflow { workflow, plan }));
                }
                Err(e) => tracing::warn!("⚠️ Workflow {} does not validate: {}", summary.id, e),
            }
        }
        self.plans.store(Arc::new(compiled));
        tracing::info!("📊 Initialized workflow registry with {} workflows", self.plans.load().len());
        Ok(())
    }

    /// Compiled workflow by id, loading and compiling it on a cache miss
    pub async fn get(&self, workflow_id: &str) -> Result<Arc<CompiledWorkflow>, EngineError> {
        if let Some(compiled) = self.plans.load().get(workflow_id) {
            return Ok(Arc::clone(compiled));
        }
        self.reload_workflow(workflow_id).await
    }

    /// Re-read a workflow from storage and swap in its new plan
    pub async fn reload_workflow(&self, workflow_id: &str) -> Result<Arc<CompiledWorkflow>, EngineError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or_else(|| EngineError::WorkflowNotFound(workflow_id.to_string()))?;
        let plan = compile(&workflow)?;
        for warning in &plan.warnings {
            tracing::debug!("⚠️ {}: {}", workflow_id, warning);
        }
        let compiled = Arc::new(CompiledWorkflow { workflow, plan });
        self.plans.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.insert(workflow_id.to_string(), Arc::clone(&compiled));
            next
        });
        tracing::info!("🔥 Hot-reloaded workflow: {}", workflow_id);
        Ok(compiled)
    }

    /// Drop a workflow's cached plan
    pub fn remove_workflow(&self, workflow_id: &str) {
        if self.plans.load().contains_key(workflow_id) {
            self.plans.rcu(|current| {
                let mut next = HashMap::clone(current);
                next.remove(workflow_id);
                next
            });
            tracing::info!("🗑️ Removed workflow from registry: {}", workflow_id);
        }
    }

    pub fn list_workflow_ids(&self) -> Vec<String> {
        self.plans.load().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::workflow::types::{Edge, Node, NodeKind, WorkflowGraph};
    use serde_json::json;

    fn workflow(name: &str) -> Workflow {
        Workflow {
            id: "wf".into(),
            name: name.into(),
            graph: WorkflowGraph {
                nodes: vec![
                    Node::new("in", NodeKind::Input, json!({"value": "x"})),
                    Node::new("out", NodeKind::Output, json!({})),
                ],
                edges: vec![Edge::new("in", "out")],
            },
        }
    }

    #[tokio::test]
    async fn caches_until_reloaded() {
        let store = Arc::new(MemoryStore::new());
        store.save_workflow(&workflow("v1")).await.unwrap();
        let registry = WorkflowRegistry::new(store.clone());

        assert_eq!(registry.get("wf").await.unwrap().workflow.name, "v1");
        store.save_workflow(&workflow("v2")).await.unwrap();
        assert_eq!(registry.get("wf").await.unwrap().workflow.name, "v1");
        registry.reload_workflow("wf").await.unwrap();
        assert_eq!(registry.get("wf").await.unwrap().workflow.name, "v2");

        registry.remove_workflow("wf");
        assert!(registry.list_workflow_ids().is_empty());
    }

    #[tokio::test]
    async fn missing_workflow_is_reported() {
        let registry = WorkflowRegistry::new(Arc::new(MemoryStore::new()));
        assert!(matches!(registry.get("nope").await, Err(EngineError::WorkflowNotFound(_))));
    }
}
