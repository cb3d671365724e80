/// In-process store backed by maps behind a tokio RwLock

use super::{RunRecord, RunStatus, RunUpdate, Store, Trigger, TriggerLogEntry, WorkflowSummary};
use crate::workflow::types::Workflow;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct Tables {
    workflows: HashMap<String, (Workflow, DateTime<Utc>)>,
    triggers: HashMap<String, Trigger>,
    trigger_log: Vec<TriggerLogEntry>,
    runs: HashMap<String, RunRecord>,
}

/// Non-durable `Store`; contents vanish with the process
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let mut tables = self.tables.write().await;
        tables
            .workflows
            .insert(workflow.id.clone(), (workflow.clone(), Utc::now()));
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        Ok(self.tables.read().await.workflows.get(id).map(|(wf, _)| wf.clone()))
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<_> = tables.workflows.values().collect();
        rows.sort_by(|a, b| b.1.cmp(&a.1));
        Ok(rows
            .into_iter()
            .map(|(wf, updated)| WorkflowSummary {
                id: wf.id.clone(),
                name: wf.name.clone(),
                updated_at: updated.to_rfc3339(),
            })
            .collect())
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        Ok(self.tables.write().await.workflows.remove(id).is_some())
    }

    async fn save_trigger(&self, trigger: &Trigger) -> Result<()> {
        self.tables
            .write()
            .await
            .triggers
            .insert(trigger.id.clone(), trigger.clone());
        Ok(())
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        Ok(self.tables.read().await.triggers.get(id).cloned())
    }

    async fn list_triggers(&self, workflow_id: Option<&str>) -> Result<Vec<Trigger>> {
        let tables = self.tables.read().await;
        let mut triggers: Vec<Trigger> = tables
            .triggers
            .values()
            .filter(|t| workflow_id.map_or(true, |w| t.workflow_id == w))
            .cloned()
            .collect();
        triggers.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(triggers)
    }

    async fn delete_trigger(&self, id: &str) -> Result<bool> {
        Ok(self.tables.write().await.triggers.remove(id).is_some())
    }

    async fn set_trigger_armed(&self, id: &str, armed: bool) -> Result<()> {
        if let Some(t) = self.tables.write().await.triggers.get_mut(id) {
            t.armed = armed;
            t.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn record_trigger_fire(&self, id: &str, fired_at: DateTime<Utc>) -> Result<()> {
        if let Some(t) = self.tables.write().await.triggers.get_mut(id) {
            t.fire_count += 1;
            t.last_fired = t.last_fired.max(Some(fired_at));
        }
        Ok(())
    }

    async fn append_trigger_log(&self, entry: &TriggerLogEntry) -> Result<()> {
        self.tables.write().await.trigger_log.push(entry.clone());
        Ok(())
    }

    async fn update_trigger_log(&self, id: &str, status: &str, message: Option<&str>) -> Result<()> {
        let mut tables = self.tables.write().await;
        if let Some(entry) = tables.trigger_log.iter_mut().find(|e| e.id == id) {
            entry.status = status.to_string();
            if let Some(message) = message {
                entry.message = Some(message.to_string());
            }
        }
        Ok(())
    }

    async fn list_trigger_log(&self, trigger_id: &str, limit: u32) -> Result<Vec<TriggerLogEntry>> {
        let tables = self.tables.read().await;
        // insertion order breaks ties between equal timestamps
        let mut entries: Vec<(usize, &TriggerLogEntry)> = tables
            .trigger_log
            .iter()
            .enumerate()
            .filter(|(_, e)| e.trigger_id == trigger_id)
            .collect();
        entries.sort_by(|a, b| b.1.fired_at.cmp(&a.1.fired_at).then_with(|| b.0.cmp(&a.0)));
        Ok(entries
            .into_iter()
            .take(limit as usize)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        self.tables.write().await.runs.insert(run.id.clone(), run.clone());
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        Ok(self.tables.read().await.runs.get(id).cloned())
    }

    async fn transition_run(&self, id: &str, from: &[RunStatus], to: RunStatus, update: RunUpdate) -> Result<bool> {
        let mut tables = self.tables.write().await;
        let Some(run) = tables.runs.get_mut(id) else {
            return Ok(false);
        };
        if !from.contains(&run.status) {
            return Ok(false);
        }
        run.status = to;
        if update.output.is_some() {
            run.output = update.output;
        }
        if update.error.is_some() {
            run.error = update.error;
        }
        if update.failed_node_id.is_some() {
            run.failed_node_id = update.failed_node_id;
        }
        if update.finished_at.is_some() {
            run.finished_at = update.finished_at;
        }
        if update.duration_ms.is_some() {
            run.duration_ms = update.duration_ms;
        }
        Ok(true)
    }
}
