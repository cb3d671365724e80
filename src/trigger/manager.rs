/// Trigger Manager
///
/// Process-wide owner of every armed trigger and of the shared webhook listener.
/// Commands on one trigger are serialized by a per-id lock; commands on different
/// triggers run concurrently. A second lock per (workflow, kind) keeps at most one
/// armed trigger of each kind per workflow.

use crate::error::{EngineError, TriggerError};
use crate::runtime::{RunLauncher, TriggerPayload};
use crate::store::{log_limit, RunRecord, Store, Trigger, TriggerKind, TriggerLogEntry};
use crate::trigger::config::{normalize_path, CronConfig, WebhookConfig};
use crate::trigger::cron::CronScheduler;
use crate::trigger::dispatch::{Dispatcher, FireMode};
use crate::trigger::rate_limit::RateLimiter;
use crate::trigger::webhook::{self, ListenerStatus, RouteTable, WebhookListener, WebhookRoute, WebhookState};
use crate::workflow::registry::WorkflowRegistry;
use axum::Router;
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Knobs the manager takes from `Config`
#[derive(Debug, Clone)]
pub struct TriggerSettings {
    pub webhook_base: String,
    pub webhook_rate_per_minute: u32,
    pub webhook_timeout_secs: u64,
    pub cron_max_catch_up: usize,
}

impl Default for TriggerSettings {
    fn default() -> Self {
        Self {
            webhook_base: "/hook".to_string(),
            webhook_rate_per_minute: 60,
            webhook_timeout_secs: 30,
            cron_max_catch_up: 10,
        }
    }
}

/// Partial update of a trigger
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TriggerPatch {
    pub config: Option<Value>,
    pub armed: Option<bool>,
}

/// Named async locks created on demand
#[derive(Default)]
struct KeyedLocks {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    fn forget(&self, key: &str) {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).remove(key);
    }
}

pub struct TriggerManager {
    store: Arc<dyn Store>,
    workflows: Arc<WorkflowRegistry>,
    dispatcher: Arc<Dispatcher>,
    routes: RouteTable,
    limiter: RateLimiter,
    cron: Arc<CronScheduler>,
    listener: Arc<dyn WebhookListener>,
    /// Bound port while the listener runs. Held across start/stop so the check and
    /// the action are one step.
    listener_port: Mutex<Option<u16>>,
    settings: TriggerSettings,
    trigger_locks: KeyedLocks,
    scope_locks: KeyedLocks,
}

impl TriggerManager {
    pub fn new(
        store: Arc<dyn Store>,
        workflows: Arc<WorkflowRegistry>,
        launcher: Arc<dyn RunLauncher>,
        listener: Arc<dyn WebhookListener>,
        settings: TriggerSettings,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(launcher, Arc::clone(&store)));
        let cron = Arc::new(CronScheduler::new(Arc::clone(&dispatcher), settings.cron_max_catch_up));
        Self {
            store,
            workflows,
            dispatcher,
            routes: RouteTable::new(),
            limiter: RateLimiter::new(settings.webhook_rate_per_minute),
            cron,
            listener,
            listener_port: Mutex::new(None),
            settings,
            trigger_locks: KeyedLocks::default(),
            scope_locks: KeyedLocks::default(),
        }
    }

    pub fn cron(&self) -> &Arc<CronScheduler> {
        &self.cron
    }

    /// Router served by the webhook listener
    pub fn webhook_router(&self) -> Router {
        webhook::router(
            WebhookState {
                routes: self.routes.clone(),
                limiter: self.limiter.clone(),
                dispatcher: Arc::clone(&self.dispatcher),
            },
            &self.settings.webhook_base,
        )
    }

    pub async fn create(&self, workflow_id: &str, kind: TriggerKind, config: Value) -> Result<Trigger, TriggerError> {
        if self.store.get_workflow(workflow_id).await?.is_none() {
            return Err(EngineError::WorkflowNotFound(workflow_id.to_string()).into());
        }
        let config = match config {
            Value::Null => Value::Object(Map::new()),
            Value::Object(map) => Value::Object(map),
            _ => return Err(TriggerError::InvalidConfig("config must be a JSON object".into())),
        };
        let now = Utc::now();
        let trigger = Trigger {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            kind,
            config,
            armed: false,
            last_fired: None,
            fire_count: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.save_trigger(&trigger).await?;
        tracing::info!("➕ Created {} trigger {} for workflow {}", kind.as_str(), trigger.id, workflow_id);
        Ok(trigger)
    }

    pub async fn get(&self, trigger_id: &str) -> Result<Trigger, TriggerError> {
        self.store
            .get_trigger(trigger_id)
            .await?
            .ok_or_else(|| TriggerError::NotFound(trigger_id.to_string()))
    }

    pub async fn list(&self, workflow_id: Option<&str>) -> Result<Vec<Trigger>, TriggerError> {
        Ok(self.store.list_triggers(workflow_id).await?)
    }

    pub async fn log(&self, trigger_id: &str, limit: Option<u32>) -> Result<Vec<TriggerLogEntry>, TriggerError> {
        self.get(trigger_id).await?;
        Ok(self.store.list_trigger_log(trigger_id, log_limit(limit)).await?)
    }

    /// Change config and/or armed state. An armed trigger is re-registered with the new config.
    pub async fn update(&self, trigger_id: &str, patch: TriggerPatch) -> Result<Trigger, TriggerError> {
        let lock = self.trigger_locks.get(trigger_id);
        let _guard = lock.lock().await;

        let mut trigger = self.get(trigger_id).await?;
        let want_armed = patch.armed.unwrap_or(trigger.armed);

        if let Some(config) = patch.config {
            if !config.is_object() {
                return Err(TriggerError::InvalidConfig("config must be a JSON object".into()));
            }
            if trigger.armed {
                trigger = self.disarm_locked(trigger_id).await?;
            }
            trigger.config = config;
            trigger.updated_at = Utc::now();
            self.store.save_trigger(&trigger).await?;
        }

        match (trigger.armed, want_armed) {
            (false, true) => self.arm_locked(trigger_id).await,
            (true, false) => self.disarm_locked(trigger_id).await,
            _ => Ok(trigger),
        }
    }

    /// Delete a disarmed trigger
    pub async fn delete(&self, trigger_id: &str) -> Result<(), TriggerError> {
        let lock = self.trigger_locks.get(trigger_id);
        {
            let _guard = lock.lock().await;
            let trigger = self.get(trigger_id).await?;
            if trigger.armed {
                return Err(TriggerError::StillArmed(trigger_id.to_string()));
            }
            self.store.delete_trigger(trigger_id).await?;
        }
        self.trigger_locks.forget(trigger_id);
        tracing::info!("🗑️ Deleted trigger {}", trigger_id);
        Ok(())
    }

    /// Register the trigger and persist `armed = true`. Arming an armed trigger is a no-op.
    pub async fn arm(&self, trigger_id: &str) -> Result<Trigger, TriggerError> {
        let lock = self.trigger_locks.get(trigger_id);
        let _guard = lock.lock().await;
        self.arm_locked(trigger_id).await
    }

    pub async fn disarm(&self, trigger_id: &str) -> Result<Trigger, TriggerError> {
        let lock = self.trigger_locks.get(trigger_id);
        let _guard = lock.lock().await;
        self.disarm_locked(trigger_id).await
    }

    async fn arm_locked(&self, trigger_id: &str) -> Result<Trigger, TriggerError> {
        let mut trigger = self.get(trigger_id).await?;
        if trigger.armed && self.is_registered(&trigger) {
            return Ok(trigger);
        }

        let scope = self
            .scope_locks
            .get(&format!("{}:{}", trigger.workflow_id, trigger.kind.as_str()));
        let _scope_guard = scope.lock().await;

        let siblings = self.store.list_triggers(Some(&trigger.workflow_id)).await?;
        if let Some(other) = siblings
            .iter()
            .find(|t| t.id != trigger.id && t.kind == trigger.kind && t.armed)
        {
            return Err(TriggerError::Conflict(format!(
                "workflow {} already has an armed {} trigger ({})",
                trigger.workflow_id,
                trigger.kind.as_str(),
                other.id
            )));
        }

        // surfaces missing or invalid workflows before anything is registered
        self.workflows.get(&trigger.workflow_id).await?;

        match trigger.kind {
            TriggerKind::Webhook => self.register_webhook(&trigger).await?,
            TriggerKind::Cron => {
                let config = CronConfig::parse(&trigger.config)?;
                self.cron.register(&trigger, config)?;
            }
        }

        if let Err(e) = self.store.set_trigger_armed(&trigger.id, true).await {
            self.deregister(&trigger).await;
            return Err(e.into());
        }
        trigger.armed = true;
        tracing::info!("🟢 Armed {} trigger {}", trigger.kind.as_str(), trigger.id);
        Ok(trigger)
    }

    async fn disarm_locked(&self, trigger_id: &str) -> Result<Trigger, TriggerError> {
        let mut trigger = self.get(trigger_id).await?;
        self.deregister(&trigger).await;
        if trigger.armed {
            self.store.set_trigger_armed(&trigger.id, false).await?;
            trigger.armed = false;
            tracing::info!("🔴 Disarmed {} trigger {}", trigger.kind.as_str(), trigger.id);
        }
        Ok(trigger)
    }

    fn is_registered(&self, trigger: &Trigger) -> bool {
        match trigger.kind {
            TriggerKind::Webhook => self.routes.contains_trigger(&trigger.id),
            TriggerKind::Cron => self.cron.is_registered(&trigger.id),
        }
    }

    async fn register_webhook(&self, trigger: &Trigger) -> Result<(), TriggerError> {
        let config = WebhookConfig::parse(&trigger.config, self.settings.webhook_timeout_secs)?;
        let path = config.path.clone();
        self.routes
            .insert(WebhookRoute {
                trigger_id: trigger.id.clone(),
                workflow_id: trigger.workflow_id.clone(),
                config,
            })
            .map_err(|owner| {
                TriggerError::Conflict(format!("webhook path '{}' is already used by trigger {}", path, owner))
            })?;

        if let Err(e) = self.ensure_listener().await {
            self.routes.remove_trigger(&trigger.id);
            return Err(e);
        }
        Ok(())
    }

    async fn deregister(&self, trigger: &Trigger) {
        match trigger.kind {
            TriggerKind::Webhook => {
                if let Some(route) = self.routes.remove_trigger(&trigger.id) {
                    self.limiter.remove(&route.config.path);
                }
                if let Err(e) = self.release_listener_if_idle().await {
                    tracing::error!("❌ Failed to stop webhook listener: {}", e);
                }
            }
            TriggerKind::Cron => {
                self.cron.unregister(&trigger.id);
            }
        }
    }

    /// Start the listener unless it already runs
    async fn ensure_listener(&self) -> Result<(), TriggerError> {
        let mut port = self.listener_port.lock().await;
        if port.is_some() {
            return Ok(());
        }
        let addr = self
            .listener
            .start(self.webhook_router())
            .await
            .map_err(|e| TriggerError::Listener(e.to_string()))?;
        *port = Some(addr.port());
        Ok(())
    }

    /// Stop the listener once no webhook route is left
    async fn release_listener_if_idle(&self) -> Result<(), TriggerError> {
        let mut port = self.listener_port.lock().await;
        if port.is_none() || !self.routes.is_empty() {
            return Ok(());
        }
        self.listener
            .stop()
            .await
            .map_err(|e| TriggerError::Listener(e.to_string()))?;
        *port = None;
        Ok(())
    }

    /// Fire a trigger by hand through the normal dispatch path and wait for the run.
    /// The fire count is left alone.
    pub async fn test_fire(&self, trigger_id: &str) -> Result<RunRecord, TriggerError> {
        let trigger = self.get(trigger_id).await?;
        let now = Utc::now();
        let payload = match trigger.kind {
            TriggerKind::Webhook => {
                let mut headers = Map::new();
                headers.insert("x-test".to_string(), json!("true"));
                TriggerPayload::Webhook {
                    body: json!({ "test": true, "triggerId": trigger.id }),
                    headers,
                    query: Map::new(),
                    method: "POST".to_string(),
                    path: trigger
                        .config
                        .get("path")
                        .and_then(Value::as_str)
                        .map(normalize_path)
                        .unwrap_or_default(),
                }
            }
            TriggerKind::Cron => TriggerPayload::Cron {
                timestamp: now,
                iteration: trigger.fire_count,
                schedule: trigger
                    .config
                    .get("expression")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                input: trigger.config.get("input").cloned().unwrap_or(Value::Null),
                catch_up: false,
            },
        };

        tracing::info!("🧪 Test-firing trigger {}", trigger.id);
        let fired = self
            .dispatcher
            .fire(&trigger.id, &trigger.workflow_id, payload, now, FireMode::Test)
            .await?;
        match fired.completion.await {
            Ok(Some(record)) => Ok(record),
            Ok(None) => Err(TriggerError::Storage(anyhow::anyhow!(
                "run {} did not report a result",
                fired.run_id
            ))),
            Err(e) => Err(TriggerError::Storage(anyhow::anyhow!("run {} task failed: {}", fired.run_id, e))),
        }
    }

    /// Re-arm every trigger persisted as armed. Triggers that no longer arm are
    /// logged and persisted as disarmed.
    pub async fn restore_armed(&self) -> Result<usize, TriggerError> {
        let armed: Vec<Trigger> = self
            .store
            .list_triggers(None)
            .await?
            .into_iter()
            .filter(|t| t.armed)
            .collect();

        let mut restored = 0;
        for trigger in armed {
            match self.arm(&trigger.id).await {
                Ok(_) => restored += 1,
                Err(e) => {
                    tracing::error!("❌ Could not restore trigger {}: {}", trigger.id, e);
                    if let Err(e) = self.store.set_trigger_armed(&trigger.id, false).await {
                        tracing::error!("❌ Failed to persist disarm of {}: {}", trigger.id, e);
                    }
                }
            }
        }
        tracing::info!("♻️ Restored {} armed trigger(s)", restored);
        Ok(restored)
    }

    pub async fn status(&self) -> ListenerStatus {
        let port = *self.listener_port.lock().await;
        ListenerStatus {
            running: port.is_some(),
            port,
            active_hooks: self.routes.len(),
        }
    }

    /// Stop the webhook listener regardless of armed routes
    pub async fn shutdown(&self) {
        let mut port = self.listener_port.lock().await;
        if port.take().is_some() {
            if let Err(e) = self.listener.stop().await {
                tracing::error!("❌ Failed to stop webhook listener: {}", e);
            }
        }
    }
}
