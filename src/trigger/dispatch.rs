/// Shared fire path for every trigger kind
///
/// Webhook requests, cron ticks and test fires all start runs here, so the fire
/// counter and the trigger log behave the same whatever caused the fire.

use crate::error::EngineError;
use crate::runtime::{RunLauncher, RunRequest, TriggerPayload};
use crate::store::{RunRecord, RunStatus, Store, TriggerLogEntry};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;

pub const LOG_FIRED: &str = "fired";
pub const LOG_COMPLETED: &str = "completed";
pub const LOG_FAILED: &str = "failed";
pub const LOG_TEST: &str = "test";

/// Whether a fire counts toward the trigger's statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireMode {
    Live,
    /// Logged as `test`, fire count untouched
    Test,
}

/// A run started by a trigger
pub struct Fired {
    pub run_id: String,
    /// Resolves once the run is terminal and the log entry is settled
    pub completion: JoinHandle<Option<RunRecord>>,
}

pub struct Dispatcher {
    launcher: Arc<dyn RunLauncher>,
    store: Arc<dyn Store>,
}

impl Dispatcher {
    pub fn new(launcher: Arc<dyn RunLauncher>, store: Arc<dyn Store>) -> Self {
        Self { launcher, store }
    }

    pub async fn fire(
        &self,
        trigger_id: &str,
        workflow_id: &str,
        payload: TriggerPayload,
        fired_at: DateTime<Utc>,
        mode: FireMode,
    ) -> Result<Fired, EngineError> {
        let request = RunRequest::new().triggered_by(Some(trigger_id.to_string()), payload);
        let mut entry = TriggerLogEntry {
            id: uuid::Uuid::new_v4().to_string(),
            trigger_id: trigger_id.to_string(),
            run_id: None,
            fired_at,
            status: match mode {
                FireMode::Live => LOG_FIRED.to_string(),
                FireMode::Test => LOG_TEST.to_string(),
            },
            message: None,
        };

        let handle = match self.launcher.launch(workflow_id, request).await {
            Ok(handle) => handle,
            Err(e) => {
                tracing::warn!("⚠️ Trigger {} could not start workflow {}: {}", trigger_id, workflow_id, e);
                entry.status = LOG_FAILED.to_string();
                entry.message = Some(e.to_string());
                if let Err(log_err) = self.store.append_trigger_log(&entry).await {
                    tracing::error!("❌ Failed to write trigger log for {}: {}", trigger_id, log_err);
                }
                return Err(e);
            }
        };

        if mode == FireMode::Live {
            if let Err(e) = self.store.record_trigger_fire(trigger_id, fired_at).await {
                tracing::error!("❌ Failed to record fire of trigger {}: {}", trigger_id, e);
            }
        }
        entry.run_id = Some(handle.run_id.clone());
        if let Err(e) = self.store.append_trigger_log(&entry).await {
            tracing::error!("❌ Failed to write trigger log for {}: {}", trigger_id, e);
        }
        tracing::info!("🔔 Trigger {} fired run {}", trigger_id, handle.run_id);

        let run_id = handle.run_id.clone();
        let store = Arc::clone(&self.store);
        let completion = tokio::spawn(async move {
            match handle.wait().await {
                Ok(record) => {
                    let (status, message) = settle(mode, &record);
                    if let Err(e) = store.update_trigger_log(&entry.id, status, message.as_deref()).await {
                        tracing::error!("❌ Failed to update trigger log {}: {}", entry.id, e);
                    }
                    Some(record)
                }
                Err(e) => {
                    tracing::error!("❌ Run for trigger {} ended abnormally: {}", entry.trigger_id, e);
                    if let Err(log_err) = store
                        .update_trigger_log(&entry.id, LOG_FAILED, Some(&e.to_string()))
                        .await
                    {
                        tracing::error!("❌ Failed to update trigger log {}: {}", entry.id, log_err);
                    }
                    None
                }
            }
        });

        Ok(Fired { run_id, completion })
    }
}

/// Final log status and message for a terminal run
fn settle(mode: FireMode, record: &RunRecord) -> (&'static str, Option<String>) {
    let status = match (mode, record.status) {
        (FireMode::Test, _) => LOG_TEST,
        (FireMode::Live, RunStatus::Completed) => LOG_COMPLETED,
        (FireMode::Live, _) => LOG_FAILED,
    };
    let message = match record.status {
        RunStatus::Completed => None,
        other => Some(record.error.clone().unwrap_or_else(|| other.as_str().to_string())),
    };
    (status, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: RunStatus, error: Option<&str>) -> RunRecord {
        let mut record = RunRecord::pending("r".into(), "wf".into(), None);
        record.status = status;
        record.error = error.map(str::to_string);
        record
    }

    #[test]
    fn live_fires_settle_by_run_status() {
        assert_eq!(settle(FireMode::Live, &record(RunStatus::Completed, None)), (LOG_COMPLETED, None));
        assert_eq!(
            settle(FireMode::Live, &record(RunStatus::Failed, Some("boom"))),
            (LOG_FAILED, Some("boom".to_string()))
        );
        assert_eq!(
            settle(FireMode::Live, &record(RunStatus::Cancelled, None)),
            (LOG_FAILED, Some("cancelled".to_string()))
        );
    }

    #[test]
    fn test_fires_keep_their_status() {
        assert_eq!(settle(FireMode::Test, &record(RunStatus::Completed, None)), (LOG_TEST, None));
        assert_eq!(
            settle(FireMode::Test, &record(RunStatus::Failed, Some("boom"))).0,
            LOG_TEST
        );
    }
}
