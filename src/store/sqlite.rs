/// SQLite persistence for workflows, triggers, the trigger log and runs
///
/// Workflow definitions are stored as JSON documents; everything else is stored in
/// plain columns. Timestamps are RFC 3339 text. The schema is created on connect.

use super::{RunRecord, RunStatus, RunUpdate, Store, Trigger, TriggerKind, TriggerLogEntry, WorkflowSummary};
use crate::workflow::types::Workflow;
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow},
    Row,
};
use std::path::Path;

/// SQLite-backed store
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflows (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        definition JSON NOT NULL,
        created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP,
        updated_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS triggers (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        kind TEXT NOT NULL,
        config JSON NOT NULL,
        armed INTEGER NOT NULL DEFAULT 0,
        last_fired TEXT,
        fire_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_triggers_workflow ON triggers(workflow_id)",
    r#"
    CREATE TABLE IF NOT EXISTS trigger_log (
        id TEXT PRIMARY KEY,
        trigger_id TEXT NOT NULL,
        run_id TEXT,
        fired_at TEXT NOT NULL,
        status TEXT NOT NULL,
        message TEXT
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_trigger_log_trigger ON trigger_log(trigger_id, fired_at)",
    r#"
    CREATE TABLE IF NOT EXISTS runs (
        id TEXT PRIMARY KEY,
        workflow_id TEXT NOT NULL,
        trigger_id TEXT,
        status TEXT NOT NULL,
        output JSON,
        error TEXT,
        failed_node_id TEXT,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        duration_ms INTEGER
    )
    "#,
];

impl SqliteStore {
    /// Open (creating if missing) the database file at `path`
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePool::connect_with(options).await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Private in-memory database; one connection so every query sees the same data
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Create tables and indexes; safe to call repeatedly
    pub async fn init_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::debug!("🗄️ SQLite schema ready");
        Ok(())
    }
}

/// Fixed-width RFC 3339 so text ordering matches time ordering
fn ts(value: &DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}

fn trigger_from_row(row: &SqliteRow) -> Result<Trigger> {
    let kind: String = row.try_get("kind")?;
    let config: String = row.try_get("config")?;
    let armed: i64 = row.try_get("armed")?;
    let created_at: String = row.try_get("created_at")?;
    let updated_at: String = row.try_get("updated_at")?;
    Ok(Trigger {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        kind: TriggerKind::parse(&kind)?,
        config: serde_json::from_str(&config)?,
        armed: armed != 0,
        last_fired: parse_opt_ts(row.try_get("last_fired")?)?,
        fire_count: row.try_get("fire_count")?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn log_from_row(row: &SqliteRow) -> Result<TriggerLogEntry> {
    let fired_at: String = row.try_get("fired_at")?;
    Ok(TriggerLogEntry {
        id: row.try_get("id")?,
        trigger_id: row.try_get("trigger_id")?,
        run_id: row.try_get("run_id")?,
        fired_at: parse_ts(&fired_at)?,
        status: row.try_get("status")?,
        message: row.try_get("message")?,
    })
}

fn run_from_row(row: &SqliteRow) -> Result<RunRecord> {
    let status: String = row.try_get("status")?;
    let output: Option<String> = row.try_get("output")?;
    let started_at: String = row.try_get("started_at")?;
    Ok(RunRecord {
        id: row.try_get("id")?,
        workflow_id: row.try_get("workflow_id")?,
        trigger_id: row.try_get("trigger_id")?,
        status: RunStatus::parse(&status)?,
        output: output.as_deref().map(serde_json::from_str).transpose()?,
        error: row.try_get("error")?,
        failed_node_id: row.try_get("failed_node_id")?,
        started_at: parse_ts(&started_at)?,
        finished_at: parse_opt_ts(row.try_get("finished_at")?)?,
        duration_ms: row.try_get("duration_ms")?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn save_workflow(&self, workflow: &Workflow) -> Result<()> {
        let definition_json = serde_json::to_string(workflow)?;
        sqlx::query(
            r#"
            INSERT INTO workflows (id, name, definition, updated_at)
            VALUES (?, ?, ?, CURRENT_TIMESTAMP)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                definition = excluded.definition,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(&workflow.id)
        .bind(&workflow.name)
        .bind(&definition_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_workflow(&self, id: &str) -> Result<Option<Workflow>> {
        let row = sqlx::query("SELECT definition FROM workflows WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let definition_json: String = row.try_get("definition")?;
                Ok(Some(serde_json::from_str(&definition_json)?))
            }
            None => Ok(None),
        }
    }

    async fn list_workflows(&self) -> Result<Vec<WorkflowSummary>> {
        let rows = sqlx::query("SELECT id, name, updated_at FROM workflows ORDER BY updated_at DESC")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| {
                Ok(WorkflowSummary {
                    id: row.try_get("id")?,
                    name: row.try_get("name")?,
                    updated_at: row.try_get("updated_at")?,
                })
            })
            .collect()
    }

    async fn delete_workflow(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workflows WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_trigger(&self, trigger: &Trigger) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO triggers (id, workflow_id, kind, config, armed, last_fired, fire_count, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                workflow_id = excluded.workflow_id,
                kind = excluded.kind,
                config = excluded.config,
                armed = excluded.armed,
                last_fired = excluded.last_fired,
                fire_count = excluded.fire_count,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&trigger.id)
        .bind(&trigger.workflow_id)
        .bind(trigger.kind.as_str())
        .bind(serde_json::to_string(&trigger.config)?)
        .bind(trigger.armed as i64)
        .bind(trigger.last_fired.as_ref().map(ts))
        .bind(trigger.fire_count)
        .bind(ts(&trigger.created_at))
        .bind(ts(&trigger.updated_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_trigger(&self, id: &str) -> Result<Option<Trigger>> {
        let row = sqlx::query("SELECT * FROM triggers WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trigger_from_row).transpose()
    }

    async fn list_triggers(&self, workflow_id: Option<&str>) -> Result<Vec<Trigger>> {
        let rows = match workflow_id {
            Some(workflow_id) => {
                sqlx::query("SELECT * FROM triggers WHERE workflow_id = ? ORDER BY created_at")
                    .bind(workflow_id)
                    .fetch_all(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("SELECT * FROM triggers ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(trigger_from_row).collect()
    }

    async fn delete_trigger(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM triggers WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn set_trigger_armed(&self, id: &str, armed: bool) -> Result<()> {
        sqlx::query("UPDATE triggers SET armed = ?, updated_at = ? WHERE id = ?")
            .bind(armed as i64)
            .bind(ts(&Utc::now()))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn record_trigger_fire(&self, id: &str, fired_at: DateTime<Utc>) -> Result<()> {
        let stamp = ts(&fired_at);
        // fixed-width UTC stamps compare in time order as text
        sqlx::query(
            "UPDATE triggers SET fire_count = fire_count + 1, \
             last_fired = CASE WHEN last_fired IS NULL OR last_fired < ? THEN ? ELSE last_fired END \
             WHERE id = ?",
        )
        .bind(&stamp)
        .bind(&stamp)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn append_trigger_log(&self, entry: &TriggerLogEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO trigger_log (id, trigger_id, run_id, fired_at, status, message) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&entry.id)
        .bind(&entry.trigger_id)
        .bind(&entry.run_id)
        .bind(ts(&entry.fired_at))
        .bind(&entry.status)
        .bind(&entry.message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn update_trigger_log(&self, id: &str, status: &str, message: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE trigger_log SET status = ?, message = COALESCE(?, message) WHERE id = ?")
            .bind(status)
            .bind(message)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn list_trigger_log(&self, trigger_id: &str, limit: u32) -> Result<Vec<TriggerLogEntry>> {
        let rows = sqlx::query(
            "SELECT * FROM trigger_log WHERE trigger_id = ? ORDER BY fired_at DESC, rowid DESC LIMIT ?",
        )
        .bind(trigger_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    async fn create_run(&self, run: &RunRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runs (id, workflow_id, trigger_id, status, output, error, failed_node_id, started_at, finished_at, duration_ms)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run.id)
        .bind(&run.workflow_id)
        .bind(&run.trigger_id)
        .bind(run.status.as_str())
        .bind(run.output.as_ref().map(serde_json::to_string).transpose()?)
        .bind(&run.error)
        .bind(&run.failed_node_id)
        .bind(ts(&run.started_at))
        .bind(run.finished_at.as_ref().map(ts))
        .bind(run.duration_ms)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_run(&self, id: &str) -> Result<Option<RunRecord>> {
        let row = sqlx::query("SELECT * FROM runs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(run_from_row).transpose()
    }

    async fn transition_run(&self, id: &str, from: &[RunStatus], to: RunStatus, update: RunUpdate) -> Result<bool> {
        if from.is_empty() {
            return Ok(false);
        }
        let placeholders = vec!["?"; from.len()].join(", ");
        let sql = format!(
            r#"
            UPDATE runs SET
                status = ?,
                output = COALESCE(?, output),
                error = COALESCE(?, error),
                failed_node_id = COALESCE(?, failed_node_id),
                finished_at = COALESCE(?, finished_at),
                duration_ms = COALESCE(?, duration_ms)
            WHERE id = ? AND status IN ({placeholders})
            "#
        );
        let mut query = sqlx::query(&sql)
            .bind(to.as_str())
            .bind(update.output.as_ref().map(serde_json::to_string).transpose()?)
            .bind(update.error)
            .bind(update.failed_node_id)
            .bind(update.finished_at.as_ref().map(ts))
            .bind(update.duration_ms)
            .bind(id);
        for status in from {
            query = query.bind(status.as_str());
        }
        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::types::WorkflowGraph;
    use serde_json::json;

    fn trigger(id: &str) -> Trigger {
        let now = Utc::now();
        Trigger {
            id: id.into(),
            workflow_id: "wf".into(),
            kind: TriggerKind::Cron,
            config: json!({"expression": "*/5 * * * *"}),
            armed: false,
            last_fired: None,
            fire_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn workflow_round_trip() {
        let store = SqliteStore::in_memory().await.unwrap();
        let wf = Workflow {
            id: "wf".into(),
            name: "demo".into(),
            graph: WorkflowGraph::default(),
        };
        store.save_workflow(&wf).await.unwrap();
        assert_eq!(store.get_workflow("wf").await.unwrap().unwrap().name, "demo");
        assert_eq!(store.list_workflows().await.unwrap().len(), 1);
        assert!(store.delete_workflow("wf").await.unwrap());
        assert!(store.get_workflow("wf").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn fire_counter_and_last_fired_persist() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save_trigger(&trigger("t1")).await.unwrap();
        let fired = Utc::now();
        store.record_trigger_fire("t1", fired).await.unwrap();
        store.record_trigger_fire("t1", fired).await.unwrap();
        store.set_trigger_armed("t1", true).await.unwrap();
        let t = store.get_trigger("t1").await.unwrap().unwrap();
        assert_eq!(t.fire_count, 2);
        assert!(t.armed);
        assert_eq!(t.last_fired.map(|d| d.timestamp()), Some(fired.timestamp()));
    }

    #[tokio::test]
    async fn late_fire_does_not_move_last_fired_back() {
        let store = SqliteStore::in_memory().await.unwrap();
        store.save_trigger(&trigger("t1")).await.unwrap();
        let live = Utc::now();
        let replayed = live - chrono::Duration::minutes(5);
        store.record_trigger_fire("t1", live).await.unwrap();
        store.record_trigger_fire("t1", replayed).await.unwrap();
        let t = store.get_trigger("t1").await.unwrap().unwrap();
        assert_eq!(t.fire_count, 2);
        assert_eq!(t.last_fired.map(|d| d.timestamp()), Some(live.timestamp()));
    }

    #[tokio::test]
    async fn cancelled_run_is_not_overwritten_by_late_completion() {
        let store = SqliteStore::in_memory().await.unwrap();
        store
            .create_run(&RunRecord::pending("r1".into(), "wf".into(), None))
            .await
            .unwrap();
        assert!(store
            .transition_run("r1", &RunStatus::ACTIVE, RunStatus::Cancelled, RunUpdate::default())
            .await
            .unwrap());
        let late = RunUpdate {
            output: Some(json!("done")),
            ..Default::default()
        };
        assert!(!store
            .transition_run("r1", &RunStatus::ACTIVE, RunStatus::Completed, late)
            .await
            .unwrap());
        let run = store.get_run("r1").await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert!(run.output.is_none());
    }

    #[tokio::test]
    async fn trigger_log_is_newest_first_and_limited() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(dir.path().join("log.db")).await.unwrap();
        let base = Utc::now();
        for i in 0..5 {
            store
                .append_trigger_log(&TriggerLogEntry {
                    id: format!("l{i}"),
                    trigger_id: "t1".into(),
                    run_id: None,
                    fired_at: base + chrono::Duration::seconds(i),
                    status: "fired".into(),
                    message: None,
                })
                .await
                .unwrap();
        }
        store.update_trigger_log("l4", "completed", None).await.unwrap();
        let page = store.list_trigger_log("t1", 3).await.unwrap();
        assert_eq!(page.len(), 3);
        assert_eq!(page[0].id, "l4");
        assert_eq!(page[0].status, "completed");
    }
}
