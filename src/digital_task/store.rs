// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Digital-task persistence. The `digital_tasks` table is the source of
//! truth for task status: every state transition is a conditional SQL
//! `UPDATE ... WHERE status IN (...)` so the database itself enforces the
//! CAS guard, not just the in-process task handle.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::db::{epoch_ms, SqliteHandle};

pub const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS digital_tasks (
        task_id TEXT PRIMARY KEY,
        session_id TEXT NOT NULL,
        goal TEXT NOT NULL,
        status TEXT NOT NULL,
        steps_json TEXT NOT NULL DEFAULT '[]',
        result_json TEXT NOT NULL DEFAULT '{}',
        error TEXT,
        timeout_seconds INTEGER NOT NULL,
        push_context_json TEXT,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_digital_tasks_status ON digital_tasks(status);
"#];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    pub ts: i64,
    pub stage: String,
    pub status: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PushContext {
    pub device_id: Option<String>,
    pub session_id: Option<String>,
    #[serde(default)]
    pub notify: bool,
    #[serde(default)]
    pub speak: bool,
    #[serde(default)]
    pub interrupt_previous: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub task_id: String,
    pub session_id: String,
    pub goal: String,
    pub status: String,
    pub steps: Vec<TaskStep>,
    pub result: Value,
    pub error: Option<String>,
    pub timeout_seconds: i64,
    pub push_context: Option<PushContext>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

pub struct TaskStore {
    db: SqliteHandle,
}

impl TaskStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        task_id: &str,
        session_id: &str,
        goal: &str,
        timeout_seconds: i64,
        push_context: Option<&PushContext>,
    ) -> rusqlite::Result<()> {
        let task_id = task_id.to_owned();
        let session_id = session_id.to_owned();
        let goal = goal.to_owned();
        let push_context_json = push_context.map(|p| serde_json::to_string(p).unwrap_or_default());
        let now = epoch_ms();
        let db = self.db.clone();
        db.with(move |conn| {
            conn.execute(
                "INSERT INTO digital_tasks
                    (task_id, session_id, goal, status, steps_json, result_json, error, timeout_seconds, push_context_json, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, 'pending', '[]', '{}', NULL, ?4, ?5, ?6, ?6)",
                params![task_id, session_id, goal, timeout_seconds, push_context_json, now],
            )?;
            Ok(())
        })
    }

    pub async fn exists(&self, task_id: &str) -> bool {
        self.get(task_id).await.is_some()
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRow> {
        let task_id = task_id.to_owned();
        let db = self.db.clone();
        db.with(move |conn| {
            conn.query_row(
                "SELECT task_id, session_id, goal, status, steps_json, result_json, error, timeout_seconds, push_context_json, created_at_ms, updated_at_ms
                 FROM digital_tasks WHERE task_id = ?1",
                params![task_id],
                row_to_task,
            )
            .optional()
        })
        .ok()
        .flatten()
    }

    pub async fn list(&self, status: Option<&str>, limit: i64) -> Vec<TaskRow> {
        let status = status.map(|s| s.to_owned());
        let db = self.db.clone();
        db.with(move |conn| {
            if let Some(ref s) = status {
                let mut stmt = conn.prepare(
                    "SELECT task_id, session_id, goal, status, steps_json, result_json, error, timeout_seconds, push_context_json, created_at_ms, updated_at_ms
                     FROM digital_tasks WHERE status = ?1 ORDER BY created_at_ms DESC LIMIT ?2",
                )?;
                stmt.query_map(params![s, limit], row_to_task)?.collect::<rusqlite::Result<Vec<_>>>()
            } else {
                let mut stmt = conn.prepare(
                    "SELECT task_id, session_id, goal, status, steps_json, result_json, error, timeout_seconds, push_context_json, created_at_ms, updated_at_ms
                     FROM digital_tasks ORDER BY created_at_ms DESC LIMIT ?1",
                )?;
                stmt.query_map(params![limit], row_to_task)?.collect::<rusqlite::Result<Vec<_>>>()
            }
        })
        .unwrap_or_default()
    }

    pub async fn list_unfinished(&self, limit: i64) -> Vec<TaskRow> {
        let db = self.db.clone();
        db.with(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT task_id, session_id, goal, status, steps_json, result_json, error, timeout_seconds, push_context_json, created_at_ms, updated_at_ms
                 FROM digital_tasks WHERE status IN ('pending', 'running') ORDER BY created_at_ms ASC LIMIT ?1",
            )?;
            stmt.query_map(params![limit], row_to_task)?.collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }

    pub async fn running_for_device(&self, device_id: &str) -> Option<TaskRow> {
        let rows = self.list(Some("running"), 4096).await;
        rows.into_iter()
            .find(|t| t.push_context.as_ref().and_then(|p| p.device_id.as_deref()) == Some(device_id))
    }

    /// Atomic `status IN expected -> new` CAS, appending one step in the
    /// same transaction. Returns `true` iff the CAS won.
    pub async fn cas_with_step(
        &self,
        task_id: &str,
        expected: &[&str],
        new_status: &str,
        stage: &str,
        message: &str,
        result: Option<Value>,
        error: Option<&str>,
    ) -> bool {
        let task_id = task_id.to_owned();
        let expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
        let new_status = new_status.to_owned();
        let stage = stage.to_owned();
        let message = message.to_owned();
        let error = error.map(|s| s.to_owned());
        let now = epoch_ms();
        let db = self.db.clone();
        db.with(move |conn| {
            let tx = conn.unchecked_transaction()?;
            let placeholders = expected.iter().map(|_| "?").collect::<Vec<_>>().join(",");
            let sql = format!("SELECT steps_json, result_json FROM digital_tasks WHERE task_id = ? AND status IN ({placeholders})");
            let mut stmt = tx.prepare(&sql)?;
            let mut query_params: Vec<&dyn rusqlite::ToSql> = vec![&task_id];
            for e in &expected {
                query_params.push(e);
            }
            let row: Option<(String, String)> = stmt
                .query_row(query_params.as_slice(), |r| Ok((r.get(0)?, r.get(1)?)))
                .optional()?;
            drop(stmt);
            let Some((steps_json, result_json)) = row else {
                return Ok(false);
            };

            let mut steps: Vec<TaskStep> = serde_json::from_str(&steps_json).unwrap_or_default();
            steps.push(TaskStep { ts: now, stage, status: new_status.clone(), message });
            let steps_json = serde_json::to_string(&steps).unwrap_or_else(|_| "[]".to_owned());

            let result_json = match result {
                Some(r) => r.to_string(),
                None => result_json,
            };

            tx.execute(
                "UPDATE digital_tasks SET status = ?2, steps_json = ?3, result_json = ?4, error = ?5, updated_at_ms = ?6 WHERE task_id = ?1",
                params![task_id, new_status, steps_json, result_json, error, now],
            )?;
            tx.commit()?;
            Ok(true)
        })
        .unwrap_or(false)
    }

    /// Force `running -> pending` after a restart, without requiring the
    /// `running` CAS precondition used during normal operation.
    pub async fn force_pending_after_restart(&self, task_id: &str) {
        let task_id = task_id.to_owned();
        let now = epoch_ms();
        let db = self.db.clone();
        let _ = db.with(move |conn| {
            conn.execute(
                "UPDATE digital_tasks SET status = 'pending', error = 'recovered_after_restart', updated_at_ms = ?2
                 WHERE task_id = ?1",
                params![task_id, now],
            )
        });
    }
}

fn row_to_task(row: &rusqlite::Row) -> rusqlite::Result<TaskRow> {
    let steps_json: String = row.get(4)?;
    let result_json: String = row.get(5)?;
    let push_context_json: Option<String> = row.get(8)?;
    Ok(TaskRow {
        task_id: row.get(0)?,
        session_id: row.get(1)?,
        goal: row.get(2)?,
        status: row.get(3)?,
        steps: serde_json::from_str(&steps_json).unwrap_or_default(),
        result: serde_json::from_str(&result_json).unwrap_or(Value::Object(Default::default())),
        error: row.get(6)?,
        timeout_seconds: row.get(7)?,
        push_context: push_context_json.and_then(|s| serde_json::from_str(&s).ok()),
        created_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
    })
}

#[cfg(test)]
mod task_store_tests {
    use super::*;

    fn store() -> TaskStore {
        TaskStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap())
    }

    #[tokio::test]
    async fn cas_only_succeeds_from_expected_status() {
        let store = store();
        store.create("t1", "s1", "do a thing", 30, None).await.unwrap();

        assert!(store.cas_with_step("t1", &["pending"], "running", "start", "started", None, None).await);
        let row = store.get("t1").await.unwrap();
        assert_eq!(row.status, "running");
        assert_eq!(row.steps.len(), 1);

        // Can't go pending -> success; only running -> success.
        assert!(!store.cas_with_step("t1", &["pending"], "success", "x", "x", None, None).await);

        assert!(store
            .cas_with_step("t1", &["running"], "success", "done", "ok", Some(serde_json::json!({"text": "done"})), None)
            .await);
        let row = store.get("t1").await.unwrap();
        assert_eq!(row.status, "success");
        assert_eq!(row.result["text"], "done");
    }

    #[tokio::test]
    async fn terminal_state_cannot_be_left() {
        let store = store();
        store.create("t2", "s2", "goal", 30, None).await.unwrap();
        store.cas_with_step("t2", &["pending"], "running", "a", "a", None, None).await;
        store.cas_with_step("t2", &["running"], "failed", "b", "boom", None, Some("boom")).await;

        assert!(!store.cas_with_step("t2", &["failed"], "running", "c", "c", None, None).await);
        let row = store.get("t2").await.unwrap();
        assert_eq!(row.status, "failed");
    }
}
