// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Durable at-least-once push queue (C7): status updates the digital-task
//! service could not deliver live land here, to be retried on an
//! exponential-ish schedule until acknowledged.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::db::{epoch_ms, SqliteHandle};

pub const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS push_queue (
        id TEXT PRIMARY KEY,
        task_id TEXT,
        device_id TEXT NOT NULL,
        session_id TEXT,
        payload_json TEXT NOT NULL,
        status TEXT NOT NULL DEFAULT 'pending',
        attempts INTEGER NOT NULL DEFAULT 0,
        next_retry_at_ms INTEGER NOT NULL,
        last_error TEXT,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_push_queue_device ON push_queue(device_id, status, next_retry_at_ms);
"#];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushQueueEntry {
    pub id: String,
    pub task_id: Option<String>,
    pub device_id: String,
    pub session_id: Option<String>,
    pub payload: Value,
    pub status: String,
    pub attempts: i64,
    pub next_retry_at_ms: i64,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

pub struct PushQueueStore {
    db: SqliteHandle,
}

impl PushQueueStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    pub async fn enqueue_push_update(
        &self,
        task_id: Option<&str>,
        device_id: &str,
        session_id: Option<&str>,
        payload: Value,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        let task_id = task_id.map(|s| s.to_owned());
        let device_id = device_id.to_owned();
        let session_id = session_id.map(|s| s.to_owned());
        let payload_json = payload.to_string();
        let now = epoch_ms();
        let db = self.db.clone();
        let id_ret = id.clone();
        let result = db.with(move |conn| {
            conn.execute(
                "INSERT INTO push_queue
                    (id, task_id, device_id, session_id, payload_json, status, attempts, next_retry_at_ms, last_error, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'pending', 0, ?6, NULL, ?6, ?6)",
                params![id, task_id, device_id, session_id, payload_json, now],
            )
        });
        if let Err(e) = result {
            tracing::warn!(err = %e, "enqueue_push_update failed");
        }
        id_ret
    }

    pub async fn list_pending_push_updates(&self, device_id: &str, limit: i64, now: i64) -> Vec<PushQueueEntry> {
        let device_id = device_id.to_owned();
        let db = self.db.clone();
        db.with(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, task_id, device_id, session_id, payload_json, status, attempts, next_retry_at_ms, last_error, created_at_ms, updated_at_ms
                 FROM push_queue
                 WHERE device_id = ?1 AND status = 'pending' AND next_retry_at_ms <= ?2
                 ORDER BY created_at_ms ASC LIMIT ?3",
            )?;
            stmt.query_map(params![device_id, now, limit], row_to_entry)?.collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }

    pub async fn mark_push_update_sent(&self, id: &str) {
        let id = id.to_owned();
        let now = epoch_ms();
        let db = self.db.clone();
        let _ = db.with(move |conn| {
            conn.execute(
                "UPDATE push_queue SET status = 'sent', updated_at_ms = ?2 WHERE id = ?1",
                params![id, now],
            )
        });
    }

    pub async fn mark_push_update_retry(&self, id: &str, error: &str, delay_ms: i64) {
        let id = id.to_owned();
        let error = error.to_owned();
        let now = epoch_ms();
        let db = self.db.clone();
        let _ = db.with(move |conn| {
            conn.execute(
                "UPDATE push_queue
                 SET attempts = attempts + 1, last_error = ?2, next_retry_at_ms = ?3, updated_at_ms = ?3
                 WHERE id = ?1",
                params![id, error, now + delay_ms],
            )
        });
    }
}

fn row_to_entry(row: &rusqlite::Row) -> rusqlite::Result<PushQueueEntry> {
    let payload_json: String = row.get(4)?;
    Ok(PushQueueEntry {
        id: row.get(0)?,
        task_id: row.get(1)?,
        device_id: row.get(2)?,
        session_id: row.get(3)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        status: row.get(5)?,
        attempts: row.get(6)?,
        next_retry_at_ms: row.get(7)?,
        last_error: row.get(8)?,
        created_at_ms: row.get(9)?,
        updated_at_ms: row.get(10)?,
    })
}

#[cfg(test)]
mod push_queue_tests {
    use super::*;

    fn store() -> PushQueueStore {
        PushQueueStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap())
    }

    #[tokio::test]
    async fn pending_entries_respect_next_retry_at() {
        let store = store();
        let id = store.enqueue_push_update(Some("t1"), "dev-1", None, serde_json::json!({"status": "failed"})).await;

        let now = crate::store::db::epoch_ms();
        let pending = store.list_pending_push_updates("dev-1", 10, now).await;
        assert_eq!(pending.len(), 1);

        store.mark_push_update_retry(&id, "device offline", 60_000).await;
        let pending = store.list_pending_push_updates("dev-1", 10, now).await;
        assert!(pending.is_empty(), "retry delay should push next_retry_at into the future");

        let later = now + 60_001;
        let pending = store.list_pending_push_updates("dev-1", 10, later).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 1);
    }

    #[tokio::test]
    async fn sent_entries_are_no_longer_pending() {
        let store = store();
        let id = store.enqueue_push_update(None, "dev-2", None, serde_json::json!({})).await;
        store.mark_push_update_sent(&id).await;
        let now = crate::store::db::epoch_ms();
        assert!(store.list_pending_push_updates("dev-2", 10, now).await.is_empty());
    }
}
