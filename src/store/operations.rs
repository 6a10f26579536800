// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device operation store (C8): tracks individual commands pushed down to a
//! device (TTS play, display update, vendor-specific action) through the
//! `queued -> sent -> acked` lifecycle, with `failed` as the terminal error
//! state. Consumed by the push queue (C7) and the `/v1/device/*` ops
//! endpoints.

use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::db::{epoch_ms, SqliteHandle};

pub const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS device_operations (
        id TEXT PRIMARY KEY,
        device_id TEXT NOT NULL,
        session_id TEXT,
        op_type TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        status TEXT NOT NULL,
        attempts INTEGER NOT NULL DEFAULT 0,
        last_error TEXT,
        created_at_ms INTEGER NOT NULL,
        updated_at_ms INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_device_operations_device ON device_operations(device_id, status);
"#];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Queued,
    Sent,
    Acked,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Sent => "sent",
            Self::Acked => "acked",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "sent" => Some(Self::Sent),
            "acked" => Some(Self::Acked),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceOperation {
    pub id: String,
    pub device_id: String,
    pub session_id: Option<String>,
    pub op_type: String,
    pub payload: Value,
    pub status: String,
    pub attempts: i64,
    pub last_error: Option<String>,
    pub created_at_ms: i64,
    pub updated_at_ms: i64,
}

pub struct DeviceOperationStore {
    db: SqliteHandle,
}

impl DeviceOperationStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        device_id: &str,
        session_id: Option<&str>,
        op_type: &str,
        payload: Value,
    ) -> DeviceOperation {
        let id = Uuid::new_v4().to_string();
        let device_id = device_id.to_owned();
        let session_id = session_id.map(|s| s.to_owned());
        let op_type = op_type.to_owned();
        let payload_json = payload.to_string();
        let now = epoch_ms();
        let db = self.db.clone();
        db.with(move |conn| {
            conn.execute(
                "INSERT INTO device_operations
                    (id, device_id, session_id, op_type, payload_json, status, attempts, last_error, created_at_ms, updated_at_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, 'queued', 0, NULL, ?6, ?6)",
                params![id, device_id, session_id, op_type, payload_json, now],
            )?;
            conn.query_row(
                "SELECT id, device_id, session_id, op_type, payload_json, status, attempts, last_error, created_at_ms, updated_at_ms
                 FROM device_operations WHERE id = ?1",
                params![id],
                row_to_operation,
            )
        })
        .expect("device operation create followed by select must find the row")
    }

    pub async fn set_status(&self, id: &str, status: OperationStatus, error: Option<&str>) -> bool {
        let id = id.to_owned();
        let status = status.as_str();
        let error = error.map(|s| s.to_owned());
        let now = epoch_ms();
        let db = self.db.clone();
        db.with(move |conn| {
            let attempts_delta = if status == "sent" { 1 } else { 0 };
            conn.execute(
                "UPDATE device_operations
                 SET status = ?2, last_error = ?3, attempts = attempts + ?4, updated_at_ms = ?5
                 WHERE id = ?1",
                params![id, status, error, attempts_delta, now],
            )
        })
        .map(|n| n > 0)
        .unwrap_or(false)
    }

    pub async fn get(&self, id: &str) -> Option<DeviceOperation> {
        let id = id.to_owned();
        let db = self.db.clone();
        db.with(move |conn| {
            conn.query_row(
                "SELECT id, device_id, session_id, op_type, payload_json, status, attempts, last_error, created_at_ms, updated_at_ms
                 FROM device_operations WHERE id = ?1",
                params![id],
                row_to_operation,
            )
            .optional()
        })
        .ok()
        .flatten()
    }

    pub async fn list(&self, device_id: Option<&str>, status: Option<OperationStatus>) -> Vec<DeviceOperation> {
        let device_id = device_id.map(|s| s.to_owned());
        let status = status.map(|s| s.as_str());
        let db = self.db.clone();
        db.with(move |conn| {
            let mut sql = String::from(
                "SELECT id, device_id, session_id, op_type, payload_json, status, attempts, last_error, created_at_ms, updated_at_ms
                 FROM device_operations WHERE 1=1",
            );
            if device_id.is_some() {
                sql.push_str(" AND device_id = :device_id");
            }
            if status.is_some() {
                sql.push_str(" AND status = :status");
            }
            sql.push_str(" ORDER BY created_at_ms DESC");
            let mut stmt = conn.prepare(&sql)?;
            let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            if let Some(ref d) = device_id {
                named.push((":device_id", d));
            }
            if let Some(ref s) = status {
                named.push((":status", s));
            }
            stmt.query_map(named.as_slice(), row_to_operation)?.collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }
}

fn row_to_operation(row: &rusqlite::Row) -> rusqlite::Result<DeviceOperation> {
    let payload_json: String = row.get(4)?;
    Ok(DeviceOperation {
        id: row.get(0)?,
        device_id: row.get(1)?,
        session_id: row.get(2)?,
        op_type: row.get(3)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        status: row.get(5)?,
        attempts: row.get(6)?,
        last_error: row.get(7)?,
        created_at_ms: row.get(8)?,
        updated_at_ms: row.get(9)?,
    })
}

#[cfg(test)]
mod operations_tests {
    use super::*;

    fn store() -> DeviceOperationStore {
        DeviceOperationStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap())
    }

    #[tokio::test]
    async fn create_then_set_status_transitions_monotonically() {
        let store = store();
        let op = store.create("dev-1", Some("s1"), "tts_play", serde_json::json!({"text": "hi"})).await;
        assert_eq!(op.status, "queued");

        store.set_status(&op.id, OperationStatus::Sent, None).await;
        let refreshed = store.get(&op.id).await.unwrap();
        assert_eq!(refreshed.status, "sent");
        assert_eq!(refreshed.attempts, 1);

        store.set_status(&op.id, OperationStatus::Acked, None).await;
        let refreshed = store.get(&op.id).await.unwrap();
        assert_eq!(refreshed.status, "acked");
    }

    #[tokio::test]
    async fn failed_status_records_error() {
        let store = store();
        let op = store.create("dev-1", None, "display_update", serde_json::json!({})).await;
        store.set_status(&op.id, OperationStatus::Failed, Some("device unreachable")).await;
        let refreshed = store.get(&op.id).await.unwrap();
        assert_eq!(refreshed.status, "failed");
        assert_eq!(refreshed.last_error.as_deref(), Some("device unreachable"));
    }

    #[tokio::test]
    async fn list_filters_by_device_and_status() {
        let store = store();
        store.create("dev-1", None, "a", serde_json::json!({})).await;
        let op2 = store.create("dev-2", None, "b", serde_json::json!({})).await;
        store.set_status(&op2.id, OperationStatus::Sent, None).await;

        let queued = store.list(None, Some(OperationStatus::Queued)).await;
        assert_eq!(queued.len(), 1);
        let dev2 = store.list(Some("dev-2"), None).await;
        assert_eq!(dev2.len(), 1);
    }
}
