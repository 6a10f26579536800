// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Thought-trace store (C8): records each stage of the orchestrator's
//! reasoning pipeline (stt, agent, safety_policy, tts, ...) for a given
//! voice turn, for debugging and the `/v1/lifelog/thought-trace` endpoint.

use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::db::{epoch_ms, SqliteHandle};

pub const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS thought_traces (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        trace_id TEXT NOT NULL,
        session_id TEXT,
        source TEXT NOT NULL,
        stage TEXT NOT NULL,
        payload_json TEXT NOT NULL,
        ts INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_thought_traces_trace ON thought_traces(trace_id, ts);
"#];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThoughtTraceRow {
    pub id: i64,
    pub trace_id: String,
    pub session_id: Option<String>,
    pub source: String,
    pub stage: String,
    pub payload: Value,
    pub ts: i64,
}

pub struct ThoughtTraceStore {
    db: SqliteHandle,
}

impl ThoughtTraceStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    /// Append a stage entry to `trace_id`, allocating a fresh trace id when
    /// `trace_id` is `None` (start of a new turn). Returns the trace id used.
    pub async fn add(
        &self,
        trace_id: Option<&str>,
        session_id: Option<&str>,
        source: &str,
        stage: &str,
        payload: Value,
    ) -> String {
        let trace_id = trace_id.map(|s| s.to_owned()).unwrap_or_else(|| Uuid::new_v4().to_string());
        let session_id = session_id.map(|s| s.to_owned());
        let source = source.to_owned();
        let stage = stage.to_owned();
        let payload_json = payload.to_string();
        let ts = epoch_ms();
        let db = self.db.clone();
        let trace_id_ret = trace_id.clone();
        let result = db.with(move |conn| {
            conn.execute(
                "INSERT INTO thought_traces (trace_id, session_id, source, stage, payload_json, ts)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![trace_id, session_id, source, stage, payload_json, ts],
            )
        });
        if let Err(e) = result {
            tracing::warn!(err = %e, "thought_trace add failed");
        }
        trace_id_ret
    }

    pub async fn get_trace(&self, trace_id: &str) -> Vec<ThoughtTraceRow> {
        let trace_id = trace_id.to_owned();
        let db = self.db.clone();
        db.with(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, trace_id, session_id, source, stage, payload_json, ts
                 FROM thought_traces WHERE trace_id = ?1 ORDER BY ts ASC, id ASC",
            )?;
            stmt.query_map(params![trace_id], row_to_trace)?.collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }

    pub async fn recent_for_session(&self, session_id: &str, limit: i64) -> Vec<ThoughtTraceRow> {
        let session_id = session_id.to_owned();
        let db = self.db.clone();
        db.with(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, trace_id, session_id, source, stage, payload_json, ts
                 FROM thought_traces WHERE session_id = ?1 ORDER BY ts DESC LIMIT ?2",
            )?;
            stmt.query_map(params![session_id, limit], row_to_trace)?.collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }
}

fn row_to_trace(row: &rusqlite::Row) -> rusqlite::Result<ThoughtTraceRow> {
    let payload_json: String = row.get(5)?;
    Ok(ThoughtTraceRow {
        id: row.get(0)?,
        trace_id: row.get(1)?,
        session_id: row.get(2)?,
        source: row.get(3)?,
        stage: row.get(4)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
        ts: row.get(6)?,
    })
}

#[cfg(test)]
mod thought_trace_tests {
    use super::*;

    fn store() -> ThoughtTraceStore {
        ThoughtTraceStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap())
    }

    #[tokio::test]
    async fn add_without_trace_id_allocates_one_and_reuses_it() {
        let store = store();
        let trace_id = store.add(None, Some("s1"), "stt", "partial", serde_json::json!({})).await;
        store.add(Some(&trace_id), Some("s1"), "agent", "final", serde_json::json!({"text": "hi"})).await;

        let rows = store.get_trace(&trace_id).await;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].stage, "partial");
        assert_eq!(rows[1].stage, "final");
    }

    #[tokio::test]
    async fn recent_for_session_orders_newest_first() {
        let store = store();
        store.add(None, Some("s2"), "stt", "partial", serde_json::json!({})).await;
        let t2 = store.add(None, Some("s2"), "agent", "final", serde_json::json!({})).await;
        let rows = store.recent_for_session("s2", 1).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].trace_id, t2);
    }
}
