// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifelog event log + device-session persistence (C8). Backs the
//! `SessionPersister` hooks used by the session manager (C3) and the
//! `/v1/lifelog/*` and `/v1/device/*` control-plane endpoints.

use async_trait::async_trait;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::redact::redact_json;
use crate::session::{DeviceSessionSnapshot, SessionPersister};
use crate::store::db::{epoch_ms, SqliteHandle};

pub const MIGRATIONS: &[&str] = &[r#"
    CREATE TABLE IF NOT EXISTS device_sessions (
        device_id TEXT NOT NULL,
        session_id TEXT NOT NULL,
        state TEXT NOT NULL,
        created_at_ms INTEGER NOT NULL,
        last_seen_ms INTEGER NOT NULL,
        closed_at_ms INTEGER,
        close_reason TEXT,
        last_seq INTEGER NOT NULL,
        last_outbound_seq INTEGER NOT NULL,
        metadata_json TEXT NOT NULL,
        PRIMARY KEY (device_id, session_id)
    );

    CREATE TABLE IF NOT EXISTS lifelog_events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        ts INTEGER NOT NULL,
        session_id TEXT,
        device_id TEXT,
        event_type TEXT NOT NULL,
        risk_level TEXT,
        payload_json TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_lifelog_session ON lifelog_events(session_id);
    CREATE INDEX IF NOT EXISTS idx_lifelog_ts ON lifelog_events(ts);
    CREATE INDEX IF NOT EXISTS idx_device_sessions_device ON device_sessions(device_id);
"#];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifelogEvent {
    pub id: i64,
    pub ts: i64,
    pub session_id: Option<String>,
    pub device_id: Option<String>,
    pub event_type: String,
    pub risk_level: Option<String>,
    pub payload: Value,
}

#[derive(Debug, Default, Clone)]
pub struct TimelineQuery {
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub risk_level: Option<String>,
    pub limit: i64,
    pub offset: i64,
}

pub struct LifelogStore {
    db: SqliteHandle,
}

impl LifelogStore {
    pub fn new(db: SqliteHandle) -> Self {
        Self { db }
    }

    pub async fn add_event(
        &self,
        session_id: Option<&str>,
        device_id: Option<&str>,
        event_type: &str,
        risk_level: Option<&str>,
        payload: Value,
    ) {
        let redacted = redact_json(&payload);
        let payload_json = redacted.to_string();
        let ts = epoch_ms();
        let session_id = session_id.map(|s| s.to_owned());
        let device_id = device_id.map(|s| s.to_owned());
        let event_type = event_type.to_owned();
        let risk_level = risk_level.map(|s| s.to_owned());
        let db = self.db.clone();
        let result = db.with(move |conn| {
            conn.execute(
                "INSERT INTO lifelog_events (ts, session_id, device_id, event_type, risk_level, payload_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![ts, session_id, device_id, event_type, risk_level, payload_json],
            )
        });
        if let Err(e) = result {
            tracing::warn!(err = %e, "lifelog add_event failed");
        }
    }

    pub async fn timeline(&self, query: TimelineQuery) -> Vec<LifelogEvent> {
        let db = self.db.clone();
        db.with(move |conn| {
            let mut sql = String::from(
                "SELECT id, ts, session_id, device_id, event_type, risk_level, payload_json FROM lifelog_events WHERE 1=1",
            );
            if query.session_id.is_some() {
                sql.push_str(" AND session_id = :session_id");
            }
            if query.event_type.is_some() {
                sql.push_str(" AND event_type = :event_type");
            }
            if query.risk_level.is_some() {
                sql.push_str(" AND risk_level = :risk_level");
            }
            sql.push_str(" ORDER BY ts DESC LIMIT :limit OFFSET :offset");

            let mut stmt = conn.prepare(&sql)?;
            let mut named: Vec<(&str, &dyn rusqlite::ToSql)> = Vec::new();
            if let Some(ref s) = query.session_id {
                named.push((":session_id", s));
            }
            if let Some(ref e) = query.event_type {
                named.push((":event_type", e));
            }
            if let Some(ref r) = query.risk_level {
                named.push((":risk_level", r));
            }
            named.push((":limit", &query.limit));
            named.push((":offset", &query.offset));

            let rows = stmt.query_map(named.as_slice(), |row| {
                let payload_json: String = row.get(6)?;
                Ok(LifelogEvent {
                    id: row.get(0)?,
                    ts: row.get(1)?,
                    session_id: row.get(2)?,
                    device_id: row.get(3)?,
                    event_type: row.get(4)?,
                    risk_level: row.get(5)?,
                    payload: serde_json::from_str(&payload_json).unwrap_or(Value::Null),
                })
            })?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }

    /// Delete lifelog rows older than `retention_days`. Returns rows removed.
    pub async fn cleanup_retention(&self, retention_days: i64) -> usize {
        if retention_days <= 0 {
            return 0;
        }
        let cutoff = epoch_ms() - retention_days * 86_400_000;
        let db = self.db.clone();
        db.with(move |conn| conn.execute("DELETE FROM lifelog_events WHERE ts < ?1", params![cutoff]))
            .unwrap_or(0)
    }

    /// Count lifelog events grouped by `risk_level`, ignoring rows with no
    /// risk level recorded. Backs `/v1/lifelog/safety/stats`.
    pub async fn risk_level_counts(&self) -> Vec<(String, i64)> {
        let db = self.db.clone();
        db.with(|conn| {
            let mut stmt = conn.prepare(
                "SELECT risk_level, COUNT(*) FROM lifelog_events
                 WHERE risk_level IS NOT NULL GROUP BY risk_level ORDER BY risk_level",
            )?;
            stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<rusqlite::Result<Vec<_>>>()
        })
        .unwrap_or_default()
    }

    pub async fn list_device_sessions(&self, device_id: Option<&str>) -> Vec<DeviceSessionRow> {
        let db = self.db.clone();
        let device_id = device_id.map(|s| s.to_owned());
        db.with(move |conn| {
            let mut sql = String::from(
                "SELECT device_id, session_id, state, created_at_ms, last_seen_ms, closed_at_ms, close_reason, last_seq, last_outbound_seq, metadata_json FROM device_sessions",
            );
            if device_id.is_some() {
                sql.push_str(" WHERE device_id = ?1");
            }
            sql.push_str(" ORDER BY last_seen_ms DESC");
            let mut stmt = conn.prepare(&sql)?;
            let map_row = |row: &rusqlite::Row| -> rusqlite::Result<DeviceSessionRow> {
                let metadata_json: String = row.get(9)?;
                Ok(DeviceSessionRow {
                    device_id: row.get(0)?,
                    session_id: row.get(1)?,
                    state: row.get(2)?,
                    created_at_ms: row.get(3)?,
                    last_seen_ms: row.get(4)?,
                    closed_at_ms: row.get(5)?,
                    close_reason: row.get(6)?,
                    last_seq: row.get(7)?,
                    last_outbound_seq: row.get(8)?,
                    metadata: serde_json::from_str(&metadata_json).unwrap_or(Value::Null),
                })
            };
            let rows = if let Some(ref d) = device_id {
                stmt.query_map(params![d], map_row)?.collect::<rusqlite::Result<Vec<_>>>()
            } else {
                stmt.query_map([], map_row)?.collect::<rusqlite::Result<Vec<_>>>()
            };
            rows
        })
        .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSessionRow {
    pub device_id: String,
    pub session_id: String,
    pub state: String,
    pub created_at_ms: i64,
    pub last_seen_ms: i64,
    pub closed_at_ms: Option<i64>,
    pub close_reason: Option<String>,
    pub last_seq: i64,
    pub last_outbound_seq: i64,
    pub metadata: Value,
}

#[async_trait]
impl SessionPersister for LifelogStore {
    async fn upsert_device_session(&self, snapshot: &DeviceSessionSnapshot) {
        let snapshot = snapshot.clone();
        let db = self.db.clone();
        let metadata_json = snapshot.metadata.to_string();
        let result = db.with(move |conn| {
            conn.execute(
                "INSERT INTO device_sessions
                    (device_id, session_id, state, created_at_ms, last_seen_ms, closed_at_ms, close_reason, last_seq, last_outbound_seq, metadata_json)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(device_id, session_id) DO UPDATE SET
                    state=excluded.state,
                    last_seen_ms=excluded.last_seen_ms,
                    closed_at_ms=excluded.closed_at_ms,
                    close_reason=excluded.close_reason,
                    last_seq=excluded.last_seq,
                    last_outbound_seq=excluded.last_outbound_seq,
                    metadata_json=excluded.metadata_json",
                params![
                    snapshot.device_id,
                    snapshot.session_id,
                    snapshot.state,
                    snapshot.created_at_ms,
                    snapshot.last_seen_ms,
                    snapshot.closed_at_ms,
                    snapshot.close_reason,
                    snapshot.last_seq,
                    snapshot.last_outbound_seq,
                    metadata_json,
                ],
            )
        });
        if let Err(e) = result {
            tracing::warn!(err = %e, "upsert_device_session failed");
        }
    }

    async fn close_device_session(&self, snapshot: &DeviceSessionSnapshot) {
        self.upsert_device_session(snapshot).await;
    }
}

#[cfg(test)]
mod lifelog_tests {
    use super::*;

    fn store() -> LifelogStore {
        LifelogStore::new(SqliteHandle::open_in_memory(MIGRATIONS).unwrap())
    }

    #[tokio::test]
    async fn add_event_and_query_timeline() {
        let store = store();
        store
            .add_event(Some("s1"), Some("d1"), "voice_turn", None, serde_json::json!({"ok": true}))
            .await;
        store
            .add_event(Some("s1"), Some("d1"), "safety_policy", Some("P1"), serde_json::json!({}))
            .await;

        let rows = store
            .timeline(TimelineQuery { session_id: Some("s1".into()), limit: 10, offset: 0, ..Default::default() })
            .await;
        assert_eq!(rows.len(), 2);
    }

    #[tokio::test]
    async fn risk_level_counts_groups_and_ignores_unset() {
        let store = store();
        store.add_event(None, None, "safety_policy", Some("P1"), serde_json::json!({})).await;
        store.add_event(None, None, "safety_policy", Some("P1"), serde_json::json!({})).await;
        store.add_event(None, None, "safety_policy", Some("P2"), serde_json::json!({})).await;
        store.add_event(None, None, "voice_turn", None, serde_json::json!({})).await;

        let counts = store.risk_level_counts().await;
        assert_eq!(counts, vec![("P1".to_owned(), 2), ("P2".to_owned(), 1)]);
    }

    #[tokio::test]
    async fn add_event_redacts_tokens() {
        let store = store();
        store
            .add_event(None, None, "device_auth_denied", Some("P1"), serde_json::json!({"device_token": "secret"}))
            .await;
        let rows = store.timeline(TimelineQuery { limit: 10, offset: 0, ..Default::default() }).await;
        assert_eq!(rows[0].payload["device_token"], "***redacted***");
    }
}
