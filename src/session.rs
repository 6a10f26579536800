// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-`(device_id, session_id)` session manager (C3): state machine,
//! inbound sequence gate, outbound sequence allocator, and best-effort
//! persistence hooks. Thread-safe via `RwLock<HashMap<...>>`, following the
//! same shape as the teacher's `MuxState`/`SessionEntry`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

pub fn epoch_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Connecting,
    Ready,
    Listening,
    Thinking,
    Speaking,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Ready => "ready",
            Self::Listening => "listening",
            Self::Thinking => "thinking",
            Self::Speaking => "speaking",
            Self::Closed => "closed",
        }
    }
}

/// A device session, identified by `(device_id, session_id)`.
pub struct DeviceSession {
    pub device_id: String,
    pub session_id: String,
    pub state: RwLock<SessionState>,
    pub created_at_ms: i64,
    pub last_seen_ms: AtomicI64,
    pub closed_at_ms: AtomicI64,
    pub close_reason: RwLock<Option<String>>,
    pub last_seq: AtomicI64,
    pub last_outbound_seq: AtomicI64,
    pub metadata: RwLock<serde_json::Map<String, Value>>,
    pub telemetry_raw: RwLock<Option<Value>>,
    pub telemetry_normalized: RwLock<Option<Value>>,
}

impl DeviceSession {
    fn new(device_id: String, session_id: String) -> Self {
        let now = epoch_ms();
        Self {
            device_id,
            session_id,
            state: RwLock::new(SessionState::Connecting),
            created_at_ms: now,
            last_seen_ms: AtomicI64::new(now),
            closed_at_ms: AtomicI64::new(0),
            close_reason: RwLock::new(None),
            last_seq: AtomicI64::new(-1),
            last_outbound_seq: AtomicI64::new(0),
            metadata: RwLock::new(serde_json::Map::new()),
            telemetry_raw: RwLock::new(None),
            telemetry_normalized: RwLock::new(None),
        }
    }

    pub async fn snapshot(&self) -> DeviceSessionSnapshot {
        DeviceSessionSnapshot {
            device_id: self.device_id.clone(),
            session_id: self.session_id.clone(),
            state: self.state.read().await.as_str().to_owned(),
            created_at_ms: self.created_at_ms,
            last_seen_ms: self.last_seen_ms.load(Ordering::Relaxed),
            closed_at_ms: {
                let v = self.closed_at_ms.load(Ordering::Relaxed);
                if v == 0 {
                    None
                } else {
                    Some(v)
                }
            },
            close_reason: self.close_reason.read().await.clone(),
            last_seq: self.last_seq.load(Ordering::Relaxed),
            last_outbound_seq: self.last_outbound_seq.load(Ordering::Relaxed),
            metadata: Value::Object(self.metadata.read().await.clone()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSessionSnapshot {
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

/// Best-effort persistence capability. Failures are logged, never
/// propagated — every mutating method on [`SessionManager`] calls these
/// hooks after mutating in-memory state.
#[async_trait]
pub trait SessionPersister: Send + Sync {
    async fn upsert_device_session(&self, snapshot: &DeviceSessionSnapshot);
    async fn close_device_session(&self, snapshot: &DeviceSessionSnapshot);
}

/// A persister that does nothing; used when no store is configured.
pub struct NullPersister;

#[async_trait]
impl SessionPersister for NullPersister {
    async fn upsert_device_session(&self, _snapshot: &DeviceSessionSnapshot) {}
    async fn close_device_session(&self, _snapshot: &DeviceSessionSnapshot) {}
}

fn key(device_id: &str, session_id: &str) -> String {
    format!("{device_id}\u{0}{session_id}")
}

/// Thread-safe manager of all live device sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<DeviceSession>>>,
    latest_by_device: RwLock<HashMap<String, String>>,
    persister: Arc<dyn SessionPersister>,
}

impl SessionManager {
    pub fn new(persister: Arc<dyn SessionPersister>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            latest_by_device: RwLock::new(HashMap::new()),
            persister,
        }
    }

    /// Return the matching session or allocate a new one, updating
    /// `latest_by_device`.
    pub async fn get_or_create(&self, device_id: &str, session_id: &str) -> Arc<DeviceSession> {
        let k = key(device_id, session_id);
        {
            let sessions = self.sessions.read().await;
            if let Some(s) = sessions.get(&k) {
                return Arc::clone(s);
            }
        }
        let mut sessions = self.sessions.write().await;
        if let Some(s) = sessions.get(&k) {
            return Arc::clone(s);
        }
        let session = Arc::new(DeviceSession::new(device_id.to_owned(), session_id.to_owned()));
        sessions.insert(k, Arc::clone(&session));
        drop(sessions);

        self.latest_by_device.write().await.insert(device_id.to_owned(), session_id.to_owned());
        let snapshot = session.snapshot().await;
        self.persister.upsert_device_session(&snapshot).await;
        session
    }

    pub async fn get(&self, device_id: &str, session_id: &str) -> Option<Arc<DeviceSession>> {
        self.sessions.read().await.get(&key(device_id, session_id)).cloned()
    }

    pub async fn latest_for_device(&self, device_id: &str) -> Option<Arc<DeviceSession>> {
        let session_id = self.latest_by_device.read().await.get(device_id).cloned()?;
        self.get(device_id, &session_id).await
    }

    /// Returns `true` and commits `seq` iff `seq > last_seq` (or `seq < 0`,
    /// which always "commits" without ordering semantics — used for
    /// payload fields that don't carry a sequence at all). Returns `false`
    /// on a duplicate/out-of-order seq, leaving state untouched.
    pub async fn check_and_commit_seq(&self, session: &DeviceSession, seq: i64) -> bool {
        if seq < 0 {
            return true;
        }
        let prev = session.last_seq.load(Ordering::SeqCst);
        if seq > prev {
            // CAS loop guards concurrent committers; only one can win per seq.
            match session.last_seq.compare_exchange(
                prev,
                seq,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.touch(session).await;
                    true
                }
                Err(_) => false,
            }
        } else {
            false
        }
    }

    /// Allocate the next strictly increasing outbound sequence number,
    /// starting at 1.
    pub async fn next_outbound_seq(&self, session: &DeviceSession) -> i64 {
        let seq = session.last_outbound_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.persist(session).await;
        seq
    }

    pub async fn update_state(&self, session: &DeviceSession, state: SessionState) {
        *session.state.write().await = state;
        self.touch(session).await;
    }

    pub async fn update_metadata(&self, session: &DeviceSession, patch: &serde_json::Map<String, Value>) {
        let mut meta = session.metadata.write().await;
        for (k, v) in patch {
            meta.insert(k.clone(), v.clone());
        }
        drop(meta);
        self.touch(session).await;
    }

    pub async fn update_telemetry(
        &self,
        session: &DeviceSession,
        raw: Value,
        normalized: Option<Value>,
    ) {
        *session.telemetry_raw.write().await = Some(raw);
        if let Some(n) = normalized {
            *session.telemetry_normalized.write().await = Some(n);
        }
        self.touch(session).await;
    }

    async fn touch(&self, session: &DeviceSession) {
        session.last_seen_ms.store(epoch_ms(), Ordering::Relaxed);
        self.persist(session).await;
    }

    async fn persist(&self, session: &DeviceSession) {
        let snapshot = session.snapshot().await;
        self.persister.upsert_device_session(&snapshot).await;
    }

    /// Close a session, removing it from `latest_by_device` only if it was
    /// the latest for its device.
    pub async fn close(&self, session: &DeviceSession, reason: &str) {
        *session.state.write().await = SessionState::Closed;
        session.closed_at_ms.store(epoch_ms(), Ordering::Relaxed);
        *session.close_reason.write().await = Some(reason.to_owned());

        let mut latest = self.latest_by_device.write().await;
        if latest.get(&session.device_id).map(|s| s.as_str()) == Some(session.session_id.as_str())
        {
            latest.remove(&session.device_id);
        }
        drop(latest);

        let snapshot = session.snapshot().await;
        self.persister.close_device_session(&snapshot).await;
    }

    pub async fn all_sessions(&self) -> Vec<Arc<DeviceSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    pub async fn remove(&self, device_id: &str, session_id: &str) {
        self.sessions.write().await.remove(&key(device_id, session_id));
    }
}

#[cfg(test)]
mod session_tests {
    use super::*;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(NullPersister))
    }

    #[tokio::test]
    async fn inbound_ordering_is_non_decreasing_and_exactly_once() {
        let mgr = manager();
        let session = mgr.get_or_create("d1", "s1").await;

        assert!(mgr.check_and_commit_seq(&session, 1).await);
        assert_eq!(session.last_seq.load(Ordering::SeqCst), 1);
        assert!(mgr.check_and_commit_seq(&session, 2).await);
        assert_eq!(session.last_seq.load(Ordering::SeqCst), 2);

        // Duplicate / out-of-order seq is rejected and state is untouched.
        assert!(!mgr.check_and_commit_seq(&session, 2).await);
        assert!(!mgr.check_and_commit_seq(&session, 1).await);
        assert_eq!(session.last_seq.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn outbound_seq_is_strictly_increasing_starting_at_one() {
        let mgr = manager();
        let session = mgr.get_or_create("d1", "s1").await;
        assert_eq!(mgr.next_outbound_seq(&session).await, 1);
        assert_eq!(mgr.next_outbound_seq(&session).await, 2);
        assert_eq!(mgr.next_outbound_seq(&session).await, 3);
    }

    #[tokio::test]
    async fn close_removes_only_if_latest() {
        let mgr = manager();
        let s1 = mgr.get_or_create("d1", "s1").await;
        let _s2 = mgr.get_or_create("d1", "s2").await;
        // s2 is now latest for d1.
        mgr.close(&s1, "test").await;
        assert!(mgr.latest_for_device("d1").await.is_some());
        assert_eq!(mgr.latest_for_device("d1").await.unwrap().session_id, "s2");

        let s2 = mgr.get("d1", "s2").await.unwrap();
        mgr.close(&s2, "test").await;
        assert!(mgr.latest_for_device("d1").await.is_none());
    }

    #[tokio::test]
    async fn get_or_create_is_idempotent() {
        let mgr = manager();
        let a = mgr.get_or_create("d1", "s1").await;
        let b = mgr.get_or_create("d1", "s1").await;
        assert!(Arc::ptr_eq(&a, &b));
    }
}
