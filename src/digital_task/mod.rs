// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Digital task service (C6) and its durable push queue (C7): a
//! concurrency-limited async executor with SQLite-backed lifecycle,
//! crash recovery, and at-least-once status delivery back to the device.
//! Grounded on the teacher's background-poller shape in
//! `upstream/poller.rs` (one spawned task per unit of work, a
//! `CancellationToken` to stop it early), generalized from "poll on an
//! interval" to "run once under a timeout, CAS the result".

pub mod executor;
pub mod push_queue;
pub mod store;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::adapter::SouthboundAdapter;
use crate::envelope::{Envelope, OutboundType};
use crate::error::{GatewayError, GatewayResult};
use crate::session::SessionManager;
use executor::{run_ladder, AgentClient};
use push_queue::PushQueueStore;
use store::{PushContext, TaskRow, TaskStore};

#[derive(Debug, Clone)]
pub struct DigitalTaskConfig {
    pub default_timeout_seconds: u64,
    pub max_concurrent_tasks: usize,
    pub status_retry_count: u32,
    pub status_retry_backoff_ms: u64,
}

impl Default for DigitalTaskConfig {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 120,
            max_concurrent_tasks: 4,
            status_retry_count: 2,
            status_retry_backoff_ms: 250,
        }
    }
}

/// The injected sink for `_emit_status_update`. Production wiring sends the
/// update back through the orchestrator to the device; tests use a
/// recording stub.
#[async_trait]
pub trait StatusCallback: Send + Sync {
    async fn send(&self, payload: Value) -> bool;
}

/// Production `StatusCallback`: pushes the task update back to the device
/// as a `task_update` envelope on whichever session the payload names, or
/// the device's most recent session if it doesn't. Grounded on
/// `control_plane::device::dispatch_op`'s session-resolve-then-send shape.
pub struct DeviceStatusCallback {
    adapter: Arc<dyn SouthboundAdapter>,
    sessions: Arc<SessionManager>,
}

impl DeviceStatusCallback {
    pub fn new(adapter: Arc<dyn SouthboundAdapter>, sessions: Arc<SessionManager>) -> Self {
        Self { adapter, sessions }
    }
}

#[async_trait]
impl StatusCallback for DeviceStatusCallback {
    async fn send(&self, payload: Value) -> bool {
        let Some(device_id) = payload.get("device_id").and_then(Value::as_str) else {
            return false;
        };
        let by_session = match payload.get("session_id").and_then(Value::as_str) {
            Some(sid) => self.sessions.get(device_id, sid).await,
            None => None,
        };
        let Some(session) = match by_session {
            Some(s) => Some(s),
            None => self.sessions.latest_for_device(device_id).await,
        } else {
            return false;
        };
        let seq = self.sessions.next_outbound_seq(&session).await;
        let payload_map: BTreeMap<String, Value> = match payload {
            Value::Object(map) => map.into_iter().collect(),
            _ => BTreeMap::new(),
        };
        let envelope =
            Envelope::outbound(device_id, &session.session_id, seq, OutboundType::TaskUpdate, payload_map);
        self.adapter.send_command(&envelope).await.is_ok()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecuteRequest {
    pub task_id: Option<String>,
    pub session_id: Option<String>,
    pub goal: String,
    pub push_context: Option<PushContext>,
    pub source: Option<String>,
    pub trace_id: Option<String>,
    pub timeout_seconds: Option<u64>,
}

pub struct DigitalTaskService {
    store: Arc<TaskStore>,
    push_queue: Arc<PushQueueStore>,
    agent: Arc<dyn AgentClient>,
    status_callback: Arc<dyn StatusCallback>,
    semaphore: Arc<Semaphore>,
    config: DigitalTaskConfig,
    running: RwLock<HashMap<String, CancellationToken>>,
    cancel_reasons: RwLock<HashMap<String, String>>,
}

impl DigitalTaskService {
    pub fn new(
        store: Arc<TaskStore>,
        push_queue: Arc<PushQueueStore>,
        agent: Arc<dyn AgentClient>,
        status_callback: Arc<dyn StatusCallback>,
        config: DigitalTaskConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            push_queue,
            agent,
            status_callback,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_tasks)),
            config,
            running: RwLock::new(HashMap::new()),
            cancel_reasons: RwLock::new(HashMap::new()),
        })
    }

    pub async fn get(&self, task_id: &str) -> Option<TaskRow> {
        self.store.get(task_id).await
    }

    pub async fn list(&self, status: Option<&str>, limit: i64) -> Vec<TaskRow> {
        self.store.list(status, limit).await
    }

    pub async fn execute(self: &Arc<Self>, request: ExecuteRequest) -> GatewayResult<TaskRow> {
        if request.goal.trim().is_empty() {
            return Err(GatewayError::BadRequest);
        }
        let task_id = request.task_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        if self.store.exists(&task_id).await {
            return Err(GatewayError::Conflict);
        }
        let session_id = request.session_id.clone().unwrap_or_else(|| format!("digital-{task_id}"));
        let timeout_seconds =
            request.timeout_seconds.unwrap_or(self.config.default_timeout_seconds) as i64;

        if let Some(ref push_context) = request.push_context {
            if push_context.interrupt_previous {
                if let Some(device_id) = push_context.device_id.as_deref() {
                    if let Some(existing) = self.store.running_for_device(device_id).await {
                        self.cancel(&existing.task_id, "interrupted_by_new_task").await;
                    }
                }
            }
        }

        self.store
            .create(&task_id, &session_id, &request.goal, timeout_seconds, request.push_context.as_ref())
            .await
            .map_err(|e| {
                tracing::error!(err = %e, task_id = %task_id, "failed to persist new digital task");
                GatewayError::Internal
            })?;

        self.spawn_run(task_id.clone(), session_id, request.goal, timeout_seconds, request.push_context);

        self.store.get(&task_id).await.ok_or(GatewayError::Internal)
    }

    fn spawn_run(
        self: &Arc<Self>,
        task_id: String,
        session_id: String,
        goal: String,
        timeout_seconds: i64,
        push_context: Option<PushContext>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.run_task(task_id, session_id, goal, timeout_seconds, push_context).await;
        });
    }

    async fn run_task(
        self: Arc<Self>,
        task_id: String,
        session_id: String,
        goal: String,
        timeout_seconds: i64,
        push_context: Option<PushContext>,
    ) {
        if !self
            .store
            .cas_with_step(&task_id, &["pending"], "running", "start", "task started", None, None)
            .await
        {
            return;
        }

        let cancel = CancellationToken::new();
        self.running.write().await.insert(task_id.clone(), cancel.clone());

        let Ok(_permit) = self.semaphore.clone().acquire_owned().await else {
            return;
        };

        let duration = Duration::from_secs(timeout_seconds.max(0) as u64);
        let (new_status, stage, message, result, error) = tokio::select! {
            _ = cancel.cancelled() => {
                let reason = self.cancel_reasons.read().await.get(&task_id).cloned()
                    .unwrap_or_else(|| "canceled".to_owned());
                ("canceled".to_owned(), "cancel".to_owned(), reason.clone(), None, Some(reason))
            }
            outcome = tokio::time::timeout(duration, run_ladder(self.agent.as_ref(), &goal, &session_id)) => {
                match outcome {
                    Ok(Ok(output)) => (
                        "success".to_owned(),
                        "complete".to_owned(),
                        "task completed".to_owned(),
                        Some(serde_json::json!({
                            "text": output.text,
                            "execution_path": output.execution_path,
                            "allowed_tools": output.allowed_tools,
                        })),
                        None,
                    ),
                    Ok(Err(e)) => ("failed".to_owned(), "error".to_owned(), e.to_string(), None, Some(e.to_string())),
                    Err(_) => {
                        let msg = format!("timeout after {timeout_seconds}s");
                        ("timeout".to_owned(), "timeout".to_owned(), msg.clone(), None, Some(msg))
                    }
                }
            }
        };

        self.running.write().await.remove(&task_id);
        self.cancel_reasons.write().await.remove(&task_id);

        self.store
            .cas_with_step(&task_id, &["running"], &new_status, &stage, &message, result, error.as_deref())
            .await;

        self.emit_status_update(&task_id, &new_status, &message, push_context.as_ref()).await;
    }

    /// Cancel a pending or running task. Returns `true` if the cancel took
    /// effect (the CAS won, either directly or via the running task's own
    /// cancellation branch).
    pub async fn cancel(&self, task_id: &str, reason: &str) -> bool {
        self.cancel_reasons.write().await.insert(task_id.to_owned(), reason.to_owned());
        if let Some(token) = self.running.read().await.get(task_id) {
            token.cancel();
            return true;
        }
        self.store
            .cas_with_step(task_id, &["pending", "running"], "canceled", "cancel", reason, None, None)
            .await
    }

    async fn emit_status_update(
        &self,
        task_id: &str,
        status: &str,
        message: &str,
        push_context: Option<&PushContext>,
    ) {
        let Some(push_context) = push_context else { return };
        if !push_context.notify && !push_context.speak {
            return;
        }

        let payload = serde_json::json!({
            "task_id": task_id,
            "status": status,
            "message": message,
            "device_id": push_context.device_id,
            "session_id": push_context.session_id,
            "notify": push_context.notify,
            "speak": push_context.speak,
        });

        let attempts = self.config.status_retry_count + 1;
        for attempt in 1..=attempts {
            if attempt > 1 {
                tokio::time::sleep(Duration::from_millis(self.config.status_retry_backoff_ms * attempt as u64))
                    .await;
            }
            if self.status_callback.send(payload.clone()).await {
                return;
            }
        }

        if let Some(device_id) = push_context.device_id.as_deref() {
            self.push_queue
                .enqueue_push_update(Some(task_id), device_id, push_context.session_id.as_deref(), payload)
                .await;
        }
    }

    /// Called once at startup: any task still `pending`/`running` lost its
    /// in-memory state across the restart. Force it back to `pending` and
    /// re-spawn.
    pub async fn recover_unfinished_tasks(self: &Arc<Self>, limit: i64) -> usize {
        let unfinished = self.store.list_unfinished(limit).await;
        let mut recovered = 0;
        for task in unfinished {
            if task.status == "running" {
                self.store.force_pending_after_restart(&task.task_id).await;
            }
            self.spawn_run(
                task.task_id.clone(),
                task.session_id.clone(),
                task.goal.clone(),
                task.timeout_seconds,
                task.push_context.clone(),
            );
            recovered += 1;
        }
        recovered
    }

    /// Flush durable push-queue entries for `device_id` (or all devices
    /// when `device_id` is `None`), e.g. on `hello`/reconnect.
    pub async fn flush_pending_updates(&self, device_id: &str, limit: i64) -> usize {
        let now = crate::store::db::epoch_ms();
        let pending = self.push_queue.list_pending_push_updates(device_id, limit, now).await;
        let mut flushed = 0;
        for entry in pending {
            if self.status_callback.send(entry.payload.clone()).await {
                self.push_queue.mark_push_update_sent(&entry.id).await;
                flushed += 1;
            } else {
                let delay = self.config.status_retry_backoff_ms * (entry.attempts + 1) as u64;
                self.push_queue.mark_push_update_retry(&entry.id, "push delivery failed", delay as i64).await;
            }
        }
        flushed
    }
}

#[cfg(test)]
mod service_tests {
    use super::*;
    use crate::digital_task::executor::{AgentOutput, AgentRequest};
    use crate::store::db::SqliteHandle;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct SleepForeverAgent;
    #[async_trait]
    impl AgentClient for SleepForeverAgent {
        async fn complete(&self, _request: AgentRequest) -> anyhow::Result<AgentOutput> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct ImmediateAgent(String);
    #[async_trait]
    impl AgentClient for ImmediateAgent {
        async fn complete(&self, _request: AgentRequest) -> anyhow::Result<AgentOutput> {
            Ok(AgentOutput { text: self.0.clone(), execution_path: vec![], allowed_tools: vec![] })
        }
    }

    struct RecordingCallback {
        calls: Mutex<Vec<Value>>,
        accept: AtomicBool,
    }
    #[async_trait]
    impl StatusCallback for RecordingCallback {
        async fn send(&self, payload: Value) -> bool {
            self.calls.lock().unwrap().push(payload);
            self.accept.load(Ordering::SeqCst)
        }
    }

    fn service(agent: Arc<dyn AgentClient>, callback: Arc<dyn StatusCallback>, config: DigitalTaskConfig) -> Arc<DigitalTaskService> {
        let db = SqliteHandle::open_in_memory(store::MIGRATIONS).unwrap();
        let push_db = SqliteHandle::open_in_memory(push_queue::MIGRATIONS).unwrap();
        DigitalTaskService::new(
            Arc::new(TaskStore::new(db)),
            Arc::new(PushQueueStore::new(push_db)),
            agent,
            callback,
            config,
        )
    }

    #[tokio::test]
    async fn execute_runs_to_success() {
        let svc = service(
            Arc::new(ImmediateAgent("done".to_owned())),
            Arc::new(RecordingCallback { calls: Mutex::new(vec![]), accept: AtomicBool::new(true) }),
            DigitalTaskConfig::default(),
        );
        let task = svc.execute(ExecuteRequest { goal: "do the thing".into(), ..Default::default() }).await.unwrap();
        assert_eq!(task.status, "pending");

        for _ in 0..20 {
            if svc.get(&task.task_id).await.unwrap().status == "success" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let row = svc.get(&task.task_id).await.unwrap();
        assert_eq!(row.status, "success");
        assert_eq!(row.result["text"], "done");
    }

    #[tokio::test]
    async fn duplicate_task_id_is_rejected() {
        let svc = service(
            Arc::new(ImmediateAgent("done".to_owned())),
            Arc::new(RecordingCallback { calls: Mutex::new(vec![]), accept: AtomicBool::new(true) }),
            DigitalTaskConfig::default(),
        );
        svc.execute(ExecuteRequest { task_id: Some("dup".into()), goal: "x".into(), ..Default::default() })
            .await
            .unwrap();
        let err = svc
            .execute(ExecuteRequest { task_id: Some("dup".into()), goal: "x".into(), ..Default::default() })
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::Conflict));
    }

    #[tokio::test]
    async fn timeout_transitions_to_timeout_status() {
        let mut config = DigitalTaskConfig::default();
        config.status_retry_count = 0;
        let svc = service(
            Arc::new(SleepForeverAgent),
            Arc::new(RecordingCallback { calls: Mutex::new(vec![]), accept: AtomicBool::new(true) }),
            config,
        );
        let task = svc
            .execute(ExecuteRequest { goal: "hangs forever".into(), timeout_seconds: Some(0), ..Default::default() })
            .await
            .unwrap();

        for _ in 0..50 {
            if svc.get(&task.task_id).await.unwrap().status == "timeout" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(svc.get(&task.task_id).await.unwrap().status, "timeout");
    }

    #[tokio::test]
    async fn failed_status_callback_lands_in_push_queue() {
        let mut config = DigitalTaskConfig::default();
        config.status_retry_count = 0;
        config.status_retry_backoff_ms = 1;
        let svc = service(
            Arc::new(ImmediateAgent("done".to_owned())),
            Arc::new(RecordingCallback { calls: Mutex::new(vec![]), accept: AtomicBool::new(false) }),
            config,
        );
        let task = svc
            .execute(ExecuteRequest {
                goal: "x".into(),
                push_context: Some(PushContext {
                    device_id: Some("dev-1".into()),
                    session_id: None,
                    notify: true,
                    speak: false,
                    interrupt_previous: false,
                }),
                ..Default::default()
            })
            .await
            .unwrap();

        for _ in 0..20 {
            if svc.get(&task.task_id).await.unwrap().status == "success" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        let now = crate::store::db::epoch_ms();
        let pending = svc.push_queue.list_pending_push_updates("dev-1", 10, now).await;
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn cancel_interrupts_previous_running_task() {
        let svc = service(
            Arc::new(SleepForeverAgent),
            Arc::new(RecordingCallback { calls: Mutex::new(vec![]), accept: AtomicBool::new(true) }),
            DigitalTaskConfig::default(),
        );
        let push_context = |interrupt: bool| PushContext {
            device_id: Some("dev-1".into()),
            session_id: None,
            notify: false,
            speak: false,
            interrupt_previous: interrupt,
        };
        let first = svc
            .execute(ExecuteRequest {
                goal: "first".into(),
                push_context: Some(push_context(false)),
                ..Default::default()
            })
            .await
            .unwrap();

        // Let the first task actually reach `running` before interrupting it.
        for _ in 0..20 {
            if svc.get(&first.task_id).await.unwrap().status == "running" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        svc.execute(ExecuteRequest {
            goal: "second".into(),
            push_context: Some(push_context(true)),
            ..Default::default()
        })
        .await
        .unwrap();

        for _ in 0..20 {
            if svc.get(&first.task_id).await.unwrap().status == "canceled" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(svc.get(&first.task_id).await.unwrap().status, "canceled");
    }
}
