// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-event-type dispatch (4.5): the sequence gate, the nine inbound
//! handlers, the two multi-step flows (`listen_stop`, `image_ready`), and
//! the safety/interaction/TTS pipeline every spoken reply passes through.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Timelike;
use serde_json::Value;

use crate::digital_task::store::PushContext;
use crate::digital_task::ExecuteRequest;
use crate::envelope::{now_ms, Envelope, InboundType, OutboundType};
use crate::orchestrator::external::RuntimeContext;
use crate::orchestrator::tool_policy::resolve_tool_policy;
use crate::orchestrator::tts::{speak_device_text, speak_server_audio};
use crate::orchestrator::Orchestrator;
use crate::session::{DeviceSession, SessionState};
use crate::store::operations::OperationStatus;

const STT_SUPPRESS_SAME_MS: i64 = 1000;
const STT_SUPPRESS_GROWTH_MS: i64 = 250;
const STT_SUPPRESS_GROWTH_CHARS: usize = 3;
const TRANSCRIPT_PREVIEW_CHARS: usize = 200;

const DIGITAL_TASK_PREFIXES: &[&str] = &[
    "please complete",
    "please do",
    "go do",
    "go complete",
    "execute task",
    "help me do",
    "help me complete",
    "帮我",
    "执行任务",
    "去完成",
    "去做",
];

fn extract_auth_token(payload: &BTreeMap<String, Value>) -> Option<String> {
    for key in ["device_token", "auth_token", "token", "authorization"] {
        if let Some(raw) = payload.get(key).and_then(Value::as_str) {
            let trimmed = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_owned());
            }
        }
    }
    None
}

fn should_route_to_digital_task(transcript: &str, payload: &BTreeMap<String, Value>) -> bool {
    if payload.get("intent").and_then(Value::as_str) == Some("digital_task") {
        return true;
    }
    if payload.get("digital_task").and_then(Value::as_bool) == Some(true) {
        return true;
    }
    let lower = transcript.trim().to_lowercase();
    DIGITAL_TASK_PREFIXES.iter().any(|p| lower.starts_with(&p.to_lowercase()))
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}

impl Orchestrator {
    async fn send(&self, session: &DeviceSession, cmd_type: OutboundType, payload: BTreeMap<String, Value>) {
        let seq = self.sessions.next_outbound_seq(session).await;
        let envelope = Envelope::outbound(&session.device_id, &session.session_id, seq, cmd_type, payload);
        if let Err(e) = self.adapter.send_command(&envelope).await {
            tracing::warn!(err = %e, device_id = %session.device_id, "orchestrator command send failed");
        }
    }

    async fn send_ack(&self, session: &DeviceSession) {
        self.send(session, OutboundType::Ack, BTreeMap::new()).await;
    }

    /// Main per-envelope entry point: auth gate, sequence gate, dispatch.
    pub async fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        let Some(inbound_type) = envelope.inbound_type() else { return };
        tracing::debug!(device_id = %envelope.device_id, event = inbound_type.as_str(), "inbound envelope");

        let session = self.sessions.get_or_create(&envelope.device_id, &envelope.session_id).await;

        if !self.auth_gate(&session, &envelope, inbound_type).await {
            return;
        }

        let seq_committed = self.sessions.check_and_commit_seq(&session, envelope.seq).await;
        let dispatch_anyway = matches!(inbound_type, InboundType::Hello | InboundType::AudioChunk);
        if !seq_committed && !dispatch_anyway {
            if matches!(
                inbound_type,
                InboundType::Heartbeat
                    | InboundType::ListenStart
                    | InboundType::ListenStop
                    | InboundType::Telemetry
                    | InboundType::ToolResult
            ) {
                self.send_ack(&session).await;
            }
            return;
        }

        match inbound_type {
            InboundType::Hello => self.handle_hello(&session, &envelope).await,
            InboundType::Heartbeat => self.handle_heartbeat(&session).await,
            InboundType::ListenStart => self.handle_listen_start(&session).await,
            InboundType::AudioChunk => self.handle_audio_chunk(&session, &envelope).await,
            InboundType::ListenStop => self.handle_listen_stop(&session, &envelope).await,
            InboundType::Abort => self.handle_abort(&session, &envelope).await,
            InboundType::ImageReady => self.handle_image_ready(&session, &envelope).await,
            InboundType::Telemetry => self.handle_telemetry(&session, &envelope).await,
            InboundType::ToolResult => self.handle_tool_result(&session, &envelope).await,
            InboundType::Error => self.handle_error(&session, &envelope).await,
        }
    }

    async fn auth_gate(&self, session: &DeviceSession, envelope: &Envelope, inbound_type: InboundType) -> bool {
        if !self.config.device_auth_enabled {
            return true;
        }
        let already_authed =
            session.metadata.read().await.get("auth_passed").and_then(Value::as_bool).unwrap_or(false);
        if already_authed {
            return true;
        }

        if inbound_type != InboundType::Hello {
            self.deny_auth(session, "hello_required").await;
            return false;
        }

        let Some(token) = extract_auth_token(&envelope.payload) else {
            self.deny_auth(session, "missing_device_token").await;
            return false;
        };

        let verified = self
            .bindings
            .verify(&envelope.device_id, &token, self.config.require_activated_devices, self.config.allow_unbound_devices)
            .await;
        if !verified {
            self.deny_auth(session, "invalid_device_token").await;
            return false;
        }

        let binding_status = match self.bindings.get(&envelope.device_id).await {
            Some(b) if b.activated => "activated",
            Some(_) => "pending_activation",
            None => "unbound",
        };
        let mut patch = serde_json::Map::new();
        patch.insert("auth_passed".to_owned(), Value::Bool(true));
        patch.insert("binding_status".to_owned(), Value::String(binding_status.to_owned()));
        self.sessions.update_metadata(session, &patch).await;
        true
    }

    async fn deny_auth(&self, session: &DeviceSession, reason: &str) {
        let mut payload = BTreeMap::new();
        payload.insert("reason".to_owned(), reason.into());
        self.send(session, OutboundType::Close, payload).await;
        self.sessions.close(session, reason).await;
        self.lifelog
            .add_event(
                Some(&session.session_id),
                Some(&session.device_id),
                "device_auth_denied",
                Some("P1"),
                serde_json::json!({"reason": reason}),
            )
            .await;
    }

    async fn handle_hello(&self, session: &DeviceSession, envelope: &Envelope) {
        if let Some(Value::Object(caps)) = envelope.payload.get("capabilities") {
            self.sessions.update_metadata(session, caps).await;
        }
        self.sessions.update_state(session, SessionState::Ready).await;

        let ack_seq = session.last_seq.load(std::sync::atomic::Ordering::Relaxed);
        let mut payload = BTreeMap::new();
        payload.insert("runtime".to_owned(), "device-runtime-gateway".into());
        payload.insert("protocol".to_owned(), envelope.version.clone().into());
        payload.insert("session_id".to_owned(), session.session_id.clone().into());
        payload.insert("ack_seq".to_owned(), ack_seq.into());
        self.send(session, OutboundType::HelloAck, payload).await;
        self.adapter.on_hello(&envelope.device_id, Some(session.last_seq.load(std::sync::atomic::Ordering::Relaxed))).await;

        let digital_task = Arc::clone(&self.digital_task);
        let device_id = envelope.device_id.clone();
        tokio::spawn(async move {
            digital_task.flush_pending_updates(&device_id, 50).await;
        });
    }

    async fn handle_heartbeat(&self, session: &DeviceSession) {
        self.sessions.update_state(session, SessionState::Ready).await;
        self.send_ack(session).await;
    }

    async fn handle_listen_start(&self, session: &DeviceSession) {
        if *session.state.read().await == SessionState::Speaking {
            let mut payload = BTreeMap::new();
            payload.insert("aborted".to_owned(), true.into());
            payload.insert("reason".to_owned(), "barge_in".into());
            self.send(session, OutboundType::TtsStop, payload).await;
            self.lifelog
                .add_event(Some(&session.session_id), Some(&session.device_id), "voice_interrupt", None, serde_json::json!({}))
                .await;
        }
        self.sessions.update_state(session, SessionState::Listening).await;
        self.capture_for(&session.device_id, &session.session_id).await;
        self.send_ack(session).await;
    }

    async fn handle_audio_chunk(&self, session: &DeviceSession, envelope: &Envelope) {
        let capture = self.capture_for(&session.device_id, &session.session_id).await;
        capture.ingest_audio_chunk(&envelope.payload, envelope.seq).await;

        if let Some(text) = envelope.payload_str("text").filter(|s| !s.is_empty()) {
            self.maybe_emit_stt_partial(session, text).await;
        }
    }

    async fn maybe_emit_stt_partial(&self, session: &DeviceSession, text: &str) {
        let key = crate::orchestrator::capture_key(&session.device_id, &session.session_id);
        let now = now_ms();
        {
            let throttle = self.stt_throttle.read().await;
            if let Some((last_text, last_ts)) = throttle.get(&key) {
                if last_text == text && now - last_ts < STT_SUPPRESS_SAME_MS {
                    return;
                }
                let is_prefix_growth = text.starts_with(last_text.as_str());
                let grew_chars = text.chars().count().saturating_sub(last_text.chars().count());
                if is_prefix_growth
                    && grew_chars < STT_SUPPRESS_GROWTH_CHARS
                    && now - last_ts < STT_SUPPRESS_GROWTH_MS
                {
                    return;
                }
            }
        }
        self.stt_throttle.write().await.insert(key, (text.to_owned(), now));

        let mut payload = BTreeMap::new();
        payload.insert("text".to_owned(), text.into());
        self.send(session, OutboundType::SttPartial, payload).await;
    }

    async fn handle_abort(&self, session: &DeviceSession, _envelope: &Envelope) {
        let capture = self.capture_for(&session.device_id, &session.session_id).await;
        capture.reset().await;
        self.sessions.update_state(session, SessionState::Ready).await;
        let mut payload = BTreeMap::new();
        payload.insert("aborted".to_owned(), true.into());
        payload.insert("reason".to_owned(), "client_abort".into());
        self.send(session, OutboundType::TtsStop, payload).await;
    }

    async fn handle_telemetry(&self, session: &DeviceSession, envelope: &Envelope) {
        let raw = Value::Object(envelope.payload.clone().into_iter().collect());
        let normalized = if self.config.telemetry_normalization_enabled {
            Some(raw.clone())
        } else {
            None
        };
        self.sessions.update_telemetry(session, raw.clone(), normalized.clone()).await;
        if normalized.is_some() {
            self.telemetry.add(&session.device_id, Some(&session.session_id), raw).await;
        }
        self.send_ack(session).await;
    }

    async fn handle_tool_result(&self, session: &DeviceSession, envelope: &Envelope) {
        self.send_ack(session).await;
        if !self.config.tool_result_logging_enabled {
            return;
        }
        self.lifelog
            .add_event(
                Some(&session.session_id),
                Some(&session.device_id),
                "tool_result",
                None,
                Value::Object(envelope.payload.clone().into_iter().collect()),
            )
            .await;

        if let Some(op_id) = envelope.payload_str("operation_id") {
            let failed = envelope.payload_bool("error").unwrap_or(false);
            let status = if failed { OperationStatus::Failed } else { OperationStatus::Acked };
            let error = envelope.payload_str("error_message");
            self.operations.set_status(op_id, status, error).await;
        }
    }

    async fn handle_error(&self, session: &DeviceSession, envelope: &Envelope) {
        self.lifelog
            .add_event(
                Some(&session.session_id),
                Some(&session.device_id),
                "device_error",
                Some("P1"),
                Value::Object(envelope.payload.clone().into_iter().collect()),
            )
            .await;
    }

    async fn handle_listen_stop(self: &Arc<Self>, session: &DeviceSession, envelope: &Envelope) {
        self.sessions.update_state(session, SessionState::Thinking).await;
        self.send_ack(session).await;

        let this = Arc::clone(self);
        let session_id = session.session_id.clone();
        let device_id = session.device_id.clone();
        let envelope = envelope.clone();
        tokio::spawn(async move {
            if let Some(session) = this.sessions.get(&device_id, &session_id).await {
                this.process_listen_stop(&session, &envelope).await;
            }
        });
    }

    async fn process_listen_stop(self: &Arc<Self>, session: &DeviceSession, envelope: &Envelope) {
        let t_start = now_ms();
        let capture = self.capture_for(&session.device_id, &session.session_id).await;
        let transcript = capture.finalize_capture(&envelope.payload, &*self.transcriber).await;
        let t_stt = now_ms();

        let trace_id = envelope.payload_str("trace_id").map(str::to_owned);

        if transcript.trim().is_empty() {
            self.speak(session, "Sorry, I didn't catch that. Could you try again?", "stt_error", Some(1.0), Some("P2"), "normal").await;
            self.lifelog
                .add_event(
                    Some(&session.session_id),
                    Some(&session.device_id),
                    "voice_turn",
                    None,
                    serde_json::json!({"transcript": "", "outcome": "empty_transcript", "stt_ms": t_stt - t_start}),
                )
                .await;
            return;
        }

        let mut stt_payload = BTreeMap::new();
        stt_payload.insert("text".to_owned(), transcript.clone().into());
        self.send(session, OutboundType::SttFinal, stt_payload).await;

        if should_route_to_digital_task(&transcript, &envelope.payload) {
            let push_context = PushContext {
                device_id: Some(session.device_id.clone()),
                session_id: Some(session.session_id.clone()),
                notify: true,
                speak: true,
                interrupt_previous: true,
            };
            let request = ExecuteRequest {
                task_id: None,
                session_id: None,
                goal: transcript.clone(),
                push_context: Some(push_context),
                source: Some("voice_intent".to_owned()),
                trace_id: trace_id.clone(),
                timeout_seconds: None,
            };
            match self.digital_task.execute(request).await {
                Ok(_row) => {
                    self.sessions.update_state(session, SessionState::Ready).await;
                }
                Err(e) => {
                    self.speak(session, &format!("{e}。"), "digital_task_error", Some(1.0), Some("P2"), "normal").await;
                }
            }
            self.lifelog
                .add_event(
                    Some(&session.session_id),
                    Some(&session.device_id),
                    "voice_turn",
                    None,
                    serde_json::json!({"transcript": transcript, "outcome": "routed_digital_task"}),
                )
                .await;
            return;
        }

        let resolved = resolve_tool_policy(self.control_plane_client.as_ref(), &session.device_id).await;
        let context = RuntimeContext {
            device_id: session.device_id.clone(),
            session_id: session.session_id.clone(),
            state: "thinking".to_owned(),
            trace_id: trace_id.clone(),
            transcript_preview: preview(&transcript, TRANSCRIPT_PREVIEW_CHARS),
            telemetry: session.telemetry_normalized.read().await.clone(),
            allowed_tool_names: resolved.allow_tools,
            blocked_tool_names: resolved.deny_tools,
            policy_warning: resolved.warning,
        };

        let t_agent_start = now_ms();
        match self.agent.process_direct(&transcript, &context).await {
            Ok(reply) => {
                let t_agent_end = now_ms();
                self.speak(session, &reply.text, "agent", reply.confidence, reply.risk_level.as_deref(), "normal").await;
                self.lifelog
                    .add_event(
                        Some(&session.session_id),
                        Some(&session.device_id),
                        "voice_turn",
                        None,
                        serde_json::json!({
                            "transcript": transcript,
                            "outcome": "agent_reply",
                            "stt_ms": t_stt - t_start,
                            "agent_ms": t_agent_end - t_agent_start,
                            "total_ms": now_ms() - t_start,
                        }),
                    )
                    .await;
            }
            Err(e) => {
                tracing::warn!(err = %e, "agent process_direct failed");
                self.speak(session, "Sorry, something went wrong on my end.", "agent_error", Some(1.0), Some("P2"), "normal").await;
                self.lifelog
                    .add_event(
                        Some(&session.session_id),
                        Some(&session.device_id),
                        "voice_turn",
                        None,
                        serde_json::json!({"transcript": transcript, "outcome": "agent_error"}),
                    )
                    .await;
            }
        }
    }

    async fn handle_image_ready(self: &Arc<Self>, session: &DeviceSession, envelope: &Envelope) {
        self.sessions.update_state(session, SessionState::Thinking).await;
        let this = Arc::clone(self);
        let session_id = session.session_id.clone();
        let device_id = session.device_id.clone();
        let envelope = envelope.clone();
        tokio::spawn(async move {
            if let Some(session) = this.sessions.get(&device_id, &session_id).await {
                this.process_image_ready(&session, &envelope).await;
            }
        });
    }

    async fn process_image_ready(self: &Arc<Self>, session: &DeviceSession, envelope: &Envelope) {
        let payload_value = Value::Object(envelope.payload.clone().into_iter().collect());
        self.lifelog
            .add_event(Some(&session.session_id), Some(&session.device_id), "image_received", None, payload_value.clone())
            .await;

        let trace_id = envelope.payload_str("trace_id").map(str::to_owned);
        let context = RuntimeContext {
            device_id: session.device_id.clone(),
            session_id: session.session_id.clone(),
            state: "thinking".to_owned(),
            trace_id,
            transcript_preview: String::new(),
            telemetry: session.telemetry_normalized.read().await.clone(),
            allowed_tool_names: None,
            blocked_tool_names: None,
            policy_warning: None,
        };

        match self.vlm.analyze_payload(&payload_value, &context).await {
            Ok(reply) => {
                self.speak(session, &reply.text, "vlm", reply.confidence, reply.risk_level.as_deref(), "normal").await;
            }
            Err(e) => {
                tracing::info!(err = %e, "no vision model available for image_ready");
                self.speak(session, "I can't analyze the image right now. Please proceed carefully.", "vlm_error", Some(1.0), Some("P2"), "normal").await;
            }
        }

        self.lifelog
            .add_event(Some(&session.session_id), Some(&session.device_id), "vision_turn", None, serde_json::json!({}))
            .await;
    }

    /// Safety policy, then interaction policy, then the configured TTS path.
    async fn speak(
        &self,
        session: &DeviceSession,
        text: &str,
        source: &str,
        confidence: Option<f64>,
        risk_level: Option<&str>,
        priority: &str,
    ) {
        let decision = self.safety.evaluate(text, source, confidence, risk_level);
        self.lifelog
            .add_event(
                Some(&session.session_id),
                Some(&session.device_id),
                "safety_policy",
                Some(&decision.risk_level),
                serde_json::json!({
                    "source": decision.source,
                    "confidence": decision.confidence,
                    "downgraded": decision.downgraded,
                    "reason": decision.reason,
                    "flags": decision.flags,
                    "rule_ids": decision.rule_ids,
                    "evidence": decision.evidence,
                }),
            )
            .await;

        let current_hour = chrono::Local::now().hour() as u8;
        let interaction = self.interaction.apply(&decision.text, source, &decision.risk_level, priority, current_hour);

        if interaction.silent {
            let mut payload = BTreeMap::new();
            payload.insert("reason".to_owned(), "interaction_policy_silent".into());
            self.send(session, OutboundType::TtsStop, payload).await;
            self.sessions.update_state(session, SessionState::Ready).await;
            return;
        }

        match self.config.tts_mode {
            crate::config::TtsMode::DeviceText => {
                speak_device_text(self.adapter.as_ref(), &self.sessions, session, &interaction.text).await;
            }
            crate::config::TtsMode::ServerAudio => {
                speak_server_audio(
                    self.adapter.as_ref(),
                    &self.sessions,
                    session,
                    &interaction.text,
                    &self.tts_synth,
                    self.config.tts_audio_chunk_bytes,
                )
                .await;
            }
        }
        self.sessions.update_state(session, SessionState::Ready).await;
    }
}

#[cfg(test)]
mod handlers_tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::audio::{AudioConfig, NullTranscriber};
    use crate::digital_task::executor::{AgentClient, AgentOutput, AgentRequest};
    use crate::digital_task::push_queue::PushQueueStore;
    use crate::digital_task::store::TaskStore;
    use crate::digital_task::{DigitalTaskConfig, DigitalTaskService, StatusCallback};
    use crate::orchestrator::external::{AgentDirect, AgentReply, NullTtsSynthesizer, NullVlm};
    use crate::orchestrator::{Orchestrator, OrchestratorConfig};
    use crate::policy::interaction::{InteractionConfig, InteractionPolicy};
    use crate::policy::safety::{SafetyConfig, SafetyPolicy};
    use crate::session::{NullPersister, SessionManager};
    use crate::store::bindings::DeviceBindingStore;
    use crate::store::db::SqliteHandle;
    use crate::store::lifelog::LifelogStore;
    use crate::store::operations::DeviceOperationStore;
    use crate::store::telemetry::TelemetrySampleStore;
    use serde_json::json;

    struct EchoAgent;

    #[async_trait::async_trait]
    impl AgentDirect for EchoAgent {
        async fn process_direct(&self, transcript: &str, _context: &RuntimeContext) -> anyhow::Result<AgentReply> {
            Ok(AgentReply { text: format!("you said {transcript}"), confidence: Some(0.99), risk_level: None })
        }
    }

    struct NullAgentClient;

    #[async_trait::async_trait]
    impl AgentClient for NullAgentClient {
        async fn complete(&self, _request: AgentRequest) -> anyhow::Result<AgentOutput> {
            anyhow::bail!("no agent configured in this test")
        }
    }

    struct NullStatusCallback;

    #[async_trait::async_trait]
    impl StatusCallback for NullStatusCallback {
        async fn send(&self, _payload: Value) -> bool {
            true
        }
    }

    fn test_orchestrator(adapter: Arc<MockAdapter>) -> Arc<Orchestrator> {
        let lifelog_db = SqliteHandle::open_in_memory(
            &crate::store::lifelog::MIGRATIONS
                .iter()
                .chain(crate::store::bindings::MIGRATIONS.iter())
                .chain(crate::store::operations::MIGRATIONS.iter())
                .chain(crate::store::thought_trace::MIGRATIONS.iter())
                .chain(crate::store::telemetry::MIGRATIONS.iter())
                .copied()
                .collect::<Vec<_>>(),
        )
        .unwrap();
        let task_db = SqliteHandle::open_in_memory(
            &crate::digital_task::store::MIGRATIONS
                .iter()
                .chain(crate::digital_task::push_queue::MIGRATIONS.iter())
                .copied()
                .collect::<Vec<_>>(),
        )
        .unwrap();

        let lifelog = Arc::new(LifelogStore::new(lifelog_db.clone()));
        let bindings = Arc::new(DeviceBindingStore::new(lifelog_db.clone()));
        let operations = Arc::new(DeviceOperationStore::new(lifelog_db.clone()));
        let telemetry = Arc::new(TelemetrySampleStore::new(lifelog_db));

        let task_store = Arc::new(TaskStore::new(task_db.clone()));
        let push_queue = Arc::new(PushQueueStore::new(task_db));
        let digital_task = DigitalTaskService::new(
            task_store,
            push_queue,
            Arc::new(NullAgentClient),
            Arc::new(NullStatusCallback),
            DigitalTaskConfig::default(),
        );

        Orchestrator::new(
            adapter,
            Arc::new(SessionManager::new(Arc::new(NullPersister))),
            AudioConfig { vad_enabled: false, ..Default::default() },
            Arc::new(NullTranscriber),
            Arc::new(EchoAgent),
            Arc::new(NullVlm),
            Arc::new(NullTtsSynthesizer),
            None,
            digital_task,
            bindings,
            operations,
            lifelog,
            telemetry,
            SafetyPolicy::new(SafetyConfig::default()),
            InteractionPolicy::new(InteractionConfig::default()),
            OrchestratorConfig::default(),
        )
    }

    #[tokio::test]
    async fn hello_sends_hello_ack_and_transitions_ready() {
        let adapter = Arc::new(MockAdapter::new(0xA5));
        let orch = test_orchestrator(Arc::clone(&adapter));
        let envelope = Envelope::from_raw(&json!({"device_id": "d1", "session_id": "s1", "type": "hello"})).unwrap();
        orch.handle_envelope(envelope).await;

        let sent = adapter.sent_commands().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].outbound_type(), Some(OutboundType::HelloAck));
        let session = orch.sessions.get("d1", "s1").await.unwrap();
        assert_eq!(*session.state.read().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn duplicate_seq_reemits_ack_for_heartbeat() {
        let adapter = Arc::new(MockAdapter::new(0xA5));
        let orch = test_orchestrator(Arc::clone(&adapter));
        let hb = |seq: i64| {
            Envelope::from_raw(&json!({"device_id": "d1", "session_id": "s1", "type": "heartbeat", "seq": seq})).unwrap()
        };
        orch.handle_envelope(hb(1)).await;
        orch.handle_envelope(hb(1)).await;

        let sent = adapter.sent_commands().await;
        assert_eq!(sent.len(), 2);
        assert!(sent.iter().all(|e| e.outbound_type() == Some(OutboundType::Ack)));
    }

    #[tokio::test]
    async fn abort_resets_capture_and_sends_tts_stop() {
        let adapter = Arc::new(MockAdapter::new(0xA5));
        let orch = test_orchestrator(Arc::clone(&adapter));
        let session = orch.sessions.get_or_create("d1", "s1").await;
        orch.sessions.update_state(&session, SessionState::Speaking).await;

        let abort = Envelope::from_raw(&json!({"device_id": "d1", "session_id": "s1", "type": "abort"})).unwrap();
        orch.handle_envelope(abort).await;

        assert_eq!(*session.state.read().await, SessionState::Ready);
        let sent = adapter.sent_commands().await;
        assert!(sent.iter().any(|e| e.outbound_type() == Some(OutboundType::TtsStop) && e.payload_bool("aborted") == Some(true)));
    }

    #[tokio::test]
    async fn listen_stop_with_empty_transcript_speaks_apology() {
        let adapter = Arc::new(MockAdapter::new(0xA5));
        let orch = test_orchestrator(Arc::clone(&adapter));
        let session = orch.sessions.get_or_create("d1", "s1").await;
        orch.process_listen_stop(&session, &Envelope::from_raw(&json!({"device_id": "d1", "session_id": "s1", "type": "listen_stop"})).unwrap()).await;

        let sent = adapter.sent_commands().await;
        assert!(sent.iter().any(|e| e.outbound_type() == Some(OutboundType::TtsStart)));
        assert_eq!(*session.state.read().await, SessionState::Ready);
    }

    #[tokio::test]
    async fn listen_stop_with_explicit_transcript_echoes_through_agent() {
        let adapter = Arc::new(MockAdapter::new(0xA5));
        let orch = test_orchestrator(Arc::clone(&adapter));
        let session = orch.sessions.get_or_create("d1", "s1").await;
        let envelope = Envelope::from_raw(&json!({
            "device_id": "d1", "session_id": "s1", "type": "listen_stop",
            "payload": {"transcript": "what time is it"}
        }))
        .unwrap();
        orch.process_listen_stop(&session, &envelope).await;

        let sent = adapter.sent_commands().await;
        let start = sent.iter().find(|e| e.outbound_type() == Some(OutboundType::TtsStart)).unwrap();
        assert!(start.payload_str("text").unwrap().contains("you said what time is it"));
    }

    #[tokio::test]
    async fn stt_partial_suppressed_for_identical_text_within_window() {
        let adapter = Arc::new(MockAdapter::new(0xA5));
        let orch = test_orchestrator(Arc::clone(&adapter));
        let session = orch.sessions.get_or_create("d1", "s1").await;
        orch.maybe_emit_stt_partial(&session, "hello").await;
        orch.maybe_emit_stt_partial(&session, "hello").await;

        let sent = adapter.sent_commands().await;
        assert_eq!(sent.iter().filter(|e| e.outbound_type() == Some(OutboundType::SttPartial)).count(), 1);
    }

    #[tokio::test]
    async fn digital_task_intent_prefix_routes_to_digital_task() {
        let adapter = Arc::new(MockAdapter::new(0xA5));
        let orch = test_orchestrator(Arc::clone(&adapter));
        let session = orch.sessions.get_or_create("d1", "s1").await;
        let envelope = Envelope::from_raw(&json!({
            "device_id": "d1", "session_id": "s1", "type": "listen_stop",
            "payload": {"transcript": "please do the laundry schedule"}
        }))
        .unwrap();
        orch.process_listen_stop(&session, &envelope).await;

        // NullAgentClient always errors, so the task ends up in a terminal
        // failure state rather than speaking through the direct-agent path.
        assert_eq!(*session.state.read().await, SessionState::Ready);
        let sent = adapter.sent_commands().await;
        assert!(sent.iter().all(|e| e.outbound_type() != Some(OutboundType::HelloAck)));
    }
}
