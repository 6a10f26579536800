// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime orchestrator (C5): the main inbound-envelope loop, the
//! per-session watchdog, and graceful shutdown. Per-event-type dispatch
//! lives in [`handlers`]; the TTS output paths live in [`tts`]; tool
//! policy resolution lives in [`tool_policy`]; collaborator trait
//! boundaries live in [`external`].

pub mod external;
pub mod handlers;
pub mod tool_policy;
pub mod tts;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::adapter::SouthboundAdapter;
use crate::audio::{AudioCapture, AudioConfig, Transcriber};
use crate::config::TtsMode;
use crate::digital_task::DigitalTaskService;
use crate::orchestrator::external::{AgentDirect, ControlPlaneClient, TtsSynthesizer, Vlm};
use crate::policy::interaction::InteractionPolicy;
use crate::policy::safety::SafetyPolicy;
use crate::session::SessionManager;
use crate::store::bindings::DeviceBindingStore;
use crate::store::lifelog::LifelogStore;
use crate::store::operations::DeviceOperationStore;
use crate::store::telemetry::TelemetrySampleStore;

const WATCHDOG_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub tts_mode: TtsMode,
    pub tts_audio_chunk_bytes: usize,
    pub device_auth_enabled: bool,
    pub allow_unbound_devices: bool,
    pub require_activated_devices: bool,
    pub no_heartbeat_timeout_s: u64,
    pub tool_result_logging_enabled: bool,
    pub telemetry_normalization_enabled: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            tts_mode: TtsMode::DeviceText,
            tts_audio_chunk_bytes: 4096,
            device_auth_enabled: false,
            allow_unbound_devices: true,
            require_activated_devices: false,
            no_heartbeat_timeout_s: 90,
            tool_result_logging_enabled: true,
            telemetry_normalization_enabled: true,
        }
    }
}

pub(crate) fn capture_key(device_id: &str, session_id: &str) -> String {
    format!("{device_id}\u{0}{session_id}")
}

/// The runtime orchestrator. Holds every collaborator the handlers need;
/// constructed once and shared via `Arc` with the adapter's receive loop.
pub struct Orchestrator {
    pub(crate) adapter: Arc<dyn SouthboundAdapter>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) audio_config: AudioConfig,
    pub(crate) audio_captures: RwLock<HashMap<String, Arc<AudioCapture>>>,
    pub(crate) transcriber: Arc<dyn Transcriber>,
    pub(crate) agent: Arc<dyn AgentDirect>,
    pub(crate) vlm: Arc<dyn Vlm>,
    pub(crate) tts_synth: Arc<dyn TtsSynthesizer>,
    pub(crate) control_plane_client: Option<Arc<dyn ControlPlaneClient>>,
    pub(crate) digital_task: Arc<DigitalTaskService>,
    pub(crate) bindings: Arc<DeviceBindingStore>,
    pub(crate) operations: Arc<DeviceOperationStore>,
    pub(crate) lifelog: Arc<LifelogStore>,
    pub(crate) telemetry: Arc<TelemetrySampleStore>,
    pub(crate) safety: SafetyPolicy,
    pub(crate) interaction: InteractionPolicy,
    pub(crate) config: OrchestratorConfig,
    pub(crate) stt_throttle: RwLock<HashMap<String, (String, i64)>>,
    pub(crate) cancel: CancellationToken,
}

#[allow(clippy::too_many_arguments)]
impl Orchestrator {
    pub fn new(
        adapter: Arc<dyn SouthboundAdapter>,
        sessions: Arc<SessionManager>,
        audio_config: AudioConfig,
        transcriber: Arc<dyn Transcriber>,
        agent: Arc<dyn AgentDirect>,
        vlm: Arc<dyn Vlm>,
        tts_synth: Arc<dyn TtsSynthesizer>,
        control_plane_client: Option<Arc<dyn ControlPlaneClient>>,
        digital_task: Arc<DigitalTaskService>,
        bindings: Arc<DeviceBindingStore>,
        operations: Arc<DeviceOperationStore>,
        lifelog: Arc<LifelogStore>,
        telemetry: Arc<TelemetrySampleStore>,
        safety: SafetyPolicy,
        interaction: InteractionPolicy,
        config: OrchestratorConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            adapter,
            sessions,
            audio_config,
            audio_captures: RwLock::new(HashMap::new()),
            transcriber,
            agent,
            vlm,
            tts_synth,
            control_plane_client,
            digital_task,
            bindings,
            operations,
            lifelog,
            telemetry,
            safety,
            interaction,
            config,
            stt_throttle: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    async fn capture_for(&self, device_id: &str, session_id: &str) -> Arc<AudioCapture> {
        let k = capture_key(device_id, session_id);
        if let Some(cap) = self.audio_captures.read().await.get(&k) {
            return Arc::clone(cap);
        }
        let mut captures = self.audio_captures.write().await;
        if let Some(cap) = captures.get(&k) {
            return Arc::clone(cap);
        }
        let cap = Arc::new(AudioCapture::new(self.audio_config.clone()));
        captures.insert(k, Arc::clone(&cap));
        cap
    }

    async fn drop_capture(&self, device_id: &str, session_id: &str) {
        self.audio_captures.write().await.remove(&capture_key(device_id, session_id));
    }

    /// Drain the adapter's inbound event stream, dispatching each envelope
    /// to a handler, until the orchestrator is shut down.
    pub async fn run_event_loop(self: &Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.adapter.recv_event() => {
                    let Some(event) = event else { break };
                    let this = Arc::clone(self);
                    tokio::spawn(async move {
                        this.handle_envelope(event.envelope).await;
                    });
                }
            }
        }
    }

    /// Close any session whose `last_seen_ms` is older than
    /// `no_heartbeat_timeout_s`, every `WATCHDOG_INTERVAL`.
    pub async fn run_watchdog(self: &Arc<Self>) {
        let timeout_ms = (self.config.no_heartbeat_timeout_s as i64) * 1000;
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(WATCHDOG_INTERVAL) => {}
            }
            let now = crate::session::epoch_ms();
            for session in self.sessions.all_sessions().await {
                if *session.state.read().await == crate::session::SessionState::Closed {
                    continue;
                }
                let last_seen = session.last_seen_ms.load(std::sync::atomic::Ordering::Relaxed);
                if now - last_seen > timeout_ms {
                    tracing::info!(device_id = %session.device_id, session_id = %session.session_id, "watchdog closing idle session");
                    self.sessions.close(&session, "heartbeat_timeout").await;
                    self.drop_capture(&session.device_id, &session.session_id).await;
                }
            }
        }
    }

    /// Close all live sessions, stop the adapter, and cancel the event loop
    /// and watchdog.
    pub async fn shutdown(&self) {
        for session in self.sessions.all_sessions().await {
            if *session.state.read().await != crate::session::SessionState::Closed {
                self.sessions.close(&session, "shutdown").await;
            }
        }
        self.adapter.stop().await;
        self.cancel.cancel();
    }
}
