// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Trait boundaries for the collaborators that live outside this crate:
//! the conversational agent, the vision model, the TTS synthesizer, and
//! the remote control-plane policy source. Production wiring adapts
//! whatever backend is configured; tests use canned implementations.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Default)]
pub struct RuntimeContext {
    pub device_id: String,
    pub session_id: String,
    pub state: String,
    pub trace_id: Option<String>,
    pub transcript_preview: String,
    pub telemetry: Option<Value>,
    pub allowed_tool_names: Option<Vec<String>>,
    pub blocked_tool_names: Option<Vec<String>>,
    pub policy_warning: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AgentReply {
    pub text: String,
    pub confidence: Option<f64>,
    pub risk_level: Option<String>,
}

/// The conversational agent handling direct (non-digital-task) voice
/// turns.
#[async_trait]
pub trait AgentDirect: Send + Sync {
    async fn process_direct(&self, transcript: &str, context: &RuntimeContext) -> anyhow::Result<AgentReply>;
}

/// Absent by default; every call fails so callers fall back to the
/// apology path `process_listen_stop` takes on an agent error.
pub struct NullAgentDirect;

#[async_trait]
impl AgentDirect for NullAgentDirect {
    async fn process_direct(&self, _transcript: &str, _context: &RuntimeContext) -> anyhow::Result<AgentReply> {
        anyhow::bail!("no conversational agent configured")
    }
}

/// Vision-language model analyzing an `image_ready` payload.
#[async_trait]
pub trait Vlm: Send + Sync {
    async fn analyze_payload(&self, payload: &Value, context: &RuntimeContext) -> anyhow::Result<AgentReply>;
}

/// Absent by default; every call fails so callers fall back to a P2
/// apology, matching the "Absent VLM: speak a P2 fallback" behavior.
pub struct NullVlm;

#[async_trait]
impl Vlm for NullVlm {
    async fn analyze_payload(&self, _payload: &Value, _context: &RuntimeContext) -> anyhow::Result<AgentReply> {
        anyhow::bail!("no vision model configured")
    }
}

#[derive(Debug, Clone)]
pub struct SynthesizedAudio {
    pub bytes: Vec<u8>,
    pub encoding: String,
    pub sample_rate_hz: Option<u32>,
}

/// Server-side TTS synthesis. Returning `Ok(None)` signals "no audio" and
/// triggers the `device_text` fallback path.
#[async_trait]
pub trait TtsSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str) -> anyhow::Result<Option<SynthesizedAudio>>;
}

pub struct NullTtsSynthesizer;

#[async_trait]
impl TtsSynthesizer for NullTtsSynthesizer {
    async fn synthesize(&self, _text: &str) -> anyhow::Result<Option<SynthesizedAudio>> {
        Ok(None)
    }
}

#[derive(Debug, Clone, Default)]
pub struct DevicePolicy {
    pub allow_tools: Vec<String>,
    pub deny_tools: Vec<String>,
}

/// Remote control-plane client used to resolve a device's tool policy.
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    async fn fetch_device_policy(&self, device_id: &str) -> anyhow::Result<DevicePolicy>;
}
