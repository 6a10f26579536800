// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The canonical envelope (C1): a type-tagged message shared by every
//! southbound adapter and the runtime orchestrator. Construction is total
//! over any JSON object — it either returns a valid envelope or an
//! [`GatewayError::InvalidEnvelope`] — and envelopes are immutable and
//! structurally comparable once built.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;

/// Closed set of inbound (device -> gateway) event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundType {
    Hello,
    Heartbeat,
    ListenStart,
    AudioChunk,
    ListenStop,
    Abort,
    ImageReady,
    Telemetry,
    ToolResult,
    Error,
}

impl InboundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hello => "hello",
            Self::Heartbeat => "heartbeat",
            Self::ListenStart => "listen_start",
            Self::AudioChunk => "audio_chunk",
            Self::ListenStop => "listen_stop",
            Self::Abort => "abort",
            Self::ImageReady => "image_ready",
            Self::Telemetry => "telemetry",
            Self::ToolResult => "tool_result",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Some(match raw {
            "hello" => Self::Hello,
            "heartbeat" => Self::Heartbeat,
            "listen_start" => Self::ListenStart,
            "audio_chunk" => Self::AudioChunk,
            "listen_stop" => Self::ListenStop,
            "abort" => Self::Abort,
            "image_ready" => Self::ImageReady,
            "telemetry" => Self::Telemetry,
            "tool_result" => Self::ToolResult,
            "error" => Self::Error,
            _ => return None,
        })
    }
}

/// Closed set of outbound (gateway -> device) command types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundType {
    HelloAck,
    SttPartial,
    SttFinal,
    TtsStart,
    TtsChunk,
    TtsStop,
    TaskUpdate,
    ToolCall,
    SetConfig,
    OtaPlan,
    Close,
    Ack,
}

impl OutboundType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::HelloAck => "hello_ack",
            Self::SttPartial => "stt_partial",
            Self::SttFinal => "stt_final",
            Self::TtsStart => "tts_start",
            Self::TtsChunk => "tts_chunk",
            Self::TtsStop => "tts_stop",
            Self::TaskUpdate => "task_update",
            Self::ToolCall => "tool_call",
            Self::SetConfig => "set_config",
            Self::OtaPlan => "ota_plan",
            Self::Close => "close",
            Self::Ack => "ack",
        }
    }
}

/// Either direction's event type, carried in a single `type` field when we
/// don't yet know which closed set applies (e.g. during raw parsing).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventType {
    Inbound(InboundType),
    Outbound(OutboundType),
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Inbound(t) => t.as_str(),
            Self::Outbound(t) => t.as_str(),
        }
    }
}

/// The canonical envelope. Immutable after construction; cheap to clone
/// (payload is a `BTreeMap` of JSON values, not a whole-document clone of
/// anything heavier).
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub version: String,
    pub msg_id: String,
    pub device_id: String,
    pub session_id: String,
    pub seq: i64,
    pub ts: i64,
    pub event_type: EventType,
    pub payload: BTreeMap<String, Value>,
}

pub fn now_ms() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn first_present<'a>(obj: &'a serde_json::Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|k| obj.get(*k))
}

fn random_hex8() -> String {
    use rand::Rng;
    let mut rng = rand::rng();
    let n: u32 = rng.random();
    format!("{n:08x}")
}

impl Envelope {
    /// Parse any JSON-shaped mapping into a canonical envelope. Accepts the
    /// alias keys named in spec.md §4.1. Non-object payloads are wrapped as
    /// `{value: ...}`. Numeric fields default on parse failure; `device_id`
    /// and `type` are mandatory.
    pub fn from_raw(raw: &Value) -> Result<Self, GatewayError> {
        let obj = raw.as_object().ok_or(GatewayError::InvalidEnvelope)?;

        let device_id = first_present(obj, &["device_id", "deviceId"])
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_owned();
        if device_id.is_empty() {
            return Err(GatewayError::InvalidEnvelope);
        }

        let type_raw = first_present(obj, &["type"]).and_then(Value::as_str).unwrap_or("");
        if type_raw.is_empty() {
            return Err(GatewayError::InvalidEnvelope);
        }
        let event_type = if let Some(t) = InboundType::parse(type_raw) {
            EventType::Inbound(t)
        } else {
            return Err(GatewayError::InvalidEnvelope);
        };

        let session_id = first_present(obj, &["session_id", "sessionId"])
            .and_then(Value::as_str)
            .map(|s| s.to_owned())
            .unwrap_or_else(|| format!("{device_id}-{}", random_hex8()));

        let version = first_present(obj, &["v", "version"])
            .and_then(Value::as_str)
            .map(|s| s.to_owned())
            .unwrap_or_else(|| "0.1".to_owned());

        let msg_id = first_present(obj, &["id", "msg_id"])
            .and_then(Value::as_str)
            .map(|s| s.to_owned())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let seq = first_present(obj, &["seq"]).and_then(Value::as_i64).unwrap_or(0);
        let ts = first_present(obj, &["ts"]).and_then(Value::as_i64).unwrap_or_else(now_ms);

        let payload = match obj.get("payload") {
            Some(Value::Object(p)) => p.clone().into_iter().collect(),
            Some(other) => {
                let mut m = BTreeMap::new();
                m.insert("value".to_owned(), other.clone());
                m
            }
            None => BTreeMap::new(),
        };

        Ok(Self { version, msg_id, device_id, session_id, seq, ts, event_type, payload })
    }

    /// Build an outbound command envelope bound to an existing session.
    pub fn outbound(
        device_id: impl Into<String>,
        session_id: impl Into<String>,
        seq: i64,
        cmd_type: OutboundType,
        payload: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            version: "0.1".to_owned(),
            msg_id: uuid::Uuid::new_v4().to_string(),
            device_id: device_id.into(),
            session_id: session_id.into(),
            seq,
            ts: now_ms(),
            event_type: EventType::Outbound(cmd_type),
            payload,
        }
    }

    pub fn inbound_type(&self) -> Option<InboundType> {
        match self.event_type {
            EventType::Inbound(t) => Some(t),
            EventType::Outbound(_) => None,
        }
    }

    pub fn outbound_type(&self) -> Option<OutboundType> {
        match self.event_type {
            EventType::Outbound(t) => Some(t),
            EventType::Inbound(_) => None,
        }
    }

    /// Serialize losslessly to a JSON-shaped map.
    pub fn to_json(&self) -> Value {
        serde_json::json!({
            "version": self.version,
            "msg_id": self.msg_id,
            "device_id": self.device_id,
            "session_id": self.session_id,
            "seq": self.seq,
            "ts": self.ts,
            "type": self.event_type.as_str(),
            "payload": Value::Object(self.payload.clone().into_iter().collect()),
        })
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    pub fn payload_bool(&self, key: &str) -> Option<bool> {
        self.payload.get(key).and_then(Value::as_bool)
    }

    pub fn payload_i64(&self, key: &str) -> Option<i64> {
        self.payload.get(key).and_then(Value::as_i64)
    }
}

#[cfg(test)]
mod envelope_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn rejects_missing_device_id() {
        let raw = json!({"type": "hello"});
        assert_eq!(Envelope::from_raw(&raw), Err(GatewayError::InvalidEnvelope));
    }

    #[test]
    fn rejects_missing_type() {
        let raw = json!({"device_id": "d1"});
        assert_eq!(Envelope::from_raw(&raw), Err(GatewayError::InvalidEnvelope));
    }

    #[test]
    fn rejects_unknown_type() {
        let raw = json!({"device_id": "d1", "type": "not_a_real_type"});
        assert_eq!(Envelope::from_raw(&raw), Err(GatewayError::InvalidEnvelope));
    }

    #[test]
    fn synthesizes_session_id_when_absent() {
        let raw = json!({"device_id": "d1", "type": "hello"});
        let env = Envelope::from_raw(&raw).unwrap();
        assert!(env.session_id.starts_with("d1-"));
        assert_eq!(env.session_id.len(), "d1-".len() + 8);
    }

    #[test]
    fn accepts_alias_keys() {
        let raw = json!({"deviceId": "d1", "sessionId": "s1", "v": "0.2", "type": "heartbeat"});
        let env = Envelope::from_raw(&raw).unwrap();
        assert_eq!(env.device_id, "d1");
        assert_eq!(env.session_id, "s1");
        assert_eq!(env.version, "0.2");
    }

    #[test]
    fn defaults_numeric_fields_on_parse_failure() {
        let raw = json!({"device_id": "d1", "type": "hello", "seq": "not-a-number"});
        let env = Envelope::from_raw(&raw).unwrap();
        assert_eq!(env.seq, 0);
    }

    #[test]
    fn wraps_non_object_payload() {
        let raw = json!({"device_id": "d1", "type": "hello", "payload": "just text"});
        let env = Envelope::from_raw(&raw).unwrap();
        assert_eq!(env.payload.get("value").unwrap(), "just text");
    }

    #[test]
    fn structural_equality() {
        let a = Envelope::from_raw(&json!({"device_id": "d1", "type": "hello", "msg_id": "m1"}))
            .unwrap();
        let b = Envelope::from_raw(&json!({"device_id": "d1", "type": "hello", "msg_id": "m1"}))
            .unwrap();
        assert_eq!(a, b);
    }
}
