// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Programmable adapter (4.2.4) used by tests and the debug
//! `POST /v1/device/event` endpoint. Parses the same wire shapes the real
//! adapters do, but keeps outbound commands in an inspectable queue
//! instead of writing them anywhere.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tokio::sync::Mutex;

use crate::adapter::frame::AudioFrame;
use crate::adapter::{AdapterEvent, EventChannel, SouthboundAdapter};
use crate::envelope::Envelope;

pub struct MockAdapter {
    events: EventChannel,
    sent: Mutex<Vec<Envelope>>,
    audio_magic: u8,
}

impl MockAdapter {
    pub fn new(audio_magic: u8) -> Self {
        Self { events: EventChannel::new(256), sent: Mutex::new(Vec::new()), audio_magic }
    }

    /// Parse a raw JSON control message into an envelope and enqueue it.
    pub async fn ingest_control(&self, raw: &Value) -> Result<(), crate::error::GatewayError> {
        let envelope = Envelope::from_raw(raw)?;
        self.events.push(AdapterEvent { envelope }).await;
        Ok(())
    }

    /// Parse a framed audio packet bound for `(device_id, session_id)` and
    /// enqueue the resulting `audio_chunk` envelope, or an `error` envelope
    /// if the frame is malformed.
    pub async fn ingest_audio_packet(&self, device_id: &str, session_id: &str, packet: &[u8]) {
        let event_type = match AudioFrame::decode(packet, self.audio_magic) {
            Ok(frame) => serde_json::json!({
                "device_id": device_id,
                "session_id": session_id,
                "type": "audio_chunk",
                "seq": frame.seq as i64,
                "ts": frame.timestamp as i64,
                "payload": {"audio_b64": BASE64.encode(&frame.payload)},
            }),
            Err(reason) => serde_json::json!({
                "device_id": device_id,
                "session_id": session_id,
                "type": "error",
                "payload": {"error": reason},
            }),
        };
        if let Ok(envelope) = Envelope::from_raw(&event_type) {
            self.events.push(AdapterEvent { envelope }).await;
        }
    }

    pub async fn sent_commands(&self) -> Vec<Envelope> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl SouthboundAdapter for MockAdapter {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {}

    async fn recv_event(&self) -> Option<AdapterEvent> {
        self.events.recv().await
    }

    async fn send_command(&self, envelope: &Envelope) -> anyhow::Result<()> {
        self.sent.lock().await.push(envelope.clone());
        Ok(())
    }

    async fn inject_event(&self, envelope: Envelope) {
        self.events.push(AdapterEvent { envelope }).await;
    }
}

#[cfg(test)]
mod mock_tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn ingest_control_round_trips_through_recv_event() {
        let adapter = MockAdapter::new(0xA5);
        adapter.ingest_control(&json!({"device_id": "d1", "type": "hello"})).await.unwrap();
        let event = adapter.recv_event().await.unwrap();
        assert_eq!(event.envelope.device_id, "d1");
    }

    #[tokio::test]
    async fn malformed_audio_packet_yields_error_event() {
        let adapter = MockAdapter::new(0xA5);
        adapter.ingest_audio_packet("d1", "s1", b"too short").await;
        let event = adapter.recv_event().await.unwrap();
        assert_eq!(event.envelope.payload_str("error"), Some("invalid audio packet"));
    }

    #[tokio::test]
    async fn valid_audio_packet_yields_audio_chunk() {
        let adapter = MockAdapter::new(0xA5);
        let packet = AudioFrame::encode(0xA5, 3, 100, b"AB");
        adapter.ingest_audio_packet("d1", "s1", &packet).await;
        let event = adapter.recv_event().await.unwrap();
        assert_eq!(event.envelope.seq, 3);
    }

    #[tokio::test]
    async fn send_command_is_recorded() {
        let adapter = MockAdapter::new(0xA5);
        let env = Envelope::outbound("d1", "s1", 1, crate::envelope::OutboundType::Ack, Default::default());
        adapter.send_command(&env).await.unwrap();
        assert_eq!(adapter.sent_commands().await.len(), 1);
    }
}
