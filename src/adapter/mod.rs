// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Southbound adapters (C2): the boundary between the gateway and whatever
//! actually talks to a device. Every adapter exposes the same contract —
//! `start`/`stop`, a lazy stream of inbound envelopes, `send_command`, and
//! (test-only) `inject_event` — so the runtime orchestrator never knows
//! which transport it's driving.

pub mod frame;
pub mod mock;
pub mod mqtt_profile;
pub mod mqtt_vendor;
pub mod websocket;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::envelope::Envelope;

/// One inbound event plus anything the adapter learned while decoding it
/// that the orchestrator needs verbatim (e.g. a malformed-audio-frame
/// error synthesized by the adapter itself).
#[derive(Debug, Clone)]
pub struct AdapterEvent {
    pub envelope: Envelope,
}

/// Shared contract every southbound adapter implements.
#[async_trait]
pub trait SouthboundAdapter: Send + Sync {
    /// Begin connecting / listening. Idempotent.
    async fn start(&self) -> anyhow::Result<()>;

    /// Stop cleanly, dropping any connections.
    async fn stop(&self);

    /// Receive the next inbound event. Returns `None` once the adapter is
    /// stopped and will not produce more events.
    async fn recv_event(&self) -> Option<AdapterEvent>;

    /// Send an outbound command envelope to the device it targets.
    async fn send_command(&self, envelope: &Envelope) -> anyhow::Result<()>;

    /// Notify the adapter a `hello` was just processed for `device_id`,
    /// carrying the device's last-seen downlink sequence if it sent one.
    /// Only the MQTT adapters act on this (replay-then-flush); others are
    /// a no-op.
    async fn on_hello(&self, _device_id: &str, _last_recv_seq: Option<i64>) {}

    /// Test/debug-only: inject a raw envelope as if it had arrived over
    /// the wire.
    async fn inject_event(&self, envelope: Envelope);
}

/// Common channel plumbing shared by every adapter implementation: a
/// bounded mpsc queue of decoded events, with the receiving half wrapped
/// behind a mutex so `&self` methods can pull from it.
pub(crate) struct EventChannel {
    tx: mpsc::Sender<AdapterEvent>,
    rx: tokio::sync::Mutex<mpsc::Receiver<AdapterEvent>>,
}

impl EventChannel {
    pub(crate) fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity);
        Self { tx, rx: tokio::sync::Mutex::new(rx) }
    }

    pub(crate) async fn push(&self, event: AdapterEvent) {
        if self.tx.send(event).await.is_err() {
            tracing::warn!("adapter event channel closed, dropping event");
        }
    }

    pub(crate) async fn recv(&self) -> Option<AdapterEvent> {
        self.rx.lock().await.recv().await
    }
}

fn device_id_from_topic(topic: &str, pattern: &str) -> Option<String> {
    let pattern_segments: Vec<&str> = pattern.split('/').collect();
    let topic_segments: Vec<&str> = topic.split('/').collect();
    if pattern_segments.len() == topic_segments.len() {
        if let Some(idx) = pattern_segments.iter().position(|s| *s == "+") {
            if let Some(value) = topic_segments.get(idx) {
                return Some((*value).to_owned());
            }
        }
    }
    // Fallback: `device/<id>/...`.
    if topic_segments.len() >= 2 && topic_segments[0] == "device" {
        return Some(topic_segments[1].to_owned());
    }
    None
}

#[cfg(test)]
mod mod_tests {
    use super::*;

    #[test]
    fn extracts_device_id_from_wildcard_position() {
        assert_eq!(device_id_from_topic("device/abc123/up/control", "device/+/up/control"), Some("abc123".to_owned()));
    }

    #[test]
    fn falls_back_to_device_prefix() {
        assert_eq!(device_id_from_topic("device/xyz/anything/else/here", "device/+/up/control"), Some("xyz".to_owned()));
    }
}
