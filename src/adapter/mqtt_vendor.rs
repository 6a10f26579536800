// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Vendor MQTT adapter (4.2.1) — the hardest part of the southbound
//! layer. One `rumqttc` client with automatic reconnect; per-device
//! offline control buffers and replay windows implement the
//! disconnect/resume protocol a flaky cellular or LoRa backhaul forces on
//! us.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::adapter::frame::AudioFrame;
use crate::adapter::{device_id_from_topic, AdapterEvent, EventChannel, SouthboundAdapter};
use crate::config::MqttConfig;
use crate::envelope::{Envelope, OutboundType};

fn qos_from(n: u8) -> QoS {
    match n {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

fn render_topic(pattern: &str, device_id: &str) -> String {
    pattern.replace("{device_id}", device_id)
}

pub struct MqttVendorAdapter {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: Mutex<Option<rumqttc::EventLoop>>,
    events: EventChannel,
    connected: Arc<AtomicBool>,
    offline: RwLock<HashMap<String, VecDeque<Envelope>>>,
    replay: RwLock<HashMap<String, VecDeque<Envelope>>>,
    last_session_by_device: RwLock<HashMap<String, String>>,
    cancel: CancellationToken,
}

impl MqttVendorAdapter {
    pub fn new(config: MqttConfig, client_id: &str) -> Arc<Self> {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keepalive_seconds as u64));
        let (client, eventloop) = AsyncClient::new(options, 64);
        Arc::new(Self {
            config,
            client,
            eventloop: Mutex::new(Some(eventloop)),
            events: EventChannel::new(1024),
            connected: Arc::new(AtomicBool::new(false)),
            offline: RwLock::new(HashMap::new()),
            replay: RwLock::new(HashMap::new()),
            last_session_by_device: RwLock::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    async fn handle_control_publish(&self, topic: &str, bytes: &[u8]) {
        let Ok(raw) = serde_json::from_slice::<serde_json::Value>(bytes) else {
            return;
        };
        let Ok(mut envelope) = Envelope::from_raw(&raw) else {
            return;
        };
        if envelope.device_id.is_empty() {
            let Some(device_id) = device_id_from_topic(topic, &self.config.up_control_topic) else {
                return;
            };
            envelope.device_id = device_id;
        }
        self.last_session_by_device
            .write()
            .await
            .insert(envelope.device_id.clone(), envelope.session_id.clone());
        self.events.push(AdapterEvent { envelope }).await;
    }

    async fn handle_audio_publish(&self, topic: &str, bytes: &[u8]) {
        let Some(device_id) = device_id_from_topic(topic, &self.config.up_audio_topic) else {
            return;
        };
        let session_id = self
            .last_session_by_device
            .read()
            .await
            .get(&device_id)
            .cloned()
            .unwrap_or_else(|| format!("{device_id}-mqtt"));

        let payload = match AudioFrame::decode(bytes, self.config.audio_frame_magic) {
            Ok(frame) => serde_json::json!({
                "device_id": device_id, "session_id": session_id, "type": "audio_chunk",
                "seq": frame.seq as i64, "ts": frame.timestamp as i64,
                "payload": {"audio_b64": BASE64.encode(&frame.payload)},
            }),
            Err(reason) => serde_json::json!({
                "device_id": device_id, "session_id": session_id, "type": "error",
                "payload": {"error": reason},
            }),
        };
        if let Ok(envelope) = Envelope::from_raw(&payload) {
            self.events.push(AdapterEvent { envelope }).await;
        }
    }

    async fn poll_loop(self: Arc<Self>) {
        let mut backoff = Duration::from_millis(self.config.reconnect_min_backoff_ms);
        loop {
            if self.cancel.is_cancelled() {
                return;
            }
            let mut guard = self.eventloop.lock().await;
            let Some(eventloop) = guard.as_mut() else { return };
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    drop(guard);
                    self.connected.store(true, Ordering::SeqCst);
                    backoff = Duration::from_millis(self.config.reconnect_min_backoff_ms);
                    if let Err(e) = self.subscribe().await {
                        tracing::warn!(err = %e, "mqtt subscribe after connect failed");
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let topic = publish.topic.clone();
                    let bytes = publish.payload.to_vec();
                    drop(guard);
                    if topic_matches(&topic, &self.config.up_control_topic) {
                        self.handle_control_publish(&topic, &bytes).await;
                    } else {
                        self.handle_audio_publish(&topic, &bytes).await;
                    }
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    drop(guard);
                    self.connected.store(false, Ordering::SeqCst);
                }
                Ok(_) => {
                    drop(guard);
                }
                Err(e) => {
                    drop(guard);
                    self.connected.store(false, Ordering::SeqCst);
                    tracing::warn!(err = %e, backoff_ms = backoff.as_millis() as u64, "mqtt eventloop error, backing off");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(Duration::from_millis(self.config.reconnect_max_backoff_ms));
                }
            }
        }
    }

    async fn subscribe(&self) -> anyhow::Result<()> {
        self.client.subscribe(&self.config.up_control_topic, qos_from(self.config.qos_control)).await?;
        self.client.subscribe(&self.config.up_audio_topic, qos_from(self.config.qos_audio)).await?;
        Ok(())
    }

    fn heartbeat_loop(self: Arc<Self>) -> Option<tokio::task::JoinHandle<()>> {
        let topic = self.config.heartbeat_topic.clone()?;
        let interval = Duration::from_secs(self.config.heartbeat_interval_seconds.max(1));
        let adapter = Arc::clone(&self);
        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = adapter.cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                if !adapter.connected.load(Ordering::SeqCst) {
                    continue;
                }
                let payload = serde_json::json!({
                    "source": "gateway", "ts": crate::store::db::epoch_ms(), "connected": true,
                })
                .to_string();
                if let Err(e) = adapter.client.publish(&topic, QoS::AtMostOnce, false, payload).await {
                    tracing::warn!(err = %e, "heartbeat publish failed");
                }
            }
        }))
    }

    async fn push_offline(&self, device_id: &str, envelope: Envelope) {
        let mut offline = self.offline.write().await;
        let q = offline.entry(device_id.to_owned()).or_default();
        if q.len() >= self.config.offline_control_buffer {
            q.pop_front();
        }
        q.push_back(envelope);
    }

    async fn push_offline_at_head(&self, device_id: &str, envelope: Envelope) {
        let mut offline = self.offline.write().await;
        offline.entry(device_id.to_owned()).or_default().push_front(envelope);
    }

    async fn push_replay(&self, device_id: &str, envelope: Envelope) {
        let mut replay = self.replay.write().await;
        let q = replay.entry(device_id.to_owned()).or_default();
        if q.len() >= self.config.control_replay_window {
            q.pop_front();
        }
        q.push_back(envelope);
    }

    async fn publish_json(&self, device_id: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let topic = render_topic(&self.config.down_control_topic, device_id);
        let payload = envelope.to_json().to_string();
        self.client.publish(topic, qos_from(self.config.qos_control), false, payload).await?;
        Ok(())
    }

    async fn publish_audio(&self, device_id: &str, envelope: &Envelope) -> anyhow::Result<()> {
        let audio_b64 = envelope
            .payload_str("audio_b64")
            .ok_or_else(|| anyhow::anyhow!("tts_chunk missing audio_b64"))?;
        let bytes = BASE64.decode(audio_b64)?;
        let seq = envelope.seq.max(0) as u32;
        let ts = crate::store::db::epoch_ms() as u32;
        let packet = AudioFrame::encode(self.config.audio_frame_magic, seq, ts, &bytes);
        let topic = render_topic(&self.config.down_audio_topic, device_id);
        self.client.publish(topic, qos_from(self.config.qos_audio), false, packet).await?;
        Ok(())
    }

    /// Drain the offline buffer in FIFO order. A failed publish re-enqueues
    /// at the head and stops the flush to preserve ordering.
    pub async fn flush_pending(&self, device_id: &str) {
        loop {
            let next = {
                let mut offline = self.offline.write().await;
                offline.get_mut(device_id).and_then(|q| q.pop_front())
            };
            let Some(envelope) = next else { break };
            match self.publish_json(device_id, &envelope).await {
                Ok(()) => self.push_replay(device_id, envelope).await,
                Err(e) => {
                    tracing::warn!(err = %e, device_id, "flush publish failed, re-enqueuing and aborting");
                    self.push_offline_at_head(device_id, envelope).await;
                    break;
                }
            }
        }
    }

    async fn replay_since(&self, device_id: &str, last_recv_seq: i64) {
        let entries: Vec<Envelope> = {
            let replay = self.replay.read().await;
            replay
                .get(device_id)
                .map(|q| q.iter().filter(|e| e.seq > last_recv_seq).cloned().collect())
                .unwrap_or_default()
        };
        for envelope in entries {
            if let Err(e) = self.publish_json(device_id, &envelope).await {
                tracing::warn!(err = %e, device_id, "replay publish failed");
            }
        }
    }
}

fn topic_matches(topic: &str, pattern: &str) -> bool {
    let topic_segs: Vec<&str> = topic.split('/').collect();
    let pattern_segs: Vec<&str> = pattern.split('/').collect();
    topic_segs.len() == pattern_segs.len()
        && topic_segs.iter().zip(pattern_segs.iter()).all(|(t, p)| *p == "+" || t == p)
}

#[async_trait]
impl SouthboundAdapter for MqttVendorAdapter {
    async fn start(&self) -> anyhow::Result<()> {
        // The poll and heartbeat loops need an owned `Arc<Self>`, which
        // `&self` can't produce; callers invoke the free `spawn` function
        // with the `Arc` returned from `new` right after construction.
        Ok(())
    }

    async fn stop(&self) {
        self.cancel.cancel();
        let _ = self.client.disconnect().await;
    }

    async fn recv_event(&self) -> Option<AdapterEvent> {
        self.events.recv().await
    }

    async fn send_command(&self, envelope: &Envelope) -> anyhow::Result<()> {
        if envelope.outbound_type() == Some(OutboundType::TtsChunk) && envelope.payload_str("audio_b64").is_some() {
            return self.publish_audio(&envelope.device_id, envelope).await;
        }

        if !self.connected.load(Ordering::SeqCst) {
            self.push_offline(&envelope.device_id, envelope.clone()).await;
            return Ok(());
        }
        match self.publish_json(&envelope.device_id, envelope).await {
            Ok(()) => {
                self.push_replay(&envelope.device_id, envelope.clone()).await;
                Ok(())
            }
            Err(e) => {
                self.push_offline_at_head(&envelope.device_id, envelope.clone()).await;
                Err(e)
            }
        }
    }

    async fn on_hello(&self, device_id: &str, last_recv_seq: Option<i64>) {
        if self.config.replay_enabled {
            if let Some(last_seq) = last_recv_seq {
                self.replay_since(device_id, last_seq).await;
            }
        }
        self.flush_pending(device_id).await;
    }

    async fn inject_event(&self, envelope: Envelope) {
        self.events.push(AdapterEvent { envelope }).await;
    }
}

/// Spawn the background poll and heartbeat loops. Separate from `start()`
/// because it needs an owned `Arc<MqttVendorAdapter>`, not `&self`.
pub fn spawn(adapter: Arc<MqttVendorAdapter>) {
    tokio::spawn(Arc::clone(&adapter).poll_loop());
    let _ = Arc::clone(&adapter).heartbeat_loop();
}

#[cfg(test)]
mod mqtt_vendor_tests {
    use super::*;

    fn config() -> MqttConfig {
        MqttConfig { offline_control_buffer: 2, control_replay_window: 2, ..Default::default() }
    }

    fn adapter() -> Arc<MqttVendorAdapter> {
        MqttVendorAdapter::new(config(), "test-client")
    }

    fn envelope(seq: i64) -> Envelope {
        Envelope::outbound("d1", "s1", seq, OutboundType::Ack, Default::default())
    }

    #[tokio::test]
    async fn offline_buffer_drops_oldest_on_overflow() {
        let adapter = adapter();
        adapter.push_offline("d1", envelope(1)).await;
        adapter.push_offline("d1", envelope(2)).await;
        adapter.push_offline("d1", envelope(3)).await;
        let offline = adapter.offline.read().await;
        let q = offline.get("d1").unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.front().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn replay_window_drops_oldest_on_overflow() {
        let adapter = adapter();
        adapter.push_replay("d1", envelope(1)).await;
        adapter.push_replay("d1", envelope(2)).await;
        adapter.push_replay("d1", envelope(3)).await;
        let replay = adapter.replay.read().await;
        let q = replay.get("d1").unwrap();
        assert_eq!(q.len(), 2);
        assert_eq!(q.front().unwrap().seq, 2);
    }

    #[tokio::test]
    async fn disconnected_send_buffers_instead_of_publishing() {
        let adapter = adapter();
        adapter.connected.store(false, Ordering::SeqCst);
        adapter.send_command(&envelope(1)).await.unwrap();
        let offline = adapter.offline.read().await;
        assert_eq!(offline.get("d1").unwrap().len(), 1);
    }

    #[test]
    fn topic_matches_wildcard_segment() {
        assert!(topic_matches("device/abc/up/control", "device/+/up/control"));
        assert!(!topic_matches("device/abc/up/audio", "device/+/up/control"));
    }
}
