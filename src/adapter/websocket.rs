// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! WebSocket adapter (4.2.3): an axum router wired into the control-plane
//! server's `/v1/ws/device` upgrade. Text frames are envelopes; binary
//! frames are either framed audio (same header as the MQTT adapter) or
//! raw opaque audio, wrapped as `{encoding:"binary", audio_b64}`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Query, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};

use crate::adapter::frame::AudioFrame;
use crate::adapter::{AdapterEvent, EventChannel, SouthboundAdapter};
use crate::envelope::Envelope;

#[derive(Debug, Clone, Deserialize)]
pub struct WsUpgradeQuery {
    pub device_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
}

struct Socket {
    session_id: String,
    tx: mpsc::Sender<Message>,
}

pub struct WebsocketAdapter {
    events: EventChannel,
    by_device: RwLock<HashMap<String, Arc<Socket>>>,
    by_device_session: RwLock<HashMap<(String, String), Arc<Socket>>>,
    require_token: bool,
    expected_token: Option<String>,
    audio_magic: u8,
}

impl WebsocketAdapter {
    pub fn new(require_token: bool, expected_token: Option<String>, audio_magic: u8) -> Arc<Self> {
        Arc::new(Self {
            events: EventChannel::new(1024),
            by_device: RwLock::new(HashMap::new()),
            by_device_session: RwLock::new(HashMap::new()),
            require_token,
            expected_token,
            audio_magic,
        })
    }

    fn token_ok(&self, token: Option<&str>) -> bool {
        if !self.require_token {
            return true;
        }
        match (&self.expected_token, token) {
            (Some(expected), Some(got)) => constant_time_eq(expected, got),
            _ => false,
        }
    }

    pub async fn handle_upgrade(
        self: &Arc<Self>,
        ws: WebSocketUpgrade,
        query: WsUpgradeQuery,
    ) -> axum::response::Response {
        if !self.token_ok(query.token.as_deref()) {
            return axum::http::Response::builder()
                .status(401)
                .body(axum::body::Body::from("unauthorized"))
                .unwrap_or_default()
                .into_response();
        }
        let adapter = Arc::clone(self);
        let device_id = query.device_id;
        let session_id = query.session_id.unwrap_or_else(|| format!("{device_id}-ws"));
        ws.on_upgrade(move |socket| async move {
            adapter.run_connection(socket, device_id, session_id).await;
        })
        .into_response()
    }

    async fn run_connection(self: Arc<Self>, socket: WebSocket, device_id: String, session_id: String) {
        let (mut ws_tx, mut ws_rx) = socket.split();
        let (tx, mut rx) = mpsc::channel::<Message>(64);
        let registered = Arc::new(Socket { session_id: session_id.clone(), tx });

        self.by_device.write().await.insert(device_id.clone(), Arc::clone(&registered));
        self.by_device_session
            .write()
            .await
            .insert((device_id.clone(), session_id.clone()), Arc::clone(&registered));

        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if ws_tx.send(msg).await.is_err() {
                    break;
                }
            }
        });

        while let Some(msg) = ws_rx.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    if let Ok(raw) = serde_json::from_str::<serde_json::Value>(&text) {
                        if let Ok(envelope) = Envelope::from_raw(&raw) {
                            self.events.push(AdapterEvent { envelope }).await;
                        }
                    }
                }
                Ok(Message::Binary(bytes)) => {
                    self.ingest_binary(&device_id, &session_id, &bytes).await;
                }
                Ok(Message::Close(_)) | Err(_) => break,
                _ => {}
            }
        }

        writer.abort();
        self.deregister(&device_id, &session_id, &registered).await;
    }

    async fn ingest_binary(&self, device_id: &str, session_id: &str, bytes: &[u8]) {
        let payload = match AudioFrame::decode(bytes, self.audio_magic) {
            Ok(frame) => serde_json::json!({
                "device_id": device_id, "session_id": session_id, "type": "audio_chunk",
                "seq": frame.seq as i64, "ts": frame.timestamp as i64,
                "payload": {"audio_b64": BASE64.encode(&frame.payload)},
            }),
            Err(_) => serde_json::json!({
                "device_id": device_id, "session_id": session_id, "type": "audio_chunk",
                "payload": {"encoding": "binary", "audio_b64": BASE64.encode(bytes)},
            }),
        };
        if let Ok(envelope) = Envelope::from_raw(&payload) {
            self.events.push(AdapterEvent { envelope }).await;
        }
    }

    async fn deregister(&self, device_id: &str, session_id: &str, registered: &Arc<Socket>) {
        let mut by_device = self.by_device.write().await;
        if by_device.get(device_id).map(|s| Arc::ptr_eq(s, registered)).unwrap_or(false) {
            by_device.remove(device_id);
        }
        drop(by_device);
        let mut by_pair = self.by_device_session.write().await;
        let key = (device_id.to_owned(), session_id.to_owned());
        if by_pair.get(&key).map(|s| Arc::ptr_eq(s, registered)).unwrap_or(false) {
            by_pair.remove(&key);
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

#[async_trait]
impl SouthboundAdapter for WebsocketAdapter {
    async fn start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self) {
        self.by_device.write().await.clear();
        self.by_device_session.write().await.clear();
    }

    async fn recv_event(&self) -> Option<AdapterEvent> {
        self.events.recv().await
    }

    async fn send_command(&self, envelope: &Envelope) -> anyhow::Result<()> {
        let key = (envelope.device_id.clone(), envelope.session_id.clone());
        let socket = {
            let by_pair = self.by_device_session.read().await;
            by_pair.get(&key).cloned()
        };
        let socket = match socket {
            Some(s) => Some(s),
            None => self.by_device.read().await.get(&envelope.device_id).cloned(),
        };
        let Some(socket) = socket else {
            anyhow::bail!("no websocket registered for device {}", envelope.device_id);
        };
        let text = envelope.to_json().to_string();
        socket
            .tx
            .send(Message::Text(text.into()))
            .await
            .map_err(|_| anyhow::anyhow!("websocket send channel closed"))
    }

    async fn inject_event(&self, envelope: Envelope) {
        self.events.push(AdapterEvent { envelope }).await;
    }
}

#[cfg(test)]
mod websocket_tests {
    use super::*;

    #[test]
    fn token_check_rejects_mismatch() {
        let adapter = WebsocketAdapter::new(true, Some("secret".to_owned()), 0xA5);
        assert!(!adapter.token_ok(Some("wrong")));
        assert!(adapter.token_ok(Some("secret")));
    }

    #[test]
    fn token_not_required_always_ok() {
        let adapter = WebsocketAdapter::new(false, None, 0xA5);
        assert!(adapter.token_ok(None));
    }

    #[tokio::test]
    async fn send_command_fails_with_no_registered_socket() {
        let adapter = WebsocketAdapter::new(false, None, 0xA5);
        let env = Envelope::outbound("d1", "s1", 1, crate::envelope::OutboundType::Ack, Default::default());
        assert!(adapter.send_command(&env).await.is_err());
    }
}
