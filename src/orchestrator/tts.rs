// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! TTS output paths (4.5): `device_text` streams plain chunks the device
//! itself speaks; `server_audio` synthesizes audio here and streams
//! base64 chunks, falling back to `device_text` when synthesis yields
//! nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::adapter::SouthboundAdapter;
use crate::envelope::{Envelope, OutboundType};
use crate::orchestrator::external::TtsSynthesizer;
use crate::session::{DeviceSession, SessionManager, SessionState};

const TTS_START_PREVIEW_CHARS: usize = 80;
const TTS_TEXT_CHUNK_CHARS: usize = 220;

fn chunk_chars(text: &str, size: usize) -> Vec<String> {
    if text.is_empty() {
        return Vec::new();
    }
    text.chars()
        .collect::<Vec<_>>()
        .chunks(size)
        .map(|c| c.iter().collect())
        .collect()
}

async fn send(adapter: &dyn SouthboundAdapter, sessions: &SessionManager, session: &DeviceSession, cmd_type: OutboundType, payload: BTreeMap<String, serde_json::Value>) {
    let seq = sessions.next_outbound_seq(session).await;
    let envelope = Envelope::outbound(&session.device_id, &session.session_id, seq, cmd_type, payload);
    if let Err(e) = adapter.send_command(&envelope).await {
        tracing::warn!(err = %e, device_id = %session.device_id, "tts command send failed");
    }
}

fn preview(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Stream `text` as `tts_start` / `tts_chunk`* / `tts_stop`. Leaves the
/// session in `speaking` state; the caller transitions back to `ready`
/// once this returns.
pub async fn speak_device_text(
    adapter: &dyn SouthboundAdapter,
    sessions: &SessionManager,
    session: &DeviceSession,
    text: &str,
) {
    sessions.update_state(session, SessionState::Speaking).await;

    let mut start_payload = BTreeMap::new();
    start_payload.insert("text".to_owned(), preview(text, TTS_START_PREVIEW_CHARS).into());
    send(adapter, sessions, session, OutboundType::TtsStart, start_payload).await;

    for chunk in chunk_chars(text, TTS_TEXT_CHUNK_CHARS) {
        let mut payload = BTreeMap::new();
        payload.insert("text".to_owned(), chunk.into());
        send(adapter, sessions, session, OutboundType::TtsChunk, payload).await;
    }

    let mut stop_payload = BTreeMap::new();
    stop_payload.insert("aborted".to_owned(), false.into());
    send(adapter, sessions, session, OutboundType::TtsStop, stop_payload).await;
}

/// Synthesize `text` through `synthesizer` and stream base64 audio
/// chunks; falls back to [`speak_device_text`] when synthesis produces
/// no audio.
pub async fn speak_server_audio(
    adapter: &dyn SouthboundAdapter,
    sessions: &SessionManager,
    session: &DeviceSession,
    text: &str,
    synthesizer: &Arc<dyn TtsSynthesizer>,
    tts_audio_chunk_bytes: usize,
) {
    let audio = match synthesizer.synthesize(text).await {
        Ok(Some(audio)) => audio,
        Ok(None) => {
            speak_device_text(adapter, sessions, session, text).await;
            return;
        }
        Err(e) => {
            tracing::warn!(err = %e, "tts synthesis failed, falling back to device_text");
            speak_device_text(adapter, sessions, session, text).await;
            return;
        }
    };

    sessions.update_state(session, SessionState::Speaking).await;

    let mut start_payload = BTreeMap::new();
    start_payload.insert("mode".to_owned(), "server_audio".into());
    start_payload.insert("encoding".to_owned(), audio.encoding.clone().into());
    send(adapter, sessions, session, OutboundType::TtsStart, start_payload).await;

    let chunk_size = tts_audio_chunk_bytes.max(1);
    for chunk in audio.bytes.chunks(chunk_size) {
        let mut payload = BTreeMap::new();
        payload.insert("audio_b64".to_owned(), BASE64.encode(chunk).into());
        payload.insert("encoding".to_owned(), audio.encoding.clone().into());
        if let Some(rate) = audio.sample_rate_hz {
            payload.insert("sample_rate_hz".to_owned(), rate.into());
        }
        send(adapter, sessions, session, OutboundType::TtsChunk, payload).await;
    }

    let mut stop_payload = BTreeMap::new();
    stop_payload.insert("aborted".to_owned(), false.into());
    send(adapter, sessions, session, OutboundType::TtsStop, stop_payload).await;
}

#[cfg(test)]
mod tts_tests {
    use super::*;
    use crate::adapter::mock::MockAdapter;
    use crate::session::NullPersister;
    use async_trait::async_trait;

    fn manager() -> SessionManager {
        SessionManager::new(Arc::new(NullPersister))
    }

    #[tokio::test]
    async fn device_text_chunks_and_ends_with_stop() {
        let adapter = MockAdapter::new(0xA5);
        let sessions = manager();
        let session = sessions.get_or_create("d1", "s1").await;
        let long_text = "x".repeat(500);
        speak_device_text(&adapter, &sessions, &session, &long_text).await;

        let sent = adapter.sent_commands().await;
        assert_eq!(sent.first().unwrap().outbound_type(), Some(OutboundType::TtsStart));
        assert_eq!(sent.last().unwrap().outbound_type(), Some(OutboundType::TtsStop));
        let chunk_count = sent.iter().filter(|e| e.outbound_type() == Some(OutboundType::TtsChunk)).count();
        assert_eq!(chunk_count, 3); // 500 chars / 220 per chunk, rounded up
    }

    struct FixedSynth(Option<crate::orchestrator::external::SynthesizedAudio>);

    #[async_trait]
    impl TtsSynthesizer for FixedSynth {
        async fn synthesize(&self, _text: &str) -> anyhow::Result<Option<crate::orchestrator::external::SynthesizedAudio>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn server_audio_falls_back_to_device_text_when_empty() {
        let adapter = MockAdapter::new(0xA5);
        let sessions = manager();
        let session = sessions.get_or_create("d1", "s1").await;
        let synth: Arc<dyn TtsSynthesizer> = Arc::new(FixedSynth(None));
        speak_server_audio(&adapter, &sessions, &session, "hello", &synth, 4096).await;

        let sent = adapter.sent_commands().await;
        assert!(sent.iter().any(|e| e.payload_str("text").is_some()));
    }

    #[tokio::test]
    async fn server_audio_streams_base64_chunks() {
        let adapter = MockAdapter::new(0xA5);
        let sessions = manager();
        let session = sessions.get_or_create("d1", "s1").await;
        let audio = crate::orchestrator::external::SynthesizedAudio {
            bytes: vec![0u8; 10],
            encoding: "pcm16".to_owned(),
            sample_rate_hz: Some(16000),
        };
        let synth: Arc<dyn TtsSynthesizer> = Arc::new(FixedSynth(Some(audio)));
        speak_server_audio(&adapter, &sessions, &session, "hello", &synth, 4).await;

        let sent = adapter.sent_commands().await;
        let chunks: Vec<_> = sent.iter().filter(|e| e.outbound_type() == Some(OutboundType::TtsChunk)).collect();
        assert_eq!(chunks.len(), 3); // 10 bytes / 4 per chunk, rounded up
        assert!(chunks[0].payload_str("audio_b64").is_some());
    }
}
