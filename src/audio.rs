// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Per-session audio pipeline (C4): ordered reassembly of audio/text
//! chunks, a VAD-gated prebuffer, a jitter window for out-of-order audio,
//! and finalize/transcribe. Ingestion is serialized behind a single
//! `tokio::sync::Mutex` per session, per spec.md §4.4.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::info;

/// External STT fallback used by `finalize_capture` when no ordered text
/// chunks arrived from the device. Out of scope for this crate beyond the
/// trait boundary — the real backend lives in a separate service.
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio: &[u8]) -> Option<String>;
}

/// A transcriber that always fails; used where no backend is configured.
pub struct NullTranscriber;

#[async_trait]
impl Transcriber for NullTranscriber {
    async fn transcribe(&self, _audio: &[u8]) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct AudioConfig {
    pub vad_enabled: bool,
    pub vad_silence_chunks: u32,
    pub prebuffer_chunks: usize,
    pub jitter_window: usize,
    pub max_bytes: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            vad_enabled: true,
            vad_silence_chunks: 8,
            prebuffer_chunks: 16,
            jitter_window: 8,
            max_bytes: 2 * 1024 * 1024,
        }
    }
}

struct CaptureState {
    ordered_audio_chunks: BTreeMap<i64, Vec<u8>>,
    ordered_text_chunks: BTreeMap<i64, String>,
    pending_audio_chunks: BTreeMap<i64, Vec<u8>>,
    prebuffer_audio_chunks: VecDeque<(i64, Vec<u8>)>,
    total_audio_bytes: usize,
    next_local_order: i64,
    next_expected_audio_order: i64,
    vad_active: bool,
    silence_chunks: u32,
    speech_chunks: u32,
}

impl CaptureState {
    fn new() -> Self {
        Self {
            ordered_audio_chunks: BTreeMap::new(),
            ordered_text_chunks: BTreeMap::new(),
            pending_audio_chunks: BTreeMap::new(),
            prebuffer_audio_chunks: VecDeque::new(),
            total_audio_bytes: 0,
            next_local_order: 0,
            next_expected_audio_order: 0,
            vad_active: false,
            silence_chunks: 0,
            speech_chunks: 0,
        }
    }
}

/// Per-session audio capture buffer.
pub struct AudioCapture {
    config: AudioConfig,
    state: Mutex<CaptureState>,
}

const ORDER_KEYS: &[&str] = &["chunk_index", "chunk_idx", "frame_index", "index", "order", "timestamp"];

fn extract_order(payload: &BTreeMap<String, Value>, seq: i64, next_local: i64) -> i64 {
    for key in ORDER_KEYS {
        if let Some(v) = payload.get(*key).and_then(Value::as_i64) {
            return v;
        }
    }
    if seq >= 0 {
        return seq;
    }
    next_local
}

fn decode_audio_b64(payload: &BTreeMap<String, Value>) -> Vec<u8> {
    payload
        .get("audio_b64")
        .and_then(Value::as_str)
        .and_then(|s| BASE64.decode(s).ok())
        .unwrap_or_default()
}

impl AudioCapture {
    pub fn new(config: AudioConfig) -> Self {
        Self { config, state: Mutex::new(CaptureState::new()) }
    }

    /// Ingest one `audio_chunk` payload. Honors VAD gating when enabled.
    pub async fn ingest_audio_chunk(&self, payload: &BTreeMap<String, Value>, seq: i64) {
        let bytes = decode_audio_b64(payload);
        let is_speech = payload.get("is_speech").and_then(Value::as_bool);
        let has_text = payload.get("text").and_then(Value::as_str).map(|s| !s.is_empty()).unwrap_or(false);

        let mut st = self.state.lock().await;
        let order = extract_order(payload, seq, st.next_local_order);
        if order >= st.next_local_order {
            st.next_local_order = order + 1;
        }

        if !self.config.vad_enabled {
            self.admit_pending(&mut st, order, bytes);
            self.promote_contiguous(&mut st, false);
            return;
        }

        // Absent VAD hint is treated conservatively as speech (deliberate
        // default: false negatives here silently drop audio the user meant
        // to speak).
        let speech = is_speech.unwrap_or(true) || has_text;

        if speech {
            st.silence_chunks = 0;
            st.speech_chunks += 1;
            st.vad_active = true;
            // Flush prebuffer into the ordered pipeline ahead of this chunk.
            let prebuffered: Vec<(i64, Vec<u8>)> = st.prebuffer_audio_chunks.drain(..).collect();
            for (o, b) in prebuffered {
                self.admit_pending(&mut st, o, b);
            }
            self.admit_pending(&mut st, order, bytes);
            self.promote_contiguous(&mut st, false);
        } else if st.vad_active {
            // Still within an active utterance; store and count silence.
            self.admit_pending(&mut st, order, bytes);
            self.promote_contiguous(&mut st, false);
            st.silence_chunks += 1;
            if st.silence_chunks >= self.config.vad_silence_chunks {
                st.vad_active = false;
            }
        } else {
            // Pre-speech silence: ring buffer, oldest dropped on overflow.
            if st.prebuffer_audio_chunks.len() >= self.config.prebuffer_chunks {
                st.prebuffer_audio_chunks.pop_front();
            }
            st.prebuffer_audio_chunks.push_back((order, bytes));
        }
    }

    fn admit_pending(&self, st: &mut CaptureState, order: i64, bytes: Vec<u8>) {
        if bytes.is_empty() {
            return;
        }
        if st.total_audio_bytes + bytes.len() > self.config.max_bytes {
            info!(order, len = bytes.len(), "audio budget exceeded, dropping chunk");
            return;
        }
        st.total_audio_bytes += bytes.len();
        st.pending_audio_chunks.insert(order, bytes);
    }

    /// Promote contiguous pending chunks starting at `next_expected_audio_order`.
    /// When more than `jitter_window` chunks are pending, the smallest pending
    /// chunk is force-promoted even if it leaves a gap. `force=true` promotes
    /// everything remaining, in order.
    fn promote_contiguous(&self, st: &mut CaptureState, force: bool) {
        loop {
            if let Some(bytes) = st.pending_audio_chunks.remove(&st.next_expected_audio_order) {
                st.ordered_audio_chunks.insert(st.next_expected_audio_order, bytes);
                st.next_expected_audio_order += 1;
                continue;
            }

            if force {
                if let Some((&order, _)) = st.pending_audio_chunks.iter().next() {
                    if let Some(bytes) = st.pending_audio_chunks.remove(&order) {
                        st.ordered_audio_chunks.insert(order, bytes);
                        st.next_expected_audio_order = order + 1;
                        continue;
                    }
                }
                break;
            }

            if st.pending_audio_chunks.len() > self.config.jitter_window {
                if let Some((&order, _)) = st.pending_audio_chunks.iter().next() {
                    if let Some(bytes) = st.pending_audio_chunks.remove(&order) {
                        st.ordered_audio_chunks.insert(order, bytes);
                        st.next_expected_audio_order = order + 1;
                        continue;
                    }
                }
            }
            break;
        }
    }

    /// Ingest a text chunk. If `order` collides with a different text, the
    /// new text is shifted to the next free order — never silently
    /// overwritten.
    pub async fn ingest_text_chunk(&self, text: String, payload: &BTreeMap<String, Value>, seq: i64) {
        let mut st = self.state.lock().await;
        let mut order = extract_order(payload, seq, st.next_local_order);
        if order >= st.next_local_order {
            st.next_local_order = order + 1;
        }
        loop {
            match st.ordered_text_chunks.get(&order) {
                Some(existing) if existing != &text => {
                    order += 1;
                    if order >= st.next_local_order {
                        st.next_local_order = order + 1;
                    }
                }
                _ => break,
            }
        }
        st.ordered_text_chunks.insert(order, text);
    }

    /// Current joined text (ascending order, space-separated), truncated to
    /// `max_chars` with an ellipsis.
    pub async fn partial_transcript(&self, max_chars: usize) -> String {
        let st = self.state.lock().await;
        let joined = st.ordered_text_chunks.values().cloned().collect::<Vec<_>>().join(" ");
        truncate_with_ellipsis(&joined, max_chars)
    }

    /// Finalize the capture for this turn, resetting all buffers.
    ///
    /// 1. If `payload.transcript|text` is explicit, use it verbatim.
    /// 2. Otherwise flush prebuffer + pending audio with `force=true`.
    /// 3. If ordered text exists, return it.
    /// 4. Otherwise hand ordered audio bytes to `transcribe_fn`; `""` on
    ///    failure.
    pub async fn finalize_capture(
        &self,
        payload: &BTreeMap<String, Value>,
        transcriber: &dyn Transcriber,
    ) -> String {
        if let Some(explicit) = payload
            .get("transcript")
            .or_else(|| payload.get("text"))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
        {
            let text = explicit.to_owned();
            self.reset().await;
            return text;
        }

        let (ordered_text, audio_bytes) = {
            let mut st = self.state.lock().await;
            let prebuffered: Vec<(i64, Vec<u8>)> = st.prebuffer_audio_chunks.drain(..).collect();
            for (o, b) in prebuffered {
                self.admit_pending(&mut st, o, b);
            }
            self.promote_contiguous(&mut st, true);

            let text = st.ordered_text_chunks.values().cloned().collect::<Vec<_>>().join(" ");
            let audio: Vec<u8> =
                st.ordered_audio_chunks.values().flat_map(|b| b.iter().copied()).collect();
            (text, audio)
        };

        self.reset().await;

        if !ordered_text.is_empty() {
            return ordered_text;
        }
        if audio_bytes.is_empty() {
            return String::new();
        }
        transcriber.transcribe(&audio_bytes).await.unwrap_or_default()
    }

    pub async fn reset(&self) {
        *self.state.lock().await = CaptureState::new();
    }

    pub async fn total_bytes(&self) -> usize {
        self.state.lock().await.total_audio_bytes
    }
}

fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_owned();
    }
    let truncated: String = s.chars().take(max_chars.saturating_sub(1)).collect();
    format!("{truncated}…")
}

#[cfg(test)]
mod audio_tests {
    use super::*;
    use serde_json::json;

    fn payload(v: Value) -> BTreeMap<String, Value> {
        v.as_object().unwrap().clone().into_iter().collect()
    }

    struct FixedTranscriber(String);

    #[async_trait]
    impl Transcriber for FixedTranscriber {
        async fn transcribe(&self, audio: &[u8]) -> Option<String> {
            if audio == b"AABB" {
                Some(self.0.clone())
            } else {
                None
            }
        }
    }

    #[tokio::test]
    async fn out_of_order_audio_reassembles_in_order() {
        let cap = AudioCapture::new(AudioConfig { vad_enabled: false, ..Default::default() });
        let p1 = payload(json!({"chunk_index": 2, "audio_b64": BASE64.encode("BB")}));
        cap.ingest_audio_chunk(&p1, 3).await;
        let p2 = payload(json!({"chunk_index": 1, "audio_b64": BASE64.encode("AA")}));
        cap.ingest_audio_chunk(&p2, 4).await;

        let transcriber = FixedTranscriber("ok".to_owned());
        let text = cap.finalize_capture(&BTreeMap::new(), &transcriber).await;
        assert_eq!(text, "ok");
    }

    #[tokio::test]
    async fn explicit_transcript_short_circuits() {
        let cap = AudioCapture::new(AudioConfig::default());
        let p = payload(json!({"transcript": "hello there"}));
        let text = cap.finalize_capture(&p, &NullTranscriber).await;
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn text_chunk_collision_shifts_to_next_free_order() {
        let cap = AudioCapture::new(AudioConfig::default());
        cap.ingest_text_chunk("first".into(), &payload(json!({"order": 0})), -1).await;
        cap.ingest_text_chunk("second".into(), &payload(json!({"order": 0})), -1).await;
        let joined = cap.partial_transcript(1000).await;
        assert_eq!(joined, "first second");
    }

    #[tokio::test]
    async fn audio_budget_drops_overflow_but_continues() {
        let cap = AudioCapture::new(AudioConfig {
            vad_enabled: false,
            max_bytes: 4,
            ..Default::default()
        });
        cap.ingest_audio_chunk(&payload(json!({"order": 0, "audio_b64": BASE64.encode("AA")})), -1)
            .await;
        cap.ingest_audio_chunk(&payload(json!({"order": 1, "audio_b64": BASE64.encode("BBBBBB")})), -1)
            .await;
        assert!(cap.total_bytes().await <= 4);
        // Capture keeps accepting further chunks instead of jamming.
        cap.ingest_audio_chunk(&payload(json!({"order": 2, "audio_b64": BASE64.encode("CC")})), -1)
            .await;
    }

    #[tokio::test]
    async fn jitter_window_force_promotes_smallest_pending() {
        let cap = AudioCapture::new(AudioConfig {
            vad_enabled: false,
            jitter_window: 2,
            ..Default::default()
        });
        // next_expected stays at 0 because order 0 never arrives; once more
        // than jitter_window chunks are pending, the smallest is promoted.
        for i in [5, 4, 3, 2] {
            cap.ingest_audio_chunk(
                &payload(json!({"order": i, "audio_b64": BASE64.encode("X")})),
                -1,
            )
            .await;
        }
        let st = cap.state.lock().await;
        assert!(!st.ordered_audio_chunks.is_empty());
    }
}
