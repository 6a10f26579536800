// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Profile-driven generic MQTT adapter (4.2.2): the same offline/replay
//! state machine as the vendor adapter, but every field name and event
//! type string is resolved through a configurable device profile instead
//! of being hardcoded. Aliases match case-insensitively after stripping
//! non-alphanumerics.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A device profile: alias tables resolved before parsing into the
/// canonical envelope, plus the reverse mapping applied to outbound
/// commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceProfile {
    /// Canonical field name -> accepted aliases, e.g. `"type" -> ["evt", "kind"]`.
    pub field_aliases: HashMap<String, Vec<String>>,
    /// Raw event type string -> canonical type, e.g. `"hb" -> "heartbeat"`.
    pub event_type_aliases: HashMap<String, String>,
    /// Payload field aliases, same shape as `field_aliases` but scoped to
    /// the `payload` object.
    pub payload_field_aliases: HashMap<String, Vec<String>>,
    /// Downlink envelope key remapping applied when serializing outbound
    /// commands, e.g. `"type" -> "cmd"`.
    pub downlink_key_remap: HashMap<String, String>,
    /// Outbound command-type alias, e.g. `"tts_stop" -> "stop_tts"`.
    pub command_type_aliases: HashMap<String, String>,
    /// JSON-base64 audio uplink key aliases (`audio_b64|encoding|seq|ts`).
    pub audio_json_field_aliases: HashMap<String, Vec<String>>,
}

fn normalize(s: &str) -> String {
    s.chars().filter(|c| c.is_alphanumeric()).collect::<String>().to_lowercase()
}

impl DeviceProfile {
    fn resolve_alias<'a>(aliases: &HashMap<String, Vec<String>>, canonical: &str, obj: &'a serde_json::Map<String, Value>) -> Option<&'a Value> {
        if let Some(v) = obj.get(canonical) {
            return Some(v);
        }
        let candidates = aliases.get(canonical)?;
        let target = normalize(canonical);
        obj.iter().find_map(|(k, v)| {
            if normalize(k) == target || candidates.iter().any(|c| normalize(c) == normalize(k)) {
                Some(v)
            } else {
                None
            }
        })
    }

    /// Rewrite a raw uplink JSON object into the canonical envelope shape
    /// (`device_id`, `session_id`, `type`, `seq`, `ts`, `msg_id`, `version`,
    /// `payload`) the rest of the gateway understands.
    pub fn canonicalize_uplink(&self, raw: &Value) -> Option<Value> {
        let obj = raw.as_object()?;
        const KEYS: &[&str] =
            &["type", "device_id", "session_id", "seq", "ts", "msg_id", "version", "payload"];

        let mut out = serde_json::Map::new();
        for key in KEYS {
            if let Some(v) = Self::resolve_alias(&self.field_aliases, key, obj) {
                out.insert((*key).to_owned(), v.clone());
            }
        }

        if let Some(Value::String(raw_type)) = out.get("type").cloned() {
            let normalized = normalize(&raw_type);
            let canonical = self
                .event_type_aliases
                .iter()
                .find(|(k, _)| normalize(k) == normalized)
                .map(|(_, v)| v.clone())
                .unwrap_or(raw_type);
            out.insert("type".to_owned(), Value::String(canonical));
        }

        if let Some(Value::Object(payload)) = out.get("payload").cloned() {
            let mut remapped = serde_json::Map::new();
            for (k, v) in &payload {
                let canonical_key = self
                    .payload_field_aliases
                    .iter()
                    .find(|(_, aliases)| aliases.iter().any(|a| normalize(a) == normalize(k)))
                    .map(|(canonical, _)| canonical.clone())
                    .unwrap_or_else(|| k.clone());
                remapped.insert(canonical_key, v.clone());
            }
            out.insert("payload".to_owned(), Value::Object(remapped));
        }

        Some(Value::Object(out))
    }

    /// Extract the base64 audio uplink fields from a JSON-encoded audio
    /// object (the non-framed uplink mode).
    pub fn extract_json_audio(&self, raw: &Value) -> Option<(String, Option<String>, Option<i64>, Option<i64>)> {
        let obj = raw.as_object()?;
        let audio_b64 = Self::resolve_alias(&self.audio_json_field_aliases, "audio_b64", obj)?
            .as_str()?
            .to_owned();
        let encoding =
            Self::resolve_alias(&self.audio_json_field_aliases, "encoding", obj).and_then(Value::as_str).map(str::to_owned);
        let seq = Self::resolve_alias(&self.audio_json_field_aliases, "seq", obj).and_then(Value::as_i64);
        let ts = Self::resolve_alias(&self.audio_json_field_aliases, "ts", obj).and_then(Value::as_i64);
        Some((audio_b64, encoding, seq, ts))
    }

    /// Apply the downlink key remap and command-type alias to an outbound
    /// envelope JSON before it's sent to the device.
    pub fn render_downlink(&self, envelope_json: &Value) -> Value {
        let Some(obj) = envelope_json.as_object() else { return envelope_json.clone() };
        let mut out = serde_json::Map::new();
        for (k, v) in obj {
            let mut value = v.clone();
            if k == "type" {
                if let Some(type_str) = value.as_str() {
                    if let Some(alias) = self.command_type_aliases.get(type_str) {
                        value = Value::String(alias.clone());
                    }
                }
            }
            let key = self.downlink_key_remap.get(k).cloned().unwrap_or_else(|| k.clone());
            out.insert(key, value);
        }
        Value::Object(out)
    }
}

#[cfg(test)]
mod profile_tests {
    use super::*;
    use serde_json::json;

    fn profile() -> DeviceProfile {
        let mut field_aliases = HashMap::new();
        field_aliases.insert("type".to_owned(), vec!["evt".to_owned()]);
        field_aliases.insert("device_id".to_owned(), vec!["dev".to_owned()]);

        let mut event_type_aliases = HashMap::new();
        event_type_aliases.insert("hb".to_owned(), "heartbeat".to_owned());

        let mut downlink_key_remap = HashMap::new();
        downlink_key_remap.insert("type".to_owned(), "cmd".to_owned());
        downlink_key_remap.insert("payload".to_owned(), "data".to_owned());

        let mut command_type_aliases = HashMap::new();
        command_type_aliases.insert("tts_stop".to_owned(), "stop_tts".to_owned());

        DeviceProfile {
            field_aliases,
            event_type_aliases,
            payload_field_aliases: HashMap::new(),
            downlink_key_remap,
            command_type_aliases,
            audio_json_field_aliases: HashMap::new(),
        }
    }

    #[test]
    fn canonicalizes_aliased_event_type() {
        let profile = profile();
        let raw = json!({"dev": "d1", "evt": "hb"});
        let canon = profile.canonicalize_uplink(&raw).unwrap();
        assert_eq!(canon["type"], "heartbeat");
        assert_eq!(canon["device_id"], "d1");
    }

    #[test]
    fn aliases_match_case_insensitively_ignoring_punctuation() {
        let mut field_aliases = HashMap::new();
        field_aliases.insert("device_id".to_owned(), vec!["Device-ID".to_owned()]);
        let profile = DeviceProfile { field_aliases, ..Default::default() };
        let raw = json!({"Device-ID": "d9", "type": "hello"});
        let canon = profile.canonicalize_uplink(&raw).unwrap();
        assert_eq!(canon["device_id"], "d9");
    }

    #[test]
    fn render_downlink_remaps_keys_and_command_type() {
        let profile = profile();
        let env = json!({"type": "tts_stop", "payload": {"aborted": true}});
        let rendered = profile.render_downlink(&env);
        assert_eq!(rendered["cmd"], "stop_tts");
        assert_eq!(rendered["data"]["aborted"], true);
    }

    #[test]
    fn extracts_json_audio_fields() {
        let mut audio_json_field_aliases = HashMap::new();
        audio_json_field_aliases.insert("audio_b64".to_owned(), vec!["b64".to_owned()]);
        let profile = DeviceProfile { audio_json_field_aliases, ..Default::default() };
        let raw = json!({"b64": "QUFC", "seq": 5});
        let (audio_b64, _encoding, seq, _ts) = profile.extract_json_audio(&raw).unwrap();
        assert_eq!(audio_b64, "QUFC");
        assert_eq!(seq, Some(5));
    }
}
