// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Gateway configuration: a flat top-level `clap::Parser` surface (host,
//! port, log level, which adapter to run) plus a structured config tree
//! loaded from a JSON file, the same way the teacher loads
//! `credential_config` (`serde_json::from_str` over
//! `std::fs::read_to_string`).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, clap::Parser)]
#[command(name = "gateway", about = "Device runtime gateway")]
pub struct Cli {
    /// Control-plane HTTP host to bind on.
    #[arg(long, default_value = "0.0.0.0", env = "GATEWAY_HOST")]
    pub host: String,

    /// Control-plane HTTP port.
    #[arg(long, default_value_t = 8090, env = "GATEWAY_PORT")]
    pub port: u16,

    /// Tracing filter, e.g. `info` or `gateway=debug,tower_http=info`.
    #[arg(long, default_value = "info", env = "GATEWAY_LOG")]
    pub log: String,

    /// Path to the structured JSON config file (hardware/mqtt/digital_task/safety/interaction).
    #[arg(long, env = "GATEWAY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Directory for the lifelog/observability SQLite databases.
    #[arg(long, default_value = "./data", env = "GATEWAY_DATA_DIR")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    Websocket,
    Ec600,
    GenericMqtt,
    Mock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TtsMode {
    DeviceText,
    ServerAudio,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlApiConfig {
    pub auth_enabled: bool,
    pub auth_token: Option<String>,
    pub rate_limit_rpm: u32,
    pub rate_limit_burst: u32,
    pub rate_limit_window_seconds: u64,
    pub replay_enabled: bool,
    pub replay_window_seconds: u64,
    pub max_request_body_bytes: usize,
}

impl Default for ControlApiConfig {
    fn default() -> Self {
        Self {
            auth_enabled: false,
            auth_token: None,
            rate_limit_rpm: 120,
            rate_limit_burst: 20,
            rate_limit_window_seconds: 60,
            replay_enabled: false,
            replay_window_seconds: 120,
            max_request_body_bytes: 1_048_576,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub keepalive_seconds: u16,
    pub qos_control: u8,
    pub qos_audio: u8,
    pub reconnect_min_backoff_ms: u64,
    pub reconnect_max_backoff_ms: u64,
    pub offline_control_buffer: usize,
    pub control_replay_window: usize,
    pub replay_enabled: bool,
    pub heartbeat_topic: Option<String>,
    pub heartbeat_interval_seconds: u64,
    pub up_control_topic: String,
    pub up_audio_topic: String,
    pub down_control_topic: String,
    pub down_audio_topic: String,
    pub audio_frame_magic: u8,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_owned(),
            port: 1883,
            keepalive_seconds: 30,
            qos_control: 1,
            qos_audio: 0,
            reconnect_min_backoff_ms: 500,
            reconnect_max_backoff_ms: 30_000,
            offline_control_buffer: 64,
            control_replay_window: 64,
            replay_enabled: true,
            heartbeat_topic: None,
            heartbeat_interval_seconds: 30,
            up_control_topic: "device/+/up/control".to_owned(),
            up_audio_topic: "device/+/up/audio".to_owned(),
            down_control_topic: "device/{device_id}/down/control".to_owned(),
            down_audio_topic: "device/{device_id}/down/audio".to_owned(),
            audio_frame_magic: 0xA5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    pub adapter: AdapterKind,
    pub tts_mode: TtsMode,
    pub tts_audio_chunk_bytes: usize,
    pub no_heartbeat_timeout_s: u64,
    pub device_auth_enabled: bool,
    pub allow_unbound_devices: bool,
    pub require_activated_devices: bool,
    pub ws_require_token: bool,
    pub control_api: ControlApiConfig,
    pub mqtt: MqttConfig,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            adapter: AdapterKind::Mock,
            tts_mode: TtsMode::DeviceText,
            tts_audio_chunk_bytes: 4096,
            no_heartbeat_timeout_s: 90,
            device_auth_enabled: false,
            allow_unbound_devices: true,
            require_activated_devices: false,
            ws_require_token: false,
            control_api: ControlApiConfig::default(),
            mqtt: MqttConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DigitalTaskConfigFile {
    pub default_timeout_seconds: u64,
    pub max_concurrent_tasks: usize,
    pub status_retry_count: u32,
    pub status_retry_backoff_ms: u64,
    pub sqlite_path: PathBuf,
}

impl Default for DigitalTaskConfigFile {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 120,
            max_concurrent_tasks: 4,
            status_retry_count: 2,
            status_retry_backoff_ms: 250,
            sqlite_path: PathBuf::from("./data/digital_tasks.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfigFile {
    pub enabled: bool,
    pub low_confidence_threshold: f64,
    pub max_output_chars: usize,
    pub prepend_caution_for_risk: bool,
    pub semantic_guard_enabled: bool,
    pub directional_confidence_threshold: f64,
}

impl Default for SafetyConfigFile {
    fn default() -> Self {
        let d = crate::policy::safety::SafetyConfig::default();
        Self {
            enabled: d.enabled,
            low_confidence_threshold: d.low_confidence_threshold,
            max_output_chars: d.max_output_chars,
            prepend_caution_for_risk: d.prepend_caution_for_risk,
            semantic_guard_enabled: d.semantic_guard_enabled,
            directional_confidence_threshold: d.directional_confidence_threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InteractionConfigFile {
    pub enabled: bool,
    pub emotion_cue_sources: Vec<String>,
    pub proactive_hint_sources: Vec<String>,
    pub proactive_hint_text: String,
    pub quiet_hours_start_hour: Option<u8>,
    pub quiet_hours_end_hour: Option<u8>,
    pub low_priority_sources: Vec<String>,
}

impl Default for InteractionConfigFile {
    fn default() -> Self {
        let d = crate::policy::interaction::InteractionConfig::default();
        Self {
            enabled: d.enabled,
            emotion_cue_sources: d.emotion_cue_sources,
            proactive_hint_sources: d.proactive_hint_sources,
            proactive_hint_text: d.proactive_hint_text,
            quiet_hours_start_hour: d.quiet_hours_start_hour,
            quiet_hours_end_hour: d.quiet_hours_end_hour,
            low_priority_sources: d.low_priority_sources,
        }
    }
}

/// The structured config tree, loaded from `--config` (or defaults if
/// absent). Mirrors the nested surface spec.md §6 names
/// (`hardware.*`, `digital_task.*`, `safety.*`, `interaction.*`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfigFile {
    pub hardware: HardwareConfig,
    pub digital_task: DigitalTaskConfigFile,
    pub safety: SafetyConfigFile,
    pub interaction: InteractionConfigFile,
    pub observability_max_rows: i64,
}

/// The fully resolved configuration: CLI flags plus the loaded config file.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub host: String,
    pub port: u16,
    pub log: String,
    pub data_dir: PathBuf,
    pub file: GatewayConfigFile,
}

impl GatewayConfig {
    pub fn load(cli: Cli) -> anyhow::Result<Self> {
        let file = match &cli.config {
            Some(path) => {
                let contents = std::fs::read_to_string(path)?;
                serde_json::from_str(&contents)?
            }
            None => GatewayConfigFile::default(),
        };
        Ok(Self { host: cli.host, port: cli.port, log: cli.log, data_dir: cli.data_dir, file })
    }

    /// Cross-field invariants a malformed config file would otherwise only
    /// surface as a confusing runtime failure. Collects every violation
    /// instead of stopping at the first.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let mqtt = &self.file.hardware.mqtt;

        if mqtt.qos_control > 2 {
            errors.push(format!("hardware.mqtt.qos_control must be 0, 1, or 2 (got {})", mqtt.qos_control));
        }
        if mqtt.qos_audio > 2 {
            errors.push(format!("hardware.mqtt.qos_audio must be 0, 1, or 2 (got {})", mqtt.qos_audio));
        }
        if mqtt.control_replay_window == 0 {
            errors.push("hardware.mqtt.control_replay_window must be >= 1".to_owned());
        }
        if mqtt.offline_control_buffer == 0 {
            errors.push("hardware.mqtt.offline_control_buffer must be >= 1".to_owned());
        }
        if mqtt.reconnect_min_backoff_ms > mqtt.reconnect_max_backoff_ms {
            errors.push("hardware.mqtt.reconnect_min_backoff_ms must be <= reconnect_max_backoff_ms".to_owned());
        }

        if self.file.digital_task.max_concurrent_tasks == 0 {
            errors.push("digital_task.max_concurrent_tasks must be >= 1".to_owned());
        }
        if self.file.digital_task.default_timeout_seconds == 0 {
            errors.push("digital_task.default_timeout_seconds must be >= 1".to_owned());
        }

        let api = &self.file.hardware.control_api;
        if api.rate_limit_window_seconds == 0 {
            errors.push("hardware.control_api.rate_limit_window_seconds must be >= 1".to_owned());
        }
        if api.auth_enabled && api.auth_token.as_deref().unwrap_or("").is_empty() {
            errors.push("hardware.control_api.auth_token must be set when auth_enabled is true".to_owned());
        }

        if !(0.0..=1.0).contains(&self.file.safety.low_confidence_threshold) {
            errors.push("safety.low_confidence_threshold must be within [0, 1]".to_owned());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod config_tests {
    use super::*;

    fn base_config() -> GatewayConfig {
        GatewayConfig {
            host: "0.0.0.0".into(),
            port: 8090,
            log: "info".into(),
            data_dir: PathBuf::from("./data"),
            file: GatewayConfigFile::default(),
        }
    }

    #[test]
    fn default_config_is_valid() {
        assert!(base_config().validate().is_ok());
    }

    #[test]
    fn bad_qos_is_rejected_with_message() {
        let mut config = base_config();
        config.file.hardware.mqtt.qos_control = 9;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("qos_control")));
    }

    #[test]
    fn auth_enabled_without_token_is_rejected() {
        let mut config = base_config();
        config.file.hardware.control_api.auth_enabled = true;
        config.file.hardware.control_api.auth_token = None;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("auth_token")));
    }

    #[test]
    fn zero_max_concurrent_tasks_is_rejected() {
        let mut config = base_config();
        config.file.digital_task.max_concurrent_tasks = 0;
        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("max_concurrent_tasks")));
    }
}
