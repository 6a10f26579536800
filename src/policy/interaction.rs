// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Interaction policy (C10, second half): applied after the safety policy.
//! May prefix emotion cues for high-risk sources, append a proactive hint
//! when the source is allow-listed, or silence the output entirely during
//! quiet hours / for low-priority updates.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct InteractionConfig {
    pub enabled: bool,
    pub emotion_cue_sources: Vec<String>,
    pub proactive_hint_sources: Vec<String>,
    pub proactive_hint_text: String,
    pub quiet_hours_start_hour: Option<u8>,
    pub quiet_hours_end_hour: Option<u8>,
    pub low_priority_sources: Vec<String>,
}

impl Default for InteractionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            emotion_cue_sources: vec!["safety_policy".to_owned(), "stt_error".to_owned()],
            proactive_hint_sources: vec!["agent".to_owned()],
            proactive_hint_text: "You can also say \"stop\" any time.".to_owned(),
            quiet_hours_start_hour: None,
            quiet_hours_end_hour: None,
            low_priority_sources: vec!["telemetry".to_owned()],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionDecision {
    pub text: String,
    pub silent: bool,
    pub silence_reason: Option<String>,
    pub cue_added: bool,
    pub hint_added: bool,
}

pub struct InteractionPolicy {
    config: InteractionConfig,
}

impl InteractionPolicy {
    pub fn new(config: InteractionConfig) -> Self {
        Self { config }
    }

    fn in_quiet_hours(&self, hour: u8) -> bool {
        match (self.config.quiet_hours_start_hour, self.config.quiet_hours_end_hour) {
            (Some(start), Some(end)) if start <= end => hour >= start && hour < end,
            (Some(start), Some(end)) => hour >= start || hour < end,
            _ => false,
        }
    }

    /// Evaluate the interaction policy for outbound `text`.
    ///
    /// `current_hour` is the caller's wall-clock hour (0..24), passed in so
    /// the function stays pure and testable. `priority` is `"normal"` or
    /// `"low"`.
    pub fn apply(
        &self,
        text: &str,
        source: &str,
        risk_level: &str,
        priority: &str,
        current_hour: u8,
    ) -> InteractionDecision {
        if !self.config.enabled {
            return InteractionDecision {
                text: text.to_owned(),
                silent: false,
                silence_reason: None,
                cue_added: false,
                hint_added: false,
            };
        }

        if self.in_quiet_hours(current_hour) {
            return InteractionDecision {
                text: String::new(),
                silent: true,
                silence_reason: Some("quiet_hours".to_owned()),
                cue_added: false,
                hint_added: false,
            };
        }

        if priority == "low" && self.config.low_priority_sources.iter().any(|s| s == source) {
            return InteractionDecision {
                text: String::new(),
                silent: true,
                silence_reason: Some("low_priority_source".to_owned()),
                cue_added: false,
                hint_added: false,
            };
        }

        let mut out = text.to_owned();
        let mut cue_added = false;
        let mut hint_added = false;

        if matches!(risk_level, "P0" | "P1")
            && self.config.emotion_cue_sources.iter().any(|s| s == source)
            && !out.starts_with('[')
        {
            out = format!("[steady] {out}");
            cue_added = true;
        }

        if self.config.proactive_hint_sources.iter().any(|s| s == source)
            && !self.config.proactive_hint_text.is_empty()
        {
            out = format!("{out} {}", self.config.proactive_hint_text);
            hint_added = true;
        }

        InteractionDecision { text: out, silent: false, silence_reason: None, cue_added, hint_added }
    }
}

#[cfg(test)]
mod interaction_tests {
    use super::*;

    #[test]
    fn quiet_hours_silences_output() {
        let mut cfg = InteractionConfig::default();
        cfg.quiet_hours_start_hour = Some(22);
        cfg.quiet_hours_end_hour = Some(7);
        let policy = InteractionPolicy::new(cfg);
        let decision = policy.apply("hello", "agent", "P3", "normal", 23);
        assert!(decision.silent);
        assert_eq!(decision.silence_reason.as_deref(), Some("quiet_hours"));
    }

    #[test]
    fn low_priority_source_is_silenced() {
        let policy = InteractionPolicy::new(InteractionConfig::default());
        let decision = policy.apply("ambient update", "telemetry", "P3", "low", 12);
        assert!(decision.silent);
    }

    #[test]
    fn high_risk_prefixes_emotion_cue() {
        let policy = InteractionPolicy::new(InteractionConfig::default());
        let decision = policy.apply("please stop", "safety_policy", "P0", "normal", 12);
        assert!(decision.cue_added);
        assert!(decision.text.starts_with("[steady]"));
    }

    #[test]
    fn allow_listed_source_gets_proactive_hint() {
        let policy = InteractionPolicy::new(InteractionConfig::default());
        let decision = policy.apply("done", "agent", "P3", "normal", 12);
        assert!(decision.hint_added);
        assert!(decision.text.contains("stop"));
    }
}
