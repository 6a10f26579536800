// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Safety policy (C10, first half): a pure, deterministic rule engine that
//! rewrites outbound text against keyword tiers and semantic guards. Every
//! evaluation is logged as a `safety_policy` lifelog event by the caller.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskLevel {
    P0,
    P1,
    P2,
    P3,
}

impl RiskLevel {
    fn order(&self) -> u8 {
        match self {
            Self::P0 => 0,
            Self::P1 => 1,
            Self::P2 => 2,
            Self::P3 => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::P0 => "P0",
            Self::P1 => "P1",
            Self::P2 => "P2",
            Self::P3 => "P3",
        }
    }

    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "P0" => Self::P0,
            "P1" => Self::P1,
            "P2" => Self::P2,
            _ => Self::P3,
        }
    }

    /// The more severe (lower-numbered) of the two.
    fn higher(a: Self, b: Self) -> Self {
        if a.order() <= b.order() {
            a
        } else {
            b
        }
    }
}

const P0_KEYWORDS: &[&str] =
    &["traffic", "oncoming vehicle", "highway", "fire", "gas leak", "electrocution", "deep pit", "falling"];
const P1_KEYWORDS: &[&str] =
    &["stairs", "step", "intersection", "crosswalk", "construction", "obstacle", "crowd", "curb"];
const P2_KEYWORDS: &[&str] = &["perhaps", "uncertain", "maybe", "vague", "probably"];
const DIRECTIONAL_KEYWORDS: &[&str] =
    &["go straight", "proceed forward", "turn left", "turn right"];
const CAUTION_PREFIXES: &[&str] = &["caution", "warning", "please stop first", "stop immediately"];

fn contains_keyword(text: &str, keywords: &[&str]) -> bool {
    let lower = text.to_ascii_lowercase();
    keywords.iter().any(|kw| lower.contains(&kw.to_ascii_lowercase()))
}

fn contains_directional_instruction(text: &str) -> bool {
    contains_keyword(text, DIRECTIONAL_KEYWORDS)
}

fn has_conflicting_directions(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("turn left") && lower.contains("turn right")
}

fn has_caution_prefix(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    CAUTION_PREFIXES.iter().any(|p| lower.starts_with(p))
}

fn shorten(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_owned();
    }
    let truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    format!("{}...", truncated.trim_end())
}

fn fallback_message(risk: RiskLevel) -> &'static str {
    match risk {
        RiskLevel::P0 => {
            "I'm not confident about the surroundings right now. Please stop immediately, confirm it's safe, and ask for help nearby."
        }
        RiskLevel::P1 => {
            "My read on this isn't stable. Please stop, confirm what's ahead with your cane, then move carefully."
        }
        _ => "I'm not sure right now. Please stop and confirm the area around you is safe.",
    }
}

#[derive(Debug, Clone)]
pub struct SafetyConfig {
    pub enabled: bool,
    pub low_confidence_threshold: f64,
    pub max_output_chars: usize,
    pub prepend_caution_for_risk: bool,
    pub semantic_guard_enabled: bool,
    pub directional_confidence_threshold: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            low_confidence_threshold: 0.55,
            max_output_chars: 320,
            prepend_caution_for_risk: true,
            semantic_guard_enabled: true,
            directional_confidence_threshold: 0.85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub text: String,
    pub source: String,
    pub risk_level: String,
    pub confidence: f64,
    pub downgraded: bool,
    pub reason: String,
    pub flags: Vec<String>,
    pub policy_version: String,
    pub rule_ids: Vec<String>,
    pub evidence: HashMap<String, serde_json::Value>,
}

pub struct SafetyPolicy {
    config: SafetyConfig,
}

impl SafetyPolicy {
    pub fn new(config: SafetyConfig) -> Self {
        Self { config }
    }

    fn infer_risk(&self, text: &str, context_risk: Option<&str>) -> RiskLevel {
        let mut risk = context_risk.map(RiskLevel::parse).unwrap_or(RiskLevel::P3);
        if contains_keyword(text, P0_KEYWORDS) {
            risk = RiskLevel::higher(risk, RiskLevel::P0);
        } else if contains_keyword(text, P1_KEYWORDS) {
            risk = RiskLevel::higher(risk, RiskLevel::P1);
        } else if contains_keyword(text, P2_KEYWORDS) {
            risk = RiskLevel::higher(risk, RiskLevel::P2);
        }
        risk
    }

    pub fn evaluate(
        &self,
        text: &str,
        source: &str,
        confidence: Option<f64>,
        risk_level: Option<&str>,
    ) -> SafetyDecision {
        let raw = text.trim();
        let mut out = raw.to_owned();
        let conf = confidence.unwrap_or(1.0).clamp(0.0, 1.0);
        let inferred = self.infer_risk(raw, risk_level);
        let risk = RiskLevel::higher(risk_level.map(RiskLevel::parse).unwrap_or(RiskLevel::P3), inferred);

        let mut flags = Vec::new();
        let mut rule_ids = Vec::new();
        let mut downgraded = false;
        let mut reason = "ok".to_owned();

        let mut evidence = HashMap::new();
        evidence.insert(
            "input_risk_level".to_owned(),
            serde_json::json!(risk_level.map(RiskLevel::parse).unwrap_or(RiskLevel::P3).as_str()),
        );
        evidence.insert("inferred_risk_level".to_owned(), serde_json::json!(inferred.as_str()));
        evidence.insert("directional".to_owned(), serde_json::json!(contains_directional_instruction(raw)));
        evidence.insert("conflict_direction".to_owned(), serde_json::json!(has_conflicting_directions(raw)));

        if out.is_empty() {
            out = fallback_message(risk).to_owned();
            flags.push("empty_output".to_owned());
            rule_ids.push("empty_output".to_owned());
            downgraded = true;
            reason = "empty_output".to_owned();
        }

        if self.config.enabled {
            if conf < self.config.low_confidence_threshold {
                out = fallback_message(risk).to_owned();
                flags.push("low_confidence".to_owned());
                rule_ids.push("low_confidence".to_owned());
                downgraded = true;
                reason = "low_confidence".to_owned();
            } else if self.config.prepend_caution_for_risk
                && matches!(risk, RiskLevel::P0 | RiskLevel::P1)
                && !out.is_empty()
                && !has_caution_prefix(&out)
            {
                out = format!("Caution. {out}");
                flags.push("caution_prefix_added".to_owned());
                rule_ids.push("caution_prefix_added".to_owned());
            }

            if self.config.semantic_guard_enabled && !downgraded {
                if has_conflicting_directions(&out) {
                    out = fallback_message(risk).to_owned();
                    flags.push("semantic_guard_conflict".to_owned());
                    rule_ids.push("semantic_guard_conflict".to_owned());
                    downgraded = true;
                    reason = "semantic_guard_conflict".to_owned();
                } else if matches!(risk, RiskLevel::P0 | RiskLevel::P1)
                    && conf < self.config.directional_confidence_threshold
                    && contains_directional_instruction(&out)
                {
                    out = fallback_message(risk).to_owned();
                    flags.push("semantic_guard_directional".to_owned());
                    rule_ids.push("semantic_guard_directional".to_owned());
                    downgraded = true;
                    reason = "semantic_guard_directional".to_owned();
                }
            }
        }

        if out.chars().count() > self.config.max_output_chars {
            out = shorten(&out, self.config.max_output_chars);
            flags.push("output_truncated".to_owned());
            rule_ids.push("output_truncated".to_owned());
        }

        SafetyDecision {
            text: out,
            source: source.to_owned(),
            risk_level: risk.as_str().to_owned(),
            confidence: conf,
            downgraded,
            reason,
            flags,
            policy_version: "v1".to_owned(),
            rule_ids,
            evidence,
        }
    }
}

#[cfg(test)]
mod safety_tests {
    use super::*;

    fn policy() -> SafetyPolicy {
        SafetyPolicy::new(SafetyConfig::default())
    }

    #[test]
    fn empty_output_gets_risk_tiered_fallback() {
        let decision = policy().evaluate("", "stt", Some(1.0), None);
        assert!(decision.downgraded);
        assert_eq!(decision.reason, "empty_output");
        assert!(!decision.text.is_empty());
    }

    #[test]
    fn p0_p1_gets_caution_prefix() {
        let decision = policy().evaluate("there are stairs ahead", "agent", Some(0.9), None);
        assert!(decision.text.starts_with("Caution."));
    }

    #[test]
    fn conflicting_directions_are_replaced() {
        let decision =
            policy().evaluate("turn left then turn right", "agent", Some(0.99), Some("P1"));
        assert!(decision.downgraded);
        assert_eq!(decision.reason, "semantic_guard_conflict");
    }

    #[test]
    fn low_confidence_directional_instruction_is_replaced() {
        let decision = policy().evaluate("go straight now", "agent", Some(0.5), Some("P0"));
        assert!(decision.downgraded);
        assert_eq!(decision.reason, "low_confidence");
    }

    #[test]
    fn long_output_is_truncated() {
        let long = "a".repeat(500);
        let decision = policy().evaluate(&long, "agent", Some(1.0), None);
        assert!(decision.text.chars().count() <= 320);
        assert!(decision.flags.contains(&"output_truncated".to_owned()));
    }
}
