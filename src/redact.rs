// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Token redaction for lifelog payloads and structured log fields.
//!
//! Device tokens and bearer tokens must never reach SQLite or the log
//! sink verbatim. Keys are matched case-insensitively; values are replaced
//! with a fixed-width placeholder that still reveals presence/absence.

const REDACTED: &str = "***redacted***";

const SENSITIVE_KEYS: &[&str] = &[
    "device_token",
    "auth_token",
    "token",
    "authorization",
    "bearer",
    "password",
    "secret",
];

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    SENSITIVE_KEYS.iter().any(|k| lower == *k || lower.ends_with(k))
}

/// Redact a bearer-style string: `Bearer abc123` -> `Bearer ***redacted***`.
pub fn redact_str(value: &str) -> String {
    if let Some(rest) = value.strip_prefix("Bearer ") {
        if !rest.is_empty() {
            return format!("Bearer {REDACTED}");
        }
    }
    value.to_owned()
}

/// Recursively redact sensitive keys in a JSON value, returning a new value.
pub fn redact_json(value: &serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::Object(map) => {
            let mut out = serde_json::Map::with_capacity(map.len());
            for (k, v) in map {
                if is_sensitive_key(k) {
                    out.insert(k.clone(), serde_json::Value::String(REDACTED.to_owned()));
                } else {
                    out.insert(k.clone(), redact_json(v));
                }
            }
            serde_json::Value::Object(out)
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.iter().map(redact_json).collect())
        }
        other => other.clone(),
    }
}

#[cfg(test)]
mod redact_tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn redacts_bearer_prefix() {
        assert_eq!(redact_str("Bearer abc123"), "Bearer ***redacted***");
        assert_eq!(redact_str("no-prefix"), "no-prefix");
    }

    #[test]
    fn redacts_nested_token_keys() {
        let input = json!({
            "device_id": "d1",
            "payload": {"device_token": "secret-value", "seq": 1},
        });
        let out = redact_json(&input);
        assert_eq!(out["payload"]["device_token"], "***redacted***");
        assert_eq!(out["payload"]["seq"], 1);
        assert_eq!(out["device_id"], "d1");
    }
}
