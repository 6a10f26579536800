// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Replay guard (4.9): POST-only, enabled via `control_api.replay_enabled`.
//! Requires `X-Request-Nonce` and `X-Request-Timestamp` (accepts ms or s);
//! the timestamp must fall within `window_seconds` of the server clock and
//! the `(identity, nonce)` pair must be unseen within that window.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tokio::sync::Mutex;

use crate::control_plane::rate_limit::identity;
use crate::control_plane::AppState;
use crate::error::GatewayError;
use crate::store::db::epoch_ms;

const GC_THRESHOLD: usize = 8192;

/// A timestamp after ~2001-09-09 in seconds would already exceed this in
/// milliseconds; anything smaller than this is assumed to be seconds and
/// is scaled up.
const MS_THRESHOLD: i64 = 10_000_000_000;

fn normalize_timestamp(raw: i64) -> i64 {
    if raw < MS_THRESHOLD {
        raw * 1000
    } else {
        raw
    }
}

pub struct ReplayGuard {
    seen: Mutex<HashMap<(String, String), i64>>,
    window_seconds: u64,
}

pub enum ReplayCheck {
    Ok,
    MissingHeaders,
    StaleTimestamp,
    Replayed,
}

impl ReplayGuard {
    pub fn new(window_seconds: u64) -> Self {
        Self { seen: Mutex::new(HashMap::new()), window_seconds }
    }

    pub async fn check(&self, identity: &str, nonce: Option<&str>, timestamp: Option<&str>) -> ReplayCheck {
        let (Some(nonce), Some(timestamp)) = (nonce, timestamp) else {
            return ReplayCheck::MissingHeaders;
        };
        let Ok(raw_ts) = timestamp.parse::<i64>() else {
            return ReplayCheck::MissingHeaders;
        };
        let ts_ms = normalize_timestamp(raw_ts);
        let now = epoch_ms();
        let window_ms = (self.window_seconds as i64) * 1000;
        if (now - ts_ms).abs() > window_ms {
            return ReplayCheck::StaleTimestamp;
        }

        let key = (identity.to_owned(), nonce.to_owned());
        let mut seen = self.seen.lock().await;
        if seen.len() > GC_THRESHOLD {
            seen.retain(|_, seen_at| now - *seen_at < window_ms);
        }
        if let Some(seen_at) = seen.get(&key) {
            if now - *seen_at < window_ms {
                return ReplayCheck::Replayed;
            }
        }
        seen.insert(key, now);
        ReplayCheck::Ok
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Axum middleware applying the replay guard to `POST` requests when
/// `control_api.replay_enabled` is true.
pub async fn replay_guard_layer(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !state.config.replay_enabled || req.method() != Method::POST {
        return next.run(req).await;
    }

    let id = identity(req.headers(), Some(remote));
    let nonce = header_str(req.headers(), "x-request-nonce").map(|s| s.to_owned());
    let timestamp = header_str(req.headers(), "x-request-timestamp").map(|s| s.to_owned());

    match state.replay_guard.check(&id, nonce.as_deref(), timestamp.as_deref()).await {
        ReplayCheck::Ok => next.run(req).await,
        ReplayCheck::MissingHeaders => {
            GatewayError::BadRequest.to_http_response("missing replay headers").into_response()
        }
        ReplayCheck::StaleTimestamp => {
            GatewayError::StaleTimestamp.to_http_response("stale timestamp").into_response()
        }
        ReplayCheck::Replayed => {
            GatewayError::ReplayedNonce.to_http_response("replayed nonce").into_response()
        }
    }
}

#[cfg(test)]
mod replay_guard_tests {
    use super::*;

    #[tokio::test]
    async fn missing_headers_rejected() {
        let guard = ReplayGuard::new(60);
        assert!(matches!(guard.check("id", None, None).await, ReplayCheck::MissingHeaders));
    }

    #[tokio::test]
    async fn stale_timestamp_rejected() {
        let guard = ReplayGuard::new(5);
        let old = (epoch_ms() / 1000) - 3600;
        assert!(matches!(
            guard.check("id", Some("n1"), Some(&old.to_string())).await,
            ReplayCheck::StaleTimestamp
        ));
    }

    #[tokio::test]
    async fn fresh_nonce_accepted_then_replay_rejected() {
        let guard = ReplayGuard::new(60);
        let now = epoch_ms() / 1000;
        let ts = now.to_string();
        assert!(matches!(guard.check("id", Some("n1"), Some(&ts)).await, ReplayCheck::Ok));
        assert!(matches!(guard.check("id", Some("n1"), Some(&ts)).await, ReplayCheck::Replayed));
    }

    #[tokio::test]
    async fn same_nonce_different_identity_is_not_a_replay() {
        let guard = ReplayGuard::new(60);
        let ts = (epoch_ms() / 1000).to_string();
        assert!(matches!(guard.check("id-a", Some("n1"), Some(&ts)).await, ReplayCheck::Ok));
        assert!(matches!(guard.check("id-b", Some("n1"), Some(&ts)).await, ReplayCheck::Ok));
    }

    #[tokio::test]
    async fn accepts_millisecond_timestamps() {
        let guard = ReplayGuard::new(60);
        let ts_ms = epoch_ms().to_string();
        assert!(matches!(guard.check("id", Some("n1"), Some(&ts_ms)).await, ReplayCheck::Ok));
    }
}
