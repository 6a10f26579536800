// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Sliding-window rate limiter (4.9): keyed by "identity" (sha256 of the
//! bearer token, else `X-Device-Id`, else client IP). Allows
//! `rpm + burst` requests per `window_seconds`; in-memory map under a
//! mutex, opportunistically garbage-collected when it grows past a cap.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::control_plane::AppState;
use crate::error::GatewayError;
use crate::store::db::epoch_ms;

const GC_THRESHOLD: usize = 4096;

pub fn identity(headers: &HeaderMap, remote: Option<SocketAddr>) -> String {
    if let Some(v) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(tok) = v.strip_prefix("Bearer ") {
            let mut hasher = Sha256::new();
            hasher.update(tok.as_bytes());
            return format!("bearer:{:x}", hasher.finalize());
        }
    }
    if let Some(v) = headers.get("x-auth-token").and_then(|v| v.to_str().ok()) {
        let mut hasher = Sha256::new();
        hasher.update(v.as_bytes());
        return format!("bearer:{:x}", hasher.finalize());
    }
    if let Some(v) = headers.get("x-device-id").and_then(|v| v.to_str().ok()) {
        return format!("device:{v}");
    }
    match remote {
        Some(addr) => format!("ip:{}", addr.ip()),
        None => "ip:unknown".to_owned(),
    }
}

pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<i64>>>,
    rpm: u32,
    burst: u32,
    window_seconds: u64,
}

impl RateLimiter {
    pub fn new(rpm: u32, burst: u32, window_seconds: u64) -> Self {
        Self { windows: Mutex::new(HashMap::new()), rpm, burst, window_seconds }
    }

    /// Record one request for `identity`, returning `true` if it is within
    /// the allowed budget.
    pub async fn check(&self, identity: &str) -> bool {
        let now = epoch_ms();
        let window_ms = (self.window_seconds as i64) * 1000;
        let limit = (self.rpm + self.burst) as usize;

        let mut windows = self.windows.lock().await;
        if windows.len() > GC_THRESHOLD {
            windows.retain(|_, hits| hits.iter().any(|ts| now - *ts < window_ms));
        }

        let hits = windows.entry(identity.to_owned()).or_default();
        hits.retain(|ts| now - *ts < window_ms);
        if hits.len() >= limit {
            return false;
        }
        hits.push(now);
        true
    }
}

/// Axum middleware applying [`RateLimiter::check`] keyed by [`identity`].
pub async fn rate_limit_layer(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    let id = identity(req.headers(), Some(remote));
    if !state.rate_limiter.check(&id).await {
        return GatewayError::RateLimited.to_http_response("rate limited").into_response();
    }
    next.run(req).await
}

#[cfg(test)]
mod rate_limit_tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_rpm_plus_burst_then_rejects() {
        let limiter = RateLimiter::new(2, 1, 60);
        assert!(limiter.check("id-1").await);
        assert!(limiter.check("id-1").await);
        assert!(limiter.check("id-1").await);
        assert!(!limiter.check("id-1").await);
    }

    #[tokio::test]
    async fn separate_identities_have_separate_budgets() {
        let limiter = RateLimiter::new(1, 0, 60);
        assert!(limiter.check("a").await);
        assert!(limiter.check("b").await);
        assert!(!limiter.check("a").await);
    }

    #[test]
    fn identity_prefers_bearer_token_hash() {
        let mut h = HeaderMap::new();
        h.insert("authorization", "Bearer tok".parse().unwrap());
        h.insert("x-device-id", "dev-1".parse().unwrap());
        assert!(identity(&h, None).starts_with("bearer:"));
    }

    #[test]
    fn identity_falls_back_to_device_id_then_ip() {
        let mut h = HeaderMap::new();
        h.insert("x-device-id", "dev-1".parse().unwrap());
        assert_eq!(identity(&h, None), "device:dev-1");
        assert_eq!(identity(&HeaderMap::new(), None), "ip:unknown");
    }
}
