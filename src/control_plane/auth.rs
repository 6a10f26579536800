// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane auth (4.9): `Authorization: Bearer <token>` or
//! `X-Auth-Token: <token>`, compared with constant-time equality. Disabled
//! entirely when `control_api.auth_enabled` is false.

use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::control_plane::AppState;
use crate::error::GatewayError;

/// Constant-time string comparison to prevent timing side-channel attacks.
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

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        if let Some(tok) = v.strip_prefix("Bearer ") {
            return Some(tok.to_owned());
        }
    }
    headers.get("x-auth-token").and_then(|v| v.to_str().ok()).map(|s| s.to_owned())
}

/// Validate the presented token against `expected`. `None` expected means
/// auth is disabled and every request passes.
pub fn validate(headers: &HeaderMap, expected: Option<&str>) -> Result<(), GatewayError> {
    let Some(expected) = expected else { return Ok(()) };
    match extract_token(headers) {
        Some(tok) if constant_time_eq(&tok, expected) => Ok(()),
        _ => Err(GatewayError::Unauthorized),
    }
}

const EXEMPT_PATHS: &[&str] = &["/v1/runtime/status"];

/// Axum middleware enforcing bearer/X-Auth-Token auth ahead of rate
/// limiting and the replay guard.
pub async fn auth_layer(
    State(state): State<Arc<AppState>>,
    req: Request<axum::body::Body>,
    next: Next,
) -> Response {
    if !state.config.auth_enabled || EXEMPT_PATHS.contains(&req.uri().path()) {
        return next.run(req).await;
    }

    if let Err(code) = validate(req.headers(), state.config.auth_token.as_deref()) {
        return code.to_http_response("missing or invalid credentials").into_response();
    }

    next.run(req).await
}

#[cfg(test)]
mod auth_tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut h = HeaderMap::new();
        for (k, v) in pairs {
            h.insert(axum::http::HeaderName::from_bytes(k.as_bytes()).unwrap(), v.parse().unwrap());
        }
        h
    }

    #[test]
    fn disabled_auth_accepts_anything() {
        assert!(validate(&headers(&[]), None).is_ok());
    }

    #[test]
    fn bearer_token_accepted() {
        let h = headers(&[("authorization", "Bearer secret")]);
        assert!(validate(&h, Some("secret")).is_ok());
    }

    #[test]
    fn x_auth_token_header_accepted() {
        let h = headers(&[("x-auth-token", "secret")]);
        assert!(validate(&h, Some("secret")).is_ok());
    }

    #[test]
    fn wrong_token_rejected() {
        let h = headers(&[("authorization", "Bearer wrong")]);
        assert!(validate(&h, Some("secret")).is_err());
    }

    #[test]
    fn missing_token_rejected_when_enabled() {
        assert!(validate(&headers(&[]), Some("secret")).is_err());
    }
}
