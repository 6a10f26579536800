// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Error taxonomy for the gateway. Every fallible surface (control-plane
/// HTTP, adapters, stores, orchestrator handlers) maps its failures onto
/// one of these kinds; nothing downstream matches on ad-hoc strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GatewayError {
    BadRequest,
    NotFound,
    Conflict,
    AlreadyFinal,
    Unauthorized,
    RateLimited,
    StaleTimestamp,
    ReplayedNonce,
    PayloadTooLarge,
    AdapterDisconnected,
    InvalidEnvelope,
    AudioDecodeError,
    ToolPolicyUnavailable,
    ExternalServiceError,
    Timeout,
    Canceled,
    Internal,
}

impl GatewayError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::BadRequest => 400,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::AlreadyFinal => 400,
            Self::Unauthorized => 401,
            Self::RateLimited => 429,
            Self::StaleTimestamp => 400,
            Self::ReplayedNonce => 409,
            Self::PayloadTooLarge => 413,
            Self::AdapterDisconnected => 502,
            Self::InvalidEnvelope => 400,
            Self::AudioDecodeError => 400,
            Self::ToolPolicyUnavailable => 502,
            Self::ExternalServiceError => 502,
            Self::Timeout => 504,
            Self::Canceled => 409,
            Self::Internal => 500,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::BadRequest => "bad_request",
            Self::NotFound => "not_found",
            Self::Conflict => "conflict",
            Self::AlreadyFinal => "already_final",
            Self::Unauthorized => "unauthorized",
            Self::RateLimited => "rate_limited",
            Self::StaleTimestamp => "stale_timestamp",
            Self::ReplayedNonce => "replayed_nonce",
            Self::PayloadTooLarge => "payload_too_large",
            Self::AdapterDisconnected => "adapter_disconnected",
            Self::InvalidEnvelope => "invalid_envelope",
            Self::AudioDecodeError => "audio_decode_error",
            Self::ToolPolicyUnavailable => "tool_policy_unavailable",
            Self::ExternalServiceError => "external_service_error",
            Self::Timeout => "runtime timeout",
            Self::Canceled => "canceled",
            Self::Internal => "runtime error",
        }
    }

    pub fn to_error_body(&self, message: impl Into<String>) -> ErrorBody {
        ErrorBody {
            success: false,
            error: message.into(),
            error_code: Some(self.as_str().to_owned()),
        }
    }

    pub fn to_http_response(&self, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
        let status =
            StatusCode::from_u16(self.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(self.to_error_body(message)))
    }
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::error::Error for GatewayError {}

/// `{success:false, error, error_code?}` response body, per the control-plane
/// wire contract. Success responses construct their own body shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

pub type GatewayResult<T> = Result<T, GatewayError>;
