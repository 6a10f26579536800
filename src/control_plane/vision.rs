// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! `POST /v1/vision/analyze` (4.9) — out-of-band vision analysis, bypassing
//! the device event loop entirely. Useful for operators/testing a VLM
//! integration without a live device session.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control_plane::device::SuccessBody;
use crate::control_plane::AppState;
use crate::error::{ErrorBody, GatewayError};
use crate::orchestrator::external::{AgentReply, RuntimeContext};

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    pub device_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub payload: Value,
}

/// `POST /v1/vision/analyze`
pub async fn analyze(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AnalyzeRequest>,
) -> Result<Json<SuccessBody<AgentReply>>, (StatusCode, Json<ErrorBody>)> {
    let context = RuntimeContext {
        device_id: req.device_id.clone(),
        session_id: req.session_id.clone().unwrap_or_default(),
        state: "analyzing".to_owned(),
        ..Default::default()
    };

    let reply = state
        .orchestrator
        .vlm
        .analyze_payload(&req.payload, &context)
        .await
        .map_err(|e| GatewayError::ExternalServiceError.to_http_response(e.to_string()))?;

    Ok(Json(SuccessBody { success: true, data: reply }))
}
