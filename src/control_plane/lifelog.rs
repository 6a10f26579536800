// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Lifelog endpoints (4.9): the timeline of recorded events, the
//! thought-trace pipeline log, raw telemetry samples, safety-policy
//! aggregates, device-session history, and retention cleanup.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control_plane::device::SuccessBody;
use crate::control_plane::AppState;
use crate::envelope::{Envelope, InboundType};
use crate::error::{ErrorBody, GatewayError};
use crate::store::lifelog::{DeviceSessionRow, LifelogEvent, TimelineQuery};
use crate::store::telemetry::TelemetrySample;
use crate::store::thought_trace::ThoughtTraceRow;

type ApiResult<T> = Result<Json<SuccessBody<T>>, (StatusCode, Json<ErrorBody>)>;

fn ok<T>(data: T) -> Json<SuccessBody<T>> {
    Json(SuccessBody { success: true, data })
}

#[derive(Debug, Deserialize)]
pub struct EnqueueImageRequest {
    pub device_id: String,
    #[serde(default)]
    pub session_id: Option<String>,
    pub payload: Value,
}

/// `POST /v1/lifelog/image` — inject an `image_ready` envelope for
/// offline/batch vision processing, same path the device event loop uses.
pub async fn enqueue_image(
    State(state): State<Arc<AppState>>,
    Json(req): Json<EnqueueImageRequest>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let mut payload = serde_json::Map::new();
    if let Value::Object(map) = req.payload {
        payload = map;
    }
    let session_id = req.session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let envelope = Envelope::from_raw(&serde_json::json!({
        "device_id": req.device_id,
        "session_id": session_id,
        "type": InboundType::ImageReady.as_str(),
        "payload": payload,
    }))
    .map_err(|e| e.to_http_response("invalid image payload"))?;
    state.orchestrator.adapter.inject_event(envelope).await;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize, Default)]
pub struct TimelineQueryParams {
    pub session_id: Option<String>,
    pub event_type: Option<String>,
    pub risk_level: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl From<TimelineQueryParams> for TimelineQuery {
    fn from(p: TimelineQueryParams) -> Self {
        TimelineQuery {
            session_id: p.session_id,
            event_type: p.event_type,
            risk_level: p.risk_level,
            limit: p.limit.unwrap_or(100).clamp(1, 1000),
            offset: p.offset.unwrap_or(0).max(0),
        }
    }
}

/// `GET /v1/lifelog/timeline`
pub async fn timeline(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TimelineQueryParams>,
) -> ApiResult<Vec<LifelogEvent>> {
    let rows = state.orchestrator.lifelog.timeline(query.into()).await;
    Ok(ok(rows))
}

#[derive(Debug, Deserialize)]
pub struct ThoughtTraceAppendRequest {
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub source: String,
    pub stage: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Serialize)]
pub struct ThoughtTraceAppendResponse {
    pub trace_id: String,
}

/// `POST /v1/lifelog/thought-trace`
pub async fn thought_trace_append(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ThoughtTraceAppendRequest>,
) -> ApiResult<ThoughtTraceAppendResponse> {
    let trace_id = state
        .thought_trace
        .add(req.trace_id.as_deref(), req.session_id.as_deref(), &req.source, &req.stage, req.payload)
        .await;
    Ok(ok(ThoughtTraceAppendResponse { trace_id }))
}

/// `GET /v1/lifelog/thought-trace/{trace_id}` — full ordered stage log for
/// one turn.
pub async fn thought_trace_query(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(trace_id): axum::extract::Path<String>,
) -> ApiResult<Vec<ThoughtTraceRow>> {
    let rows = state.thought_trace.get_trace(&trace_id).await;
    Ok(ok(rows))
}

/// `GET /v1/lifelog/thought-trace/{trace_id}/replay` — same stage log, framed
/// for sequential playback (ordering is already the replay order `get_trace`
/// returns, so this is the query handler under a second name for clients
/// that want replay-shaped semantics explicit in the URL).
pub async fn thought_trace_replay(
    State(state): State<Arc<AppState>>,
    axum::extract::Path(trace_id): axum::extract::Path<String>,
) -> ApiResult<Vec<ThoughtTraceRow>> {
    let rows = state.thought_trace.get_trace(&trace_id).await;
    Ok(ok(rows))
}

#[derive(Debug, Deserialize)]
pub struct TelemetryQuery {
    pub device_id: String,
    pub limit: Option<i64>,
}

/// `GET /v1/lifelog/telemetry`
pub async fn telemetry(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TelemetryQuery>,
) -> ApiResult<Vec<TelemetrySample>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let rows = state.orchestrator.telemetry.list(&query.device_id, limit).await;
    Ok(ok(rows))
}

#[derive(Debug, Deserialize, Default)]
pub struct SafetyQueryParams {
    pub session_id: Option<String>,
    pub risk_level: Option<String>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

/// `GET /v1/lifelog/safety` — timeline filtered to safety-policy events.
pub async fn safety_query(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SafetyQueryParams>,
) -> ApiResult<Vec<LifelogEvent>> {
    let rows = state
        .orchestrator
        .lifelog
        .timeline(TimelineQuery {
            session_id: query.session_id,
            event_type: Some("safety_policy".to_owned()),
            risk_level: query.risk_level,
            limit: query.limit.unwrap_or(100).clamp(1, 1000),
            offset: query.offset.unwrap_or(0).max(0),
        })
        .await;
    Ok(ok(rows))
}

#[derive(Debug, Serialize)]
pub struct SafetyStatsResponse {
    pub total: i64,
    pub by_risk_level: Vec<(String, i64)>,
}

/// `GET /v1/lifelog/safety/stats`
pub async fn safety_stats(State(state): State<Arc<AppState>>) -> ApiResult<SafetyStatsResponse> {
    let by_risk_level = state.orchestrator.lifelog.risk_level_counts().await;
    let total = by_risk_level.iter().map(|(_, n)| n).sum();
    Ok(ok(SafetyStatsResponse { total, by_risk_level }))
}

#[derive(Debug, Deserialize, Default)]
pub struct SessionsQuery {
    pub device_id: Option<String>,
}

/// `GET /v1/lifelog/sessions`
pub async fn sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionsQuery>,
) -> ApiResult<Vec<DeviceSessionRow>> {
    let rows = state.orchestrator.lifelog.list_device_sessions(query.device_id.as_deref()).await;
    Ok(ok(rows))
}

#[derive(Debug, Deserialize)]
pub struct RetentionCleanupRequest {
    pub retention_days: i64,
}

#[derive(Debug, Serialize)]
pub struct RetentionCleanupResponse {
    pub removed: usize,
}

/// `POST /v1/lifelog/retention/cleanup`
pub async fn retention_cleanup(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RetentionCleanupRequest>,
) -> ApiResult<RetentionCleanupResponse> {
    let removed = state.orchestrator.lifelog.cleanup_retention(req.retention_days).await;
    Ok(ok(RetentionCleanupResponse { removed }))
}
