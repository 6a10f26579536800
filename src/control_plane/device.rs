// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device lifecycle, operations, and event-injection endpoints (4.9).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::control_plane::AppState;
use crate::envelope::{Envelope, OutboundType};
use crate::error::{ErrorBody, GatewayError};
use crate::session::DeviceSessionSnapshot;
use crate::store::bindings::DeviceBinding;
use crate::store::operations::{DeviceOperation, OperationStatus};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ErrorBody>)>;

#[derive(Debug, Serialize)]
pub struct SuccessBody<T> {
    pub success: bool,
    #[serde(flatten)]
    pub data: T,
}

fn ok<T>(data: T) -> Json<SuccessBody<T>> {
    Json(SuccessBody { success: true, data })
}

fn err_response(e: GatewayError, message: impl Into<String>) -> (StatusCode, Json<ErrorBody>) {
    e.to_http_response(message)
}

/// `GET /v1/device/{id}/status`
pub async fn status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<DeviceSessionSnapshot> {
    let session = state
        .orchestrator
        .sessions
        .latest_for_device(&id)
        .await
        .ok_or_else(|| err_response(GatewayError::NotFound, "no session for device"))?;
    Ok(ok(session.snapshot().await))
}

#[derive(Debug, Deserialize, Default)]
pub struct AbortRequest {
    pub session_id: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct AbortResponse {
    pub aborted: bool,
}

/// `POST /v1/device/{id}/abort`
pub async fn abort(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AbortRequest>,
) -> ApiResult<AbortResponse> {
    let session = match req.session_id {
        Some(ref sid) => state.orchestrator.sessions.get(&id, sid).await,
        None => state.orchestrator.sessions.latest_for_device(&id).await,
    }
    .ok_or_else(|| err_response(GatewayError::NotFound, "no session for device"))?;

    let reason = req.reason.as_deref().unwrap_or("operator_abort");
    let seq = state.orchestrator.sessions.next_outbound_seq(&session).await;
    let envelope = Envelope::outbound(&session.device_id, &session.session_id, seq, OutboundType::Close, Default::default());
    let _ = state.orchestrator.adapter.send_command(&envelope).await;
    state.orchestrator.sessions.close(&session, reason).await;

    Ok(ok(AbortResponse { aborted: true }))
}

/// `POST /v1/device/event` — inject a canonical envelope as if it arrived
/// over the wire. Test/debug only.
pub async fn inject_event(
    State(state): State<Arc<AppState>>,
    Json(raw): Json<Value>,
) -> Result<StatusCode, (StatusCode, Json<ErrorBody>)> {
    let envelope = Envelope::from_raw(&raw).map_err(|e| err_response(e, "invalid envelope"))?;
    state.orchestrator.adapter.inject_event(envelope).await;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    pub device_id: String,
    pub device_token: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// `POST /v1/device/register` — first-time binding; conflicts if the
/// device is already registered.
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<DeviceBinding> {
    if state.orchestrator.bindings.get(&req.device_id).await.is_some() {
        return Err(err_response(GatewayError::Conflict, "device already registered"));
    }
    let binding = state.orchestrator.bindings.upsert(&req.device_id, &req.device_token, req.label.as_deref()).await;
    Ok(ok(binding))
}

#[derive(Debug, Deserialize)]
pub struct BindRequest {
    pub device_id: String,
    pub device_token: String,
    #[serde(default)]
    pub label: Option<String>,
}

/// `POST /v1/device/bind` — create-or-rotate a device's token.
pub async fn bind(State(state): State<Arc<AppState>>, Json(req): Json<BindRequest>) -> ApiResult<DeviceBinding> {
    let binding = state.orchestrator.bindings.upsert(&req.device_id, &req.device_token, req.label.as_deref()).await;
    Ok(ok(binding))
}

#[derive(Debug, Deserialize)]
pub struct DeviceIdRequest {
    pub device_id: String,
}

/// `POST /v1/device/activate`
pub async fn activate(State(state): State<Arc<AppState>>, Json(req): Json<DeviceIdRequest>) -> ApiResult<DeviceBinding> {
    if !state.orchestrator.bindings.activate(&req.device_id).await {
        return Err(err_response(GatewayError::NotFound, "no binding for device"));
    }
    let binding = state.orchestrator.bindings.get(&req.device_id).await.ok_or_else(|| {
        err_response(GatewayError::NotFound, "no binding for device")
    })?;
    Ok(ok(binding))
}

#[derive(Debug, Serialize)]
pub struct RevokeResponse {
    pub revoked: bool,
}

/// `POST /v1/device/revoke`
pub async fn revoke(State(state): State<Arc<AppState>>, Json(req): Json<DeviceIdRequest>) -> ApiResult<RevokeResponse> {
    let revoked = state.orchestrator.bindings.revoke(&req.device_id).await;
    Ok(ok(RevokeResponse { revoked }))
}

#[derive(Debug, Deserialize)]
pub struct BindingQuery {
    pub device_id: String,
}

/// `GET /v1/device/binding`
pub async fn binding(State(state): State<Arc<AppState>>, Query(query): Query<BindingQuery>) -> ApiResult<DeviceBinding> {
    let binding = state
        .orchestrator
        .bindings
        .get(&query.device_id)
        .await
        .ok_or_else(|| err_response(GatewayError::NotFound, "no binding for device"))?;
    Ok(ok(binding))
}

async fn resolve_session(
    state: &AppState,
    device_id: &str,
) -> std::sync::Arc<crate::session::DeviceSession> {
    match state.orchestrator.sessions.latest_for_device(device_id).await {
        Some(session) => session,
        None => {
            let session_id = uuid::Uuid::new_v4().to_string();
            state.orchestrator.sessions.get_or_create(device_id, &session_id).await
        }
    }
}

async fn dispatch_op(
    state: &AppState,
    device_id: &str,
    op_type: &str,
    outbound_type: OutboundType,
    payload: Value,
) -> Result<DeviceOperation, (StatusCode, Json<ErrorBody>)> {
    let payload_map: std::collections::BTreeMap<String, Value> = match payload {
        Value::Object(map) => map.into_iter().collect(),
        Value::Null => std::collections::BTreeMap::new(),
        other => {
            let mut m = std::collections::BTreeMap::new();
            m.insert("value".to_owned(), other);
            m
        }
    };

    let session = resolve_session(state, device_id).await;
    let op = state
        .orchestrator
        .operations
        .create(device_id, Some(&session.session_id), op_type, Value::Object(payload_map.clone().into_iter().collect()))
        .await;

    let seq = state.orchestrator.sessions.next_outbound_seq(&session).await;
    let envelope = Envelope::outbound(device_id, &session.session_id, seq, outbound_type, payload_map);
    match state.orchestrator.adapter.send_command(&envelope).await {
        Ok(()) => {
            state.orchestrator.operations.set_status(&op.id, OperationStatus::Sent, None).await;
        }
        Err(e) => {
            state.orchestrator.operations.set_status(&op.id, OperationStatus::Failed, Some(&e.to_string())).await;
        }
    }
    state.orchestrator.operations.get(&op.id).await.ok_or_else(|| err_response(GatewayError::Internal, "lost operation after dispatch"))
}

#[derive(Debug, Deserialize)]
pub struct OpsDispatchRequest {
    pub device_id: String,
    pub op_type: String,
    #[serde(default)]
    pub payload: Value,
}

/// `POST /v1/device/ops/dispatch` — generic vendor-defined op.
pub async fn ops_dispatch(State(state): State<Arc<AppState>>, Json(req): Json<OpsDispatchRequest>) -> ApiResult<DeviceOperation> {
    let outbound_type = match req.op_type.as_str() {
        "set_config" => OutboundType::SetConfig,
        "tool_call" => OutboundType::ToolCall,
        "ota_plan" => OutboundType::OtaPlan,
        _ => return Err(err_response(GatewayError::BadRequest, "unknown op_type")),
    };
    let op = dispatch_op(&state, &req.device_id, &req.op_type, outbound_type, req.payload).await?;
    Ok(ok(op))
}

/// `POST /v1/device/{id}/set_config`
pub async fn set_config(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(payload): Json<Value>) -> ApiResult<DeviceOperation> {
    let op = dispatch_op(&state, &id, "set_config", OutboundType::SetConfig, payload).await?;
    Ok(ok(op))
}

/// `POST /v1/device/{id}/tool_call`
pub async fn tool_call(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(payload): Json<Value>) -> ApiResult<DeviceOperation> {
    let op = dispatch_op(&state, &id, "tool_call", OutboundType::ToolCall, payload).await?;
    Ok(ok(op))
}

/// `POST /v1/device/{id}/ota_plan`
pub async fn ota_plan(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(payload): Json<Value>) -> ApiResult<DeviceOperation> {
    let op = dispatch_op(&state, &id, "ota_plan", OutboundType::OtaPlan, payload).await?;
    Ok(ok(op))
}

#[derive(Debug, Deserialize)]
pub struct OpsAckRequest {
    pub status: String,
    #[serde(default)]
    pub error: Option<String>,
}

/// `POST /v1/device/ops/{operation_id}/ack` — a device or test client
/// reporting the terminal outcome of a dispatched op.
pub async fn ops_ack(
    State(state): State<Arc<AppState>>,
    Path(operation_id): Path<String>,
    Json(req): Json<OpsAckRequest>,
) -> ApiResult<DeviceOperation> {
    let status = OperationStatus::parse(&req.status)
        .ok_or_else(|| err_response(GatewayError::BadRequest, "unknown status"))?;
    let existing = state
        .orchestrator
        .operations
        .get(&operation_id)
        .await
        .ok_or_else(|| err_response(GatewayError::NotFound, "no such operation"))?;
    if matches!(existing.status.as_str(), "acked" | "failed") {
        return Err(err_response(GatewayError::AlreadyFinal, "operation already in a terminal state"));
    }
    state.orchestrator.operations.set_status(&operation_id, status, req.error.as_deref()).await;
    let updated = state
        .orchestrator
        .operations
        .get(&operation_id)
        .await
        .ok_or_else(|| err_response(GatewayError::Internal, "lost operation after ack"))?;
    Ok(ok(updated))
}

#[derive(Debug, Deserialize)]
pub struct OpsListQuery {
    pub device_id: Option<String>,
    pub status: Option<String>,
}

/// `GET /v1/device/ops`
pub async fn ops_list(State(state): State<Arc<AppState>>, Query(query): Query<OpsListQuery>) -> ApiResult<Vec<DeviceOperation>> {
    let status = query.status.as_deref().and_then(OperationStatus::parse);
    let ops = state.orchestrator.operations.list(query.device_id.as_deref(), status).await;
    Ok(ok(ops))
}
