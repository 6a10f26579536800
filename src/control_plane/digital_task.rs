// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Digital-task endpoints (4.9): submit a goal, inspect or list tasks,
//! aggregate status counts, and cancel a running/pending task.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::control_plane::device::SuccessBody;
use crate::control_plane::AppState;
use crate::digital_task::ExecuteRequest;
use crate::digital_task::store::{PushContext, TaskRow};
use crate::error::ErrorBody;

type ApiResult<T> = Result<Json<SuccessBody<T>>, (StatusCode, Json<ErrorBody>)>;

fn ok<T>(data: T) -> Json<SuccessBody<T>> {
    Json(SuccessBody { success: true, data })
}

#[derive(Debug, Deserialize)]
pub struct ExecuteBody {
    #[serde(default)]
    pub task_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub goal: String,
    #[serde(default)]
    pub push_context: Option<PushContext>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub trace_id: Option<String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

/// `POST /v1/digital-task/execute`
pub async fn execute(State(state): State<Arc<AppState>>, Json(body): Json<ExecuteBody>) -> ApiResult<TaskRow> {
    let request = ExecuteRequest {
        task_id: body.task_id,
        session_id: body.session_id,
        goal: body.goal,
        push_context: body.push_context,
        source: body.source,
        trace_id: body.trace_id,
        timeout_seconds: body.timeout_seconds,
    };
    let task = state
        .orchestrator
        .digital_task
        .execute(request)
        .await
        .map_err(|e| e.to_http_response("could not submit digital task"))?;
    Ok(ok(task))
}

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

/// `GET /v1/digital-task`
pub async fn list(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> ApiResult<Vec<TaskRow>> {
    let limit = query.limit.unwrap_or(100).clamp(1, 4096);
    let tasks = state.orchestrator.digital_task.list(query.status.as_deref(), limit).await;
    Ok(ok(tasks))
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub total: usize,
    pub by_status: HashMap<String, usize>,
}

/// `GET /v1/digital-task/stats` — aggregated in-handler over the existing
/// task list rather than a dedicated store query, matching the runtime
/// snapshot's `digital_tasks_by_status` approach.
pub async fn stats(State(state): State<Arc<AppState>>) -> ApiResult<StatsResponse> {
    let tasks = state.orchestrator.digital_task.list(None, 4096).await;
    let mut by_status = HashMap::new();
    for task in &tasks {
        *by_status.entry(task.status.clone()).or_insert(0usize) += 1;
    }
    Ok(ok(StatsResponse { total: tasks.len(), by_status }))
}

/// `GET /v1/digital-task/{id}`
pub async fn get(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<TaskRow> {
    let task = state
        .orchestrator
        .digital_task
        .get(&id)
        .await
        .ok_or_else(|| crate::error::GatewayError::NotFound.to_http_response("no such digital task"))?;
    Ok(ok(task))
}

#[derive(Debug, Deserialize, Default)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub canceled: bool,
}

/// `POST /v1/digital-task/{id}/cancel`
pub async fn cancel(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(body): Json<CancelRequest>,
) -> ApiResult<CancelResponse> {
    let reason = body.reason.as_deref().unwrap_or("operator_cancel");
    let canceled = state.orchestrator.digital_task.cancel(&id, reason).await;
    Ok(ok(CancelResponse { canceled }))
}
