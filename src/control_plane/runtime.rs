// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime status and observability endpoints (4.9). `status` is a plain
//! snapshot; `observability` layers healthy/alert computation with minimum
//! thresholds on top of it and ingests a sample into the observability
//! store; `observability/history` buckets that store's samples.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::control_plane::AppState;
use crate::session::SessionState;
use crate::store::db::epoch_ms;

#[derive(Debug, Serialize)]
pub struct RuntimeStatus {
    pub success: bool,
    pub uptime_ms: i64,
    pub sessions_by_state: HashMap<String, usize>,
    pub digital_tasks_by_status: HashMap<String, usize>,
}

async fn snapshot(state: &AppState) -> RuntimeStatus {
    let sessions = state.orchestrator.sessions.all_sessions().await;
    let mut sessions_by_state = HashMap::new();
    for session in &sessions {
        let key = session.state.read().await.as_str().to_owned();
        *sessions_by_state.entry(key).or_insert(0usize) += 1;
    }
    for variant in [
        SessionState::Connecting,
        SessionState::Ready,
        SessionState::Listening,
        SessionState::Thinking,
        SessionState::Speaking,
        SessionState::Closed,
    ] {
        sessions_by_state.entry(variant.as_str().to_owned()).or_insert(0);
    }

    let tasks = state.orchestrator.digital_task.list(None, 4096).await;
    let mut digital_tasks_by_status = HashMap::new();
    for task in &tasks {
        *digital_tasks_by_status.entry(task.status.clone()).or_insert(0usize) += 1;
    }

    RuntimeStatus {
        success: true,
        uptime_ms: epoch_ms() - state.started_at_ms,
        sessions_by_state,
        digital_tasks_by_status,
    }
}

/// `GET /v1/runtime/status`
pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(snapshot(&state).await)
}

#[derive(Debug, Deserialize)]
pub struct ObservabilityQuery {
    pub min_task_total_for_alert: Option<usize>,
    pub ingest_rejected_active_queue_depth_min: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct ObservabilityResponse {
    pub success: bool,
    pub healthy: bool,
    pub alerts: Vec<String>,
    pub status: RuntimeStatus,
}

/// `GET /v1/runtime/observability[?thresholds]`
pub async fn observability(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ObservabilityQuery>,
) -> impl IntoResponse {
    let status = snapshot(&state).await;

    let mut alerts = Vec::new();
    let task_total: usize = status.digital_tasks_by_status.values().sum();
    let min_total = query.min_task_total_for_alert.unwrap_or(5);
    if task_total >= min_total {
        let failed = status.digital_tasks_by_status.get("failed").copied().unwrap_or(0)
            + status.digital_tasks_by_status.get("timeout").copied().unwrap_or(0);
        if failed * 2 > task_total {
            alerts.push(format!("digital_task_failure_rate_high: {failed}/{task_total}"));
        }
    }

    let closed = status.sessions_by_state.get("closed").copied().unwrap_or(0);
    let ingest_min = query.ingest_rejected_active_queue_depth_min.unwrap_or(usize::MAX);
    if closed >= ingest_min {
        alerts.push(format!("closed_session_backlog: {closed}"));
    }

    let healthy = alerts.is_empty();
    let sample = json!({
        "uptime_ms": status.uptime_ms,
        "sessions_by_state": status.sessions_by_state,
        "digital_tasks_by_status": status.digital_tasks_by_status,
        "healthy": healthy,
        "alerts": alerts,
    });
    state.observability.add_sample("orchestrator", sample).await;

    Json(ObservabilityResponse { success: true, healthy, alerts, status })
}

#[derive(Debug, Deserialize)]
pub struct ObservabilityHistoryQuery {
    #[serde(default = "default_bucket_seconds")]
    pub bucket_seconds: i64,
    #[serde(default = "default_max_points")]
    pub max_points: i64,
    pub component: Option<String>,
}

fn default_bucket_seconds() -> i64 {
    60
}

fn default_max_points() -> i64 {
    100
}

const MIN_BUCKET_SECONDS: i64 = 10;
const MAX_BUCKET_SECONDS: i64 = 86_400;
const MAX_POINTS_CAP: i64 = 1000;

#[derive(Debug, Serialize)]
pub struct HistoryBucket {
    pub bucket_start_ms: i64,
    pub count: usize,
    pub healthy_avg: f64,
}

#[derive(Debug, Serialize)]
pub struct ObservabilityHistoryResponse {
    pub success: bool,
    pub bucket_seconds: i64,
    pub buckets: Vec<HistoryBucket>,
    pub delta: Value,
}

/// `GET /v1/runtime/observability/history` — bucketed view over the
/// observability store's samples; `bucket_seconds` is clamped to
/// `[10, 86400]` and the point count to `max_points` (itself capped).
pub async fn observability_history(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ObservabilityHistoryQuery>,
) -> impl IntoResponse {
    let bucket_seconds = query.bucket_seconds.clamp(MIN_BUCKET_SECONDS, MAX_BUCKET_SECONDS);
    let max_points = query.max_points.clamp(1, MAX_POINTS_CAP);
    let bucket_ms = bucket_seconds * 1000;

    let samples = state.observability.list_samples(query.component.as_deref(), max_points * 64).await;

    let mut buckets: HashMap<i64, (usize, f64)> = HashMap::new();
    for sample in &samples {
        let bucket_start = (sample.ts / bucket_ms) * bucket_ms;
        let healthy = sample.payload.get("healthy").and_then(Value::as_bool).unwrap_or(true);
        let entry = buckets.entry(bucket_start).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += if healthy { 1.0 } else { 0.0 };
    }

    let mut rows: Vec<HistoryBucket> = buckets
        .into_iter()
        .map(|(bucket_start_ms, (count, healthy_sum))| HistoryBucket {
            bucket_start_ms,
            count,
            healthy_avg: if count > 0 { healthy_sum / count as f64 } else { 1.0 },
        })
        .collect();
    rows.sort_by_key(|b| b.bucket_start_ms);
    if rows.len() as i64 > max_points {
        let drop = rows.len() - max_points as usize;
        rows.drain(0..drop);
    }

    let delta = match (rows.first(), rows.last()) {
        (Some(first), Some(last)) if rows.len() > 1 => json!({
            "healthy_avg_delta": last.healthy_avg - first.healthy_avg,
            "count_delta": last.count as i64 - first.count as i64,
        }),
        _ => Value::Null,
    };

    Json(ObservabilityHistoryResponse { success: true, bucket_seconds, buckets: rows, delta })
}
