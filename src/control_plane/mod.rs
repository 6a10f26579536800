// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane HTTP server (C9): the operator- and tooling-facing REST
//! surface that sits beside the device-facing adapters. Bridges straight
//! into the async orchestrator and stores — no separate thread pool, since
//! axum's handlers are themselves async and every collaborator underneath
//! is already `tokio`-native. Cross-cutting concerns (auth, rate limiting,
//! the replay guard, body-size limits) are axum middleware layered around
//! the route table, grounded on the teacher's `transport/{mod,auth}.rs`.

pub mod auth;
pub mod device;
pub mod digital_task;
pub mod lifelog;
pub mod rate_limit;
pub mod replay_guard;
pub mod runtime;
pub mod vision;

use std::sync::Arc;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::config::ControlApiConfig;
use crate::orchestrator::Orchestrator;
use crate::store::observability::ObservabilityStore;
use crate::store::thought_trace::ThoughtTraceStore;

use rate_limit::RateLimiter;
use replay_guard::ReplayGuard;

/// Shared state for every control-plane handler. Reuses the orchestrator's
/// collaborators (`pub(crate)` fields, same crate) rather than duplicating
/// `Arc` handles to the same stores.
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub thought_trace: Arc<ThoughtTraceStore>,
    pub observability: Arc<ObservabilityStore>,
    pub config: ControlApiConfig,
    pub rate_limiter: RateLimiter,
    pub replay_guard: ReplayGuard,
    pub started_at_ms: i64,
}

impl AppState {
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        thought_trace: Arc<ThoughtTraceStore>,
        observability: Arc<ObservabilityStore>,
        config: ControlApiConfig,
    ) -> Arc<Self> {
        let rate_limiter =
            RateLimiter::new(config.rate_limit_rpm, config.rate_limit_burst, config.rate_limit_window_seconds);
        let replay_guard = ReplayGuard::new(config.replay_window_seconds);
        Arc::new(Self {
            orchestrator,
            thought_trace,
            observability,
            config,
            rate_limiter,
            replay_guard,
            started_at_ms: crate::store::db::epoch_ms(),
        })
    }
}

pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.max_request_body_bytes;
    Router::new()
        .route("/v1/runtime/status", get(runtime::status))
        .route("/v1/runtime/observability", get(runtime::observability))
        .route("/v1/runtime/observability/history", get(runtime::observability_history))
        .route("/v1/device/event", post(device::inject_event))
        .route("/v1/device/register", post(device::register))
        .route("/v1/device/bind", post(device::bind))
        .route("/v1/device/activate", post(device::activate))
        .route("/v1/device/revoke", post(device::revoke))
        .route("/v1/device/binding", get(device::binding))
        .route("/v1/device/ops", get(device::ops_list))
        .route("/v1/device/ops/dispatch", post(device::ops_dispatch))
        .route("/v1/device/ops/{operation_id}/ack", post(device::ops_ack))
        .route("/v1/device/{id}/status", get(device::status))
        .route("/v1/device/{id}/abort", post(device::abort))
        .route("/v1/device/{id}/set_config", post(device::set_config))
        .route("/v1/device/{id}/tool_call", post(device::tool_call))
        .route("/v1/device/{id}/ota_plan", post(device::ota_plan))
        .route("/v1/vision/analyze", post(vision::analyze))
        .route("/v1/lifelog/image", post(lifelog::enqueue_image))
        .route("/v1/lifelog/timeline", get(lifelog::timeline))
        .route("/v1/lifelog/thought-trace", post(lifelog::thought_trace_append))
        .route("/v1/lifelog/thought-trace/{trace_id}", get(lifelog::thought_trace_query))
        .route("/v1/lifelog/thought-trace/{trace_id}/replay", get(lifelog::thought_trace_replay))
        .route("/v1/lifelog/telemetry", get(lifelog::telemetry))
        .route("/v1/lifelog/safety", get(lifelog::safety_query))
        .route("/v1/lifelog/safety/stats", get(lifelog::safety_stats))
        .route("/v1/lifelog/sessions", get(lifelog::sessions))
        .route("/v1/lifelog/retention/cleanup", post(lifelog::retention_cleanup))
        .route("/v1/digital-task/execute", post(digital_task::execute))
        .route("/v1/digital-task/stats", get(digital_task::stats))
        .route("/v1/digital-task", get(digital_task::list))
        .route("/v1/digital-task/{id}", get(digital_task::get))
        .route("/v1/digital-task/{id}/cancel", post(digital_task::cancel))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), replay_guard::replay_guard_layer))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), rate_limit::rate_limit_layer))
        .layer(middleware::from_fn_with_state(Arc::clone(&state), auth::auth_layer))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
