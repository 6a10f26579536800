// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device runtime gateway: bridges field devices (voice capture, vision
//! capture, telemetry) to a conversational agent and a digital-task
//! executor, over a pluggable southbound transport (WebSocket or MQTT),
//! with an operator-facing HTTP control plane alongside it.

pub mod adapter;
pub mod audio;
pub mod config;
pub mod control_plane;
pub mod digital_task;
pub mod envelope;
pub mod error;
pub mod orchestrator;
pub mod policy;
pub mod redact;
pub mod session;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State, WebSocketUpgrade};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;

use crate::adapter::mock::MockAdapter;
use crate::adapter::mqtt_vendor::{self, MqttVendorAdapter};
use crate::adapter::websocket::{WebsocketAdapter, WsUpgradeQuery};
use crate::adapter::SouthboundAdapter;
use crate::audio::{AudioConfig, NullTranscriber, Transcriber};
use crate::config::{AdapterKind, GatewayConfig};
use crate::control_plane::{self, AppState};
use crate::digital_task::executor::{AgentClient, NullAgentClient};
use crate::digital_task::push_queue::{self, PushQueueStore};
use crate::digital_task::store::{self as task_store, TaskStore};
use crate::digital_task::{DeviceStatusCallback, DigitalTaskConfig, DigitalTaskService, StatusCallback};
use crate::orchestrator::external::{
    AgentDirect, ControlPlaneClient, NullAgentDirect, NullTtsSynthesizer, NullVlm, TtsSynthesizer, Vlm,
};
use crate::orchestrator::{Orchestrator, OrchestratorConfig};
use crate::policy::interaction::{InteractionConfig, InteractionPolicy};
use crate::policy::safety::{SafetyConfig, SafetyPolicy};
use crate::session::SessionManager;
use crate::store::db::SqliteHandle;
use crate::store::Stores;

/// Build whichever southbound adapter the config selects, already coerced
/// to the trait object the orchestrator holds. The websocket variant also
/// hands back its own concrete `Arc`, so `run` can mount the upgrade route
/// separately — `handle_upgrade` isn't part of `SouthboundAdapter`.
fn build_adapter(config: &GatewayConfig) -> (Arc<dyn SouthboundAdapter>, Option<Arc<WebsocketAdapter>>) {
    let hw = &config.file.hardware;
    match hw.adapter {
        AdapterKind::Websocket => {
            let ws = WebsocketAdapter::new(
                hw.ws_require_token,
                hw.control_api.auth_token.clone(),
                hw.mqtt.audio_frame_magic,
            );
            (ws.clone() as Arc<dyn SouthboundAdapter>, Some(ws))
        }
        AdapterKind::Ec600 | AdapterKind::GenericMqtt => {
            let mqtt = MqttVendorAdapter::new(hw.mqtt.clone(), "gateway");
            mqtt_vendor::spawn(Arc::clone(&mqtt));
            (mqtt as Arc<dyn SouthboundAdapter>, None)
        }
        AdapterKind::Mock => {
            (Arc::new(MockAdapter::new(hw.mqtt.audio_frame_magic)) as Arc<dyn SouthboundAdapter>, None)
        }
    }
}

async fn ws_upgrade(
    State(adapter): State<Arc<WebsocketAdapter>>,
    Query(query): Query<WsUpgradeQuery>,
    ws: WebSocketUpgrade,
) -> axum::response::Response {
    adapter.handle_upgrade(ws, query).await
}

/// Assemble every collaborator and run the gateway until shut down.
pub async fn run(config: GatewayConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.data_dir)?;

    let stores = Stores::open(&config.data_dir, config.file.observability_max_rows)?;
    let sessions = Arc::new(SessionManager::new(
        stores.lifelog.clone() as Arc<dyn session::SessionPersister>
    ));

    let (adapter, ws_adapter) = build_adapter(&config);

    let digital_task_migrations: Vec<&str> =
        task_store::MIGRATIONS.iter().chain(push_queue::MIGRATIONS.iter()).copied().collect();
    let digital_task_db = SqliteHandle::open(&config.file.digital_task.sqlite_path, &digital_task_migrations)?;
    let task_store = Arc::new(TaskStore::new(digital_task_db.clone()));
    let push_queue = Arc::new(PushQueueStore::new(digital_task_db));
    let status_callback: Arc<dyn StatusCallback> =
        Arc::new(DeviceStatusCallback::new(Arc::clone(&adapter), Arc::clone(&sessions)));
    let digital_task = DigitalTaskService::new(
        task_store,
        push_queue,
        Arc::new(NullAgentClient) as Arc<dyn AgentClient>,
        status_callback,
        DigitalTaskConfig {
            default_timeout_seconds: config.file.digital_task.default_timeout_seconds,
            max_concurrent_tasks: config.file.digital_task.max_concurrent_tasks,
            status_retry_count: config.file.digital_task.status_retry_count,
            status_retry_backoff_ms: config.file.digital_task.status_retry_backoff_ms,
        },
    );
    let recovered = digital_task.recover_unfinished_tasks(1024).await;
    if recovered > 0 {
        tracing::info!(recovered, "resumed digital tasks interrupted by restart");
    }

    let safety = SafetyPolicy::new(SafetyConfig {
        enabled: config.file.safety.enabled,
        low_confidence_threshold: config.file.safety.low_confidence_threshold,
        max_output_chars: config.file.safety.max_output_chars,
        prepend_caution_for_risk: config.file.safety.prepend_caution_for_risk,
        semantic_guard_enabled: config.file.safety.semantic_guard_enabled,
        directional_confidence_threshold: config.file.safety.directional_confidence_threshold,
    });
    let interaction = InteractionPolicy::new(InteractionConfig {
        enabled: config.file.interaction.enabled,
        emotion_cue_sources: config.file.interaction.emotion_cue_sources.clone(),
        proactive_hint_sources: config.file.interaction.proactive_hint_sources.clone(),
        proactive_hint_text: config.file.interaction.proactive_hint_text.clone(),
        quiet_hours_start_hour: config.file.interaction.quiet_hours_start_hour,
        quiet_hours_end_hour: config.file.interaction.quiet_hours_end_hour,
        low_priority_sources: config.file.interaction.low_priority_sources.clone(),
    });

    let orchestrator = Orchestrator::new(
        Arc::clone(&adapter),
        sessions,
        AudioConfig::default(),
        Arc::new(NullTranscriber) as Arc<dyn Transcriber>,
        Arc::new(NullAgentDirect) as Arc<dyn AgentDirect>,
        Arc::new(NullVlm) as Arc<dyn Vlm>,
        Arc::new(NullTtsSynthesizer) as Arc<dyn TtsSynthesizer>,
        None as Option<Arc<dyn ControlPlaneClient>>,
        digital_task,
        stores.bindings.clone(),
        stores.operations.clone(),
        stores.lifelog.clone(),
        stores.telemetry.clone(),
        safety,
        interaction,
        OrchestratorConfig {
            tts_mode: config.file.hardware.tts_mode,
            tts_audio_chunk_bytes: config.file.hardware.tts_audio_chunk_bytes,
            device_auth_enabled: config.file.hardware.device_auth_enabled,
            allow_unbound_devices: config.file.hardware.allow_unbound_devices,
            require_activated_devices: config.file.hardware.require_activated_devices,
            no_heartbeat_timeout_s: config.file.hardware.no_heartbeat_timeout_s,
            ..OrchestratorConfig::default()
        },
    );

    adapter.start().await?;
    {
        let o = Arc::clone(&orchestrator);
        tokio::spawn(async move { o.run_event_loop().await });
    }
    {
        let o = Arc::clone(&orchestrator);
        tokio::spawn(async move { o.run_watchdog().await });
    }

    let app_state = AppState::new(
        Arc::clone(&orchestrator),
        stores.thought_trace.clone(),
        stores.observability.clone(),
        config.file.hardware.control_api.clone(),
    );
    let mut router: Router = control_plane::build_router(app_state);
    if let Some(ws_adapter) = ws_adapter {
        let ws_router = Router::new().route("/v1/ws/device", get(ws_upgrade)).with_state(ws_adapter);
        router = router.merge(ws_router);
    }

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "device runtime gateway listening");

    axum::serve(listener, router.into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown_signal(orchestrator))
        .await?;

    Ok(())
}

async fn shutdown_signal(orchestrator: Arc<Orchestrator>) {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutdown signal received");
    orchestrator.shutdown().await;
}
