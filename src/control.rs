// ABOUTME: HTTP control surface the conductor calls back into: deliver, initiate, health
// ABOUTME: Marshals all platform work through the runtime handle; never touches the connection

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use anyhow::Result;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::conductor::ConductorClient;
use crate::runtime::RuntimeHandle;
use troupe_core::config::Config;
use troupe_core::identity::IdentityTable;
use troupe_core::metrics;
use troupe_core::protocol::{
    ControlResponse, DeliverRequest, HealthStatus, InitiateRequest, TurnRequest,
};
use troupe_core::session::StateStore;
use troupe_core::traits::DeliveryError;
use troupe_core::utils::preview;

/// Upper bound on a pushed message body; anything bigger is operator error
const MAX_MESSAGE_LENGTH: usize = 64 * 1024;

#[derive(Clone)]
pub struct ControlState {
    pub runtime: RuntimeHandle,
    pub store: StateStore,
    pub conductor: ConductorClient,
    pub identities: Arc<IdentityTable>,
    pub config: Arc<Config>,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/control/message", post(message_handler))
        .route("/control/initiate", post(initiate_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Serve the control surface on an already-bound listener. The listener is
/// bound only after the platform connection reports ready, which is what
/// makes readiness a one-way gate for callers.
pub async fn serve(state: ControlState, listener: TcpListener) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "Control surface listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Shared API-key check for the mutating endpoints. Reads `x-api-key`;
/// no key configured means the surface is open (private network deployments).
fn authorized(state: &ControlState, headers: &HeaderMap) -> bool {
    match &state.config.control.api_key {
        None => true,
        Some(expected) => headers
            .get("x-api-key")
            .and_then(|v| v.to_str().ok())
            .map(|provided| provided == expected.as_str())
            .unwrap_or(false),
    }
}

/// Handle `POST /control/message` — the conductor pushing a reply into the
/// channel through this agent's platform connection. Not idempotent by
/// design; the caller owns de-duplication.
async fn message_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Json(payload): Json<DeliverRequest>,
) -> (StatusCode, Json<ControlResponse>) {
    if !authorized(&state, &headers) {
        metrics::record_control_request("message", "unauthorized");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ControlResponse::error("Invalid or missing API key")),
        );
    }

    if payload.message_text.trim().is_empty() {
        metrics::record_control_request("message", "bad_request");
        return (
            StatusCode::BAD_REQUEST,
            Json(ControlResponse::error("message_text cannot be empty")),
        );
    }
    if payload.message_text.len() > MAX_MESSAGE_LENGTH {
        metrics::record_control_request("message", "bad_request");
        return (
            StatusCode::BAD_REQUEST,
            Json(ControlResponse::error(format!(
                "message_text too large (max {} bytes)",
                MAX_MESSAGE_LENGTH
            ))),
        );
    }

    tracing::info!(
        channel_id = %payload.channel_id,
        text_preview = %preview(&payload.message_text, 50),
        "Control surface delivering message"
    );

    match state
        .runtime
        .deliver(&payload.channel_id, &payload.message_text)
        .await
    {
        Ok(()) => {
            metrics::record_control_request("message", "delivered");
            (StatusCode::OK, Json(ControlResponse::ok("delivered")))
        }
        Err(e) => {
            let (status, outcome) = match &e {
                DeliveryError::PermissionDenied(_) => {
                    (StatusCode::FORBIDDEN, "permission_denied")
                }
                DeliveryError::ChannelNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                DeliveryError::Transient(_) => (StatusCode::BAD_GATEWAY, "transient"),
            };
            metrics::record_control_request("message", outcome);
            (status, Json(ControlResponse::error(e.to_string())))
        }
    }
}

/// Handle `POST /control/initiate` — open a conversation as this persona, as
/// if it had spoken first, then hand the new session to the conductor.
async fn initiate_handler(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    Json(payload): Json<InitiateRequest>,
) -> (StatusCode, Json<ControlResponse>) {
    if !authorized(&state, &headers) {
        metrics::record_control_request("initiate", "unauthorized");
        return (
            StatusCode::UNAUTHORIZED,
            Json(ControlResponse::error("Invalid or missing API key")),
        );
    }

    if payload.starter_text.trim().is_empty() || payload.session_id.trim().is_empty() {
        metrics::record_control_request("initiate", "bad_request");
        return (
            StatusCode::BAD_REQUEST,
            Json(ControlResponse::error(
                "starter_text and session_id must be set",
            )),
        );
    }

    let own = state.identities.own();

    // Record the caller-assigned session so every later lookup in this
    // channel lands on the same id
    if let Err(e) = state.store.adopt_session(
        &payload.channel_id,
        &payload.session_id,
        &own.name,
        state.config.state.session_ttl_secs,
    ) {
        tracing::warn!(error = %e, session_id = %payload.session_id,
            "Failed to record initiated session — continuing");
    }

    if let Err(e) = state
        .runtime
        .deliver(&payload.channel_id, &payload.starter_text)
        .await
    {
        let (status, outcome) = match &e {
            DeliveryError::PermissionDenied(_) => (StatusCode::FORBIDDEN, "permission_denied"),
            DeliveryError::ChannelNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            DeliveryError::Transient(_) => (StatusCode::BAD_GATEWAY, "transient"),
        };
        metrics::record_control_request("initiate", outcome);
        return (status, Json(ControlResponse::error(e.to_string())));
    }

    // Inform the conductor asynchronously; there is no human waiting on this
    // call, so a failure here is a logged warning, not a channel message
    let request = TurnRequest {
        user_query: payload.starter_text.clone(),
        channel_id: payload.channel_id.clone(),
        initiator_persona: own.name.clone(),
        initiator_mention: own.mention(),
        human_display_name: String::new(),
        is_new_conversation: payload.is_new,
        session_id: payload.session_id.clone(),
        event_id: format!("initiate:{}", payload.session_id),
    };
    let conductor = state.conductor.clone();
    tokio::spawn(async move {
        if let Err(e) = conductor.submit(&request).await {
            tracing::warn!(
                session_id = %request.session_id,
                error = %e,
                "Initiated conversation loop failed to reach the conductor"
            );
        }
    });

    metrics::record_control_request("initiate", "scheduled");
    (StatusCode::ACCEPTED, Json(ControlResponse::ok("scheduled")))
}

/// Handle `GET /health` — reflects real platform connectivity, since the
/// process can outlive its platform session
async fn health_handler(State(state): State<Arc<ControlState>>) -> Json<HealthStatus> {
    let connection = state.runtime.connection_state().await;
    let connected = connection.is_connected();
    Json(HealthStatus {
        status: if connected { "ok" } else { "degraded" }.to_string(),
        platform_connected: connected,
    })
}

/// Handle `GET /metrics` — Prometheus text format
async fn metrics_handler(State(state): State<Arc<ControlState>>) -> impl IntoResponse {
    state.metrics_handle.render()
}
