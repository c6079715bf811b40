//! Axum-based HTTP gateway: the tenant dashboard API plus the provider
//! webhook callbacks.
//!
//! Hardening is inherited from the stack rather than hand-rolled:
//! - Request body size limit (64KB) via `RequestBodyLimitLayer`
//! - Request timeouts (30s) to prevent slow-loris attacks
//! - HTTP/1.1 parsing, header sanitization via axum/hyper
//!
//! Every route is listed in the ownership tables in [`crate::tenancy`];
//! the guard middleware runs before any handler in this module.

pub mod api;

use crate::channels::{ChannelEngine, HandshakeQuery};
use crate::config::Config;
use crate::security::{is_public_bind, SessionSigner};
use crate::store::GatewayStore;
use crate::tenancy;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;

/// Maximum request body size (64KB). Webhook payloads and channel configs
/// are far smaller; anything bigger is noise.
pub const MAX_BODY_SIZE: usize = 65_536;

/// Request timeout in seconds.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;

/// Signature header on business webhook deliveries.
const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Shared state for all gateway routes.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<ChannelEngine>,
    pub store: Arc<dyn GatewayStore>,
    pub sessions: Arc<SessionSigner>,
    /// Deployment admin key guarding `POST /api/session`.
    pub admin_key: Option<String>,
}

/// Assemble the full route table with the ownership guard and hardening
/// layers applied.
pub fn build_router(state: AppState) -> Router {
    let sessions = state.sessions.clone();
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/api/session", post(api::handle_session_issue))
        .route("/api/channels/connect", post(api::handle_channel_connect))
        .route("/api/channels/{tenant_id}", get(api::handle_channel_list))
        .route(
            "/api/channels/{tenant_id}/{channel_type}/disconnect",
            post(api::handle_channel_disconnect),
        )
        .route(
            "/api/channels/{tenant_id}/{channel_type}/status",
            get(api::handle_channel_status),
        )
        .route(
            "/api/channels/{tenant_id}/email/poll",
            post(api::handle_email_poll),
        )
        .route(
            "/api/conversations/{tenant_id}",
            get(api::handle_conversation_list),
        )
        .route(
            "/api/conversations/{tenant_id}/{conversation_id}",
            get(api::handle_conversation_detail),
        )
        .route(
            "/webhooks/business/{tenant_id}",
            get(handle_business_verify).post(handle_business_webhook),
        )
        .route("/webhooks/bot/{tenant_id}", post(handle_bot_webhook))
        .layer(middleware::from_fn_with_state(
            sessions,
            tenancy::ownership_guard,
        ))
        .with_state(state)
        .layer(RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            Duration::from_secs(REQUEST_TIMEOUT_SECS),
        ))
}

/// Run the HTTP gateway until `shutdown` fires.
pub async fn run_gateway(
    config: &Config,
    state: AppState,
    shutdown: CancellationToken,
) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;
    if is_public_bind(&host) && config.gateway.public_base_url.is_none() {
        tracing::warn!(
            "Binding {host}:{port} on a public interface without public_base_url; \
             put TLS termination in front and set [gateway] public_base_url"
        );
    }

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid gateway host/port")?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!("Gateway listening on http://{local}");

    let app = build_router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { shutdown.cancelled().await })
    .await?;
    Ok(())
}

// ── Handlers ─────────────────────────────────────────────────────

/// GET /healthz: liveness probe, no secrets.
async fn handle_health() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// GET /webhooks/business/{tenant_id}: subscription handshake. Echoes the
/// challenge only when the presented verify token matches the stored one.
async fn handle_business_verify(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    Query(query): Query<HandshakeQuery>,
) -> Response {
    match state.engine.business_handshake(&tenant_id, &query).await {
        Ok(Some(challenge)) => (StatusCode::OK, challenge).into_response(),
        Ok(None) => (StatusCode::FORBIDDEN, "verification failed").into_response(),
        Err(e) => {
            tracing::error!(tenant = %tenant_id, "Handshake lookup failed: {e}");
            (StatusCode::FORBIDDEN, "verification failed").into_response()
        }
    }
}

/// POST /webhooks/business/{tenant_id}: message delivery. Acknowledged
/// immediately; processing continues detached and its failures are only
/// visible in logs.
async fn handle_business_webhook(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    if let Err(e) = state
        .engine
        .accept_business_webhook(&tenant_id, signature.as_deref(), &body)
        .await
    {
        tracing::error!(tenant = %tenant_id, "Business webhook intake failed: {e}");
    }
    StatusCode::OK.into_response()
}

/// POST /webhooks/bot/{tenant_id}: push update. Answers `{"ok":true}`
/// regardless of internal outcome; the provider retries any non-2xx until
/// it gets one.
async fn handle_bot_webhook(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
    body: Bytes,
) -> Response {
    match serde_json::from_slice::<serde_json::Value>(&body) {
        Ok(update) => {
            if let Err(e) = state.engine.handle_bot_update(&tenant_id, &update).await {
                tracing::error!(tenant = %tenant_id, "Bot webhook handling failed: {e}");
            }
        }
        Err(e) => {
            tracing::debug!(tenant = %tenant_id, "Bot webhook body is not JSON: {e}");
        }
    }
    (StatusCode::OK, Json(serde_json::json!({ "ok": true }))).into_response()
}
