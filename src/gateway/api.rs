//! REST handlers for the tenant dashboard API.
//!
//! The ownership guard has already run for everything here except
//! `POST /api/session`, which authenticates with the deployment admin key
//! instead of a session token.

use super::AppState;
use crate::channels::{ChannelError, ConnectRequest};
use crate::security::constant_time_eq;
use crate::store::ChannelKind;
use crate::tenancy::{self, AuthenticatedTenant};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    Extension,
};
use serde::Deserialize;

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

fn parse_kind(raw: &str) -> Result<ChannelKind, Response> {
    ChannelKind::parse(raw).ok_or_else(|| {
        error(
            StatusCode::BAD_REQUEST,
            "unknown channel type (expected email, bot, or business)",
        )
    })
}

/// Map driver failures onto the HTTP surface. Secrets never appear in
/// these bodies; `Connection` details are probe summaries, not credentials.
fn channel_error_response(e: ChannelError) -> Response {
    match e {
        ChannelError::Connection(detail) => error(
            StatusCode::BAD_GATEWAY,
            &format!("connection failed: {detail}"),
        ),
        ChannelError::Decryption(_) => error(
            StatusCode::CONFLICT,
            "stored credential unreadable; reconnect the channel",
        ),
        ChannelError::AccessDenied => error(StatusCode::FORBIDDEN, "access denied"),
        ChannelError::Duplicate => error(StatusCode::CONFLICT, "message already handled"),
        ChannelError::ReplyGeneration(detail) => error(
            StatusCode::BAD_GATEWAY,
            &format!("reply generation failed: {detail}"),
        ),
        ChannelError::Dispatch(detail) => {
            error(StatusCode::BAD_GATEWAY, &format!("dispatch failed: {detail}"))
        }
        ChannelError::QuotaExceeded {
            remaining,
            resets_on,
        } => (
            StatusCode::TOO_MANY_REQUESTS,
            Json(serde_json::json!({
                "error": "daily send quota exhausted",
                "remaining": remaining,
                "resets_on": resets_on,
            })),
        )
            .into_response(),
        ChannelError::Other(e) => {
            tracing::error!("Channel operation failed: {e:#}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

// ── Sessions ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub tenant_id: String,
    pub admin_key: String,
}

/// POST /api/session: exchange the deployment admin key for a
/// tenant-scoped session token.
pub async fn handle_session_issue(
    State(state): State<AppState>,
    Json(body): Json<SessionRequest>,
) -> Response {
    let Some(expected) = state.admin_key.as_deref() else {
        return error(
            StatusCode::SERVICE_UNAVAILABLE,
            "no admin key configured; start the gateway once to generate one",
        );
    };
    if !constant_time_eq(&body.admin_key, expected) {
        tracing::warn!(tenant = %body.tenant_id, "Session request with wrong admin key");
        return error(StatusCode::UNAUTHORIZED, "invalid admin key");
    }
    if body.tenant_id.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "tenant_id must not be empty");
    }
    match state.sessions.issue(&body.tenant_id) {
        Ok(token) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "token": token,
                "tenant_id": body.tenant_id,
            })),
        )
            .into_response(),
        Err(e) => {
            tracing::error!("Could not issue session token: {e}");
            error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "could not issue session token",
            )
        }
    }
}

// ── Channel management ───────────────────────────────────────────

/// POST /api/channels/connect: probe the platform, seal the secret,
/// persist the channel active.
pub async fn handle_channel_connect(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthenticatedTenant>,
    Json(body): Json<ConnectRequest>,
) -> Response {
    let tenant_id = match tenancy::resolve_target(&auth, body.tenant_id.as_deref()) {
        Ok(tenant_id) => tenant_id,
        Err(response) => return response,
    };
    let kind = match parse_kind(&body.channel_type) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    if body.secret.trim().is_empty() {
        return error(StatusCode::BAD_REQUEST, "secret must not be empty");
    }
    match state
        .engine
        .connect(&tenant_id, kind, &body.secret, &body.endpoint)
        .await
    {
        Ok(view) => (StatusCode::CREATED, Json(view)).into_response(),
        Err(e) => channel_error_response(e),
    }
}

/// POST /api/channels/{tenant_id}/{channel_type}/disconnect
pub async fn handle_channel_disconnect(
    State(state): State<AppState>,
    Path((tenant_id, channel_type)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&channel_type) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    match state.engine.disconnect(&tenant_id, kind).await {
        Ok(true) => Json(serde_json::json!({ "disconnected": true })).into_response(),
        Ok(false) => error(StatusCode::NOT_FOUND, "no such channel"),
        Err(e) => channel_error_response(e),
    }
}

/// GET /api/channels/{tenant_id}/{channel_type}/status
pub async fn handle_channel_status(
    State(state): State<AppState>,
    Path((tenant_id, channel_type)): Path<(String, String)>,
) -> Response {
    let kind = match parse_kind(&channel_type) {
        Ok(kind) => kind,
        Err(response) => return response,
    };
    match state.engine.channel_status(&tenant_id, kind).await {
        Ok(Some(view)) => Json(view).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, "no such channel"),
        Err(e) => channel_error_response(e),
    }
}

/// GET /api/channels/{tenant_id}
pub async fn handle_channel_list(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    match state.engine.list_channels(&tenant_id).await {
        Ok(views) => Json(views).into_response(),
        Err(e) => channel_error_response(e),
    }
}

/// POST /api/channels/{tenant_id}/email/poll: run one poll cycle now and
/// report what it did.
pub async fn handle_email_poll(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    match state.engine.poll_email(&tenant_id).await {
        Ok(Some(report)) => Json(report).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, "no active email channel"),
        Err(e) => channel_error_response(e),
    }
}

// ── Conversations ────────────────────────────────────────────────

/// GET /api/conversations/{tenant_id}
pub async fn handle_conversation_list(
    State(state): State<AppState>,
    Path(tenant_id): Path<String>,
) -> Response {
    match state.store.conversations(&tenant_id).await {
        Ok(summaries) => Json(summaries).into_response(),
        Err(e) => {
            tracing::error!(tenant = %tenant_id, "Conversation list failed: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "store failure")
        }
    }
}

/// GET /api/conversations/{tenant_id}/{conversation_id}
pub async fn handle_conversation_detail(
    State(state): State<AppState>,
    Path((tenant_id, conversation_id)): Path<(String, String)>,
) -> Response {
    match state.store.conversation(&tenant_id, &conversation_id).await {
        Ok(Some(detail)) => Json(detail).into_response(),
        Ok(None) => error(StatusCode::NOT_FOUND, "no such conversation"),
        Err(e) => {
            tracing::error!(tenant = %tenant_id, "Conversation lookup failed: {e}");
            error(StatusCode::INTERNAL_SERVER_ERROR, "store failure")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_parsing_covers_the_three_kinds() {
        assert!(parse_kind("email").is_ok());
        assert!(parse_kind("bot").is_ok());
        assert!(parse_kind("business").is_ok());
        assert!(parse_kind("fax").is_err());
    }

    #[test]
    fn quota_error_carries_reset_information() {
        let response = channel_error_response(ChannelError::QuotaExceeded {
            remaining: 0,
            resets_on: chrono::NaiveDate::from_ymd_opt(2025, 7, 1).unwrap(),
        });
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn connect_body_accepts_missing_tenant_id() {
        let body: ConnectRequest = serde_json::from_str(
            r#"{"channel_type": "bot", "secret": "123:abc"}"#,
        )
        .unwrap();
        assert!(body.tenant_id.is_none());
        assert_eq!(body.channel_type, "bot");
        assert!(body.endpoint.is_null());
    }
}
