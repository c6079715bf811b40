//! Tenant ownership enforcement for the HTTP surface.
//!
//! One table lists every session-guarded route together with the path
//! segment that names the target tenant; a single matcher resolves that
//! target and refuses cross-tenant requests before any handler runs.
//! Paths in neither table are refused outright; a new route stays private
//! until it is listed.

use crate::security::SessionSigner;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Json, Response};
use std::sync::Arc;

/// Marks the target-tenant segment in a route template.
const TENANT_PARAM: &str = "{tenant_id}";

/// Routes served without a session. Webhook callbacks are authenticated by
/// provider secret or signature instead; the health probe carries nothing
/// worth guarding.
const PUBLIC_ROUTES: &[(&str, &str)] = &[
    ("GET", "/healthz"),
    ("POST", "/api/session"),
    ("GET", "/webhooks/business/{tenant_id}"),
    ("POST", "/webhooks/business/{tenant_id}"),
    ("POST", "/webhooks/bot/{tenant_id}"),
];

/// Session-guarded routes. `{tenant_id}` is the segment naming the target
/// tenant; other `{...}` segments match any value. Routes without a
/// `{tenant_id}` segment carry the target in the request body and resolve
/// it through [`resolve_target`] inside the handler.
const TENANT_ROUTES: &[(&str, &str)] = &[
    ("POST", "/api/channels/connect"),
    ("GET", "/api/channels/{tenant_id}"),
    ("POST", "/api/channels/{tenant_id}/{channel_type}/disconnect"),
    ("GET", "/api/channels/{tenant_id}/{channel_type}/status"),
    ("POST", "/api/channels/{tenant_id}/email/poll"),
    ("GET", "/api/conversations/{tenant_id}"),
    ("GET", "/api/conversations/{tenant_id}/{conversation_id}"),
];

/// The session's tenant, injected into request extensions once the guard
/// has passed. Handlers read this instead of re-deriving identity.
#[derive(Debug, Clone)]
pub struct AuthenticatedTenant(pub String);

/// Match one path against one template, segment by segment. `Some` means
/// the template matched; the inner value is the captured `{tenant_id}`
/// segment, when the template has one.
fn match_template<'a>(template: &str, path: &'a str) -> Option<Option<&'a str>> {
    let mut captured = None;
    let mut template_segments = template.trim_matches('/').split('/');
    let mut path_segments = path.trim_matches('/').split('/');
    loop {
        match (template_segments.next(), path_segments.next()) {
            (None, None) => return Some(captured),
            (Some(expected), Some(actual)) => {
                if expected == TENANT_PARAM {
                    captured = Some(actual);
                } else if expected.starts_with('{') && expected.ends_with('}') {
                    // wildcard segment
                } else if expected != actual {
                    return None;
                }
            }
            _ => return None,
        }
    }
}

fn is_public(method: &Method, path: &str) -> bool {
    PUBLIC_ROUTES
        .iter()
        .any(|(m, template)| *m == method.as_str() && match_template(template, path).is_some())
}

/// Find the guarded route matching this request. Outer `None` means the
/// route is not listed at all; the inner option is the path's target
/// tenant, as in [`match_template`].
fn guarded_route_target<'a>(method: &Method, path: &'a str) -> Option<Option<&'a str>> {
    TENANT_ROUTES.iter().find_map(|(m, template)| {
        if *m == method.as_str() {
            match_template(template, path)
        } else {
            None
        }
    })
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|auth| auth.strip_prefix("Bearer "))
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "error": message }))).into_response()
}

/// Axum middleware consulting the route tables before every handler.
pub async fn ownership_guard(
    State(sessions): State<Arc<SessionSigner>>,
    mut request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    if is_public(&method, &path) {
        return next.run(request).await;
    }

    let Some(target) = guarded_route_target(&method, &path) else {
        // Listed in neither table: refuse rather than guess.
        tracing::warn!(%method, %path, "Request to unlisted route refused");
        return error_response(StatusCode::FORBIDDEN, "access denied");
    };

    let tenant = match bearer_token(request.headers()).map(|t| sessions.verify(t)) {
        Some(Ok(tenant)) => tenant,
        _ => {
            return error_response(StatusCode::UNAUTHORIZED, "missing or invalid session token");
        }
    };

    if let Some(target) = target {
        if target != tenant {
            tracing::warn!(tenant = %tenant, target = %target, %path, "Cross-tenant request refused");
            return error_response(StatusCode::FORBIDDEN, "access denied");
        }
    }

    request.extensions_mut().insert(AuthenticatedTenant(tenant));
    next.run(request).await
}

/// Resolve the target tenant for routes that carry it in the body. A body
/// id contradicting the session is refused; an absent one falls back to
/// the session's tenant.
pub fn resolve_target(
    auth: &AuthenticatedTenant,
    body_tenant: Option<&str>,
) -> Result<String, Response> {
    match body_tenant {
        Some(target) if target != auth.0 => {
            tracing::warn!(tenant = %auth.0, target = %target, "Cross-tenant request refused");
            Err(error_response(StatusCode::FORBIDDEN, "access denied"))
        }
        Some(target) => Ok(target.to_string()),
        None => Ok(auth.0.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request as HttpRequest;
    use axum::routing::{get, post};
    use axum::{middleware, Extension, Router};
    use tower::ServiceExt;

    #[test]
    fn template_matching_captures_the_tenant_segment() {
        assert_eq!(
            match_template("/api/channels/{tenant_id}", "/api/channels/acme"),
            Some(Some("acme"))
        );
        assert_eq!(
            match_template(
                "/api/channels/{tenant_id}/{channel_type}/status",
                "/api/channels/acme/email/status"
            ),
            Some(Some("acme"))
        );
        assert_eq!(match_template("/healthz", "/healthz"), Some(None));
        assert_eq!(match_template("/healthz", "/api/channels/acme"), None);
        assert_eq!(match_template("/api/channels/{tenant_id}", "/api/channels"), None);
        assert_eq!(
            match_template("/api/channels/{tenant_id}", "/api/channels/acme/extra"),
            None
        );
    }

    #[test]
    fn webhook_and_session_routes_are_public() {
        assert!(is_public(&Method::POST, "/webhooks/bot/acme"));
        assert!(is_public(&Method::GET, "/webhooks/business/acme"));
        assert!(is_public(&Method::POST, "/api/session"));
        assert!(!is_public(&Method::GET, "/api/channels/acme"));
        assert!(!is_public(&Method::DELETE, "/webhooks/bot/acme"));
    }

    #[test]
    fn body_target_falls_back_to_the_session_tenant() {
        let auth = AuthenticatedTenant("acme".into());
        assert_eq!(resolve_target(&auth, None).unwrap(), "acme");
        assert_eq!(resolve_target(&auth, Some("acme")).unwrap(), "acme");
        assert!(resolve_target(&auth, Some("rival")).is_err());
    }

    fn signer() -> Arc<SessionSigner> {
        Arc::new(SessionSigner::new("0f".repeat(32).as_str(), 3600).unwrap())
    }

    fn guarded_router(sessions: Arc<SessionSigner>) -> Router {
        async fn whoami(Extension(tenant): Extension<AuthenticatedTenant>) -> String {
            tenant.0
        }
        Router::new()
            .route("/api/channels/{tenant_id}", get(whoami))
            .route("/api/session", post(|| async { "open" }))
            .route("/webhooks/bot/{tenant_id}", post(|| async { "ok" }))
            .route("/internal/experiment", get(|| async { "hidden" }))
            .layer(middleware::from_fn_with_state(sessions, ownership_guard))
    }

    #[tokio::test]
    async fn guarded_route_requires_a_session() {
        let app = guarded_router(signer());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/channels/acme")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn cross_tenant_path_is_refused_before_the_handler() {
        let sessions = signer();
        let token = sessions.issue("acme").unwrap();
        let app = guarded_router(sessions);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/channels/rival")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn matching_tenant_reaches_the_handler_with_identity_injected() {
        let sessions = signer();
        let token = sessions.issue("acme").unwrap();
        let app = guarded_router(sessions);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/api/channels/acme")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        assert_eq!(&body[..], b"acme");
    }

    #[tokio::test]
    async fn unlisted_route_is_refused_even_with_a_valid_session() {
        let sessions = signer();
        let token = sessions.issue("acme").unwrap();
        let app = guarded_router(sessions);
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .uri("/internal/experiment")
                    .header(header::AUTHORIZATION, format!("Bearer {token}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn public_webhook_path_bypasses_the_guard() {
        let app = guarded_router(signer());
        let response = app
            .oneshot(
                HttpRequest::builder()
                    .method(Method::POST)
                    .uri("/webhooks/bot/acme")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
