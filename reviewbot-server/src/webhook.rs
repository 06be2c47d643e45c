use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Request, State},
    http::{HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use reviewbot_core::CorrelationId;
use serde::Serialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info};

use crate::dispatcher::Ack;
use crate::AppState;

pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// GitHub caps webhook payloads at 25 MB.
const MAX_WEBHOOK_BODY_BYTES: usize = 25 * 1024 * 1024;

#[derive(Debug, Serialize)]
pub struct WebhookResponse {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl WebhookResponse {
    fn success() -> Self {
        Self {
            status: "success",
            message: None,
        }
    }

    fn error(message: String) -> Self {
        Self {
            status: "error",
            message: Some(message),
        }
    }
}

type HmacSha256 = Hmac<Sha256>;

pub fn verify_github_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let Ok(signature_bytes) = hex::decode(signature_hex) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };

    mac.update(payload);

    // Use constant-time verification
    mac.verify_slice(&signature_bytes).is_ok()
}

/// Reject deliveries whose `X-Hub-Signature-256` does not match the body.
///
/// Passes everything through when no webhook secret is configured.
async fn verify_webhook_signature(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(secret) = state.webhook_secret.as_deref() else {
        return Ok(next.run(request).await);
    };

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, MAX_WEBHOOK_BODY_BYTES)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let signature = parts
        .headers
        .get(SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| {
            error!("Webhook delivery without signature");
            StatusCode::UNAUTHORIZED
        })?;

    if !verify_github_signature(secret, &bytes, signature) {
        error!("Invalid webhook signature");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let request = Request::from_parts(parts, axum::body::Body::from(bytes));
    Ok(next.run(request).await)
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Acknowledge a delivery. Reviews run in the background, so the answer only
/// reflects whether the payload was acceptable.
pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let event_type = header(&headers, EVENT_HEADER);
    let delivery_id = header(&headers, DELIVERY_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| CorrelationId::generate().0);

    info!(
        "Received webhook delivery {} ({})",
        delivery_id,
        event_type.unwrap_or("no event type")
    );

    match state
        .dispatcher
        .handle(event_type, &body, Some(&delivery_id))
        .await
    {
        Ok(Ack::Ignored(_)) | Ok(Ack::Dispatched(_)) => {
            (StatusCode::OK, Json(WebhookResponse::success())).into_response()
        }
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(WebhookResponse::error(e.to_string())),
        )
            .into_response(),
    }
}

pub fn webhook_router(middleware_state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhook", post(github_webhook_handler))
        .route_layer(middleware::from_fn_with_state(
            middleware_state,
            verify_webhook_signature,
        ))
        .layer(DefaultBodyLimit::max(MAX_WEBHOOK_BODY_BYTES))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_router;
    use crate::record_store::RecordStore;
    use crate::test_utils::{opened_payload, TestApp};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use reviewbot_core::PullRequestId;
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use tower::ServiceExt;

    const SECRET: &str = "It's a Secret to Everybody";

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    fn webhook_request(event: &str, body: &[u8], signature: Option<String>) -> Request<Body> {
        let mut builder = Request::builder()
            .method("POST")
            .uri("/webhook")
            .header("content-type", "application/json")
            .header(EVENT_HEADER, event)
            .header(DELIVERY_HEADER, "72d3162e-cc78-11e3-81ab-4c9367dc0958");
        if let Some(signature) = signature {
            builder = builder.header(SIGNATURE_HEADER, signature);
        }
        builder.body(Body::from(body.to_vec())).unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_verify_github_signature() {
        // Example from GitHub's webhook documentation
        assert!(verify_github_signature(
            SECRET,
            b"Hello, World!",
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        ));
        assert!(!verify_github_signature(
            SECRET,
            b"Hello, World?",
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        ));
    }

    #[test]
    fn test_verify_github_signature_rejects_bad_format() {
        let good = sign(SECRET, b"payload");
        assert!(verify_github_signature(SECRET, b"payload", &good));
        assert!(!verify_github_signature(SECRET, b"payload", &good[7..]));
        assert!(!verify_github_signature(SECRET, b"payload", "sha256=not-hex"));
        assert!(!verify_github_signature("other secret", b"payload", &good));
    }

    #[tokio::test]
    async fn test_signed_opened_event_is_accepted_and_reviewed() {
        let app = TestApp::new(Some(SECRET));
        let body = serde_json::to_vec(&opened_payload("acme/widgets", 42)).unwrap();

        let response = build_router(app.state.clone())
            .oneshot(webhook_request("pull_request", &body, Some(sign(SECRET, &body))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "success"}));

        app.state.dispatcher.wait_idle().await;
        assert_eq!(app.host.comments().len(), 1);
        assert!(app
            .store
            .has_record(&PullRequestId::new("acme/widgets", 42))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_bad_or_missing_signature_is_unauthorized() {
        let app = TestApp::new(Some(SECRET));
        let body = serde_json::to_vec(&opened_payload("acme/widgets", 42)).unwrap();

        let response = build_router(app.state.clone())
            .oneshot(webhook_request(
                "pull_request",
                &body,
                Some(sign("wrong secret", &body)),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = build_router(app.state.clone())
            .oneshot(webhook_request("pull_request", &body, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        app.state.dispatcher.wait_idle().await;
        assert_eq!(app.completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unsigned_delivery_accepted_without_secret() {
        let app = TestApp::new(None);
        let body = serde_json::to_vec(&opened_payload("acme/widgets", 42)).unwrap();

        let response = build_router(app.state.clone())
            .oneshot(webhook_request("pull_request", &body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        app.state.dispatcher.wait_idle().await;
        assert_eq!(app.host.comments().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_bad_request() {
        let app = TestApp::new(Some(SECRET));
        let body = br#"{"action": "opened", "number": 42}"#;

        let response = build_router(app.state.clone())
            .oneshot(webhook_request("pull_request", body, Some(sign(SECRET, body))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let json = body_json(response).await;
        assert_eq!(json["status"], "error");
        assert_eq!(
            json["message"],
            "webhook payload is missing required field `pull_request`"
        );
    }

    #[tokio::test]
    async fn test_closed_delivery_with_odd_fields_is_ignored() {
        let app = TestApp::new(None);
        let body = serde_json::to_vec(&json!({
            "action": "closed",
            "number": "42",
            "pull_request": {"number": 42, "title": 7},
            "repository": {"full_name": "acme/widgets"}
        }))
        .unwrap();

        let response = build_router(app.state.clone())
            .oneshot(webhook_request("pull_request", &body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "success"}));
        app.state.dispatcher.wait_idle().await;
        assert_eq!(app.completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_payload_over_two_megabytes_is_accepted() {
        let app = TestApp::new(None);
        let mut payload = opened_payload("acme/widgets", 42);
        payload["pull_request"]["body"] = json!("x".repeat(3 * 1024 * 1024));
        let body = serde_json::to_vec(&payload).unwrap();

        let response = build_router(app.state.clone())
            .oneshot(webhook_request("pull_request", &body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        app.state.dispatcher.wait_idle().await;
        assert_eq!(app.host.comments().len(), 1);
    }

    #[tokio::test]
    async fn test_other_events_are_acknowledged_and_ignored() {
        let app = TestApp::new(Some(SECRET));
        let body = serde_json::to_vec(&json!({"zen": "Keep it logically awesome."})).unwrap();

        let response = build_router(app.state.clone())
            .oneshot(webhook_request("ping", &body, Some(sign(SECRET, &body))))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await, json!({"status": "success"}));
        app.state.dispatcher.wait_idle().await;
        assert_eq!(app.completion.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_review_still_acknowledged() {
        let app = TestApp::new(None);
        app.completion.fail.store(true, Ordering::SeqCst);
        let body = serde_json::to_vec(&opened_payload("acme/widgets", 42)).unwrap();

        let response = build_router(app.state.clone())
            .oneshot(webhook_request("pull_request", &body, None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        app.state.dispatcher.wait_idle().await;
        assert!(app.host.comments().is_empty());
        assert!(app.store.list_records().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_health_and_status_endpoints() {
        let app = TestApp::new(None);
        app.store
            .insert_record(&PullRequestId::new("acme/widgets", 7))
            .await
            .unwrap();

        let response = build_router(app.state.clone())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["service"], "reviewbot");

        let response = build_router(app.state.clone())
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["summary"]["processed_prs"], 1);
        assert_eq!(json["prs"][0]["repository_name"], "acme/widgets");
        assert_eq!(json["prs"][0]["pr_number"], 7);
    }

    #[tokio::test]
    async fn test_status_requires_bearer_token_when_configured() {
        let app = TestApp::with_status_token(None, Some("s3cret"));
        app.store
            .insert_record(&PullRequestId::new("acme/widgets", 7))
            .await
            .unwrap();

        let response = build_router(app.state.clone())
            .oneshot(Request::get("/status").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = build_router(app.state.clone())
            .oneshot(
                Request::get("/status")
                    .header("authorization", "Bearer wrong")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = build_router(app.state.clone())
            .oneshot(
                Request::get("/status")
                    .header("authorization", "Bearer s3cret")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = body_json(response).await;
        assert_eq!(json["prs"][0]["repository_name"], "acme/widgets");

        // Health stays public
        let response = build_router(app.state.clone())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
