//! Meta webhook endpoint, one URL per phone number id

use axum::{
    Json, Router,
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use super::AppState;
use crate::crypto::verify_meta_signature;
use crate::queue::Task;
use crate::types::VerifyParams;

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

pub(super) fn routes() -> Router<AppState> {
    Router::new().route(
        "/api/config/webhook/{phone_number_id}/",
        get(verify).post(handle_notification),
    )
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body.into(),
    )
        .into_response()
}

/// Subscription handshake (GET request from Meta)
async fn verify(
    State(state): State<AppState>,
    Path(phone_number_id): Path<String>,
    Query(params): Query<VerifyParams>,
) -> Response {
    info!(
        "📥 Received verification request for {}: mode={:?}",
        phone_number_id, params.mode
    );

    let account = match state.store.get_account_by_phone_number_id(&phone_number_id) {
        Ok(Some(account)) => account,
        Ok(None) => {
            warn!("Verification for unknown phone number id {}", phone_number_id);
            return plain(StatusCode::NOT_FOUND, "Not Found");
        }
        Err(e) => {
            error!("Failed to look up account {}: {}", phone_number_id, e);
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    };

    match (params.mode.as_deref(), params.verify_token.as_deref()) {
        (Some("subscribe"), Some(token)) => {
            if token == account.webhook_verify_token {
                info!("Webhook verification successful for {}", phone_number_id);
                plain(StatusCode::OK, params.challenge.unwrap_or_default())
            } else {
                warn!("Invalid verify token for {}", phone_number_id);
                plain(StatusCode::FORBIDDEN, "Forbidden")
            }
        }
        _ => plain(StatusCode::BAD_REQUEST, "Bad Request"),
    }
}

/// Event notification (POST request from Meta)
async fn handle_notification(
    State(state): State<AppState>,
    Path(phone_number_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    info!(
        "📥 Received webhook for {} ({} bytes)",
        phone_number_id,
        body.len()
    );

    match state.store.get_account_by_phone_number_id(&phone_number_id) {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!("Webhook for unknown phone number id {}", phone_number_id);
            return plain(StatusCode::NOT_FOUND, "Not Found");
        }
        Err(e) => {
            error!("Failed to look up account {}: {}", phone_number_id, e);
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
        }
    }

    if let Some(secret) = state.config.meta_app_secret.as_deref() {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !verify_meta_signature(secret, &body, signature) {
            warn!("Invalid webhook signature for {}", phone_number_id);
            return plain(StatusCode::FORBIDDEN, "Forbidden");
        }
    }

    if state.config.debug_mode {
        debug!("Webhook payload: {}", String::from_utf8_lossy(&body));
    }

    let payload: Value = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Invalid webhook JSON: {}", e);
            return plain(StatusCode::BAD_REQUEST, "Bad Request");
        }
    };

    match state.queue.enqueue(Task::ProcessWebhookPayload {
        payload,
        phone_number_id,
    }) {
        Ok(task_id) => {
            debug!("Queued webhook payload as {}", task_id);
            Json(json!({"status": "ok"})).into_response()
        }
        Err(e) => {
            error!("Failed to enqueue webhook payload: {}", e);
            plain(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::crypto::meta_signature;
    use crate::queue::Task;
    use crate::storage::test_support::account;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_verify_handshake() {
        let app = app();
        account(&app.state.store, None, "1001");

        let (status, body) = app
            .request(
                Method::GET,
                "/api/config/webhook/1001/?hub.mode=subscribe&hub.verify_token=verify-me&hub.challenge=12345",
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!(12345));

        let (status, body) = app
            .request(
                Method::GET,
                "/api/config/webhook/1001/?hub.mode=subscribe&hub.verify_token=nope&hub.challenge=1",
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body, "Forbidden");

        let (status, _) = app
            .request(Method::GET, "/api/config/webhook/1001/", None, None)
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .request(
                Method::GET,
                "/api/config/webhook/9999/?hub.mode=subscribe&hub.verify_token=verify-me",
                None,
                None,
            )
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Not Found");
    }

    #[tokio::test]
    async fn test_notification_enqueues_payload() {
        let mut app = app();
        account(&app.state.store, None, "1001");

        let payload = json!({"object": "whatsapp_business_account", "entry": []});
        let (status, body) = app
            .request(
                Method::POST,
                "/api/config/webhook/1001/",
                None,
                Some(payload.clone()),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"status": "ok"}));

        assert_eq!(
            app.receiver.drain(),
            vec![Task::ProcessWebhookPayload {
                payload,
                phone_number_id: "1001".into(),
            }]
        );
    }

    #[tokio::test]
    async fn test_notification_unknown_account() {
        let mut app = app();
        let (status, _) = app
            .request(Method::POST, "/api/config/webhook/404/", None, Some(json!({})))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(app.receiver.drain().is_empty());
    }

    #[tokio::test]
    async fn test_notification_signature_check() {
        let mut app = app();
        std::sync::Arc::get_mut(&mut app.state.config)
            .unwrap()
            .meta_app_secret = Some("app-secret".into());
        account(&app.state.store, None, "1001");

        let body = br#"{"entry":[]}"#;
        let unsigned = Request::builder()
            .method(Method::POST)
            .uri("/api/config/webhook/1001/")
            .header("x-hub-signature-256", "sha256=00")
            .body(Body::from(&body[..]))
            .unwrap();
        let (status, _) = app.send(unsigned).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(app.receiver.drain().is_empty());

        let signed = Request::builder()
            .method(Method::POST)
            .uri("/api/config/webhook/1001/")
            .header(
                "x-hub-signature-256",
                meta_signature("app-secret", body).unwrap(),
            )
            .body(Body::from(&body[..]))
            .unwrap();
        let (status, _) = app.send(signed).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(app.receiver.drain().len(), 1);
    }
}
