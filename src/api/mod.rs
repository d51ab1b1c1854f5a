//! REST API, webhook endpoint and inbox WebSocket
//!
//! All routes live on one axum router:
//!
//! ```text
//! /api/auth/...          register, login, refresh, me
//! /api/config/...        accounts, templates, Meta webhook
//! /api/contacts/...      contacts, bulk actions
//! /api/chat/...          conversations, messages
//! /api/ai-bot/...        auto-responder configuration
//! /ws/chat/inbox/        inbox feed
//! /health                liveness
//! ```

mod accounts;
mod ai_config;
mod auth;
mod contacts;
mod conversations;
mod messages;
mod webhook;

use axum::{
    Router,
    body::Body,
    extract::Query,
    http::{HeaderValue, Request},
    middleware::{self, Next},
    response::Response,
    routing::get,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::services::ServeDir;
use tracing::{info, warn};

use crate::auth::AuthService;
use crate::config::CrmConfig;
use crate::error::ApiError;
use crate::media::MediaStore;
use crate::queue::TaskQueue;
use crate::realtime::{self, InboxHub};
use crate::storage::CrmStore;
use crate::templates::NotificationService;
use crate::whatsapp_api::WhatsAppApi;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<CrmConfig>,
    pub store: Arc<CrmStore>,
    pub auth: AuthService,
    pub queue: TaskQueue,
    pub hub: InboxHub,
    pub media: MediaStore,
    pub whatsapp: Arc<dyn WhatsAppApi>,
    pub notifications: NotificationService,
}

impl AppState {
    pub fn new(
        config: Arc<CrmConfig>,
        store: Arc<CrmStore>,
        queue: TaskQueue,
        hub: InboxHub,
        media: MediaStore,
        whatsapp: Arc<dyn WhatsAppApi>,
    ) -> Self {
        Self {
            auth: AuthService::new(store.clone(), &config),
            notifications: NotificationService::new(store.clone(), queue.clone(), hub.clone()),
            config,
            store,
            queue,
            hub,
            media,
            whatsapp,
        }
    }
}

/// Build the application router
pub fn router(state: AppState) -> Router {
    let media_route = format!("/{}", state.config.media_url.trim_matches('/'));
    let cors = cors_layer(&state.config.cors_allowed_origins);

    Router::new()
        .merge(auth::routes())
        .merge(accounts::routes())
        .merge(webhook::routes())
        .merge(contacts::routes())
        .merge(conversations::routes())
        .merge(messages::routes())
        .merge(ai_config::routes())
        .route("/ws/chat/inbox/", get(realtime::inbox_socket))
        .route("/health", get(health_check))
        .nest_service(&media_route, ServeDir::new(state.media.root()))
        .layer(middleware::from_fn(log_request))
        .layer(cors)
        .with_state(state)
}

/// Run the HTTP server until the listener fails
pub async fn run_server(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);

    if origins.iter().any(|o| o == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}

/// Health check endpoint
async fn health_check() -> &'static str {
    "OK"
}

/// Middleware to log all incoming HTTP requests
async fn log_request(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let uri = req.uri().clone();

    info!("🌐 HTTP {} {}", method, uri.path());

    let response = next.run(req).await;

    info!("📤 Response status: {}", response.status());

    response
}

// =============================================================================
// Shared request helpers
// =============================================================================

/// Query parameters as a lenient map, so bad filter values can be reported as 400
pub(crate) type QueryMap = Query<std::collections::HashMap<String, String>>;

/// Parse an optional filter value
pub(crate) fn parse_filter<T: std::str::FromStr>(
    query: &std::collections::HashMap<String, String>,
    name: &str,
) -> Result<Option<T>, ApiError> {
    match query.get(name).map(|v| v.trim()).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ApiError::bad_request(format!("Invalid value for {}: {}", name, raw))),
    }
}

/// Non-empty string filter
pub(crate) fn text_filter(
    query: &std::collections::HashMap<String, String>,
    name: &str,
) -> Option<String> {
    query
        .get(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// `{"ids": [...]}` body of bulk endpoints
#[derive(Debug, Deserialize)]
pub(crate) struct IdsRequest {
    #[serde(default)]
    pub ids: Vec<String>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::queue::TaskReceiver;
    use crate::storage::{TokenKind, User};
    use crate::whatsapp_api::test_support::FakeWhatsApp;
    use axum::http::{Method, StatusCode, header};
    use serde_json::Value;
    use tower::ServiceExt;

    pub struct TestApp {
        pub state: AppState,
        pub receiver: TaskReceiver,
        pub whatsapp: FakeWhatsApp,
        pub _media_dir: tempfile::TempDir,
    }

    pub fn app_with(whatsapp: FakeWhatsApp) -> TestApp {
        let store = Arc::new(crate::storage::test_support::store());
        let media_dir = tempfile::tempdir().unwrap();
        let media = MediaStore::new(media_dir.path(), "/media/");
        let mut config = CrmConfig::with_encryption_key("unused");
        config.media_root = media_dir.path().to_path_buf();

        let (queue, receiver) = TaskQueue::new();
        let state = AppState::new(
            Arc::new(config),
            store,
            queue,
            InboxHub::new(),
            media,
            Arc::new(whatsapp.clone()),
        );

        TestApp {
            state,
            receiver,
            whatsapp,
            _media_dir: media_dir,
        }
    }

    pub fn app() -> TestApp {
        app_with(FakeWhatsApp::default())
    }

    impl TestApp {
        /// User with a live access token (skips password hashing)
        pub fn login(&self, username: &str) -> (User, String) {
            let user = crate::storage::test_support::user(&self.state.store, username);
            let token = format!("token-{}", username);
            self.state
                .store
                .insert_token(&token, user.id, TokenKind::Access, chrono::Duration::hours(1))
                .unwrap();
            (user, token)
        }

        pub async fn request(
            &self,
            method: Method,
            uri: &str,
            token: Option<&str>,
            body: Option<Value>,
        ) -> (StatusCode, Value) {
            let mut builder = Request::builder().method(method).uri(uri);
            if let Some(token) = token {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            let request = match body {
                Some(body) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };
            self.send(request).await
        }

        pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
            let response = router(self.state.clone()).oneshot(request).await.unwrap();
            let status = response.status();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let value = serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
            (status, value)
        }

        pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
            self.request(Method::GET, uri, Some(token), None).await
        }

        pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
            self.request(Method::POST, uri, Some(token), Some(body)).await
        }
    }
}
