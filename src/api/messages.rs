//! `/api/chat/messages/`: message history and the outbound send actions

use axum::{
    Json, Router,
    extract::{DefaultBodyLimit, Multipart, Path, State},
    http::{StatusCode, Uri},
    routing::{get, post},
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::{AppState, QueryMap, parse_filter, text_filter};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::media::{MAX_UPLOAD_SIZE, mime_for_filename};
use crate::queue::Task;
use crate::realtime::message_json;
use crate::storage::{Conversation, Message, MessageType, NewMessage, User};
use crate::templates::TemplateData;

const DEFAULT_PAGE_SIZE: u32 = 50;
const MAX_PAGE_SIZE: u32 = 100;
const MAX_TEXT_CHARS: usize = 4096;
const LOCAL_ID_PREFIX: &str = "local_";

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/api/chat/messages/", get(list_messages))
        .route("/api/chat/messages/by_conversation/", get(by_conversation))
        .route(
            "/api/chat/messages/upload_media/",
            post(upload_media).layer(DefaultBodyLimit::max(MAX_UPLOAD_SIZE + 64 * 1024)),
        )
        .route(
            "/api/chat/messages/{id}/",
            get(retrieve_message).delete(delete_message),
        )
        .route("/api/chat/messages/{id}/send_text/", post(send_text))
        .route("/api/chat/messages/{id}/mark_as_read/", post(mark_as_read))
        .route("/api/chat/messages/{id}/send_template/", post(send_template))
        .route("/api/chat/messages/{id}/send_media/", post(send_media))
}

// =============================================================================
// Listing
// =============================================================================

/// Link to another page of the same listing, relative to this server
fn page_link(uri: &Uri, query: &HashMap<String, String>, page: u32) -> ApiResult<String> {
    let mut params: Vec<(&str, String)> = query
        .iter()
        .filter(|(key, _)| key.as_str() != "page")
        .map(|(key, value)| (key.as_str(), value.clone()))
        .collect();
    params.sort();
    params.push(("page", page.to_string()));

    let query_string = serde_urlencoded::to_string(&params)
        .map_err(|e| ApiError::Internal(format!("failed to encode page link: {}", e)))?;
    Ok(format!("{}?{}", uri.path(), query_string))
}

fn paginated(
    state: &AppState,
    user: &User,
    uri: &Uri,
    query: &HashMap<String, String>,
    conversation_id: Option<&str>,
) -> ApiResult<Value> {
    let page: u32 = parse_filter(query, "page")?.unwrap_or(1);
    if page == 0 {
        return Err(ApiError::bad_request("Invalid page."));
    }
    let page_size = parse_filter::<u32>(query, "page_size")?
        .unwrap_or(DEFAULT_PAGE_SIZE)
        .clamp(1, MAX_PAGE_SIZE);

    let (messages, count) =
        state
            .store
            .list_messages(user.id, conversation_id, page, page_size)?;

    let last_page = (count.max(1) as u64).div_ceil(u64::from(page_size));
    if u64::from(page) > last_page {
        return Err(ApiError::NotFound);
    }

    let next = (u64::from(page) < last_page)
        .then(|| page_link(uri, query, page + 1))
        .transpose()?;
    let previous = (page > 1)
        .then(|| page_link(uri, query, page - 1))
        .transpose()?;
    Ok(json!({
        "count": count,
        "next": next,
        "previous": previous,
        "results": messages.iter().map(message_json).collect::<Vec<_>>(),
    }))
}

async fn list_messages(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    uri: Uri,
    query: QueryMap,
) -> ApiResult<Json<Value>> {
    let conversation = text_filter(&query, "conversation");
    Ok(Json(paginated(
        &state,
        &user,
        &uri,
        &query,
        conversation.as_deref(),
    )?))
}

async fn by_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    uri: Uri,
    query: QueryMap,
) -> ApiResult<Json<Value>> {
    let conversation = text_filter(&query, "conversation")
        .ok_or_else(|| ApiError::bad_request("conversation parameter is required"))?;
    Ok(Json(paginated(
        &state,
        &user,
        &uri,
        &query,
        Some(&conversation),
    )?))
}

async fn retrieve_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let message = state
        .store
        .get_owned_message(&id, user.id)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(message_json(&message)))
}

async fn delete_message(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    state
        .store
        .get_owned_message(&id, user.id)?
        .ok_or(ApiError::NotFound)?;
    state.store.delete_message(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

// =============================================================================
// Send actions (path id is a conversation id)
// =============================================================================

#[derive(Debug, Deserialize)]
struct SendTextRequest {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct SendMediaRequest {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    media_url: Option<String>,
    #[serde(default)]
    caption: Option<String>,
}

fn owned_conversation(state: &AppState, id: &str, user_id: i64) -> ApiResult<Conversation> {
    state
        .store
        .get_owned_conversation(id, user_id)?
        .ok_or(ApiError::NotFound)
}

/// Store an outgoing message, push it to the inbox and hand it to the send worker
fn store_and_queue(
    state: &AppState,
    conversation: &Conversation,
    new: NewMessage,
) -> ApiResult<Message> {
    let message = state
        .store
        .insert_message(new)?
        .ok_or_else(|| ApiError::Internal("duplicate local message id".to_string()))?;

    state
        .store
        .touch_conversation(&conversation.id, Utc::now())?;
    state.hub.notify_message_activity(&state.store, &message);
    state.queue.enqueue(Task::SendMessage {
        message_id: message.id.clone(),
    })?;

    debug!(
        "Queued {} message {} in conversation {}",
        message.message_type, message.id, conversation.id
    );
    Ok(message)
}

async fn send_text(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(request): Json<SendTextRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let length = request.message.chars().count();
    if request.message.trim().is_empty() || length > MAX_TEXT_CHARS {
        return Err(ApiError::bad_request(format!(
            "message must be between 1 and {} characters",
            MAX_TEXT_CHARS
        )));
    }
    let conversation = owned_conversation(&state, &id, user.id)?;

    let new = NewMessage::outgoing(
        &conversation.id,
        LOCAL_ID_PREFIX,
        MessageType::Text,
        Some(request.message),
    );
    let message = store_and_queue(&state, &conversation, new)?;
    Ok((StatusCode::CREATED, Json(message_json(&message))))
}

async fn mark_as_read(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let conversation = owned_conversation(&state, &id, user.id)?;
    let updated = state.store.mark_conversation_read(&conversation.id)?;
    if updated > 0
        && let Err(e) = state.hub.notify_conversation(&state.store, &conversation.id)
    {
        warn!("Failed to push conversation update: {}", e);
    }
    Ok(Json(json!({ "marked_as_read": updated })))
}

async fn send_template(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(data): Json<TemplateData>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    data.validate().map_err(ApiError::BadRequest)?;
    let conversation = owned_conversation(&state, &id, user.id)?;
    let contact = state
        .store
        .get_contact(&conversation.contact_id)?
        .ok_or(ApiError::NotFound)?;

    let result = state.notifications.send_template_to_contact(&contact, &data);
    match result.message {
        Some(message) if result.success => {
            Ok((StatusCode::CREATED, Json(message_json(&message))))
        }
        _ => Err(ApiError::Internal(
            result
                .error
                .unwrap_or_else(|| "template send failed".to_string()),
        )),
    }
}

async fn send_media(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(request): Json<SendMediaRequest>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let (Some(media_type), Some(media_url)) = (
        request.media_type.filter(|t| !t.is_empty()),
        request.media_url.filter(|u| !u.is_empty()),
    ) else {
        return Err(ApiError::bad_request(
            "media_type and media_url are required",
        ));
    };
    let message_type: MessageType = media_type
        .parse()
        .ok()
        .filter(MessageType::is_media)
        .ok_or_else(|| ApiError::bad_request(format!("Unsupported media_type: {}", media_type)))?;
    let conversation = owned_conversation(&state, &id, user.id)?;

    let caption = request.caption.unwrap_or_default();
    let mut metadata = json!({ "caption": caption });
    if matches!(message_type, MessageType::Audio | MessageType::Video) {
        metadata["duration"] = json!(state.media.media_duration(&media_url).await);
    }

    let mut new = NewMessage::outgoing(
        &conversation.id,
        LOCAL_ID_PREFIX,
        message_type,
        Some(caption).filter(|c| !c.is_empty()),
    );
    new.media_url = Some(media_url);
    new.metadata = metadata;

    let message = store_and_queue(&state, &conversation, new)?;
    Ok((StatusCode::CREATED, Json(message_json(&message))))
}

/// Multipart upload of a file to attach to a later `send_media`
async fn upload_media(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    mut multipart: Multipart,
) -> ApiResult<Json<Value>> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }

        let original_name = field.file_name().unwrap_or("upload").to_string();
        let mime_type = field
            .content_type()
            .map(str::to_string)
            .unwrap_or_else(|| mime_for_filename(&original_name).to_string());
        let data = field
            .bytes()
            .await
            .map_err(|e| ApiError::bad_request(e.to_string()))?;

        let saved = state.media.save_upload(&original_name, &data).await?;
        info!(
            "📎 {} uploaded {} ({} bytes) as {}",
            user.username,
            original_name,
            data.len(),
            saved.url
        );
        return Ok(Json(json!({
            "url": saved.url,
            "filename": saved.filename,
            "mime_type": mime_type,
        })));
    }

    Err(ApiError::bad_request("No file provided"))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::queue::Task;
    use crate::storage::test_support::{account, conversation, incoming_text};
    use crate::storage::{Conversation, DeliveryStatus};
    use crate::types::WsEvent;
    use axum::body::Body;
    use axum::http::{Method, Request, StatusCode, header};
    use serde_json::json;

    fn seeded(app: &TestApp) -> (String, Conversation) {
        let (ana, token) = app.login("ana");
        let acc = account(&app.state.store, Some(ana.id), "1001");
        let (_, conv) = conversation(&app.state.store, &acc, "5215550001");
        (token, conv)
    }

    #[tokio::test]
    async fn test_send_text_queues_and_pushes() {
        let mut app = app();
        let (token, conv) = seeded(&app);
        let mut feed = app.state.hub.subscribe();

        let uri = format!("/api/chat/messages/{}/send_text/", conv.id);
        let (status, body) = app.post(&uri, &token, json!({"message": "Hola"})).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["body"], "Hola");
        assert_eq!(body["is_from_me"], true);
        assert_eq!(body["delivery_status"], "sent");

        let stored = app
            .state
            .store
            .get_message(body["id"].as_str().unwrap())
            .unwrap()
            .unwrap();
        assert!(stored.whatsapp_id.starts_with("local_"));
        assert!(
            app.state
                .store
                .get_conversation(&conv.id)
                .unwrap()
                .unwrap()
                .last_message_at
                .is_some()
        );
        assert_eq!(
            app.receiver.drain(),
            vec![Task::SendMessage {
                message_id: stored.id
            }]
        );
        assert!(matches!(
            feed.try_recv().map(|e| e.event),
            Ok(WsEvent::NewMessage { .. })
        ));
        match feed.try_recv().map(|e| e.event) {
            Ok(WsEvent::ConversationUpdate { conversation }) => {
                assert_eq!(conversation["id"], conv.id.as_str());
                assert_eq!(conversation["last_message"], "Hola");
            }
            other => panic!("expected conversation update, got {:?}", other),
        }

        let (status, _) = app.post(&uri, &token, json!({"message": ""})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = app
            .post(&uri, &token, json!({"message": "a".repeat(4097)}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, luis_token) = app.login("luis");
        let (status, _) = app.post(&uri, &luis_token, json!({"message": "x"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_pagination() {
        let app = app();
        let (token, conv) = seeded(&app);
        for i in 0..5 {
            app.state
                .store
                .insert_message(incoming_text(&conv.id, &format!("wamid.{}", i), "hola"))
                .unwrap();
        }

        let (status, page) = app
            .get(
                &format!("/api/chat/messages/?conversation={}&page_size=2", conv.id),
                &token,
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(page["count"], 5);
        assert_eq!(page["results"].as_array().unwrap().len(), 2);
        assert_eq!(page["previous"], serde_json::Value::Null);
        assert_eq!(
            page["next"],
            format!(
                "/api/chat/messages/?conversation={}&page_size=2&page=2",
                conv.id
            )
        );

        let (_, last) = app
            .get("/api/chat/messages/?page_size=2&page=3", &token)
            .await;
        assert_eq!(last["results"].as_array().unwrap().len(), 1);
        assert_eq!(last["next"], serde_json::Value::Null);
        assert_eq!(last["previous"], "/api/chat/messages/?page_size=2&page=2");

        let (_, tagged) = app
            .get("/api/chat/messages/?page_size=2&tag=a%26b+c", &token)
            .await;
        assert_eq!(
            tagged["next"],
            "/api/chat/messages/?page_size=2&tag=a%26b+c&page=2"
        );

        let (status, _) = app
            .get("/api/chat/messages/?page_size=2&page=9", &token)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, body) = app.get("/api/chat/messages/by_conversation/", &token).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "conversation parameter is required");

        let (_, by_conv) = app
            .get(
                &format!("/api/chat/messages/by_conversation/?conversation={}", conv.id),
                &token,
            )
            .await;
        assert_eq!(by_conv["count"], 5);
        assert_eq!(by_conv["results"][0]["is_from_me"], false);
    }

    #[tokio::test]
    async fn test_mark_as_read() {
        let app = app();
        let (token, conv) = seeded(&app);
        let message = app
            .state
            .store
            .insert_message(incoming_text(&conv.id, "wamid.1", "hola"))
            .unwrap()
            .unwrap();

        let uri = format!("/api/chat/messages/{}/mark_as_read/", conv.id);
        let (_, body) = app.post(&uri, &token, json!({})).await;
        assert_eq!(body, json!({"marked_as_read": 1}));
        let (_, body) = app.post(&uri, &token, json!({})).await;
        assert_eq!(body, json!({"marked_as_read": 0}));

        let stored = app.state.store.get_message(&message.id).unwrap().unwrap();
        assert_eq!(stored.delivery_status, DeliveryStatus::Read);
    }

    #[tokio::test]
    async fn test_send_template() {
        let mut app = app();
        let (token, conv) = seeded(&app);

        let uri = format!("/api/chat/messages/{}/send_template/", conv.id);
        let (status, body) = app
            .post(
                &uri,
                &token,
                json!({"template_name": "bienvenida", "template_language": "es"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["message_type"], "template");
        assert_eq!(body["body"], "[Template: bienvenida]");
        assert_eq!(body["metadata"]["template_language"], "es");
        assert!(matches!(
            app.receiver.drain().as_slice(),
            [Task::SendTemplate { name, .. }] if name == "bienvenida"
        ));

        let (status, _) = app
            .post(&uri, &token, json!({"template_name": "x", "template_language": ""}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_send_media() {
        let mut app = app();
        let (token, conv) = seeded(&app);
        let uri = format!("/api/chat/messages/{}/send_media/", conv.id);

        let (status, body) = app.post(&uri, &token, json!({"media_type": "image"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "media_type and media_url are required");

        let (status, _) = app
            .post(
                &uri,
                &token,
                json!({"media_type": "template", "media_url": "/media/x"}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .post(
                &uri,
                &token,
                json!({
                    "media_type": "audio",
                    "media_url": "/media/whatsapp/uploads/missing.webm",
                    "caption": "nota de voz"
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        assert_eq!(body["message_type"], "audio");
        assert_eq!(body["media_url"], "/media/whatsapp/uploads/missing.webm");
        assert_eq!(body["metadata"]["caption"], "nota de voz");
        assert_eq!(body["metadata"]["duration"], 0.0);
        assert_eq!(app.receiver.drain().len(), 1);
    }

    #[tokio::test]
    async fn test_upload_media() {
        let app = app();
        let (_, token) = app.login("ana");

        let boundary = "XBOUNDARYX";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"foto.PNG\"\r\n\
             Content-Type: image/png\r\n\r\npngdata\r\n--{b}--\r\n",
            b = boundary
        );
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/chat/messages/upload_media/")
            .header(header::AUTHORIZATION, format!("Bearer {}", token))
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={}", boundary),
            )
            .body(Body::from(body))
            .unwrap();

        let (status, body) = app.send(request).await;
        assert_eq!(status, StatusCode::OK, "{}", body);
        assert_eq!(body["mime_type"], "image/png");
        let url = body["url"].as_str().unwrap();
        assert!(url.starts_with("/media/whatsapp/uploads/"));
        assert!(url.ends_with(".png"));

        let (status, served) = app.request(Method::GET, url, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(served, "pngdata");
    }
}
