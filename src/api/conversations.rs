//! `/api/chat/conversations/`: inbox listing and conversation lifecycle

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{AppState, QueryMap, parse_filter, text_filter};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::realtime::{conversation_detail_json, conversation_json};
use crate::storage::{ConversationFilter, ConversationStatus};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/chat/conversations/",
            get(list_conversations).post(create_conversation),
        )
        .route(
            "/api/chat/conversations/{id}/",
            get(retrieve_conversation)
                .patch(update_conversation)
                .put(update_conversation)
                .delete(delete_conversation),
        )
}

#[derive(Debug, Deserialize)]
struct CreateConversation {
    contact: String,
    account: String,
}

#[derive(Debug, Deserialize)]
struct UpdateConversation {
    status: Option<ConversationStatus>,
}

fn detail(state: &AppState, id: &str, user_id: i64) -> ApiResult<Value> {
    state
        .store
        .get_owned_conversation(id, user_id)?
        .ok_or(ApiError::NotFound)?;
    let summary = state
        .store
        .conversation_summary(id)?
        .ok_or(ApiError::NotFound)?;
    Ok(conversation_detail_json(&summary, Utc::now()))
}

async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    query: QueryMap,
) -> ApiResult<Json<Vec<Value>>> {
    let filter = ConversationFilter {
        status: parse_filter(&query, "status")?,
        account: text_filter(&query, "account"),
        search: text_filter(&query, "search"),
    };
    let now = Utc::now();
    let summaries = state.store.list_conversation_summaries(user.id, &filter)?;
    Ok(Json(
        summaries
            .iter()
            .map(|summary| conversation_json(summary, now))
            .collect(),
    ))
}

async fn retrieve_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    Ok(Json(detail(&state, &id, user.id)?))
}

/// Open (or return the existing) conversation with a contact
async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<CreateConversation>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account = state
        .store
        .get_owned_account(&request.account, user.id)?
        .ok_or_else(|| ApiError::bad_request("Invalid account"))?;
    let contact = state
        .store
        .get_contact(&request.contact)?
        .filter(|contact| contact.account == account.id)
        .ok_or_else(|| ApiError::bad_request("Invalid contact"))?;

    let (conversation, created) = state
        .store
        .get_or_create_conversation(&account.id, &contact.id)?;
    if created {
        info!(
            "Opened conversation {} with {}",
            conversation.id, contact.phone_number
        );
    }

    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(detail(&state, &conversation.id, user.id)?)))
}

async fn update_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(request): Json<UpdateConversation>,
) -> ApiResult<Json<Value>> {
    state
        .store
        .get_owned_conversation(&id, user.id)?
        .ok_or(ApiError::NotFound)?;

    if let Some(status) = request.status {
        state.store.set_conversation_status(&id, status)?;
        if let Err(e) = state.hub.notify_conversation(&state.store, &id) {
            warn!("Failed to push conversation update: {}", e);
        }
    }
    Ok(Json(detail(&state, &id, user.id)?))
}

/// Delete a conversation, its messages and their media files
async fn delete_conversation(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    state
        .store
        .get_owned_conversation(&id, user.id)?
        .ok_or(ApiError::NotFound)?;

    let mut deleted_files = 0;
    for url in state.store.media_urls_for_conversation(&id)? {
        if state.media.remove_url(&url).await {
            deleted_files += 1;
        }
    }
    state.store.delete_conversation(&id)?;

    info!(
        "Deleted conversation {} ({} media files)",
        id, deleted_files
    );
    Ok(Json(json!({
        "status": "deleted",
        "conversation_id": id,
        "deleted_files": deleted_files,
    })))
}
