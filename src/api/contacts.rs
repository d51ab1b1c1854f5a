//! `/api/contacts/`: contacts and bulk actions

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{AppState, IdsRequest, QueryMap, text_filter};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::storage::{ContactFilter, ContactListing, ContactPatch, NewContact};
use crate::templates::TemplateData;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/contacts/contacts/",
            get(list_contacts).post(create_contact),
        )
        .route("/api/contacts/contacts/bulk_delete/", post(bulk_delete))
        .route(
            "/api/contacts/contacts/bulk_send_template/",
            post(bulk_send_template),
        )
        .route(
            "/api/contacts/contacts/{id}/",
            get(retrieve_contact)
                .put(update_contact)
                .patch(update_contact)
                .delete(delete_contact),
        )
}

#[derive(Debug, Deserialize)]
struct CreateContact {
    account: String,
    phone_number: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    profile_picture_url: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct BulkTemplateRequest {
    #[serde(default)]
    ids: Vec<String>,
    template_data: Option<TemplateData>,
}

fn owned_listing(state: &AppState, id: &str, user_id: i64) -> ApiResult<ContactListing> {
    state
        .store
        .get_contact_listing(id, user_id)?
        .ok_or(ApiError::NotFound)
}

async fn list_contacts(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    query: QueryMap,
) -> ApiResult<Json<Vec<ContactListing>>> {
    let filter = ContactFilter {
        account: text_filter(&query, "account"),
        search: text_filter(&query, "search"),
    };
    Ok(Json(state.store.list_contacts(user.id, &filter)?))
}

async fn create_contact(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<CreateContact>,
) -> ApiResult<(StatusCode, Json<ContactListing>)> {
    let account = state
        .store
        .get_owned_account(&request.account, user.id)?
        .ok_or_else(|| ApiError::bad_request("Invalid account"))?;
    let phone_number = request.phone_number.trim().to_string();
    if phone_number.is_empty() {
        return Err(ApiError::bad_request("phone_number is required"));
    }

    let contact = state.store.insert_contact(NewContact {
        account_id: account.id,
        name: request
            .name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| phone_number.clone()),
        phone_number,
        profile_picture_url: request.profile_picture_url,
        metadata: request.metadata.unwrap_or_else(|| json!({})),
    })?;
    let listing = owned_listing(&state, &contact.id, user.id)?;
    Ok((StatusCode::CREATED, Json(listing)))
}

async fn retrieve_contact(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<ContactListing>> {
    Ok(Json(owned_listing(&state, &id, user.id)?))
}

async fn update_contact(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(patch): Json<ContactPatch>,
) -> ApiResult<Json<ContactListing>> {
    owned_listing(&state, &id, user.id)?;
    state.store.update_contact(&id, patch)?;
    Ok(Json(owned_listing(&state, &id, user.id)?))
}

async fn delete_contact(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    owned_listing(&state, &id, user.id)?;
    state.store.delete_contact(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn bulk_delete(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<IdsRequest>,
) -> ApiResult<Json<Value>> {
    if request.ids.is_empty() {
        return Err(ApiError::bad_request("No contact ids provided."));
    }

    let owner = (!user.is_superuser).then_some(user.id);
    let deleted = state.store.delete_contacts(&request.ids, owner)?;
    info!("User {} bulk-deleted {} contacts", user.username, deleted);
    Ok(Json(json!({ "deleted": deleted })))
}

async fn bulk_send_template(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<BulkTemplateRequest>,
) -> ApiResult<Json<Value>> {
    if request.ids.is_empty() {
        return Err(ApiError::bad_request("No contact ids provided."));
    }
    let data = request
        .template_data
        .ok_or_else(|| ApiError::bad_request("template_data is required"))?;
    data.validate().map_err(ApiError::BadRequest)?;

    let owner = (!user.is_superuser).then_some(user.id);
    let contacts = state.store.contacts_by_ids(&request.ids, owner)?;

    let mut success = 0;
    let mut failed = 0;
    let mut errors = Vec::new();
    for contact in &contacts {
        let result = state.notifications.send_template_to_contact(contact, &data);
        if result.success {
            success += 1;
        } else {
            failed += 1;
            errors.push(format!(
                "Error with contact {}: {}",
                contact.id,
                result.error.unwrap_or_default()
            ));
        }
    }

    info!(
        "Bulk template {} by {}: {} queued, {} failed",
        data.name, user.username, success, failed
    );
    Ok(Json(json!({
        "success": success,
        "failed": failed,
        "errors": errors,
    })))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::queue::Task;
    use crate::storage::test_support::{account, conversation};
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_contact_crud_and_search() {
        let app = app();
        let (ana, token) = app.login("ana");
        let acc = account(&app.state.store, Some(ana.id), "1001");

        let (status, created) = app
            .post(
                "/api/contacts/contacts/",
                &token,
                json!({"account": acc.id, "phone_number": "5215550001", "name": "María"}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", created);
        assert_eq!(created["account_name"], "Account 1001");
        assert_eq!(created["conversations_count"], 0);

        let (status, _) = app
            .post(
                "/api/contacts/contacts/",
                &token,
                json!({"account": acc.id, "phone_number": "5215550001"}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, unnamed) = app
            .post(
                "/api/contacts/contacts/",
                &token,
                json!({"account": acc.id, "phone_number": "5215550002"}),
            )
            .await;
        assert_eq!(unnamed["name"], "5215550002");

        let (_, found) = app.get("/api/contacts/contacts/?search=Mar", &token).await;
        assert_eq!(found.as_array().unwrap().len(), 1);
        let (_, all) = app.get("/api/contacts/contacts/", &token).await;
        assert_eq!(all[0]["phone_number"], "5215550002");

        let uri = format!("/api/contacts/contacts/{}/", created["id"].as_str().unwrap());
        let (status, patched) = app
            .request(Method::PATCH, &uri, Some(&token), Some(json!({"name": "Mari"})))
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["name"], "Mari");

        let (_, luis_token) = app.login("luis");
        let (status, _) = app.get(&uri, &luis_token).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = app.request(Method::DELETE, &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_bulk_delete_scoping() {
        let app = app();
        let (ana, ana_token) = app.login("ana");
        let (luis, luis_token) = app.login("luis");
        let acc = account(&app.state.store, Some(ana.id), "1001");
        let (c1, _) = conversation(&app.state.store, &acc, "5215550001");
        let (c2, _) = conversation(&app.state.store, &acc, "5215550002");
        let ids = json!({"ids": [c1.id, c2.id]});

        let (status, _) = app
            .post("/api/contacts/contacts/bulk_delete/", &ana_token, json!({"ids": []}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (_, body) = app
            .post("/api/contacts/contacts/bulk_delete/", &luis_token, ids.clone())
            .await;
        assert_eq!(body, json!({"deleted": 0}));

        app.state.store.set_superuser(luis.id, true).unwrap();
        let (_, body) = app
            .post("/api/contacts/contacts/bulk_delete/", &luis_token, ids)
            .await;
        assert_eq!(body, json!({"deleted": 2}));
    }

    #[tokio::test]
    async fn test_bulk_send_template() {
        let mut app = app();
        let (ana, token) = app.login("ana");
        let acc = account(&app.state.store, Some(ana.id), "1001");
        let (c1, _) = conversation(&app.state.store, &acc, "5215550001");
        let (c2, _) = conversation(&app.state.store, &acc, "5215550002");

        let (status, _) = app
            .post(
                "/api/contacts/contacts/bulk_send_template/",
                &token,
                json!({"ids": [c1.id], "template_data": {"template_name": "", "template_language": "es"}}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, body) = app
            .post(
                "/api/contacts/contacts/bulk_send_template/",
                &token,
                json!({
                    "ids": [c1.id, c2.id, "missing"],
                    "template_data": {"template_name": "promo", "template_language": "es"}
                }),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"success": 2, "failed": 0, "errors": []}));

        let tasks = app.receiver.drain();
        assert_eq!(tasks.len(), 2);
        assert!(tasks.iter().all(|t| matches!(
            t,
            Task::SendTemplate { name, .. } if name == "promo"
        )));
    }
}
