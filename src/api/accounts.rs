//! `/api/config/`: WhatsApp Business accounts and message templates

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, warn};

use super::{AppState, QueryMap, parse_filter, text_filter};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::storage::{
    Account, AccountPatch, AccountStatus, NewAccount, NewTemplate, Template, TemplateCategory,
    TemplateFilter, TemplatePatch, TemplateStatus,
};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/config/accounts/",
            get(list_accounts).post(create_account),
        )
        .route(
            "/api/config/accounts/{id}/",
            get(retrieve_account)
                .put(update_account)
                .patch(update_account)
                .delete(delete_account),
        )
        .route(
            "/api/config/accounts/{id}/sync_templates/",
            post(sync_templates),
        )
        .route(
            "/api/config/templates/",
            get(list_templates).post(create_template),
        )
        .route(
            "/api/config/templates/{id}/",
            get(retrieve_template)
                .put(update_template)
                .patch(update_template)
                .delete(delete_template),
        )
}

// =============================================================================
// Accounts
// =============================================================================

fn account_json(account: &Account) -> Value {
    json!({
        "id": account.id,
        "name": account.name,
        "phone_number_id": account.phone_number_id,
        "business_account_id": account.business_account_id,
        "status": account.status,
        "has_access_token": !account.access_token.is_empty(),
        "has_webhook_token": !account.webhook_verify_token.is_empty(),
        "created_at": account.created_at,
        "updated_at": account.updated_at,
    })
}

#[derive(Debug, Deserialize)]
struct CreateAccount {
    name: String,
    phone_number_id: String,
    #[serde(default)]
    business_account_id: String,
    #[serde(default)]
    access_token: String,
    #[serde(default)]
    webhook_verify_token: String,
    #[serde(default)]
    status: Option<AccountStatus>,
}

fn owned_account(state: &AppState, id: &str, user_id: i64) -> ApiResult<Account> {
    state
        .store
        .get_owned_account(id, user_id)?
        .ok_or(ApiError::NotFound)
}

async fn list_accounts(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Vec<Value>>> {
    let accounts = state.store.list_accounts(user.id)?;
    Ok(Json(accounts.iter().map(account_json).collect()))
}

async fn create_account(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<CreateAccount>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if request.name.trim().is_empty() || request.phone_number_id.trim().is_empty() {
        return Err(ApiError::bad_request("name and phone_number_id are required"));
    }

    let account = state.store.insert_account(NewAccount {
        owner_id: Some(user.id),
        name: request.name.trim().to_string(),
        phone_number_id: request.phone_number_id.trim().to_string(),
        business_account_id: request.business_account_id.trim().to_string(),
        access_token: request.access_token,
        webhook_verify_token: request.webhook_verify_token,
        status: request.status.unwrap_or(AccountStatus::Active),
    })?;
    info!("Created account {} ({})", account.name, account.phone_number_id);
    Ok((StatusCode::CREATED, Json(account_json(&account))))
}

async fn retrieve_account(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let account = owned_account(&state, &id, user.id)?;
    Ok(Json(account_json(&account)))
}

async fn update_account(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(patch): Json<AccountPatch>,
) -> ApiResult<Json<Value>> {
    owned_account(&state, &id, user.id)?;
    let account = state
        .store
        .update_account(&id, patch)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(account_json(&account)))
}

async fn delete_account(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    owned_account(&state, &id, user.id)?;
    state.store.delete_account(&id)?;
    info!("Deleted account {}", id);
    Ok(StatusCode::NO_CONTENT)
}

/// Pull templates from Meta and upsert them locally
async fn sync_templates(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Response> {
    let account = owned_account(&state, &id, user.id)?;

    if account.business_account_id.is_empty() || account.access_token.is_empty() {
        return Ok((
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "message": "Account is missing business_account_id or access_token",
            })),
        )
            .into_response());
    }

    let remote = match state
        .whatsapp
        .list_templates(&account.business_account_id, &account.access_token)
        .await
    {
        Ok(templates) => templates,
        Err(e) => {
            warn!("Template sync failed for account {}: {}", account.id, e);
            return Ok((
                StatusCode::BAD_GATEWAY,
                Json(json!({
                    "status": "error",
                    "message": "Failed to fetch templates from Meta",
                    "details": e.to_string(),
                })),
            )
                .into_response());
        }
    };

    let total = remote.len();
    let mut synced = 0;
    let mut updated = 0;
    for template in remote {
        let components = match template.components {
            Value::Null => json!([]),
            other => other,
        };
        let (_, created) = state.store.upsert_template(NewTemplate {
            account_id: account.id.clone(),
            name: template.name,
            language: template.language,
            category: template.category.parse().unwrap_or(TemplateCategory::Utility),
            status: template.status.parse().unwrap_or(TemplateStatus::Pending),
            components,
        })?;
        if created {
            synced += 1;
        } else {
            updated += 1;
        }
    }

    info!(
        "Synced templates for account {}: {} new, {} updated",
        account.id, synced, updated
    );
    Ok(Json(json!({
        "status": "success",
        "message": format!("Synced {} new templates, updated {}", synced, updated),
        "total_from_meta": total,
        "synced": synced,
        "updated": updated,
    }))
    .into_response())
}

// =============================================================================
// Templates
// =============================================================================

fn template_json(template: &Template, account_name: &str) -> Value {
    let mut value = json!(template);
    value["account_name"] = json!(account_name);
    value
}

#[derive(Debug, Deserialize)]
struct CreateTemplate {
    account: String,
    name: String,
    language: String,
    #[serde(default)]
    category: Option<TemplateCategory>,
    #[serde(default)]
    status: Option<TemplateStatus>,
    #[serde(default)]
    components: Option<Value>,
}

fn owned_template(state: &AppState, id: &str, user_id: i64) -> ApiResult<(Template, String)> {
    state
        .store
        .get_owned_template(id, user_id)?
        .ok_or(ApiError::NotFound)
}

async fn list_templates(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    query: QueryMap,
) -> ApiResult<Json<Vec<Value>>> {
    let filter = TemplateFilter {
        account: text_filter(&query, "account"),
        category: parse_filter(&query, "category")?,
        status: parse_filter(&query, "status")?,
        language: text_filter(&query, "language"),
    };
    let templates = state.store.list_templates(user.id, &filter)?;
    Ok(Json(
        templates
            .iter()
            .map(|(template, account_name)| template_json(template, account_name))
            .collect(),
    ))
}

async fn create_template(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<CreateTemplate>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account = state
        .store
        .get_owned_account(&request.account, user.id)?
        .ok_or_else(|| ApiError::bad_request("Invalid account"))?;
    if request.name.trim().is_empty() || request.language.trim().is_empty() {
        return Err(ApiError::bad_request("name and language are required"));
    }

    let template = state.store.insert_template(NewTemplate {
        account_id: account.id,
        name: request.name.trim().to_string(),
        language: request.language.trim().to_string(),
        category: request.category.unwrap_or(TemplateCategory::Utility),
        status: request.status.unwrap_or(TemplateStatus::Pending),
        components: request.components.unwrap_or_else(|| json!([])),
    })?;
    Ok((
        StatusCode::CREATED,
        Json(template_json(&template, &account.name)),
    ))
}

async fn retrieve_template(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let (template, account_name) = owned_template(&state, &id, user.id)?;
    Ok(Json(template_json(&template, &account_name)))
}

async fn update_template(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(patch): Json<TemplatePatch>,
) -> ApiResult<Json<Value>> {
    let (_, account_name) = owned_template(&state, &id, user.id)?;
    let template = state
        .store
        .update_template(&id, patch)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(template_json(&template, &account_name)))
}

async fn delete_template(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    owned_template(&state, &id, user.id)?;
    state.store.delete_template(&id)?;
    Ok(StatusCode::NO_CONTENT)
}
