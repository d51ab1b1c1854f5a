//! `/api/ai-bot/`: auto-responder configuration per account

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::info;

use super::{AppState, QueryMap, parse_filter, text_filter};
use crate::ai::{ProviderInfo, providers};
use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::storage::{AiConfig, AiConfigFilter, AiConfigPatch, AiProviderKind, NewAiConfig};

const DEFAULT_MAX_HISTORY: u32 = 10;

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route(
            "/api/ai-bot/config/",
            get(list_configs).post(create_config),
        )
        .route("/api/ai-bot/config/providers/", get(list_providers))
        .route(
            "/api/ai-bot/config/{id}/",
            get(retrieve_config)
                .put(update_config)
                .patch(update_config)
                .delete(delete_config),
        )
}

fn config_json(config: &AiConfig, account_name: &str) -> Value {
    json!({
        "id": config.id,
        "account": config.account_id,
        "account_name": account_name,
        "enabled": config.enabled,
        "provider": config.provider,
        "system_prompt": config.system_prompt,
        "max_history_messages": config.max_history_messages,
        "has_api_key": !config.api_key.is_empty(),
        "created_at": config.created_at,
        "updated_at": config.updated_at,
    })
}

#[derive(Debug, Deserialize)]
struct CreateConfig {
    account: String,
    api_key: String,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    provider: Option<AiProviderKind>,
    #[serde(default)]
    system_prompt: String,
    #[serde(default)]
    max_history_messages: Option<u32>,
}

fn owned_config(state: &AppState, id: &str, user_id: i64) -> ApiResult<(AiConfig, String)> {
    state
        .store
        .get_owned_ai_config(id, user_id)?
        .ok_or(ApiError::NotFound)
}

async fn list_providers(AuthUser(_): AuthUser) -> Json<Vec<ProviderInfo>> {
    Json(providers())
}

async fn list_configs(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    query: QueryMap,
) -> ApiResult<Json<Vec<Value>>> {
    let filter = AiConfigFilter {
        account: text_filter(&query, "account"),
        enabled: parse_filter(&query, "enabled")?,
        provider: parse_filter(&query, "provider")?,
    };
    let configs = state.store.list_ai_configs(user.id, &filter)?;
    Ok(Json(
        configs
            .iter()
            .map(|(config, account_name)| config_json(config, account_name))
            .collect(),
    ))
}

async fn create_config(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Json(request): Json<CreateConfig>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let account = state
        .store
        .get_owned_account(&request.account, user.id)?
        .ok_or_else(|| ApiError::bad_request("Invalid account"))?;
    if request.api_key.trim().is_empty() {
        return Err(ApiError::bad_request("api_key is required"));
    }
    if state.store.get_ai_config_for_account(&account.id)?.is_some() {
        return Err(ApiError::bad_request(
            "This account already has an AI configuration",
        ));
    }

    let config = state.store.insert_ai_config(NewAiConfig {
        account_id: account.id,
        enabled: request.enabled,
        provider: request.provider.unwrap_or(AiProviderKind::Gemini),
        api_key: request.api_key.trim().to_string(),
        system_prompt: request.system_prompt,
        max_history_messages: request.max_history_messages.unwrap_or(DEFAULT_MAX_HISTORY),
    })?;
    info!(
        "AI config {} created for account {} (enabled: {})",
        config.id, account.name, config.enabled
    );
    Ok((
        StatusCode::CREATED,
        Json(config_json(&config, &account.name)),
    ))
}

async fn retrieve_config(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let (config, account_name) = owned_config(&state, &id, user.id)?;
    Ok(Json(config_json(&config, &account_name)))
}

async fn update_config(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
    Json(patch): Json<AiConfigPatch>,
) -> ApiResult<Json<Value>> {
    let (_, mut account_name) = owned_config(&state, &id, user.id)?;

    if let Some(account_id) = &patch.account {
        let account = state
            .store
            .get_owned_account(account_id, user.id)?
            .ok_or_else(|| ApiError::bad_request("Invalid account"))?;
        account_name = account.name;
    }

    let config = state
        .store
        .update_ai_config(&id, patch)?
        .ok_or(ApiError::NotFound)?;
    Ok(Json(config_json(&config, &account_name)))
}

async fn delete_config(
    State(state): State<AppState>,
    AuthUser(user): AuthUser,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    owned_config(&state, &id, user.id)?;
    state.store.delete_ai_config(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::storage::test_support::account;
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    #[tokio::test]
    async fn test_api_key_is_write_only() {
        let app = app();
        let (ana, token) = app.login("ana");
        let acc = account(&app.state.store, Some(ana.id), "1001");

        let (status, created) = app
            .post(
                "/api/ai-bot/config/",
                &token,
                json!({"account": acc.id, "api_key": "AIza-secret", "enabled": true}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", created);
        assert!(created.get("api_key").is_none());
        assert_eq!(created["has_api_key"], true);
        assert_eq!(created["provider"], "gemini");
        assert_eq!(created["max_history_messages"], 10);
        assert_eq!(created["account_name"], "Account 1001");

        let stored = app
            .state
            .store
            .get_ai_config_for_account(&acc.id)
            .unwrap()
            .unwrap();
        assert_eq!(stored.api_key, "AIza-secret");

        let (status, _) = app
            .post(
                "/api/ai-bot/config/",
                &token,
                json!({"account": acc.id, "api_key": "other"}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_filters_update_and_scope() {
        let app = app();
        let (ana, token) = app.login("ana");
        let acc = account(&app.state.store, Some(ana.id), "1001");
        let (_, created) = app
            .post(
                "/api/ai-bot/config/",
                &token,
                json!({"account": acc.id, "api_key": "k"}),
            )
            .await;
        let uri = format!("/api/ai-bot/config/{}/", created["id"].as_str().unwrap());

        let (_, enabled) = app.get("/api/ai-bot/config/?enabled=true", &token).await;
        assert_eq!(enabled, json!([]));
        let (status, _) = app.get("/api/ai-bot/config/?provider=openai", &token).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, patched) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&token),
                Some(json!({"enabled": true, "system_prompt": "Eres amable"})),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(patched["enabled"], true);
        assert_eq!(patched["system_prompt"], "Eres amable");

        let (_, enabled) = app.get("/api/ai-bot/config/?enabled=true", &token).await;
        assert_eq!(enabled.as_array().unwrap().len(), 1);

        let (luis, luis_token) = app.login("luis");
        let (status, _) = app.get(&uri, &luis_token).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let foreign = account(&app.state.store, Some(luis.id), "2002");
        let (status, _) = app
            .request(
                Method::PATCH,
                &uri,
                Some(&token),
                Some(json!({"account": foreign.id})),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = app.request(Method::DELETE, &uri, Some(&token), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn test_providers() {
        let app = app();
        let (_, token) = app.login("ana");
        let (status, body) = app.get("/api/ai-bot/config/providers/", &token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!([{"id": "gemini", "name": "Google Gemini"}]));
    }
}
