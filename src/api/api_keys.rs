use axum::{
    Json,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::Deserialize;
use std::sync::Arc;

use super::auth::CurrentUser;
use super::validation::payload;
use super::{ApiError, ApiResponse, AppState, MessageResponse};
use crate::db::ActivityEntry;
use crate::services::{ApiKeySummary, ClientInfo, CreatedApiKey};

#[derive(Deserialize)]
pub struct CreateApiKeyRequest {
    pub name: String,
    pub expires_in_days: Option<u32>,
}

/// GET /auth/api-keys
pub async fn list_api_keys(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> Result<Json<ApiResponse<Vec<ApiKeySummary>>>, ApiError> {
    let keys = state.api_keys.list(&current.user.id).await?;
    Ok(Json(ApiResponse::success(keys)))
}

/// POST /auth/api-keys
/// The plaintext key is only ever returned here.
pub async fn create_api_key(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
    body: Result<Json<CreateApiKeyRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<CreatedApiKey>>), ApiError> {
    let input = payload(body)?;
    let created = state
        .api_keys
        .create(&current.user.id, &input.name, input.expires_in_days)
        .await?;

    state
        .store
        .activity()
        .record(ActivityEntry {
            user_id: Some(current.user.id.clone()),
            action: "api_key.create",
            description: format!("Created API key {}", created.name),
            ip: Some(client.ip),
            is_admin: current.user.is_admin,
            metadata: Some(serde_json::json!({
                "key_id": created.id,
                "key_prefix": created.key_prefix,
            })),
        })
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(created))))
}

/// DELETE /auth/api-keys/{id}
pub async fn delete_api_key(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
    Path(key_id): Path<String>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    state.api_keys.delete(&current.user.id, &key_id).await?;

    state
        .store
        .activity()
        .record(ActivityEntry {
            user_id: Some(current.user.id.clone()),
            action: "api_key.delete",
            description: "Deleted API key".to_string(),
            ip: Some(client.ip),
            is_admin: current.user.is_admin,
            metadata: Some(serde_json::json!({ "key_id": key_id })),
        })
        .await?;

    Ok(Json(ApiResponse::success(MessageResponse::new("API key deleted"))))
}
