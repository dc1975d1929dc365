use axum::{
    Json,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::auth::CurrentUser;
use super::validation::{payload, validate_ip, validate_limit};
use super::{ApiError, ApiResponse, AppState, MessageResponse, NodeDto};
use crate::db::ActivityEntry;
use crate::entities::{activity_logs, ip_bans};
use crate::services::nodes::generate_pairing_code;
use crate::services::{ClientInfo, NodeRegistration};

// ============================================================================
// Nodes
// ============================================================================

#[derive(Deserialize)]
pub struct CreateNodeRequest {
    pub name: String,
    pub fqdn: String,
    pub port: u16,
    #[serde(default = "default_scheme")]
    pub scheme: String,
}

fn default_scheme() -> String {
    "https".to_string()
}

#[derive(Deserialize, Default)]
pub struct PairNodeRequest {
    /// Code the admin reads to the agent operator. Generated when omitted.
    pub code: Option<String>,
}

#[derive(Serialize)]
pub struct PairNodeResponse {
    pub node: NodeDto,
    pub code: String,
}

/// GET /admin/nodes
pub async fn list_nodes(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<NodeDto>>>, ApiError> {
    let nodes = state.nodes.list().await?;
    Ok(Json(ApiResponse::success(
        nodes.into_iter().map(NodeDto::from).collect(),
    )))
}

/// POST /admin/nodes
pub async fn create_node(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    body: Result<Json<CreateNodeRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<NodeDto>>), ApiError> {
    let input = payload(body)?;
    let node = state
        .nodes
        .create(
            NodeRegistration {
                name: input.name,
                fqdn: input.fqdn,
                port: input.port,
                scheme: input.scheme,
            },
            &current.user.id,
        )
        .await?;

    Ok((StatusCode::CREATED, Json(ApiResponse::success(node.into()))))
}

/// POST /admin/nodes/{id}/pair
pub async fn pair_node(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(node_id): Path<String>,
    body: Result<Json<PairNodeRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<PairNodeResponse>>, ApiError> {
    let request = match body {
        Ok(Json(request)) => request,
        Err(JsonRejection::MissingJsonContentType(_)) => PairNodeRequest::default(),
        Err(rejection) => return Err(ApiError::validation(rejection.body_text())),
    };
    let code = match request.code {
        Some(code) if !code.trim().is_empty() => code.trim().to_uppercase(),
        _ => generate_pairing_code(),
    };

    let node = state.nodes.pair(&node_id, &code, &current.user.id).await?;

    Ok(Json(ApiResponse::success(PairNodeResponse {
        node: node.into(),
        code,
    })))
}

// ============================================================================
// IP bans
// ============================================================================

#[derive(Deserialize)]
pub struct CreateIpBanRequest {
    pub ip: String,
    pub reason: Option<String>,
}

/// GET /admin/ip-bans
pub async fn list_ip_bans(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ApiResponse<Vec<ip_bans::Model>>>, ApiError> {
    let bans = state.store.ips().list_bans().await?;
    Ok(Json(ApiResponse::success(bans)))
}

/// POST /admin/ip-bans
pub async fn create_ip_ban(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
    body: Result<Json<CreateIpBanRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<ip_bans::Model>>), ApiError> {
    let input = payload(body)?;
    let ip = validate_ip(&input.ip)?;

    let ban = state
        .store
        .ips()
        .create_ban(&ip, input.reason, Some(current.user.id.clone()))
        .await?
        .ok_or_else(|| ApiError::Conflict(format!("{ip} is already banned")))?;

    state
        .store
        .activity()
        .record(ActivityEntry {
            user_id: Some(current.user.id),
            action: "admin.ip_ban",
            description: format!("Banned IP {ip}"),
            ip: Some(client.ip),
            is_admin: true,
            metadata: Some(serde_json::json!({ "ban_id": ban.id })),
        })
        .await?;

    info!(event = "ip_banned", ip = %ip, "IP address banned");
    Ok((StatusCode::CREATED, Json(ApiResponse::success(ban))))
}

/// DELETE /admin/ip-bans/{id}
pub async fn delete_ip_ban(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
    Path(ban_id): Path<String>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let ban = state
        .store
        .ips()
        .delete_ban(&ban_id)
        .await?
        .ok_or_else(|| ApiError::not_found("IP ban not found"))?;

    state
        .store
        .activity()
        .record(ActivityEntry {
            user_id: Some(current.user.id),
            action: "admin.ip_unban",
            description: format!("Unbanned IP {}", ban.ip),
            ip: Some(client.ip),
            is_admin: true,
            metadata: Some(serde_json::json!({ "ban_id": ban.id })),
        })
        .await?;

    Ok(Json(ApiResponse::success(MessageResponse::new("IP ban removed"))))
}

// ============================================================================
// Users
// ============================================================================

async fn set_user_banned(
    state: &AppState,
    client: ClientInfo,
    admin: CurrentUser,
    user_id: &str,
    banned: bool,
) -> Result<(), ApiError> {
    if banned && admin.user.id == user_id {
        return Err(ApiError::validation("You cannot ban yourself"));
    }

    if !state.store.users().set_banned(user_id, banned).await? {
        return Err(ApiError::not_found("User not found"));
    }

    if banned {
        state.sessions.logout_all(user_id).await?;
    }

    let (action, verb) = if banned {
        ("admin.user_ban", "Banned")
    } else {
        ("admin.user_unban", "Unbanned")
    };

    state
        .store
        .activity()
        .record(ActivityEntry {
            user_id: Some(admin.user.id),
            action,
            description: format!("{verb} user {user_id}"),
            ip: Some(client.ip),
            is_admin: true,
            metadata: Some(serde_json::json!({ "target_user_id": user_id })),
        })
        .await?;

    Ok(())
}

/// POST /admin/users/{id}/ban
/// Also revokes every session the user holds.
pub async fn ban_user(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
    Path(user_id): Path<String>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    set_user_banned(&state, client, current, &user_id, true).await?;
    Ok(Json(ApiResponse::success(MessageResponse::new("User banned"))))
}

/// POST /admin/users/{id}/unban
pub async fn unban_user(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
    Path(user_id): Path<String>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    set_user_banned(&state, client, current, &user_id, false).await?;
    Ok(Json(ApiResponse::success(MessageResponse::new("User unbanned"))))
}

/// DELETE /admin/users/{id}
/// Soft delete: the email and username become free for new accounts.
pub async fn delete_user(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
    Path(user_id): Path<String>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    if current.user.id == user_id {
        return Err(ApiError::validation("You cannot delete yourself"));
    }

    if !state.store.users().soft_delete(&user_id).await? {
        return Err(ApiError::not_found("User not found"));
    }
    state.sessions.logout_all(&user_id).await?;

    state
        .store
        .activity()
        .record(ActivityEntry {
            user_id: Some(current.user.id),
            action: "admin.user_delete",
            description: format!("Deleted user {user_id}"),
            ip: Some(client.ip),
            is_admin: true,
            metadata: Some(serde_json::json!({ "target_user_id": user_id })),
        })
        .await?;

    info!(event = "user_deleted", user_id = %user_id, "User soft-deleted");
    Ok(Json(ApiResponse::success(MessageResponse::new("User deleted"))))
}

// ============================================================================
// Activity
// ============================================================================

#[derive(Deserialize)]
pub struct ActivityQuery {
    pub action: Option<String>,
    #[serde(default)]
    pub admin_only: bool,
    pub limit: Option<u64>,
}

/// GET /admin/activity
pub async fn list_activity(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ActivityQuery>,
) -> Result<Json<ApiResponse<Vec<activity_logs::Model>>>, ApiError> {
    let limit = validate_limit(query.limit)?;
    let entries = state
        .store
        .activity()
        .list(query.action.as_deref(), query.admin_only, limit)
        .await?;
    Ok(Json(ApiResponse::success(entries)))
}
