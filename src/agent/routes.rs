use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::AgentState;
use super::engine::{ContainerConfig, ContainerStats, HostConfig};
use crate::api::validation::payload;
use crate::api::{ApiError, ApiResponse, MessageResponse};
use crate::protocol::{PairRequest, PairResponse, PairingError, SystemInfo};

/// POST /api/pair
///
/// Always answers with a [`PairResponse`] so the panel can read the reason.
pub async fn pair(
    State(state): State<Arc<AgentState>>,
    body: Result<Json<PairRequest>, JsonRejection>,
) -> (StatusCode, Json<PairResponse>) {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            let err = PairingError::Invalid(rejection.body_text());
            return (err.status(), Json(PairResponse::failed(&err)));
        }
    };

    match state.pairing.handle(request).await {
        Ok(response) => (StatusCode::OK, Json(response)),
        Err(err) => (err.status(), Json(PairResponse::failed(&err))),
    }
}

/// GET /api/system
pub async fn system(State(state): State<Arc<AgentState>>) -> Json<ApiResponse<SystemInfo>> {
    Json(ApiResponse::success(state.system_info()))
}

#[derive(Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    pub config: ContainerConfig,
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub start: bool,
}

#[derive(Debug, Serialize)]
pub struct ContainerRef {
    pub id: String,
    pub name: String,
}

/// POST /api/containers
pub async fn create_container(
    State(state): State<Arc<AgentState>>,
    body: Result<Json<CreateContainerRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<ContainerRef>>), ApiError> {
    let input = payload(body)?;

    if input.name.trim().is_empty() || input.config.image.trim().is_empty() {
        return Err(ApiError::validation("name and config.image are required"));
    }
    if state.engine.exists(&input.name).await {
        return Err(ApiError::Conflict(format!(
            "Container {} already exists",
            input.name
        )));
    }

    if !state.engine.image_exists(&input.config.image).await {
        state.engine.pull_image(&input.config.image).await?;
    }

    let id = state
        .engine
        .create(&input.name, &input.config, &input.host)
        .await?;

    if input.start {
        state.engine.start(&id).await?;
    }

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(ContainerRef {
            id,
            name: input.name,
        })),
    ))
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PowerAction {
    Start,
    Stop,
    Restart,
    Kill,
}

#[derive(Deserialize)]
pub struct PowerRequest {
    pub action: PowerAction,
    #[serde(default = "default_stop_timeout")]
    pub timeout_secs: u32,
}

const fn default_stop_timeout() -> u32 {
    10
}

/// POST /api/containers/{id}/power
pub async fn power(
    State(state): State<Arc<AgentState>>,
    Path(id): Path<String>,
    body: Result<Json<PowerRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let input = payload(body)?;

    match input.action {
        PowerAction::Start => state.engine.start(&id).await?,
        PowerAction::Stop => state.engine.stop(&id, input.timeout_secs).await?,
        PowerAction::Restart => state.engine.restart(&id, input.timeout_secs).await?,
        PowerAction::Kill => state.engine.kill(&id).await?,
    }

    info!(event = "container_power", id = %id, action = ?input.action, "Power action applied");
    Ok(Json(ApiResponse::success(MessageResponse::new("OK"))))
}

#[derive(Deserialize)]
pub struct CommandRequest {
    pub command: String,
}

/// POST /api/containers/{id}/command
pub async fn command(
    State(state): State<Arc<AgentState>>,
    Path(id): Path<String>,
    body: Result<Json<CommandRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let input = payload(body)?;
    if input.command.contains('\n') {
        return Err(ApiError::validation("command must be a single line"));
    }

    state.engine.send_stdin(&id, &input.command).await?;
    Ok(Json(ApiResponse::success(MessageResponse::new("Command sent"))))
}

#[derive(Deserialize)]
pub struct LogsQuery {
    pub tail: Option<u32>,
    #[serde(default)]
    pub follow: bool,
}

/// GET /api/containers/{id}/logs
pub async fn logs(
    State(state): State<Arc<AgentState>>,
    Path(id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let lines = state.engine.logs(&id, query.tail, query.follow).await?;
    let body = Body::from_stream(lines.map_ok(|line| format!("{line}\n")));

    Ok(([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], body).into_response())
}

/// GET /api/containers/{id}/stats
pub async fn stats(
    State(state): State<Arc<AgentState>>,
    Path(id): Path<String>,
) -> Result<Json<ApiResponse<ContainerStats>>, ApiError> {
    let stats = state.engine.stats(&id).await?;
    Ok(Json(ApiResponse::success(stats)))
}

#[derive(Deserialize)]
pub struct RemoveQuery {
    #[serde(default)]
    pub force: bool,
}

/// DELETE /api/containers/{id}
pub async fn remove(
    State(state): State<Arc<AgentState>>,
    Path(id): Path<String>,
    Query(query): Query<RemoveQuery>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    state.engine.remove(&id, query.force).await?;
    info!(event = "container_removed", id = %id, force = query.force, "Container removed");
    Ok(Json(ApiResponse::success(MessageResponse::new("Container removed"))))
}

/// GET /api/containers/lookup/{name}
pub async fn lookup(
    State(state): State<Arc<AgentState>>,
    Path(name): Path<String>,
) -> Result<Json<ApiResponse<ContainerRef>>, ApiError> {
    let id = state.engine.id_of(&name).await?;
    Ok(Json(ApiResponse::success(ContainerRef { id, name })))
}
