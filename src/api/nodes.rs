use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
};
use serde::Serialize;
use std::sync::Arc;

use super::auth::CurrentNode;
use super::validation::payload;
use super::{ApiError, ApiResponse, AppState};
use crate::protocol::HeartbeatRequest;

#[derive(Serialize)]
pub struct HeartbeatResponse {
    pub node_id: String,
    pub name: String,
}

/// POST /nodes/heartbeat
pub async fn heartbeat(
    State(state): State<Arc<AppState>>,
    CurrentNode(node): CurrentNode,
    body: Result<Json<HeartbeatRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<HeartbeatResponse>>, ApiError> {
    let heartbeat = payload(body)?;
    state.nodes.record_heartbeat(&node, heartbeat).await?;

    Ok(Json(ApiResponse::success(HeartbeatResponse {
        node_id: node.id,
        name: node.name,
    })))
}
