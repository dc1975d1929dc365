use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::debug;

use super::AgentState;
use super::link::AgentConfigStore;
use crate::api::ApiError;
use crate::api::auth::bearer_token;
use crate::crypto::{sha256_hex, split_node_token};
use crate::services::node_token::{CredentialLookup, StoredCredential};

/// The panel's credential, as handed over during pairing.
pub struct DaemonTokenLookup {
    config: Arc<AgentConfigStore>,
}

impl DaemonTokenLookup {
    #[must_use]
    pub const fn new(config: Arc<AgentConfigStore>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl CredentialLookup for DaemonTokenLookup {
    type Node = ();

    async fn lookup(&self, token_id: &str) -> anyhow::Result<Option<StoredCredential<()>>> {
        let Some(daemon_token) = self.config.panel().await.daemon_token else {
            return Ok(None);
        };

        Ok(split_node_token(&daemon_token)
            .filter(|(id, _)| *id == token_id)
            .map(|(_, secret)| StoredCredential {
                token_hash: sha256_hex(secret),
                node: (),
            }))
    }
}

/// Only the paired panel may drive containers.
pub async fn require_panel(
    State(state): State<Arc<AgentState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(request.headers()) else {
        return ApiError::unauthorized("Missing credentials").into_response();
    };

    match state.validator.validate(&token).await {
        Ok(()) => next.run(request).await,
        Err(e) => {
            debug!(error = %e, "Rejected panel credential");
            ApiError::from(e).into_response()
        }
    }
}
