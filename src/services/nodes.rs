//! Panel-side node management: registration, the pairing trigger and liveness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::NodesConfig;
use crate::crypto::{
    NODE_TOKEN_ID_BYTES, NODE_TOKEN_SECRET_BYTES, NodeToken, is_lower_hex, sha256_hex,
};
use crate::db::{ActivityEntry, NewNode, Store};
use crate::entities::nodes;
use crate::protocol::{HeartbeatRequest, PairRequest, PairResponse, PairingError};
use crate::services::worker::BackgroundWorker;

pub const PAIRING_CODE_LEN: usize = 6;
const PAIRING_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Node not found")]
    NotFound,

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error("Node unreachable: {0}")]
    Unreachable(String),

    #[error("Agent error: {0}")]
    Agent(String),

    #[error("Node sent an invalid pairing response")]
    InvalidResponse,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct NodeRegistration {
    pub name: String,
    pub fqdn: String,
    pub port: u16,
    pub scheme: String,
}

/// Short code shown to the admin and to the agent operator for comparison.
#[must_use]
pub fn generate_pairing_code() -> String {
    let mut rng = rand::rng();
    (0..PAIRING_CODE_LEN)
        .map(|_| char::from(PAIRING_CODE_ALPHABET[rng.random_range(0..PAIRING_CODE_ALPHABET.len())]))
        .collect()
}

#[must_use]
pub fn agent_base_url(node: &nodes::Model) -> String {
    format!("{}://{}:{}", node.scheme, node.fqdn, node.port)
}

pub struct NodeService {
    store: Store,
    client: reqwest::Client,
    panel_url: String,
    settings: NodesConfig,
    checker: BackgroundWorker,
}

impl NodeService {
    pub fn new(store: Store, panel_url: String, settings: NodesConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.pairing_request_timeout_secs))
            .user_agent(concat!("birdactyl-panel/", env!("CARGO_PKG_VERSION")))
            .build()?;

        let checker = BackgroundWorker::new(
            "node_heartbeat_checker",
            Duration::from_secs(settings.heartbeat_check_interval_secs.max(1)),
        );

        Ok(Self {
            store,
            client,
            panel_url,
            settings,
            checker,
        })
    }

    pub async fn list(&self) -> Result<Vec<nodes::Model>, NodeError> {
        Ok(self.store.nodes().list().await?)
    }

    /// Register a node. The panel→agent credential is minted here and handed
    /// to the agent during pairing.
    pub async fn create(
        &self,
        input: NodeRegistration,
        created_by: &str,
    ) -> Result<nodes::Model, NodeError> {
        let name = input.name.trim();
        let fqdn = input.fqdn.trim();
        if name.is_empty() || name.len() > 64 {
            return Err(NodeError::Validation("Node name must be 1-64 characters".to_string()));
        }
        if fqdn.is_empty() || fqdn.contains('/') || fqdn.contains(' ') {
            return Err(NodeError::Validation("Invalid node FQDN".to_string()));
        }
        if input.port == 0 {
            return Err(NodeError::Validation("Invalid node port".to_string()));
        }
        if !matches!(input.scheme.as_str(), "http" | "https") {
            return Err(NodeError::Validation("Scheme must be http or https".to_string()));
        }

        let node = self
            .store
            .nodes()
            .create(NewNode {
                name: name.to_string(),
                fqdn: fqdn.to_string(),
                port: i32::from(input.port),
                scheme: input.scheme,
                daemon_token: NodeToken::generate().to_header_value(),
            })
            .await?;

        self.store
            .activity()
            .record(ActivityEntry {
                user_id: Some(created_by.to_string()),
                action: "node.create",
                description: format!("Created node {}", node.name),
                is_admin: true,
                metadata: Some(serde_json::json!({ "node_id": node.id })),
                ..Default::default()
            })
            .await?;

        info!(event = "node_created", node_id = %node.id, name = %node.name, "Node created");
        Ok(node)
    }

    /// Drive the handshake against the agent. Blocks until the agent's
    /// operator answers, the agent times out, or the request deadline hits.
    pub async fn pair(
        &self,
        node_id: &str,
        code: &str,
        paired_by: &str,
    ) -> Result<nodes::Model, NodeError> {
        let node = self
            .store
            .nodes()
            .get_by_id(node_id)
            .await?
            .ok_or(NodeError::NotFound)?;

        let url = format!("{}/api/pair", agent_base_url(&node));
        let request = PairRequest {
            panel_url: self.panel_url.clone(),
            code: code.to_string(),
            daemon_token: Some(node.daemon_token.clone()),
        };

        info!(event = "node_pairing_started", node_id = %node.id, code, "Sending pairing request");

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NodeError::Pairing(PairingError::TimedOut)
                } else {
                    NodeError::Unreachable(e.to_string())
                }
            })?;

        let reply: PairResponse = response
            .json()
            .await
            .map_err(|_| NodeError::InvalidResponse)?;

        let (token_id, token) = match reply {
            PairResponse {
                success: true,
                token_id: Some(token_id),
                token: Some(token),
                ..
            } => (token_id, token),
            PairResponse {
                error: Some(message),
                ..
            } => {
                let err = PairingError::from_message(&message)
                    .map_or_else(|| NodeError::Agent(message.clone()), NodeError::Pairing);
                warn!(node_id = %node.id, error = %message, "Agent refused pairing");
                self.store.nodes().set_auth_error(&node.id, &message).await?;
                return Err(err);
            }
            _ => return Err(NodeError::InvalidResponse),
        };

        if !is_lower_hex(&token_id, NODE_TOKEN_ID_BYTES * 2)
            || !is_lower_hex(&token, NODE_TOKEN_SECRET_BYTES * 2)
        {
            return Err(NodeError::InvalidResponse);
        }

        if !self
            .store
            .nodes()
            .set_credentials(&node.id, &token_id, &sha256_hex(&token))
            .await?
        {
            return Err(NodeError::NotFound);
        }

        self.store
            .activity()
            .record(ActivityEntry {
                user_id: Some(paired_by.to_string()),
                action: "node.pair",
                description: format!("Paired node {}", node.name),
                is_admin: true,
                metadata: Some(serde_json::json!({ "node_id": node.id, "token_id": token_id })),
                ..Default::default()
            })
            .await?;

        info!(event = "node_paired", node_id = %node.id, token_id = %token_id, "Node paired");

        self.store
            .nodes()
            .get_by_id(&node.id)
            .await?
            .ok_or(NodeError::NotFound)
    }

    pub async fn record_heartbeat(
        &self,
        node: &nodes::Model,
        heartbeat: HeartbeatRequest,
    ) -> Result<(), NodeError> {
        let system = serde_json::to_value(&heartbeat.system).map_err(anyhow::Error::from)?;
        self.store
            .nodes()
            .record_heartbeat(&node.id, system, Utc::now())
            .await?;
        if !node.is_online {
            info!(event = "node_online", node_id = %node.id, "Node came online");
        }
        Ok(())
    }

    pub async fn mark_stale_offline(&self) -> Result<u64, NodeError> {
        let timeout = chrono::Duration::seconds(
            i64::try_from(self.settings.heartbeat_timeout_secs).unwrap_or(i64::MAX),
        );
        Ok(self
            .store
            .nodes()
            .mark_stale_offline(Utc::now() - timeout)
            .await?)
    }

    pub fn start_heartbeat_checker(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        self.checker.start(move || {
            let weak = weak.clone();
            async move {
                let Some(service) = weak.upgrade() else {
                    return;
                };
                match service.mark_stale_offline().await {
                    Ok(0) => {}
                    Ok(count) => info!(event = "nodes_offline", count, "Nodes marked offline"),
                    Err(e) => warn!(error = %e, "Failed to check node heartbeats"),
                }
            }
        })
    }

    pub async fn stop_heartbeat_checker(&self) {
        self.checker.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_codes_use_the_unambiguous_alphabet() {
        for _ in 0..32 {
            let code = generate_pairing_code();
            assert_eq!(code.len(), PAIRING_CODE_LEN);
            assert!(code.bytes().all(|b| PAIRING_CODE_ALPHABET.contains(&b)));
        }
    }
}
