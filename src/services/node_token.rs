//! Validation of `<token_id>.<secret>` node credentials.
//!
//! The public half selects the stored credential; the secret half is hashed
//! and compared to the stored digest with a constant-time comparator.

use async_trait::async_trait;
use thiserror::Error;

use crate::crypto::{constant_time_eq, sha256_hex, split_node_token};
use crate::db::Store;
use crate::entities::nodes;

#[derive(Debug, Error)]
pub enum NodeAuthError {
    #[error("invalid format")]
    InvalidFormat,

    #[error("unauthorized")]
    Unauthorized,

    #[error(transparent)]
    Lookup(#[from] anyhow::Error),
}

/// A stored digest and whatever the caller attaches on success.
#[derive(Debug, Clone)]
pub struct StoredCredential<N> {
    pub token_hash: String,
    pub node: N,
}

#[async_trait]
pub trait CredentialLookup: Send + Sync {
    type Node: Send;

    async fn lookup(&self, token_id: &str) -> anyhow::Result<Option<StoredCredential<Self::Node>>>;
}

pub struct NodeTokenValidator<L> {
    lookup: L,
}

impl<L: CredentialLookup> NodeTokenValidator<L> {
    #[must_use]
    pub const fn new(lookup: L) -> Self {
        Self { lookup }
    }

    pub async fn validate(&self, presented: &str) -> Result<L::Node, NodeAuthError> {
        let (token_id, secret) = split_node_token(presented).ok_or(NodeAuthError::InvalidFormat)?;

        let credential = self
            .lookup
            .lookup(token_id)
            .await?
            .ok_or(NodeAuthError::Unauthorized)?;

        let digest = sha256_hex(secret);
        if constant_time_eq(digest.as_bytes(), credential.token_hash.as_bytes()) {
            Ok(credential.node)
        } else {
            Err(NodeAuthError::Unauthorized)
        }
    }
}

/// Panel side: credentials live on the `nodes` table.
#[derive(Clone)]
pub struct StoreNodeLookup {
    store: Store,
}

impl StoreNodeLookup {
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }
}

#[async_trait]
impl CredentialLookup for StoreNodeLookup {
    type Node = nodes::Model;

    async fn lookup(&self, token_id: &str) -> anyhow::Result<Option<StoredCredential<nodes::Model>>> {
        let node = self.store.nodes().get_by_token_id(token_id).await?;
        Ok(node.and_then(|node| {
            node.token_hash.clone().map(|token_hash| StoredCredential { token_hash, node })
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::NodeToken;

    struct Fixed {
        token_id: String,
        token_hash: String,
    }

    #[async_trait]
    impl CredentialLookup for Fixed {
        type Node = &'static str;

        async fn lookup(&self, token_id: &str) -> anyhow::Result<Option<StoredCredential<&'static str>>> {
            Ok((token_id == self.token_id).then(|| StoredCredential {
                token_hash: self.token_hash.clone(),
                node: "node-1",
            }))
        }
    }

    fn validator(token: &NodeToken) -> NodeTokenValidator<Fixed> {
        NodeTokenValidator::new(Fixed {
            token_id: token.token_id.clone(),
            token_hash: token.secret_hash(),
        })
    }

    #[tokio::test]
    async fn accepts_the_issued_token() {
        let token = NodeToken::generate();
        let node = validator(&token)
            .validate(&token.to_header_value())
            .await
            .unwrap();
        assert_eq!(node, "node-1");
    }

    #[tokio::test]
    async fn rejects_missing_separator() {
        let token = NodeToken::generate();
        let err = validator(&token).validate(&token.secret).await.unwrap_err();
        assert!(matches!(err, NodeAuthError::InvalidFormat));
    }

    #[tokio::test]
    async fn rejects_wrong_secret_and_unknown_id() {
        let token = NodeToken::generate();
        let validator = validator(&token);

        let wrong_secret = format!("{}.{}", token.token_id, "0".repeat(64));
        assert!(matches!(
            validator.validate(&wrong_secret).await,
            Err(NodeAuthError::Unauthorized)
        ));

        let unknown_id = format!("abcdef0123456789.{}", token.secret);
        assert!(matches!(
            validator.validate(&unknown_id).await,
            Err(NodeAuthError::Unauthorized)
        ));
    }
}
