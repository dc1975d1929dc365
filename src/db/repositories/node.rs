use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::Expr,
};

use crate::db::new_id;
use crate::entities::nodes;

#[derive(Debug, Clone)]
pub struct NewNode {
    pub name: String,
    pub fqdn: String,
    pub port: i32,
    pub scheme: String,
    pub daemon_token: String,
}

pub struct NodeRepository {
    conn: DatabaseConnection,
}

impl NodeRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&self, node: NewNode) -> Result<nodes::Model> {
        let now = Utc::now();
        nodes::ActiveModel {
            id: Set(new_id()),
            name: Set(node.name),
            fqdn: Set(node.fqdn),
            port: Set(node.port),
            scheme: Set(node.scheme),
            token_id: Set(None),
            token_hash: Set(None),
            daemon_token: Set(node.daemon_token),
            is_online: Set(false),
            last_heartbeat: Set(None),
            auth_error: Set(None),
            system_info: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.conn)
        .await
        .context("Failed to insert node")
    }

    pub async fn list(&self) -> Result<Vec<nodes::Model>> {
        nodes::Entity::find()
            .order_by_asc(nodes::Column::Name)
            .all(&self.conn)
            .await
            .context("Failed to list nodes")
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<nodes::Model>> {
        nodes::Entity::find_by_id(id.to_string())
            .one(&self.conn)
            .await
            .context("Failed to query node by ID")
    }

    pub async fn get_by_token_id(&self, token_id: &str) -> Result<Option<nodes::Model>> {
        nodes::Entity::find()
            .filter(nodes::Column::TokenId.eq(token_id))
            .one(&self.conn)
            .await
            .context("Failed to query node by token ID")
    }

    /// Store the credential produced by pairing. Only the digest of the
    /// secret half is written.
    pub async fn set_credentials(&self, id: &str, token_id: &str, token_hash: &str) -> Result<bool> {
        let result = nodes::Entity::update_many()
            .col_expr(nodes::Column::TokenId, Expr::value(Some(token_id.to_string())))
            .col_expr(nodes::Column::TokenHash, Expr::value(Some(token_hash.to_string())))
            .col_expr(nodes::Column::AuthError, Expr::value(Option::<String>::None))
            .col_expr(nodes::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(nodes::Column::Id.eq(id))
            .exec(&self.conn)
            .await
            .context("Failed to store node credentials")?;
        Ok(result.rows_affected == 1)
    }

    pub async fn record_heartbeat(
        &self,
        id: &str,
        system_info: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<()> {
        nodes::Entity::update_many()
            .col_expr(nodes::Column::IsOnline, Expr::value(true))
            .col_expr(nodes::Column::LastHeartbeat, Expr::value(Some(now)))
            .col_expr(nodes::Column::AuthError, Expr::value(Option::<String>::None))
            .col_expr(nodes::Column::SystemInfo, Expr::value(Some(system_info)))
            .col_expr(nodes::Column::UpdatedAt, Expr::value(now))
            .filter(nodes::Column::Id.eq(id))
            .exec(&self.conn)
            .await
            .context("Failed to record heartbeat")?;
        Ok(())
    }

    pub async fn set_auth_error(&self, id: &str, message: &str) -> Result<()> {
        let Some(node) = self.get_by_id(id).await? else {
            return Ok(());
        };
        let mut active: nodes::ActiveModel = node.into();
        active.auth_error = Set(Some(message.to_string()));
        active.updated_at = Set(Utc::now());
        active
            .update(&self.conn)
            .await
            .context("Failed to record node auth error")?;
        Ok(())
    }

    /// Flip online nodes whose last heartbeat is older than `cutoff`.
    pub async fn mark_stale_offline(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = nodes::Entity::update_many()
            .col_expr(nodes::Column::IsOnline, Expr::value(false))
            .filter(nodes::Column::IsOnline.eq(true))
            .filter(
                nodes::Column::LastHeartbeat
                    .is_null()
                    .or(nodes::Column::LastHeartbeat.lt(cutoff)),
            )
            .exec(&self.conn)
            .await
            .context("Failed to mark stale nodes offline")?;
        Ok(result.rows_affected)
    }
}
