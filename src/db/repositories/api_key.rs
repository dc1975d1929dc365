use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set,
    sea_query::Expr,
};

use crate::db::new_id;
use crate::entities::api_keys;

pub struct ApiKeyRepository {
    conn: DatabaseConnection,
}

impl ApiKeyRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn create(
        &self,
        user_id: &str,
        name: &str,
        key_hash: String,
        key_prefix: String,
        expires_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<api_keys::Model> {
        api_keys::ActiveModel {
            id: Set(new_id()),
            user_id: Set(user_id.to_string()),
            name: Set(name.to_string()),
            key_hash: Set(key_hash),
            key_prefix: Set(key_prefix),
            expires_at: Set(expires_at),
            last_used_at: Set(None),
            created_at: Set(now),
        }
        .insert(&self.conn)
        .await
        .context("Failed to insert API key")
    }

    pub async fn get_by_hash(&self, key_hash: &str) -> Result<Option<api_keys::Model>> {
        api_keys::Entity::find()
            .filter(api_keys::Column::KeyHash.eq(key_hash))
            .one(&self.conn)
            .await
            .context("Failed to query API key by hash")
    }

    /// Newest first.
    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<api_keys::Model>> {
        api_keys::Entity::find()
            .filter(api_keys::Column::UserId.eq(user_id))
            .order_by_desc(api_keys::Column::CreatedAt)
            .all(&self.conn)
            .await
            .context("Failed to list API keys")
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = api_keys::Entity::delete_by_id(id.to_string())
            .exec(&self.conn)
            .await
            .context("Failed to delete API key")?;
        Ok(result.rows_affected > 0)
    }

    pub async fn delete_owned(&self, user_id: &str, id: &str) -> Result<bool> {
        let result = api_keys::Entity::delete_many()
            .filter(api_keys::Column::Id.eq(id))
            .filter(api_keys::Column::UserId.eq(user_id))
            .exec(&self.conn)
            .await
            .context("Failed to delete API key")?;
        Ok(result.rows_affected > 0)
    }

    pub async fn touch(&self, id: &str, now: DateTime<Utc>) -> Result<()> {
        api_keys::Entity::update_many()
            .col_expr(api_keys::Column::LastUsedAt, Expr::value(Some(now)))
            .filter(api_keys::Column::Id.eq(id))
            .exec(&self.conn)
            .await
            .context("Failed to update API key last use")?;
        Ok(())
    }
}
