use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, DatabaseConnection, EntityTrait, QueryFilter,
    QueryOrder, Set, sea_query::Expr,
};

use crate::db::new_id;
use crate::entities::sessions;

#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub refresh_token_hash: String,
    pub ip: String,
    pub user_agent: String,
    pub expires_at: DateTime<Utc>,
}

pub struct SessionRepository {
    conn: DatabaseConnection,
}

impl SessionRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn create(&self, session: NewSession, now: DateTime<Utc>) -> Result<sessions::Model> {
        sessions::ActiveModel {
            id: Set(new_id()),
            user_id: Set(session.user_id),
            refresh_token_hash: Set(session.refresh_token_hash),
            previous_token_hash: Set(None),
            rotated_at: Set(None),
            ip: Set(session.ip),
            user_agent: Set(session.user_agent),
            expires_at: Set(session.expires_at),
            last_refresh_at: Set(now),
            created_at: Set(now),
        }
        .insert(&self.conn)
        .await
        .context("Failed to insert session")
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<sessions::Model>> {
        sessions::Entity::find_by_id(id.to_string())
            .one(&self.conn)
            .await
            .context("Failed to query session by ID")
    }

    /// Find the unexpired session holding `token_hash` as either its current
    /// or its previous refresh token.
    pub async fn find_by_token_hash(
        &self,
        token_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<sessions::Model>> {
        sessions::Entity::find()
            .filter(
                Condition::any()
                    .add(sessions::Column::RefreshTokenHash.eq(token_hash))
                    .add(sessions::Column::PreviousTokenHash.eq(token_hash)),
            )
            .filter(sessions::Column::ExpiresAt.gt(now))
            .one(&self.conn)
            .await
            .context("Failed to query session by refresh token")
    }

    /// Compare-and-set rotation. Succeeds only if the row still holds
    /// `expected_hash` as its current token; the observed token becomes the
    /// previous one.
    pub async fn rotate(
        &self,
        id: &str,
        expected_hash: &str,
        new_hash: &str,
        expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sessions::Entity::update_many()
            .col_expr(sessions::Column::RefreshTokenHash, Expr::value(new_hash))
            .col_expr(
                sessions::Column::PreviousTokenHash,
                Expr::value(Some(expected_hash.to_string())),
            )
            .col_expr(sessions::Column::RotatedAt, Expr::value(Some(now)))
            .col_expr(sessions::Column::LastRefreshAt, Expr::value(now))
            .col_expr(sessions::Column::ExpiresAt, Expr::value(expires_at))
            .filter(sessions::Column::Id.eq(id))
            .filter(sessions::Column::RefreshTokenHash.eq(expected_hash))
            .exec(&self.conn)
            .await
            .context("Failed to rotate session")?;

        Ok(result.rows_affected == 1)
    }

    pub async fn list_for_user(&self, user_id: &str) -> Result<Vec<sessions::Model>> {
        sessions::Entity::find()
            .filter(sessions::Column::UserId.eq(user_id))
            .order_by_desc(sessions::Column::LastRefreshAt)
            .all(&self.conn)
            .await
            .context("Failed to list sessions")
    }

    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sessions::Entity::delete_by_id(id.to_string())
            .exec(&self.conn)
            .await
            .context("Failed to delete session")?;
        Ok(result.rows_affected > 0)
    }

    /// Delete `id` only if it belongs to `user_id`.
    pub async fn delete_owned(&self, user_id: &str, id: &str) -> Result<bool> {
        let result = sessions::Entity::delete_many()
            .filter(sessions::Column::Id.eq(id))
            .filter(sessions::Column::UserId.eq(user_id))
            .exec(&self.conn)
            .await
            .context("Failed to revoke session")?;
        Ok(result.rows_affected > 0)
    }

    pub async fn delete_for_user(&self, user_id: &str) -> Result<u64> {
        let result = sessions::Entity::delete_many()
            .filter(sessions::Column::UserId.eq(user_id))
            .exec(&self.conn)
            .await
            .context("Failed to delete user sessions")?;
        Ok(result.rows_affected)
    }

    pub async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let result = sessions::Entity::delete_many()
            .filter(sessions::Column::ExpiresAt.lt(now))
            .exec(&self.conn)
            .await
            .context("Failed to delete expired sessions")?;
        Ok(result.rows_affected)
    }
}
