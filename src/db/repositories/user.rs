use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::sea_query::{Expr, Func};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    sea_query::SimpleExpr,
};

use crate::db::{is_unique_violation, new_id};
use crate::entities::users;

#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub username: String,
    pub password_hash: String,
    pub is_admin: bool,
}

pub struct UserRepository {
    conn: DatabaseConnection,
}

fn lower_eq(column: users::Column, value: &str) -> SimpleExpr {
    Expr::expr(Func::lower(Expr::col(column))).eq(value.to_lowercase())
}

impl UserRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    /// Insert a user. Returns `None` when the email or username is already
    /// held by a live user.
    pub async fn create(&self, user: NewUser, now: DateTime<Utc>) -> Result<Option<users::Model>> {
        let model = users::ActiveModel {
            id: Set(new_id()),
            email: Set(user.email),
            username: Set(user.username),
            password_hash: Set(user.password_hash),
            is_admin: Set(user.is_admin),
            is_banned: Set(false),
            force_password_reset: Set(false),
            ram_limit_mib: Set(None),
            cpu_limit_percent: Set(None),
            disk_limit_mib: Set(None),
            server_limit: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            deleted_at: Set(None),
        };

        match model.insert(&self.conn).await {
            Ok(model) => Ok(Some(model)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e).context("Failed to insert user"),
        }
    }

    pub async fn get_by_id(&self, id: &str) -> Result<Option<users::Model>> {
        users::Entity::find_by_id(id.to_string())
            .filter(users::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await
            .context("Failed to query user by ID")
    }

    /// Look up a live user by email or username, ignoring case.
    pub async fn get_by_login(&self, identifier: &str) -> Result<Option<users::Model>> {
        let column = if identifier.contains('@') {
            users::Column::Email
        } else {
            users::Column::Username
        };

        users::Entity::find()
            .filter(lower_eq(column, identifier))
            .filter(users::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await
            .context("Failed to query user by login")
    }

    pub async fn email_taken(&self, email: &str) -> Result<bool> {
        let found = users::Entity::find()
            .filter(lower_eq(users::Column::Email, email))
            .filter(users::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await
            .context("Failed to check email availability")?;
        Ok(found.is_some())
    }

    pub async fn username_taken(&self, username: &str) -> Result<bool> {
        let found = users::Entity::find()
            .filter(lower_eq(users::Column::Username, username))
            .filter(users::Column::DeletedAt.is_null())
            .one(&self.conn)
            .await
            .context("Failed to check username availability")?;
        Ok(found.is_some())
    }

    /// Returns `false` if the user does not exist.
    pub async fn set_banned(&self, id: &str, banned: bool) -> Result<bool> {
        let Some(user) = self.get_by_id(id).await? else {
            return Ok(false);
        };

        let mut active: users::ActiveModel = user.into();
        active.is_banned = Set(banned);
        active.updated_at = Set(Utc::now());
        active
            .update(&self.conn)
            .await
            .context("Failed to update ban flag")?;
        Ok(true)
    }

    pub async fn soft_delete(&self, id: &str) -> Result<bool> {
        let Some(user) = self.get_by_id(id).await? else {
            return Ok(false);
        };

        let now = Utc::now();
        let mut active: users::ActiveModel = user.into();
        active.deleted_at = Set(Some(now));
        active.updated_at = Set(now);
        active
            .update(&self.conn)
            .await
            .context("Failed to soft-delete user")?;
        Ok(true)
    }
}
