use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};

use crate::db::{is_unique_violation, new_id};
use crate::entities::{ip_bans, ip_registrations};

/// Banned addresses and the per-IP registration audit trail.
pub struct IpRepository {
    conn: DatabaseConnection,
}

impl IpRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn is_banned(&self, ip: &str) -> Result<bool> {
        let count = ip_bans::Entity::find()
            .filter(ip_bans::Column::Ip.eq(ip))
            .count(&self.conn)
            .await
            .context("Failed to check IP ban")?;
        Ok(count > 0)
    }

    pub async fn list_bans(&self) -> Result<Vec<ip_bans::Model>> {
        ip_bans::Entity::find()
            .order_by_desc(ip_bans::Column::CreatedAt)
            .all(&self.conn)
            .await
            .context("Failed to list IP bans")
    }

    /// Returns `None` if the address is already banned.
    pub async fn create_ban(
        &self,
        ip: &str,
        reason: Option<String>,
        banned_by: Option<String>,
    ) -> Result<Option<ip_bans::Model>> {
        let model = ip_bans::ActiveModel {
            id: Set(new_id()),
            ip: Set(ip.to_string()),
            reason: Set(reason),
            banned_by: Set(banned_by),
            created_at: Set(Utc::now()),
        };

        match model.insert(&self.conn).await {
            Ok(model) => Ok(Some(model)),
            Err(e) if is_unique_violation(&e) => Ok(None),
            Err(e) => Err(e).context("Failed to insert IP ban"),
        }
    }

    pub async fn delete_ban(&self, id: &str) -> Result<Option<ip_bans::Model>> {
        let Some(ban) = ip_bans::Entity::find_by_id(id.to_string())
            .one(&self.conn)
            .await
            .context("Failed to query IP ban")?
        else {
            return Ok(None);
        };

        ip_bans::Entity::delete_by_id(id.to_string())
            .exec(&self.conn)
            .await
            .context("Failed to delete IP ban")?;
        Ok(Some(ban))
    }

    pub async fn record_registration(
        &self,
        ip: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<()> {
        ip_registrations::ActiveModel {
            id: Set(new_id()),
            ip: Set(ip.to_string()),
            user_id: Set(user_id.to_string()),
            created_at: Set(now),
        }
        .insert(&self.conn)
        .await
        .context("Failed to record registration")?;
        Ok(())
    }

    pub async fn registrations_since(&self, ip: &str, since: DateTime<Utc>) -> Result<u64> {
        ip_registrations::Entity::find()
            .filter(ip_registrations::Column::Ip.eq(ip))
            .filter(ip_registrations::Column::CreatedAt.gte(since))
            .count(&self.conn)
            .await
            .context("Failed to count registrations")
    }
}
