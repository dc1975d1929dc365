use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};

use crate::db::new_id;
use crate::entities::activity_logs;

#[derive(Debug, Clone, Default)]
pub struct ActivityEntry {
    pub user_id: Option<String>,
    pub action: &'static str,
    pub description: String,
    pub ip: Option<String>,
    pub is_admin: bool,
    pub metadata: Option<serde_json::Value>,
}

/// Append-only audit trail.
pub struct ActivityRepository {
    conn: DatabaseConnection,
}

impl ActivityRepository {
    #[must_use]
    pub const fn new(conn: DatabaseConnection) -> Self {
        Self { conn }
    }

    pub async fn record(&self, entry: ActivityEntry) -> Result<()> {
        activity_logs::ActiveModel {
            id: Set(new_id()),
            user_id: Set(entry.user_id),
            action: Set(entry.action.to_string()),
            description: Set(entry.description),
            ip: Set(entry.ip),
            is_admin: Set(entry.is_admin),
            metadata: Set(entry.metadata),
            created_at: Set(Utc::now()),
        }
        .insert(&self.conn)
        .await
        .context("Failed to record activity")?;
        Ok(())
    }

    pub async fn list(
        &self,
        action: Option<&str>,
        admin_only: bool,
        limit: u64,
    ) -> Result<Vec<activity_logs::Model>> {
        let mut query = activity_logs::Entity::find();
        if let Some(action) = action {
            query = query.filter(activity_logs::Column::Action.eq(action));
        }
        if admin_only {
            query = query.filter(activity_logs::Column::IsAdmin.eq(true));
        }

        query
            .order_by_desc(activity_logs::Column::CreatedAt)
            .limit(limit)
            .all(&self.conn)
            .await
            .context("Failed to list activity")
    }
}
