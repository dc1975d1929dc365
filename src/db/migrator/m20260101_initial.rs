use crate::entities::{activity_logs, api_keys, ip_registrations, prelude::*, sessions};
use sea_orm_migration::prelude::*;
use sea_orm_migration::sea_orm::{ConnectionTrait, EntityTrait, Schema};

#[derive(DeriveMigrationName)]
pub struct Migration;

/// Live users must be unique by email and username regardless of case.
/// Soft-deleted rows are excluded so their identifiers can be reused.
const USER_UNIQUE_INDEXES: [&str; 2] = [
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email_live ON users (lower(email)) WHERE deleted_at IS NULL",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_username_live ON users (lower(username)) WHERE deleted_at IS NULL",
];

async fn create_table<E: EntityTrait>(
    manager: &SchemaManager<'_>,
    schema: &Schema,
    entity: E,
) -> Result<(), DbErr> {
    manager
        .create_table(
            schema
                .create_table_from_entity(entity)
                .if_not_exists()
                .to_owned(),
        )
        .await
}

async fn create_index<C: IntoIden>(
    manager: &SchemaManager<'_>,
    name: &str,
    table: impl IntoIden + 'static,
    cols: impl IntoIterator<Item = C>,
) -> Result<(), DbErr> {
    let mut index = Index::create();
    index.name(name).table(table).if_not_exists();
    for col in cols {
        index.col(col);
    }
    manager.create_index(index.to_owned()).await
}

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        let backend = manager.get_database_backend();
        let schema = Schema::new(backend);

        create_table(manager, &schema, Users).await?;
        create_table(manager, &schema, Sessions).await?;
        create_table(manager, &schema, ApiKeys).await?;
        create_table(manager, &schema, IpBans).await?;
        create_table(manager, &schema, IpRegistrations).await?;
        create_table(manager, &schema, Nodes).await?;
        create_table(manager, &schema, ActivityLogs).await?;

        let conn = manager.get_connection();
        for sql in USER_UNIQUE_INDEXES {
            conn.execute_unprepared(sql).await?;
        }

        create_index(
            manager,
            "idx_sessions_user_id",
            Sessions,
            [sessions::Column::UserId],
        )
        .await?;
        create_index(
            manager,
            "idx_sessions_previous_token_hash",
            Sessions,
            [sessions::Column::PreviousTokenHash],
        )
        .await?;
        create_index(
            manager,
            "idx_api_keys_user_id",
            ApiKeys,
            [api_keys::Column::UserId],
        )
        .await?;
        create_index(
            manager,
            "idx_ip_registrations_ip_created_at",
            IpRegistrations,
            [
                ip_registrations::Column::Ip,
                ip_registrations::Column::CreatedAt,
            ],
        )
        .await?;
        create_index(
            manager,
            "idx_activity_logs_action",
            ActivityLogs,
            [activity_logs::Column::Action],
        )
        .await?;
        create_index(
            manager,
            "idx_activity_logs_is_admin",
            ActivityLogs,
            [activity_logs::Column::IsAdmin],
        )
        .await?;
        create_index(
            manager,
            "idx_activity_logs_created_at",
            ActivityLogs,
            [activity_logs::Column::CreatedAt],
        )
        .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        for table in [
            ActivityLogs.into_table_ref(),
            Nodes.into_table_ref(),
            IpRegistrations.into_table_ref(),
            IpBans.into_table_ref(),
            ApiKeys.into_table_ref(),
            Sessions.into_table_ref(),
            Users.into_table_ref(),
        ] {
            manager
                .drop_table(Table::drop().table(table).if_exists().to_owned())
                .await?;
        }
        Ok(())
    }
}
