use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "sessions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub user_id: String,

    /// SHA-256 of the current refresh token.
    #[sea_orm(unique)]
    pub refresh_token_hash: String,

    /// SHA-256 of the token replaced by the last rotation.
    pub previous_token_hash: Option<String>,

    pub rotated_at: Option<DateTimeUtc>,

    pub ip: String,

    pub user_agent: String,

    pub expires_at: DateTimeUtc,

    pub last_refresh_at: DateTimeUtc,

    pub created_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::users::Entity",
        from = "Column::UserId",
        to = "super::users::Column::Id",
        on_update = "Cascade",
        on_delete = "Cascade"
    )]
    User,
}

impl Related<super::users::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::User.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
