use sea_orm::entity::prelude::*;

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel)]
#[sea_orm(table_name = "nodes")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: String,

    pub name: String,

    pub fqdn: String,

    pub port: i32,

    /// `http` or `https`
    pub scheme: String,

    /// Public half of the node credential. Empty until paired.
    #[sea_orm(unique)]
    pub token_id: Option<String>,

    /// SHA-256 of the secret half.
    pub token_hash: Option<String>,

    /// Credential the panel presents to the agent.
    pub daemon_token: String,

    pub is_online: bool,

    pub last_heartbeat: Option<DateTimeUtc>,

    pub auth_error: Option<String>,

    pub system_info: Option<Json>,

    pub created_at: DateTimeUtc,

    pub updated_at: DateTimeUtc,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
