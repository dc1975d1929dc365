use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::entities::{nodes, sessions, users};
use crate::services::TokenPair;

#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub notifications: Vec<String>,
}

impl<T> ApiResponse<T> {
    pub const fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            notifications: Vec::new(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message.into()),
            notifications: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_notification(mut self, message: impl Into<String>) -> Self {
        self.notifications.push(message.into());
        self
    }
}

#[derive(Debug, Serialize)]
pub struct UserDto {
    pub id: String,
    pub email: String,
    pub username: String,
    pub is_admin: bool,
    pub is_banned: bool,
    pub force_password_reset: bool,
    pub ram_limit_mib: Option<i64>,
    pub cpu_limit_percent: Option<i32>,
    pub disk_limit_mib: Option<i64>,
    pub server_limit: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl From<users::Model> for UserDto {
    fn from(user: users::Model) -> Self {
        Self {
            id: user.id,
            email: user.email,
            username: user.username,
            is_admin: user.is_admin,
            is_banned: user.is_banned,
            force_password_reset: user.force_password_reset,
            ram_limit_mib: user.ram_limit_mib,
            cpu_limit_percent: user.cpu_limit_percent,
            disk_limit_mib: user.disk_limit_mib,
            server_limit: user.server_limit,
            created_at: user.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct AuthResponse {
    pub user: UserDto,
    pub tokens: TokenPair,
}

#[derive(Debug, Serialize)]
pub struct SessionDto {
    pub id: String,
    pub ip: String,
    pub user_agent: String,
    pub current: bool,
    pub expires_at: DateTime<Utc>,
    pub last_refresh_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl SessionDto {
    #[must_use]
    pub fn new(session: sessions::Model, current_session: Option<&str>) -> Self {
        Self {
            current: current_session == Some(session.id.as_str()),
            id: session.id,
            ip: session.ip,
            user_agent: session.user_agent,
            expires_at: session.expires_at,
            last_refresh_at: session.last_refresh_at,
            created_at: session.created_at,
        }
    }
}

/// Node as shown to admins. Credential digests never leave the panel.
#[derive(Debug, Serialize)]
pub struct NodeDto {
    pub id: String,
    pub name: String,
    pub fqdn: String,
    pub port: i32,
    pub scheme: String,
    pub paired: bool,
    pub token_id: Option<String>,
    pub is_online: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub auth_error: Option<String>,
    pub system_info: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

impl From<nodes::Model> for NodeDto {
    fn from(node: nodes::Model) -> Self {
        Self {
            paired: node.token_hash.is_some(),
            id: node.id,
            name: node.name,
            fqdn: node.fqdn,
            port: node.port,
            scheme: node.scheme,
            token_id: node.token_id,
            is_online: node.is_online,
            last_heartbeat: node.last_heartbeat,
            auth_error: node.auth_error,
            system_info: node.system_info,
            created_at: node.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}
