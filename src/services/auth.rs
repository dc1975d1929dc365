//! Account registration and password login.

use std::sync::{Arc, OnceLock};

use chrono::{Duration, Utc};
use regex::Regex;
use thiserror::Error;
use tracing::info;

use crate::config::RegistrationConfig;
use crate::db::{ActivityEntry, NewUser, Store};
use crate::entities::users;
use crate::services::password::PasswordHasherService;
use crate::services::session::{SessionManager, TokenPair};

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 128;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Token expired")]
    Expired,

    #[error("Malformed token")]
    Malformed,

    #[error("Session revoked")]
    Revoked,

    #[error("Invalid refresh token")]
    InvalidRefreshToken,

    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Invalid API key")]
    InvalidApiKey,

    #[error("API key expired")]
    ApiKeyExpired,

    #[error("Your account has been banned")]
    Banned,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Request origin recorded alongside sessions and audit rows.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct Registration {
    pub email: String,
    pub username: String,
    pub password: String,
}

fn username_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_-]{3,32}$").expect("Invalid regex"))
}

pub fn validate_registration(input: &Registration) -> Result<(), AuthError> {
    let email = input.email.trim();
    let valid_email = email.len() <= 254
        && email
            .split_once('@')
            .is_some_and(|(local, domain)| !local.is_empty() && domain.contains('.'));
    if !valid_email {
        return Err(AuthError::Validation("Invalid email address".to_string()));
    }

    if !username_regex().is_match(&input.username) {
        return Err(AuthError::Validation(
            "Username must be 3-32 characters of letters, digits, '_' or '-'".to_string(),
        ));
    }

    validate_password(&input.password)
}

pub fn validate_password(password: &str) -> Result<(), AuthError> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    if password.len() > MAX_PASSWORD_LEN {
        return Err(AuthError::Validation(format!(
            "Password must be at most {MAX_PASSWORD_LEN} bytes"
        )));
    }
    Ok(())
}

pub struct AccountService {
    store: Store,
    hasher: PasswordHasherService,
    sessions: Arc<SessionManager>,
    registration: RegistrationConfig,
}

impl AccountService {
    #[must_use]
    pub const fn new(
        store: Store,
        hasher: PasswordHasherService,
        sessions: Arc<SessionManager>,
        registration: RegistrationConfig,
    ) -> Self {
        Self {
            store,
            hasher,
            sessions,
            registration,
        }
    }

    async fn reject_banned_ip(&self, ip: &str) -> Result<(), AuthError> {
        if self.store.ips().is_banned(ip).await? {
            return Err(AuthError::Forbidden(
                "Your IP address has been banned".to_string(),
            ));
        }
        Ok(())
    }

    pub async fn register(
        &self,
        input: Registration,
        client: &ClientInfo,
    ) -> Result<(users::Model, TokenPair), AuthError> {
        self.reject_banned_ip(&client.ip).await?;

        if !self.registration.enabled {
            return Err(AuthError::Forbidden("Registration is disabled".to_string()));
        }

        validate_registration(&input)?;

        if self.registration.max_per_ip > 0 {
            let since = Utc::now() - Duration::hours(i64::from(self.registration.ip_window_hours));
            let count = self
                .store
                .ips()
                .registrations_since(&client.ip, since)
                .await?;
            if count >= u64::from(self.registration.max_per_ip) {
                return Err(AuthError::Forbidden(
                    "Too many accounts registered from this IP address".to_string(),
                ));
            }
        }

        let email = input.email.trim().to_string();
        if self.store.users().email_taken(&email).await? {
            return Err(AuthError::Conflict("email already in use".to_string()));
        }
        if self.store.users().username_taken(&input.username).await? {
            return Err(AuthError::Conflict("username already in use".to_string()));
        }

        let password_hash = self.hasher.hash(&input.password).await?;
        let user = self
            .store
            .users()
            .create(
                NewUser {
                    email,
                    username: input.username,
                    password_hash,
                    is_admin: false,
                },
                Utc::now(),
            )
            .await?
            .ok_or_else(|| AuthError::Conflict("email or username already in use".to_string()))?;

        self.store
            .ips()
            .record_registration(&client.ip, &user.id, Utc::now())
            .await?;

        self.store
            .activity()
            .record(ActivityEntry {
                user_id: Some(user.id.clone()),
                action: "auth.register",
                description: format!("Registered account {}", user.username),
                ip: Some(client.ip.clone()),
                ..Default::default()
            })
            .await?;

        info!(event = "user_registered", user_id = %user.id, username = %user.username, "User registered");

        let tokens = self
            .sessions
            .issue(&user.id, &client.ip, &client.user_agent)
            .await?;
        Ok((user, tokens))
    }

    /// `identifier` is an email or a username, matched case-insensitively.
    pub async fn login(
        &self,
        identifier: &str,
        password: &str,
        client: &ClientInfo,
    ) -> Result<(users::Model, TokenPair), AuthError> {
        self.reject_banned_ip(&client.ip).await?;

        let user = self
            .store
            .users()
            .get_by_login(identifier.trim())
            .await?
            .ok_or(AuthError::InvalidCredentials)?;

        if !self.hasher.verify(password, &user.password_hash).await? {
            return Err(AuthError::InvalidCredentials);
        }

        if user.is_banned {
            return Err(AuthError::Banned);
        }

        let tokens = self
            .sessions
            .issue(&user.id, &client.ip, &client.user_agent)
            .await?;

        self.store
            .activity()
            .record(ActivityEntry {
                user_id: Some(user.id.clone()),
                action: "auth.login",
                description: "Logged in".to_string(),
                ip: Some(client.ip.clone()),
                is_admin: user.is_admin,
                metadata: Some(serde_json::json!({ "session_id": tokens.session_id })),
            })
            .await?;

        info!(event = "user_login", user_id = %user.id, "User logged in");
        Ok((user, tokens))
    }

    /// Create an account from the CLI, bypassing registration limits.
    pub async fn create_user(
        &self,
        input: Registration,
        is_admin: bool,
    ) -> Result<users::Model, AuthError> {
        validate_registration(&input)?;

        let password_hash = self.hasher.hash(&input.password).await?;
        self.store
            .users()
            .create(
                NewUser {
                    email: input.email.trim().to_string(),
                    username: input.username,
                    password_hash,
                    is_admin,
                },
                Utc::now(),
            )
            .await?
            .ok_or_else(|| AuthError::Conflict("email or username already in use".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration(email: &str, username: &str, password: &str) -> Registration {
        Registration {
            email: email.to_string(),
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    #[test]
    fn accepts_reasonable_input() {
        assert!(validate_registration(&registration("alice@example.com", "alice", "password1")).is_ok());
        assert!(validate_registration(&registration("a@b.io", "a_b-c", "12345678")).is_ok());
    }

    #[test]
    fn rejects_bad_usernames() {
        let long = "x".repeat(33);
        for name in ["ab", "has space", "semi;colon", long.as_str()] {
            let err = validate_registration(&registration("a@b.io", name, "password1"));
            assert!(matches!(err, Err(AuthError::Validation(_))), "{name}");
        }
    }

    #[test]
    fn rejects_short_password_and_bad_email() {
        assert!(matches!(
            validate_registration(&registration("a@b.io", "alice", "short")),
            Err(AuthError::Validation(_))
        ));
        assert!(matches!(
            validate_registration(&registration("no-at-sign", "alice", "password1")),
            Err(AuthError::Validation(_))
        ));
    }
}
