//! Long-lived `birdactyl_`-prefixed API keys.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use crate::crypto::{API_KEY_PREFIX, random_hex, sha256_hex};
use crate::db::Store;
use crate::entities::{api_keys, users};
use crate::services::auth::AuthError;

pub const API_KEY_RANDOM_BYTES: usize = 32;
const DISPLAY_HEX_CHARS: usize = 8;

/// Returned once at creation; the plaintext is never stored.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedApiKey {
    pub id: String,
    pub name: String,
    pub key: String,
    pub key_prefix: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiKeySummary {
    pub id: String,
    pub name: String,
    pub key_prefix: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<api_keys::Model> for ApiKeySummary {
    fn from(model: api_keys::Model) -> Self {
        Self {
            id: model.id,
            name: model.name,
            key_prefix: model.key_prefix,
            expires_at: model.expires_at,
            last_used_at: model.last_used_at,
            created_at: model.created_at,
        }
    }
}

/// Plaintext key and its display prefix.
#[must_use]
pub fn generate_key() -> (String, String) {
    let suffix = random_hex(API_KEY_RANDOM_BYTES);
    let prefix = format!("{API_KEY_PREFIX}{}", &suffix[..DISPLAY_HEX_CHARS]);
    (format!("{API_KEY_PREFIX}{suffix}"), prefix)
}

#[must_use]
pub fn looks_like_api_key(credential: &str) -> bool {
    credential.starts_with(API_KEY_PREFIX)
}

#[derive(Clone)]
pub struct ApiKeyService {
    store: Store,
}

impl ApiKeyService {
    #[must_use]
    pub const fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn create(
        &self,
        user_id: &str,
        name: &str,
        expires_in_days: Option<u32>,
    ) -> Result<CreatedApiKey, AuthError> {
        let name = name.trim();
        if name.is_empty() || name.len() > 64 {
            return Err(AuthError::Validation(
                "API key name must be 1-64 characters".to_string(),
            ));
        }
        if expires_in_days == Some(0) {
            return Err(AuthError::Validation(
                "expires_in_days must be positive".to_string(),
            ));
        }

        let now = Utc::now();
        let expires_at = expires_in_days.map(|days| now + Duration::days(i64::from(days)));
        let (key, key_prefix) = generate_key();

        let model = self
            .store
            .api_keys()
            .create(
                user_id,
                name,
                sha256_hex(&key),
                key_prefix,
                expires_at,
                now,
            )
            .await?;

        debug!(user_id, key_id = %model.id, "API key created");

        Ok(CreatedApiKey {
            id: model.id,
            name: model.name,
            key,
            key_prefix: model.key_prefix,
            expires_at: model.expires_at,
            created_at: model.created_at,
        })
    }

    /// Resolve the owner of a presented key. Expired keys are deleted on sight.
    pub async fn validate(&self, key: &str) -> Result<users::Model, AuthError> {
        let record = self
            .store
            .api_keys()
            .get_by_hash(&sha256_hex(key))
            .await?
            .ok_or(AuthError::InvalidApiKey)?;

        let now = Utc::now();
        if record.expires_at.is_some_and(|expires| expires < now) {
            self.store.api_keys().delete(&record.id).await?;
            debug!(key_id = %record.id, "Expired API key removed");
            return Err(AuthError::ApiKeyExpired);
        }

        let user = self
            .store
            .users()
            .get_by_id(&record.user_id)
            .await?
            .ok_or(AuthError::InvalidApiKey)?;

        if let Err(e) = self.store.api_keys().touch(&record.id, now).await {
            warn!(key_id = %record.id, error = %e, "Failed to update API key last use");
        }

        Ok(user)
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<ApiKeySummary>, AuthError> {
        let keys = self.store.api_keys().list_for_user(user_id).await?;
        Ok(keys.into_iter().map(ApiKeySummary::from).collect())
    }

    pub async fn delete(&self, user_id: &str, key_id: &str) -> Result<(), AuthError> {
        if self.store.api_keys().delete_owned(user_id, key_id).await? {
            Ok(())
        } else {
            Err(AuthError::NotFound("API key not found".to_string()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::is_lower_hex;

    #[test]
    fn generated_key_format() {
        let (key, prefix) = generate_key();
        assert_eq!(key.len(), 74);
        assert!(looks_like_api_key(&key));
        assert!(is_lower_hex(&key[API_KEY_PREFIX.len()..], 64));
        assert_eq!(prefix.len(), API_KEY_PREFIX.len() + 8);
        assert!(key.starts_with(&prefix));
    }

    #[test]
    fn keys_are_unique() {
        let (a, _) = generate_key();
        let (b, _) = generate_key();
        assert_ne!(a, b);
        assert_ne!(sha256_hex(&a), sha256_hex(&b));
    }
}
