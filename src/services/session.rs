//! Bearer access tokens, rotating refresh tokens and their session rows.
//!
//! Access tokens are HS256 JWTs naming the user and the session. Refresh
//! tokens are 256-bit random hex strings; only their SHA-256 digests are
//! stored. A rotation keeps the replaced digest as `previous_token_hash` for a
//! short grace period so one duplicate refresh (two tabs racing) still lands.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode, errors::ErrorKind,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::AuthConfig;
use crate::crypto::{random_hex, sha256_hex};
use crate::db::{NewSession, Store};
use crate::entities::sessions;
use crate::services::auth::AuthError;
use crate::services::worker::BackgroundWorker;

pub const REFRESH_TOKEN_BYTES: usize = 32;
pub const SESSION_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(60 * 60);

/// Attempts before a rotation that keeps losing the compare-and-set gives up.
const ROTATE_ATTEMPTS: usize = 3;

const REFRESH_FINGERPRINT_LEN: usize = 16;

/// Leading hex of a stored refresh digest, embedded in access tokens.
#[must_use]
pub fn refresh_fingerprint(token_hash: &str) -> String {
    token_hash.chars().take(REFRESH_FINGERPRINT_LEN).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// User id.
    pub sub: String,
    /// Session id.
    pub sid: String,
    pub iat: i64,
    pub exp: i64,
    /// Fingerprint of the refresh token digest this access token was issued
    /// alongside. Sliding refresh only rotates while the session still holds it.
    #[serde(default)]
    pub rfp: String,
}

impl Claims {
    #[must_use]
    pub fn user_id(&self) -> &str {
        &self.sub
    }

    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.sid
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub session_id: String,
    pub access_expires_at: DateTime<Utc>,
    pub refresh_expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub access_ttl: Duration,
    pub refresh_ttl: Duration,
    pub previous_token_grace: Duration,
    /// Fraction of the access lifetime, counted back from expiry, in which
    /// validation asks for a sliding refresh.
    pub refresh_window: f64,
}

impl From<&AuthConfig> for SessionSettings {
    fn from(config: &AuthConfig) -> Self {
        Self {
            access_ttl: Duration::seconds(i64::from(config.access_token_ttl_secs)),
            refresh_ttl: Duration::days(i64::from(config.refresh_token_ttl_days)),
            previous_token_grace: Duration::seconds(i64::from(config.previous_token_grace_secs)),
            refresh_window: config.refresh_window.clamp(0.0, 1.0),
        }
    }
}

pub struct SessionManager {
    store: Store,
    settings: SessionSettings,
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
    expirer: BackgroundWorker,
}

impl SessionManager {
    #[must_use]
    pub fn new(store: Store, secret: &SecretString, settings: SessionSettings) -> Self {
        let key = secret.expose_secret().as_bytes();
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);

        Self {
            store,
            settings,
            encoding: EncodingKey::from_secret(key),
            decoding: DecodingKey::from_secret(key),
            validation,
            expirer: BackgroundWorker::new("session_expirer", SESSION_SWEEP_INTERVAL),
        }
    }

    #[must_use]
    pub const fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub(crate) fn sign(&self, claims: &Claims) -> Result<String, AuthError> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| AuthError::Internal(anyhow::anyhow!("Failed to sign access token: {e}")))
    }

    fn token_pair(
        &self,
        user_id: &str,
        session_id: &str,
        refresh_token: String,
        refresh_expires_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<TokenPair, AuthError> {
        let access_expires_at = now + self.settings.access_ttl;
        let claims = Claims {
            sub: user_id.to_string(),
            sid: session_id.to_string(),
            iat: now.timestamp(),
            exp: access_expires_at.timestamp(),
            rfp: refresh_fingerprint(&sha256_hex(&refresh_token)),
        };

        Ok(TokenPair {
            access_token: self.sign(&claims)?,
            refresh_token,
            session_id: session_id.to_string(),
            access_expires_at,
            refresh_expires_at,
        })
    }

    /// Open a new session after a successful password check.
    pub async fn issue(
        &self,
        user_id: &str,
        ip: &str,
        user_agent: &str,
    ) -> Result<TokenPair, AuthError> {
        let now = Utc::now();
        let refresh_token = random_hex(REFRESH_TOKEN_BYTES);
        let refresh_expires_at = now + self.settings.refresh_ttl;

        let session = self
            .store
            .sessions()
            .create(
                NewSession {
                    user_id: user_id.to_string(),
                    refresh_token_hash: sha256_hex(&refresh_token),
                    ip: ip.to_string(),
                    user_agent: user_agent.to_string(),
                    expires_at: refresh_expires_at,
                },
                now,
            )
            .await?;

        debug!(user_id, session_id = %session.id, "Session issued");
        self.token_pair(user_id, &session.id, refresh_token, refresh_expires_at, now)
    }

    /// Check an access token against its signature, its expiry and the
    /// session it names. The flag is set inside the sliding-refresh window.
    pub async fn validate(&self, access_token: &str) -> Result<(Claims, bool), AuthError> {
        let claims = decode::<Claims>(access_token, &self.decoding, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Malformed,
            })?
            .claims;

        let now = Utc::now();
        let session = self
            .store
            .sessions()
            .get_by_id(&claims.sid)
            .await?
            .filter(|s| s.user_id == claims.sub && s.expires_at > now)
            .ok_or(AuthError::Revoked)?;

        let needs_refresh = self.in_refresh_window(&claims, now.timestamp());
        debug!(session_id = %session.id, needs_refresh, "Access token validated");
        Ok((claims, needs_refresh))
    }

    #[allow(clippy::cast_precision_loss)]
    fn in_refresh_window(&self, claims: &Claims, now: i64) -> bool {
        let lifetime = (claims.exp - claims.iat).max(1) as f64;
        let remaining = (claims.exp - now) as f64;
        remaining <= lifetime * self.settings.refresh_window
    }

    /// Exchange a refresh token for a new pair.
    ///
    /// Matches either the current or, within the grace period, the previous
    /// token of a live session. The swap itself is a compare-and-set on the
    /// current digest, retried if another rotation got there first.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let presented = sha256_hex(refresh_token);

        for _ in 0..ROTATE_ATTEMPTS {
            let now = Utc::now();
            let session = self
                .store
                .sessions()
                .find_by_token_hash(&presented, now)
                .await?
                .ok_or(AuthError::InvalidRefreshToken)?;

            if session.refresh_token_hash != presented && !self.within_grace(&session, now) {
                debug!(session_id = %session.id, "Stale refresh token outside grace period");
                return Err(AuthError::InvalidRefreshToken);
            }

            self.ensure_user_active(&session).await?;

            if let Some(pair) = self.try_rotate(&session, now).await? {
                return Ok(pair);
            }
            debug!(session_id = %session.id, "Lost rotation race, retrying");
        }

        warn!("Refresh token rotation kept conflicting");
        Err(AuthError::InvalidRefreshToken)
    }

    /// Rotate without a presented refresh token. Used by the auth gate for
    /// sliding refresh once the access token has been validated.
    ///
    /// `issued_with` is the access token's refresh fingerprint. If the session
    /// has rotated since that token was issued, nothing happens and `None` is
    /// returned, so parallel requests carrying one access token rotate at most
    /// once and the refresh token the client holds stays in its grace slot.
    pub async fn refresh_by_session_id(
        &self,
        session_id: &str,
        issued_with: &str,
    ) -> Result<Option<TokenPair>, AuthError> {
        let now = Utc::now();
        let session = self
            .store
            .sessions()
            .get_by_id(session_id)
            .await?
            .filter(|s| s.expires_at > now)
            .ok_or(AuthError::Revoked)?;

        if refresh_fingerprint(&session.refresh_token_hash) != issued_with {
            debug!(session_id, "Session rotated since this access token was issued");
            return Ok(None);
        }

        self.try_rotate(&session, now).await
    }

    fn within_grace(&self, session: &sessions::Model, now: DateTime<Utc>) -> bool {
        session
            .rotated_at
            .is_some_and(|rotated| now - rotated <= self.settings.previous_token_grace)
    }

    async fn ensure_user_active(&self, session: &sessions::Model) -> Result<(), AuthError> {
        match self.store.users().get_by_id(&session.user_id).await? {
            Some(user) if !user.is_banned => Ok(()),
            Some(_) => {
                self.store.sessions().delete(&session.id).await?;
                Err(AuthError::Banned)
            }
            None => {
                self.store.sessions().delete(&session.id).await?;
                Err(AuthError::Revoked)
            }
        }
    }

    async fn try_rotate(
        &self,
        session: &sessions::Model,
        now: DateTime<Utc>,
    ) -> Result<Option<TokenPair>, AuthError> {
        let refresh_token = random_hex(REFRESH_TOKEN_BYTES);
        let refresh_expires_at = now + self.settings.refresh_ttl;

        let swapped = self
            .store
            .sessions()
            .rotate(
                &session.id,
                &session.refresh_token_hash,
                &sha256_hex(&refresh_token),
                refresh_expires_at,
                now,
            )
            .await?;

        if !swapped {
            return Ok(None);
        }

        self.token_pair(
            &session.user_id,
            &session.id,
            refresh_token,
            refresh_expires_at,
            now,
        )
        .map(Some)
    }

    pub async fn logout(&self, session_id: &str) -> Result<bool, AuthError> {
        Ok(self.store.sessions().delete(session_id).await?)
    }

    pub async fn logout_all(&self, user_id: &str) -> Result<u64, AuthError> {
        let removed = self.store.sessions().delete_for_user(user_id).await?;
        info!(user_id, removed, "All sessions revoked");
        Ok(removed)
    }

    /// Delete one session, only if `user_id` owns it.
    pub async fn revoke_session(&self, user_id: &str, session_id: &str) -> Result<(), AuthError> {
        if self.store.sessions().delete_owned(user_id, session_id).await? {
            Ok(())
        } else {
            Err(AuthError::NotFound("Session not found".to_string()))
        }
    }

    pub async fn list(&self, user_id: &str) -> Result<Vec<sessions::Model>, AuthError> {
        Ok(self.store.sessions().list_for_user(user_id).await?)
    }

    pub async fn purge_expired(&self) -> Result<u64, AuthError> {
        Ok(self.store.sessions().delete_expired(Utc::now()).await?)
    }

    pub fn start_expirer(self: &Arc<Self>) -> bool {
        let weak = Arc::downgrade(self);
        self.expirer.start(move || {
            let weak = weak.clone();
            async move {
                let Some(manager) = weak.upgrade() else {
                    return;
                };
                match manager.purge_expired().await {
                    Ok(0) => {}
                    Ok(removed) => info!(event = "sessions_expired", removed, "Expired sessions removed"),
                    Err(e) => warn!(error = %e, "Failed to purge expired sessions"),
                }
            }
        })
    }

    pub async fn stop_expirer(&self) {
        self.expirer.stop().await;
    }
}
