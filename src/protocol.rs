//! Bodies exchanged between the panel and the agent.

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Panel → agent: start the handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairRequest {
    pub panel_url: String,
    pub code: String,
    /// Credential the panel will present on later calls to this agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daemon_token: Option<String>,
}

/// Agent → panel reply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PairResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PairResponse {
    #[must_use]
    pub const fn accepted(token_id: String, token: String) -> Self {
        Self {
            success: true,
            token_id: Some(token_id),
            token: Some(token),
            error: None,
        }
    }

    #[must_use]
    pub fn failed(error: &PairingError) -> Self {
        Self {
            success: false,
            token_id: None,
            token: None,
            error: Some(error.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PairingError {
    #[error("Pairing mode not active")]
    NotActive,

    #[error("Pairing rejected by user")]
    Rejected,

    #[error("Pairing request timed out")]
    TimedOut,

    #[error("Failed to save pairing: {0}")]
    Persist(String),

    #[error("Invalid pairing request: {0}")]
    Invalid(String),
}

impl PairingError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::NotActive => StatusCode::CONFLICT,
            Self::Rejected => StatusCode::FORBIDDEN,
            Self::TimedOut => StatusCode::REQUEST_TIMEOUT,
            Self::Persist(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Invalid(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// Recover the kind from an agent's error message.
    #[must_use]
    pub fn from_message(message: &str) -> Option<Self> {
        [Self::NotActive, Self::Rejected, Self::TimedOut]
            .into_iter()
            .find(|kind| kind.to_string() == message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub hostname: String,
    pub os: String,
    pub arch: String,
    pub cpu_count: usize,
    #[serde(default)]
    pub engine_version: Option<String>,
    pub agent_version: String,
}

/// Agent → panel liveness report, authenticated with the node token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub system: SystemInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairing_errors_round_trip_through_messages() {
        assert_eq!(
            PairingError::from_message("Pairing mode not active"),
            Some(PairingError::NotActive)
        );
        assert_eq!(
            PairingError::from_message("Pairing rejected by user"),
            Some(PairingError::Rejected)
        );
        assert_eq!(
            PairingError::from_message("Pairing request timed out"),
            Some(PairingError::TimedOut)
        );
        assert_eq!(PairingError::from_message("something else"), None);
    }

    #[test]
    fn failed_response_omits_token_fields() {
        let json = serde_json::to_value(PairResponse::failed(&PairingError::NotActive)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "success": false, "error": "Pairing mode not active" })
        );
    }
}
