use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use std::fmt;

use super::ApiResponse;
use crate::agent::engine::EngineError;
use crate::protocol::PairingError;
use crate::services::{AuthError, NodeAuthError, NodeError};

#[derive(Debug)]
pub enum ApiError {
    Unauthorized(String),

    Forbidden(String),

    ValidationError(String),

    Conflict(String),

    NotFound(String),

    RequestTimeout(String),

    ExternalApiError { service: String, message: String },

    InternalError(String),
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unauthorized(msg) => write!(f, "Unauthorized: {msg}"),
            Self::Forbidden(msg) => write!(f, "Forbidden: {msg}"),
            Self::ValidationError(msg) => write!(f, "Validation error: {msg}"),
            Self::Conflict(msg) => write!(f, "Conflict: {msg}"),
            Self::NotFound(msg) => write!(f, "Not found: {msg}"),
            Self::RequestTimeout(msg) => write!(f, "Timeout: {msg}"),
            Self::ExternalApiError { service, message } => write!(f, "{service} error: {message}"),
            Self::InternalError(msg) => write!(f, "Internal error: {msg}"),
        }
    }
}

impl std::error::Error for ApiError {}

impl ApiError {
    #[must_use]
    pub const fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::RequestTimeout(_) => StatusCode::REQUEST_TIMEOUT,
            Self::ExternalApiError { .. } => StatusCode::BAD_GATEWAY,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::Unauthorized(msg.into())
    }

    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::InternalError(msg.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match self {
            Self::Unauthorized(msg)
            | Self::Forbidden(msg)
            | Self::ValidationError(msg)
            | Self::Conflict(msg)
            | Self::NotFound(msg)
            | Self::RequestTimeout(msg) => msg,
            Self::ExternalApiError { service, message } => {
                tracing::warn!("{} error: {}", service, message);
                format!("{service} error: {message}")
            }
            Self::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                "An internal error occurred".to_string()
            }
        };

        let body = ApiResponse::<()>::error(message);
        (status, Json(body)).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalError(format!("{err:#}"))
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Expired
            | AuthError::Malformed
            | AuthError::Revoked
            | AuthError::InvalidRefreshToken
            | AuthError::InvalidCredentials
            | AuthError::InvalidApiKey
            | AuthError::ApiKeyExpired => Self::Unauthorized(err.to_string()),
            AuthError::Banned => Self::Forbidden(err.to_string()),
            AuthError::Forbidden(msg) => Self::Forbidden(msg),
            AuthError::Validation(msg) => Self::ValidationError(msg),
            AuthError::Conflict(msg) => Self::Conflict(msg),
            AuthError::NotFound(msg) => Self::NotFound(msg),
            AuthError::Internal(e) => Self::from(e),
        }
    }
}

impl From<NodeAuthError> for ApiError {
    fn from(err: NodeAuthError) -> Self {
        match err {
            NodeAuthError::InvalidFormat | NodeAuthError::Unauthorized => {
                Self::Unauthorized(err.to_string())
            }
            NodeAuthError::Lookup(e) => Self::from(e),
        }
    }
}

impl From<PairingError> for ApiError {
    fn from(err: PairingError) -> Self {
        let message = err.to_string();
        match err {
            PairingError::NotActive => Self::Conflict(message),
            PairingError::Rejected => Self::Forbidden(message),
            PairingError::TimedOut => Self::RequestTimeout(message),
            PairingError::Persist(_) => Self::InternalError(message),
            PairingError::Invalid(_) => Self::ValidationError(message),
        }
    }
}

impl From<NodeError> for ApiError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::NotFound => Self::NotFound(err.to_string()),
            NodeError::Validation(msg) => Self::ValidationError(msg),
            NodeError::Pairing(e) => Self::from(e),
            NodeError::Unreachable(_) | NodeError::Agent(_) | NodeError::InvalidResponse => {
                Self::ExternalApiError {
                    service: "Node".to_string(),
                    message: err.to_string(),
                }
            }
            NodeError::Internal(e) => Self::from(e),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::NotFound(_) => Self::NotFound(err.to_string()),
            EngineError::NotInstalled
            | EngineError::InstallFailed(_)
            | EngineError::Unsupported(_) => Self::InternalError(err.to_string()),
            _ => Self::ExternalApiError {
                service: "Container engine".to_string(),
                message: err.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_follow_the_status_table() {
        let cases = [
            (AuthError::Expired, StatusCode::UNAUTHORIZED),
            (AuthError::InvalidApiKey, StatusCode::UNAUTHORIZED),
            (AuthError::Banned, StatusCode::FORBIDDEN),
            (AuthError::Forbidden("x".into()), StatusCode::FORBIDDEN),
            (AuthError::Validation("x".into()), StatusCode::BAD_REQUEST),
            (AuthError::Conflict("x".into()), StatusCode::CONFLICT),
            (AuthError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (
                AuthError::Internal(anyhow::anyhow!("db gone")),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];

        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status(), status);
        }
    }

    #[test]
    fn pairing_errors_keep_their_messages() {
        let err = ApiError::from(NodeError::Pairing(PairingError::Rejected));
        assert_eq!(err.status(), StatusCode::FORBIDDEN);
        assert!(matches!(err, ApiError::Forbidden(ref m) if m == "Pairing rejected by user"));

        let err = ApiError::from(NodeError::Pairing(PairingError::TimedOut));
        assert_eq!(err.status(), StatusCode::REQUEST_TIMEOUT);
    }

    #[test]
    fn engine_errors_map_to_gateway_or_not_found() {
        assert_eq!(
            ApiError::from(EngineError::NotFound("abc".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(EngineError::AttachFailed("closed".into())).status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
