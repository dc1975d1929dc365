use axum::{
    Json,
    extract::{ConnectInfo, FromRequestParts, Path, Query, Request, State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, StatusCode, header, request::Parts},
    middleware::Next,
    response::Response,
};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::validation::payload;
use super::{ApiError, ApiResponse, AppState, AuthResponse, MessageResponse, SessionDto, UserDto};
use crate::db::ActivityEntry;
use crate::entities::{nodes, users};
use crate::services::api_key::looks_like_api_key;
use crate::services::{AuthError, Claims, ClientInfo, Registration, TokenPair};

pub const NEW_ACCESS_TOKEN_HEADER: &str = "x-new-access-token";
pub const NEW_REFRESH_TOKEN_HEADER: &str = "x-new-refresh-token";

// ============================================================================
// Principal
// ============================================================================

/// Who a request was authenticated as.
#[derive(Debug, Clone)]
pub enum Principal {
    Bearer { user: users::Model, claims: Claims },
    ApiKey { user: users::Model },
    Node(nodes::Model),
}

impl Principal {
    #[must_use]
    pub const fn user(&self) -> Option<&users::Model> {
        match self {
            Self::Bearer { user, .. } | Self::ApiKey { user } => Some(user),
            Self::Node(_) => None,
        }
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        match self {
            Self::Bearer { claims, .. } => Some(claims.session_id()),
            _ => None,
        }
    }
}

/// Tokens minted by a sliding refresh while handling this request.
#[derive(Debug, Clone)]
pub struct NewTokens(pub TokenPair);

/// The authenticated user, for handlers behind [`require_user`].
pub struct CurrentUser {
    pub user: users::Model,
    pub session_id: Option<String>,
    pub new_tokens: Option<TokenPair>,
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let principal = parts
            .extensions
            .get::<Principal>()
            .ok_or_else(|| ApiError::unauthorized("unauthorized"))?;
        let user = principal
            .user()
            .cloned()
            .ok_or_else(|| ApiError::unauthorized("unauthorized"))?;

        Ok(Self {
            user,
            session_id: principal.session_id().map(str::to_string),
            new_tokens: parts.extensions.get::<NewTokens>().map(|t| t.0.clone()),
        })
    }
}

/// The node behind [`require_node`].
pub struct CurrentNode(pub nodes::Model);

impl<S: Send + Sync> FromRequestParts<S> for CurrentNode {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        match parts.extensions.get::<Principal>() {
            Some(Principal::Node(node)) => Ok(Self(node.clone())),
            _ => Err(ApiError::unauthorized("unauthorized")),
        }
    }
}

impl FromRequestParts<Arc<AppState>> for ClientInfo {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("unknown")
            .to_string();

        Ok(Self {
            ip: state.config.server.proxy_trust.client_ip(&parts.headers, peer),
            user_agent,
        })
    }
}

// ============================================================================
// Middleware
// ============================================================================

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

pub fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|value| value.eq_ignore_ascii_case("websocket"))
}

/// `Authorization: Bearer <credential>`, or `?token=` on a WebSocket upgrade.
fn extract_credential(req: &Request) -> Option<String> {
    if let Some(token) = bearer_token(req.headers()) {
        return Some(token);
    }

    if is_websocket_upgrade(req.headers()) {
        return Query::<TokenQuery>::try_from_uri(req.uri())
            .ok()
            .and_then(|Query(q)| q.token)
            .filter(|token| !token.is_empty());
    }

    None
}

async fn authenticate_user(
    state: &AppState,
    credential: &str,
) -> Result<(Principal, Option<TokenPair>), ApiError> {
    if looks_like_api_key(credential) {
        let user = state.api_keys.validate(credential).await?;
        return Ok((Principal::ApiKey { user }, None));
    }

    let (claims, needs_refresh) = state.sessions.validate(credential).await?;
    let user = state
        .store
        .users()
        .get_by_id(claims.user_id())
        .await?
        .ok_or(AuthError::Revoked)?;

    let new_tokens = if needs_refresh && !user.is_banned {
        match state
            .sessions
            .refresh_by_session_id(claims.session_id(), &claims.rfp)
            .await
        {
            Ok(Some(tokens)) => {
                debug!(session_id = %claims.session_id(), "Sliding refresh issued");
                Some(tokens)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(session_id = %claims.session_id(), error = %e, "Sliding refresh failed");
                None
            }
        }
    } else {
        None
    };

    Ok((Principal::Bearer { user, claims }, new_tokens))
}

fn attach_new_tokens(response: &mut Response, tokens: &TokenPair) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&tokens.access_token) {
        headers.insert(NEW_ACCESS_TOKEN_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&tokens.refresh_token) {
        headers.insert(NEW_REFRESH_TOKEN_HEADER, value);
    }
}

/// Resolve a bearer access token or an API key to a user.
pub async fn require_user(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let credential =
        extract_credential(&request).ok_or_else(|| ApiError::unauthorized("Missing credentials"))?;

    let (principal, new_tokens) = authenticate_user(&state, &credential).await?;

    if let Some(user) = principal.user() {
        if user.is_banned {
            return Err(AuthError::Banned.into());
        }
        tracing::Span::current().record("user_id", user.id.as_str());
    }

    request.extensions_mut().insert(principal);
    if let Some(tokens) = &new_tokens {
        request.extensions_mut().insert(NewTokens(tokens.clone()));
    }

    let mut response = next.run(request).await;
    if let Some(tokens) = &new_tokens {
        attach_new_tokens(&mut response, tokens);
    }
    Ok(response)
}

/// Must run behind [`require_user`].
pub async fn require_admin(request: Request, next: Next) -> Result<Response, ApiError> {
    let is_admin = request
        .extensions()
        .get::<Principal>()
        .and_then(Principal::user)
        .map(|user| user.is_admin);

    match is_admin {
        Some(true) => Ok(next.run(request).await),
        Some(false) => Err(ApiError::forbidden("Admin access required")),
        None => Err(ApiError::unauthorized("unauthorized")),
    }
}

/// Resolve a `<token_id>.<secret>` node credential.
pub async fn require_node(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let credential =
        bearer_token(request.headers()).ok_or_else(|| ApiError::unauthorized("unauthorized"))?;

    let node = state.node_validator.validate(&credential).await?;
    debug!(node_id = %node.id, "Node authenticated");

    request.extensions_mut().insert(Principal::Node(node));
    Ok(next.run(request).await)
}

// ============================================================================
// Request/Response Types
// ============================================================================

#[derive(Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub username: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct LoginRequest {
    /// Email or username.
    #[serde(alias = "email", alias = "username")]
    pub login: String,
    pub password: String,
}

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

#[derive(Serialize)]
pub struct MeResponse {
    pub user: UserDto,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_tokens: Option<TokenPair>,
}

#[derive(Serialize)]
pub struct RevokedResponse {
    pub revoked: u64,
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<ApiResponse<AuthResponse>>), ApiError> {
    let input = payload(body)?;

    let (user, tokens) = state
        .accounts
        .register(
            Registration {
                email: input.email,
                username: input.username,
                password: input.password,
            },
            &client,
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(AuthResponse {
            user: user.into(),
            tokens,
        })),
    ))
}

/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<AuthResponse>>, ApiError> {
    let input = payload(body)?;
    if input.login.trim().is_empty() || input.password.is_empty() {
        return Err(ApiError::validation("Login and password are required"));
    }

    let (user, tokens) = state
        .accounts
        .login(&input.login, &input.password, &client)
        .await?;

    let mut response = ApiResponse::success(AuthResponse {
        user: UserDto::from(user.clone()),
        tokens,
    });
    if user.force_password_reset {
        response = response.with_notification("Your password must be changed");
    }
    Ok(Json(response))
}

/// POST /auth/refresh
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RefreshRequest>, JsonRejection>,
) -> Result<Json<ApiResponse<TokenPair>>, ApiError> {
    let input = payload(body)?;
    let tokens = state.sessions.refresh(input.refresh_token.trim()).await?;
    Ok(Json(ApiResponse::success(tokens)))
}

/// POST /auth/logout
pub async fn logout(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    let session_id = current
        .session_id
        .ok_or_else(|| ApiError::validation("Logout requires a session token"))?;

    state.sessions.logout(&session_id).await?;

    state
        .store
        .activity()
        .record(ActivityEntry {
            user_id: Some(current.user.id.clone()),
            action: "auth.logout",
            description: "Logged out".to_string(),
            ip: Some(client.ip),
            is_admin: current.user.is_admin,
            metadata: Some(serde_json::json!({ "session_id": session_id })),
        })
        .await?;

    Ok(Json(ApiResponse::success(MessageResponse::new("Logged out"))))
}

/// POST /auth/logout-all
pub async fn logout_all(
    State(state): State<Arc<AppState>>,
    client: ClientInfo,
    current: CurrentUser,
) -> Result<Json<ApiResponse<RevokedResponse>>, ApiError> {
    let revoked = state.sessions.logout_all(&current.user.id).await?;

    state
        .store
        .activity()
        .record(ActivityEntry {
            user_id: Some(current.user.id.clone()),
            action: "auth.logout_all",
            description: format!("Revoked {revoked} sessions"),
            ip: Some(client.ip),
            is_admin: current.user.is_admin,
            metadata: None,
        })
        .await?;

    Ok(Json(ApiResponse::success(RevokedResponse { revoked })))
}

/// GET /auth/me
pub async fn me(current: CurrentUser) -> Json<ApiResponse<MeResponse>> {
    Json(ApiResponse::success(MeResponse {
        user: current.user.into(),
        new_tokens: current.new_tokens,
    }))
}

/// GET /auth/sessions
pub async fn list_sessions(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
) -> Result<Json<ApiResponse<Vec<SessionDto>>>, ApiError> {
    let sessions = state.sessions.list(&current.user.id).await?;
    let current_session = current.session_id.as_deref();

    Ok(Json(ApiResponse::success(
        sessions
            .into_iter()
            .map(|session| SessionDto::new(session, current_session))
            .collect(),
    )))
}

/// DELETE /auth/sessions/{id}
pub async fn delete_session(
    State(state): State<Arc<AppState>>,
    current: CurrentUser,
    Path(session_id): Path<String>,
) -> Result<Json<ApiResponse<MessageResponse>>, ApiError> {
    state
        .sessions
        .revoke_session(&current.user.id, &session_id)
        .await?;
    Ok(Json(ApiResponse::success(MessageResponse::new("Session revoked"))))
}
