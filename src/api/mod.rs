use axum::{
    Router,
    http::HeaderValue,
    middleware,
    routing::{delete, get, post},
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};

use crate::config::Config;
use crate::crypto::random_hex;
use crate::db::Store;
use crate::ratelimit::{MAX_BUCKETS_PER_SHARD, RateLimitGuard, RateLimiter, rate_limit};
use crate::services::{
    AccountService, ApiKeyService, NodeService, NodeTokenValidator, PasswordHasherService,
    SessionManager, SessionSettings, StoreNodeLookup,
};

mod admin;
mod api_keys;
pub mod auth;
mod error;
mod nodes;
pub mod observability;
mod types;
pub mod validation;

pub use auth::{CurrentNode, CurrentUser, NewTokens, Principal};
pub use error::ApiError;
pub use types::*;

use metrics_exporter_prometheus::PrometheusHandle;
use secrecy::SecretString;

pub struct AppState {
    pub config: Config,

    pub store: Store,

    pub sessions: Arc<SessionManager>,

    pub accounts: AccountService,

    pub api_keys: ApiKeyService,

    pub nodes: Arc<NodeService>,

    pub node_validator: NodeTokenValidator<StoreNodeLookup>,

    pub limiter: Arc<RateLimiter>,

    pub start_time: std::time::Instant,

    pub prometheus_handle: Option<PrometheusHandle>,
}

impl AppState {
    /// Start the rate-limit sweeper, session expirer and heartbeat checker.
    pub fn start_workers(&self) {
        self.limiter.start_sweeper();
        self.sessions.start_expirer();
        self.nodes.start_heartbeat_checker();
    }

    pub async fn stop_workers(&self) {
        self.limiter.stop_sweeper().await;
        self.sessions.stop_expirer().await;
        self.nodes.stop_heartbeat_checker().await;
    }
}

fn jwt_secret(config: &Config) -> SecretString {
    if config.auth.jwt_secret.is_empty() {
        warn!("auth.jwt_secret is not set, using a random key; sessions will not survive a restart");
        SecretString::from(random_hex(32))
    } else {
        SecretString::from(config.auth.jwt_secret.clone())
    }
}

pub async fn create_app_state(
    config: Config,
    prometheus_handle: Option<PrometheusHandle>,
) -> anyhow::Result<Arc<AppState>> {
    let store = Store::with_pool_options(
        &config.general.database_path,
        config.general.max_db_connections,
        config.general.min_db_connections,
    )
    .await?;

    let sessions = Arc::new(SessionManager::new(
        store.clone(),
        &jwt_secret(&config),
        SessionSettings::from(&config.auth),
    ));

    let accounts = AccountService::new(
        store.clone(),
        PasswordHasherService::new(config.security.clone()),
        sessions.clone(),
        config.registration.clone(),
    );

    let nodes = Arc::new(NodeService::new(
        store.clone(),
        config.server.public_url.clone(),
        config.nodes.clone(),
    )?);

    let limiter = Arc::new(RateLimiter::with_limits(
        MAX_BUCKETS_PER_SHARD,
        Duration::from_secs(config.rate_limit.bucket_expiry_secs),
    ));

    Ok(Arc::new(AppState {
        api_keys: ApiKeyService::new(store.clone()),
        node_validator: NodeTokenValidator::new(StoreNodeLookup::new(store.clone())),
        config,
        store,
        sessions,
        accounts,
        nodes,
        limiter,
        start_time: std::time::Instant::now(),
        prometheus_handle,
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    let rate_limit_config = state.config.rate_limit.clone();
    let proxy_trust = state.config.server.proxy_trust;

    let mut auth_routes = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/auth/refresh", post(auth::refresh));

    if rate_limit_config.enabled {
        let guard = RateLimitGuard::new(state.limiter.clone(), rate_limit_config.auth, proxy_trust);
        auth_routes = auth_routes.route_layer(middleware::from_fn_with_state(guard, rate_limit));
    }

    let user_routes = Router::new()
        .route("/auth/logout", post(auth::logout))
        .route("/auth/logout-all", post(auth::logout_all))
        .route("/auth/me", get(auth::me))
        .route("/auth/sessions", get(auth::list_sessions))
        .route("/auth/sessions/{id}", delete(auth::delete_session))
        .route("/auth/api-keys", get(api_keys::list_api_keys))
        .route("/auth/api-keys", post(api_keys::create_api_key))
        .route("/auth/api-keys/{id}", delete(api_keys::delete_api_key))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_user,
        ));

    let admin_routes = Router::new()
        .route("/metrics", get(observability::get_metrics))
        .route("/admin/nodes", get(admin::list_nodes))
        .route("/admin/nodes", post(admin::create_node))
        .route("/admin/nodes/{id}/pair", post(admin::pair_node))
        .route("/admin/ip-bans", get(admin::list_ip_bans))
        .route("/admin/ip-bans", post(admin::create_ip_ban))
        .route("/admin/ip-bans/{id}", delete(admin::delete_ip_ban))
        .route("/admin/users/{id}/ban", post(admin::ban_user))
        .route("/admin/users/{id}/unban", post(admin::unban_user))
        .route("/admin/users/{id}", delete(admin::delete_user))
        .route("/admin/activity", get(admin::list_activity))
        .route_layer(middleware::from_fn(auth::require_admin))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_user,
        ));

    let node_routes = Router::new()
        .route("/nodes/heartbeat", post(nodes::heartbeat))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_node,
        ));

    let mut api_router = Router::new()
        .route("/health", get(observability::health))
        .merge(auth_routes)
        .merge(user_routes)
        .merge(admin_routes)
        .merge(node_routes)
        .with_state(state.clone());

    if rate_limit_config.enabled {
        let guard = RateLimitGuard::new(state.limiter.clone(), rate_limit_config.global, proxy_trust);
        api_router = api_router.layer(middleware::from_fn_with_state(guard, rate_limit));
    }

    let cors_origins = &state.config.server.cors_allowed_origins;
    let cors_layer = if cors_origins.iter().any(|origin| origin == "*") {
        CorsLayer::new().allow_origin(Any)
    } else {
        let origins: Vec<HeaderValue> =
            cors_origins.iter().filter_map(|s| s.parse().ok()).collect();
        CorsLayer::new().allow_origin(origins)
    };

    info!(
        rate_limit = rate_limit_config.enabled,
        proxy_trust = ?proxy_trust,
        "API router built"
    );

    Router::new()
        .nest("/api", api_router)
        .layer(CatchPanicLayer::custom(observability::handle_panic))
        .layer(cors_layer.allow_methods(Any).allow_headers(Any))
        .layer(middleware::from_fn(observability::security_headers_middleware))
        .layer(middleware::from_fn(observability::logging_middleware))
}
