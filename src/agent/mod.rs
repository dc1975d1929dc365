//! The node agent: pairing endpoint plus the container routes the panel
//! drives once paired.

pub mod auth;
pub mod engine;
pub mod heartbeat;
pub mod link;
pub mod pairing;
mod routes;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{
    Router, middleware,
    routing::{delete, get, post},
};
use tower_http::catch_panic::CatchPanicLayer;
use tracing::{error, info, warn};

use crate::api::observability;
use crate::config::AgentConfig;
use crate::protocol::SystemInfo;
use crate::services::NodeTokenValidator;
use auth::DaemonTokenLookup;
use engine::{ContainerEngine, DockerCli};
use heartbeat::HeartbeatReporter;
use link::AgentConfigStore;
use pairing::{OperatorPrompt, PairingManager, PairingState, StdinPrompt};

pub struct AgentState {
    pub config: Arc<AgentConfigStore>,

    pub engine: Arc<dyn ContainerEngine>,

    pub pairing: Arc<PairingManager>,

    pub validator: NodeTokenValidator<DaemonTokenLookup>,

    pub heartbeat: HeartbeatReporter,

    pub engine_version: Option<String>,
}

impl AgentState {
    /// `path` is where pairing saves the panel link; `None` keeps it in memory.
    pub fn new(
        config: AgentConfig,
        path: Option<PathBuf>,
        engine: Arc<dyn ContainerEngine>,
        prompt: Arc<dyn OperatorPrompt>,
        engine_version: Option<String>,
    ) -> anyhow::Result<Self> {
        let heartbeat = HeartbeatReporter::new(&config.heartbeat)?;
        let store = Arc::new(match path {
            Some(path) => AgentConfigStore::new(path, config),
            None => AgentConfigStore::in_memory(config),
        });

        Ok(Self {
            pairing: Arc::new(PairingManager::new(prompt, store.clone())),
            validator: NodeTokenValidator::new(DaemonTokenLookup::new(store.clone())),
            config: store,
            engine,
            heartbeat,
            engine_version,
        })
    }

    #[must_use]
    pub fn system_info(&self) -> SystemInfo {
        SystemInfo {
            hostname: hostname(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            cpu_count: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            engine_version: self.engine_version.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn router(state: Arc<AgentState>) -> Router {
    let panel_routes = Router::new()
        .route("/api/system", get(routes::system))
        .route("/api/containers", post(routes::create_container))
        .route("/api/containers/lookup/{name}", get(routes::lookup))
        .route("/api/containers/{id}", delete(routes::remove))
        .route("/api/containers/{id}/power", post(routes::power))
        .route("/api/containers/{id}/command", post(routes::command))
        .route("/api/containers/{id}/logs", get(routes::logs))
        .route("/api/containers/{id}/stats", get(routes::stats))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_panel,
        ));

    Router::new()
        .route("/api/pair", post(routes::pair))
        .merge(panel_routes)
        .with_state(state)
        .layer(CatchPanicLayer::custom(observability::handle_panic))
        .layer(middleware::from_fn(observability::logging_middleware))
}

async fn log_pairing_outcome(state: Arc<AgentState>) {
    let mut status = state.pairing.subscribe();
    match status
        .wait_for(|s| matches!(s, PairingState::Settled(_)))
        .await
    {
        Ok(settled) => info!(event = "pairing_settled", outcome = ?*settled, "Pairing window closed"),
        Err(e) => warn!(error = %e, "Pairing status channel closed"),
    }
}

/// Run the agent until Ctrl+C. With `pair_window`, pairing is armed for that
/// long right after startup.
pub async fn run_agent(path: &Path, pair_window: Option<Duration>) -> anyhow::Result<()> {
    let config = AgentConfig::load_from_path(path)?;
    config.validate()?;

    info!("Birdactyl agent v{} starting...", env!("CARGO_PKG_VERSION"));

    let engine = Arc::new(DockerCli::new(&config.engine));
    let engine_version = engine
        .init()
        .await
        .context("Container engine is not usable")?;

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let heartbeat_enabled = config.heartbeat.enabled;

    let state = Arc::new(AgentState::new(
        config,
        Some(path.to_path_buf()),
        engine,
        Arc::new(StdinPrompt::spawn()),
        Some(engine_version),
    )?);

    if heartbeat_enabled {
        state.heartbeat.start(Arc::downgrade(&state));
    }

    if let Some(window) = pair_window {
        state.pairing.arm(window);
        tokio::spawn(log_pairing_outcome(state.clone()));
    } else if !state.config.panel().await.is_paired() {
        warn!("Agent is not paired; run `birdactyl agent pair` to pair it with a panel");
    }

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Agent listening on {}", addr);

    let app = router(state.clone());
    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(crate::shutdown_signal())
    .await
    {
        error!("Agent server error: {}", e);
    }

    state.heartbeat.stop().await;
    info!("Agent stopped");
    Ok(())
}
