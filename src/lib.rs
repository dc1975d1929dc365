pub mod agent;
pub mod api;
pub mod cli;
pub mod config;
pub mod crypto;
pub mod db;
pub mod entities;
pub mod protocol;
pub mod ratelimit;
pub mod services;

use std::net::SocketAddr;
use std::path::Path;

use anyhow::Context;
use cli::{AgentCommands, Cli, Commands, UserCommands};
pub use config::{AgentConfig, Config};
use config::ObservabilityConfig;
use metrics_exporter_prometheus::PrometheusHandle;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Where and how log lines go. Shared by the panel and the agent.
pub struct LogSettings<'a> {
    pub level: &'a str,
    pub format: &'a str,
    pub file: Option<&'a str>,
    pub observability: Option<&'a ObservabilityConfig>,
}

impl<'a> LogSettings<'a> {
    #[must_use]
    pub fn panel(config: &'a Config) -> Self {
        Self {
            level: &config.general.log_level,
            format: &config.general.log_format,
            file: config.general.log_file.as_deref(),
            observability: Some(&config.observability),
        }
    }

    #[must_use]
    pub fn agent(config: &'a AgentConfig) -> Self {
        Self {
            level: &config.general.log_level,
            format: &config.general.log_format,
            file: config.general.log_file.as_deref(),
            observability: None,
        }
    }
}

fn fmt_layer<W>(format: &str, writer: W, ansi: bool) -> Box<dyn Layer<Registry> + Send + Sync>
where
    W: for<'w> tracing_subscriber::fmt::MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi);
    if format == "json" {
        layer.json().boxed()
    } else {
        layer.boxed()
    }
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
pub fn init_tracing(settings: &LogSettings<'_>) -> anyhow::Result<()> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(settings.level));

    let mut layers = vec![fmt_layer(settings.format, std::io::stdout, true)];

    if let Some(path) = settings.file {
        if let Some(parent) = Path::new(path).parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {path}"))?;
        layers.push(fmt_layer(settings.format, std::sync::Mutex::new(file), false));
    }

    let mut loki_url = None;
    if let Some(observability) = settings.observability
        && observability.loki_enabled
    {
        let url = url::Url::parse(&observability.loki_url).context("Invalid Loki URL")?;

        let mut builder = tracing_loki::builder();
        for (key, value) in &observability.loki_labels {
            builder = builder.label(key.as_str(), value.as_str())?;
        }
        let (layer, task) = builder.build_url(url)?;

        tokio::spawn(task);
        layers.push(layer.boxed());
        loki_url = Some(observability.loki_url.clone());
    }

    tracing_subscriber::registry()
        .with(layers)
        .with(env_filter)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    if let Some(url) = loki_url {
        info!("Loki logging initialized at {}", url);
    }
    Ok(())
}

fn install_metrics(enabled: bool) -> anyhow::Result<Option<PrometheusHandle>> {
    if !enabled {
        return Ok(None);
    }

    use metrics_exporter_prometheus::PrometheusBuilder;
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .context("Failed to install Prometheus recorder")?;
    Ok(Some(handle))
}

fn load_panel_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load()?,
    };
    config.validate()?;
    Ok(config)
}

/// Tokio worker threads for the command about to run. 0 means one per core.
#[must_use]
pub fn worker_threads(cli: &Cli) -> usize {
    match &cli.command {
        Commands::Agent { .. } => {
            let path = cli.config.clone().unwrap_or_else(AgentConfig::locate);
            AgentConfig::load_from_path(&path).map_or(0, |c| c.general.worker_threads)
        }
        _ => load_panel_config(cli.config.as_deref()).map_or(0, |c| c.general.worker_threads),
    }
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Panel => {
            let config = load_panel_config(cli.config.as_deref())?;
            let prometheus_handle = install_metrics(config.observability.metrics_enabled)?;
            init_tracing(&LogSettings::panel(&config))?;
            run_panel(config, prometheus_handle).await
        }

        Commands::Agent { command } => {
            let path = cli.config.unwrap_or_else(AgentConfig::locate);
            let config = AgentConfig::load_from_path(&path)?;
            init_tracing(&LogSettings::agent(&config))?;

            match command {
                AgentCommands::Run => agent::run_agent(&path, None).await,
                AgentCommands::Pair { duration } => agent::run_agent(&path, Some(duration)).await,
            }
        }

        Commands::Init => cli::cmd_init(),

        Commands::User {
            command:
                UserCommands::Create {
                    email,
                    username,
                    password,
                    admin,
                },
        } => {
            let config = load_panel_config(cli.config.as_deref())?;
            init_tracing(&LogSettings::panel(&config))?;
            cli::cmd_user_create(&config, email, username, password, admin).await
        }
    }
}

async fn run_panel(config: Config, prometheus_handle: Option<PrometheusHandle>) -> anyhow::Result<()> {
    info!("Birdactyl panel v{} starting...", env!("CARGO_PKG_VERSION"));

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let state = api::create_app_state(config, prometheus_handle).await?;
    state.start_workers();

    let app = api::router(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("🌐 Panel API running at http://{}", addr);

    if let Err(e) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    {
        error!("Web server error: {}", e);
    }

    state.stop_workers().await;
    info!("Panel stopped");
    Ok(())
}

pub(crate) async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Error listening for shutdown: {}", e),
    }
}
