use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::ratelimit::{ProxyTrust, RateLimitPolicy};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub general: GeneralConfig,

    pub server: ServerConfig,

    pub auth: AuthConfig,

    pub registration: RegistrationConfig,

    pub rate_limit: RateLimitConfig,

    pub security: SecurityConfig,

    pub nodes: NodesConfig,

    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    pub database_path: String,

    pub log_level: String,

    /// "pretty" or "json"
    pub log_format: String,

    /// Also append log lines to this file when set.
    pub log_file: Option<String>,

    /// Number of tokio worker threads (default: 2)
    /// Set to 0 to use the number of CPU cores
    pub worker_threads: usize,

    pub max_db_connections: u32,

    pub min_db_connections: u32,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            database_path: "sqlite:data/birdactyl.db".to_string(),
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
            worker_threads: 2,
            max_db_connections: 5,
            min_db_connections: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,

    pub port: u16,

    /// Address agents are told to reach the panel on during pairing.
    pub public_url: String,

    pub cors_allowed_origins: Vec<String>,

    /// Which forwarding headers are trusted for the client address.
    pub proxy_trust: ProxyTrust,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8080,
            public_url: "http://localhost:8080".to_string(),
            cors_allowed_origins: vec![
                "http://localhost:8080".to_string(),
                "http://127.0.0.1:8080".to_string(),
            ],
            proxy_trust: ProxyTrust::None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// HS256 signing key for access tokens. A random key is generated at
    /// startup when empty, which logs everyone out on restart.
    pub jwt_secret: String,

    pub access_token_ttl_secs: u32,

    pub refresh_token_ttl_days: u32,

    /// How long a rotated-out refresh token keeps working.
    pub previous_token_grace_secs: u32,

    /// Final fraction of the access token lifetime in which the gate rotates
    /// the session on the caller's behalf.
    pub refresh_window: f64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            access_token_ttl_secs: 15 * 60,
            refresh_token_ttl_days: 7,
            previous_token_grace_secs: 60,
            refresh_window: 0.2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub enabled: bool,

    /// Accounts allowed per source IP inside the window. 0 disables the cap.
    pub max_per_ip: u32,

    pub ip_window_hours: u32,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_ip: 3,
            ip_window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,

    /// Applied to every API route.
    pub global: RateLimitPolicy,

    /// Stacked on login, register and refresh.
    pub auth: RateLimitPolicy,

    pub bucket_expiry_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            global: RateLimitPolicy::new(300, 60),
            auth: RateLimitPolicy::new(10, 5),
            bucket_expiry_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Argon2 memory cost in KiB
    pub argon2_memory_cost_kib: u32,

    /// Argon2 time cost (iterations)
    pub argon2_time_cost: u32,

    pub argon2_parallelism: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            argon2_memory_cost_kib: 19 * 1024,
            argon2_time_cost: 2,
            argon2_parallelism: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodesConfig {
    /// Nodes silent for longer than this are marked offline.
    pub heartbeat_timeout_secs: u64,

    pub heartbeat_check_interval_secs: u64,

    /// Upper bound on a pairing request, including the operator's answer.
    pub pairing_request_timeout_secs: u64,
}

impl Default for NodesConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: 90,
            heartbeat_check_interval_secs: 30,
            pairing_request_timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,

    pub loki_enabled: bool,

    pub loki_url: String,

    pub loki_labels: HashMap<String, String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        let mut labels = HashMap::new();
        labels.insert("app".to_string(), "birdactyl".to_string());

        Self {
            metrics_enabled: true,
            loki_enabled: false,
            loki_url: "http://localhost:3100".to_string(),
            loki_labels: labels,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let paths = config_paths("config.toml");

        for path in &paths {
            if path.exists() {
                info!("Loading config from: {}", path.display());
                return Self::load_from_path(path);
            }
        }

        info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        read_toml(path)
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        write_toml(self, path)
    }

    pub fn create_default_if_missing() -> Result<bool> {
        create_default_at(&Self::default(), Path::new("config.toml"))
    }

    pub fn validate(&self) -> Result<()> {
        validate_log_format(&self.general.log_format)?;

        if !self.auth.jwt_secret.is_empty() && self.auth.jwt_secret.len() < 32 {
            anyhow::bail!("auth.jwt_secret must be at least 32 bytes");
        }

        if self.auth.access_token_ttl_secs == 0 || self.auth.refresh_token_ttl_days == 0 {
            anyhow::bail!("Token lifetimes must be > 0");
        }

        if !(0.0..=1.0).contains(&self.auth.refresh_window) {
            anyhow::bail!("auth.refresh_window must be between 0 and 1");
        }

        if self.registration.max_per_ip > 0 && self.registration.ip_window_hours == 0 {
            anyhow::bail!("registration.ip_window_hours must be > 0 when max_per_ip is set");
        }

        if self.rate_limit.enabled
            && (self.rate_limit.global.burst == 0 || self.rate_limit.auth.burst == 0)
        {
            anyhow::bail!("Rate limit burst must be > 0");
        }

        if self.nodes.heartbeat_timeout_secs == 0 {
            anyhow::bail!("nodes.heartbeat_timeout_secs must be > 0");
        }

        url::Url::parse(&self.server.public_url).context("Invalid server.public_url")?;

        Ok(())
    }
}

/// Settings of the node agent, kept in `agent.toml`. Pairing writes the
/// panel section back to the same file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub general: AgentGeneralConfig,

    pub server: AgentServerConfig,

    pub panel: PanelLinkConfig,

    pub engine: EngineConfig,

    pub heartbeat: HeartbeatConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentGeneralConfig {
    pub log_level: String,

    pub log_format: String,

    pub log_file: Option<String>,

    pub worker_threads: usize,
}

impl Default for AgentGeneralConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: "pretty".to_string(),
            log_file: None,
            worker_threads: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentServerConfig {
    pub bind: String,

    pub port: u16,
}

impl Default for AgentServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 8443,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PanelLinkConfig {
    pub url: Option<String>,

    /// `<token_id>.<secret>` presented to the panel.
    pub token: Option<String>,

    /// Credential the panel presents to this agent.
    pub daemon_token: Option<String>,
}

impl PanelLinkConfig {
    #[must_use]
    pub const fn is_paired(&self) -> bool {
        self.url.is_some() && self.token.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Container engine CLI.
    pub binary: String,

    /// Install the engine through the system package manager if missing.
    pub auto_install: bool,

    pub ping_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            binary: "docker".to_string(),
            auto_install: true,
            ping_timeout_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    pub enabled: bool,

    pub interval_secs: u64,

    pub request_timeout_secs: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 30,
            request_timeout_secs: 10,
        }
    }
}

impl AgentConfig {
    pub const FILE_NAME: &'static str = "agent.toml";

    /// First existing `agent.toml` on the search path, or the local one.
    #[must_use]
    pub fn locate() -> PathBuf {
        config_paths(Self::FILE_NAME)
            .into_iter()
            .find(|path| path.exists())
            .unwrap_or_else(|| PathBuf::from(Self::FILE_NAME))
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading agent config from: {}", path.display());
            read_toml(path)
        } else {
            info!("No agent config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        write_toml(self, path)
    }

    pub fn create_default_if_missing() -> Result<bool> {
        create_default_at(&Self::default(), Path::new(Self::FILE_NAME))
    }

    pub fn validate(&self) -> Result<()> {
        validate_log_format(&self.general.log_format)?;

        if let Some(url) = &self.panel.url {
            url::Url::parse(url).context("Invalid panel.url")?;
        }

        if self.heartbeat.enabled && self.heartbeat.interval_secs == 0 {
            anyhow::bail!("heartbeat.interval_secs must be > 0");
        }

        Ok(())
    }
}

fn validate_log_format(format: &str) -> Result<()> {
    match format {
        "pretty" | "json" => Ok(()),
        other => anyhow::bail!("Unknown log format '{other}', expected 'pretty' or 'json'"),
    }
}

fn config_paths(file_name: &str) -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from(file_name)];

    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("birdactyl").join(file_name));
    }

    if let Some(home) = dirs::home_dir() {
        paths.push(home.join(".birdactyl").join(file_name));
    }

    paths
}

fn read_toml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

fn write_toml<T: Serialize>(value: &T, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(value)?;
    std::fs::write(path, content)
        .with_context(|| format!("Failed to write config file: {}", path.display()))?;
    info!("Config saved to: {}", path.display());
    Ok(())
}

fn create_default_at<T: Serialize>(value: &T, path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    write_toml(value, path)?;
    info!("Created default config file: {}", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.auth.previous_token_grace_secs, 60);
        assert_eq!(config.registration.max_per_ip, 3);
        assert_eq!(config.registration.ip_window_hours, 24);
        assert_eq!(config.server.proxy_trust, ProxyTrust::None);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string_pretty(&config).unwrap();
        assert!(toml_str.contains("[general]"));
        assert!(toml_str.contains("[auth]"));
        assert!(toml_str.contains("[rate_limit.global]"));
    }

    #[test]
    fn test_config_deserialization() {
        let toml_str = r#"
            [general]
            log_level = "debug"

            [server]
            proxy_trust = "cloudflare"

            [rate_limit.auth]
            requests_per_minute = 6
            burst = 2
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.general.log_level, "debug");
        assert_eq!(config.server.proxy_trust, ProxyTrust::Cloudflare);
        assert_eq!(config.rate_limit.auth.requests_per_minute, 6);
        assert!(!config.rate_limit.auth.skip_failed);
        assert_eq!(config.rate_limit.global.burst, 60);
    }

    #[test]
    fn test_validate_rejects_short_secret() {
        let mut config = Config::default();
        config.auth.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_agent_config_round_trip() {
        let dir = std::env::temp_dir().join(format!("birdactyl-agent-{}", uuid::Uuid::new_v4()));
        let path = dir.join("agent.toml");

        let mut config = AgentConfig::default();
        assert!(!config.panel.is_paired());
        config.panel.url = Some("https://panel.example.com".to_string());
        config.panel.token = Some("abc.def".to_string());
        config.save_to_path(&path).unwrap();

        let loaded = AgentConfig::load_from_path(&path).unwrap();
        assert!(loaded.panel.is_paired());
        assert_eq!(loaded.panel.token.as_deref(), Some("abc.def"));
        assert_eq!(loaded.engine.binary, "docker");

        std::fs::remove_dir_all(dir).ok();
    }
}
