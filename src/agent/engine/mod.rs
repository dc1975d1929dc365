//! Container engine façade.
//!
//! Routes and the heartbeat only talk to [`ContainerEngine`]; the concrete
//! engine is the Docker CLI driven through `tokio::process`.

mod docker;
pub mod install;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use docker::DockerCli;

/// stdout and stderr lines, timestamped by the engine.
pub type LogStream = BoxStream<'static, std::io::Result<String>>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Container engine is not installed")]
    NotInstalled,

    #[error("Container engine install failed: {0}")]
    InstallFailed(String),

    #[error("Container engine unreachable: {0}")]
    Unreachable(String),

    #[error("Image pull failed: {0}")]
    PullFailed(String),

    #[error("Container create failed: {0}")]
    CreateFailed(String),

    #[error("Container not found: {0}")]
    NotFound(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Failed to decode engine output: {0}")]
    DecodeFailed(String),

    #[error("Failed to attach to container stdin: {0}")]
    AttachFailed(String),

    #[error("Automatic engine install is not supported here: {0}")]
    Unsupported(String),
}

impl EngineError {
    /// Stable machine-readable kind.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotInstalled => "not_installed",
            Self::InstallFailed(_) => "install_failed",
            Self::Unreachable(_) => "unreachable",
            Self::PullFailed(_) => "pull_failed",
            Self::CreateFailed(_) => "create_failed",
            Self::NotFound(_) => "not_found",
            Self::Engine(_) => "engine_error",
            Self::DecodeFailed(_) => "decode_failed",
            Self::AttachFailed(_) => "attach_failed",
            Self::Unsupported(_) => "unsupported",
        }
    }
}

/// What runs inside the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    pub image: String,
    pub env: BTreeMap<String, String>,
    pub cmd: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PortBinding {
    pub host_port: u16,
    pub container_port: u16,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_string()
}

/// How the host constrains and wires the container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    pub memory_mib: Option<u64>,
    /// 100 = one full core.
    pub cpu_percent: Option<u32>,
    pub ports: Vec<PortBinding>,
    /// `host_path:container_path[:ro]`
    pub binds: Vec<String>,
    pub restart_policy: Option<String>,
}

/// One-shot resource snapshot.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ContainerStats {
    pub id: String,
    pub name: String,
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub memory_usage: String,
    pub net_io: String,
    pub block_io: String,
    pub pids: u64,
}

#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Make sure the engine is installed and answering. Returns its version.
    async fn init(&self) -> Result<String, EngineError>;

    async fn pull_image(&self, image: &str) -> Result<(), EngineError>;

    async fn image_exists(&self, image: &str) -> bool;

    async fn create(
        &self,
        name: &str,
        config: &ContainerConfig,
        host: &HostConfig,
    ) -> Result<String, EngineError>;

    async fn start(&self, id: &str) -> Result<(), EngineError>;

    async fn stop(&self, id: &str, timeout_secs: u32) -> Result<(), EngineError>;

    async fn kill(&self, id: &str) -> Result<(), EngineError>;

    async fn restart(&self, id: &str, timeout_secs: u32) -> Result<(), EngineError>;

    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError>;

    async fn exists(&self, name: &str) -> bool;

    async fn id_of(&self, name: &str) -> Result<String, EngineError>;

    async fn logs(&self, id: &str, tail: Option<u32>, follow: bool)
    -> Result<LogStream, EngineError>;

    async fn stats(&self, id: &str) -> Result<ContainerStats, EngineError>;

    /// Write `line` plus a newline to the container's stdin.
    async fn send_stdin(&self, id: &str, line: &str) -> Result<(), EngineError>;
}

/// Engines report names with a leading `/`.
#[must_use]
pub fn normalize_name(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_leading_slash_only_once() {
        assert_eq!(normalize_name("/mc-1"), "mc-1");
        assert_eq!(normalize_name("mc-1"), "mc-1");
        assert_eq!(normalize_name("//mc-1"), "/mc-1");
    }

    #[test]
    fn kinds_are_stable() {
        assert_eq!(EngineError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(EngineError::Engine("x".into()).kind(), "engine_error");
        assert_eq!(EngineError::Unsupported("x".into()).kind(), "unsupported");
    }

    #[test]
    fn port_protocol_defaults_to_tcp() {
        let port: PortBinding =
            serde_json::from_str(r#"{"host_port":25565,"container_port":25565}"#).unwrap();
        assert_eq!(port.protocol, "tcp");
    }
}
