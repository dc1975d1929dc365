use std::ffi::OsStr;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use serde::Deserialize;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::{
    ContainerConfig, ContainerEngine, ContainerStats, EngineError, HostConfig, LogStream, install,
    normalize_name,
};
use crate::config::EngineConfig;

/// Time the engine gets to forward stdin before the attach is torn down.
const STDIN_SETTLE: Duration = Duration::from_millis(100);

#[derive(Debug, Error)]
enum CliError {
    #[error("engine binary not found")]
    Missing,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl CliError {
    /// Map a failure on an existing container into `not_found` or `engine_error`.
    fn for_container(self, id: &str) -> EngineError {
        match self {
            Self::Missing => EngineError::NotInstalled,
            Self::Failed(msg) if msg.contains("No such container") || msg.contains("No such object") => {
                EngineError::NotFound(id.to_string())
            }
            other => EngineError::Engine(other.to_string()),
        }
    }
}

/// Drives the `docker` CLI.
pub struct DockerCli {
    binary: String,
    auto_install: bool,
    ping_timeout: Duration,
}

impl DockerCli {
    #[must_use]
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            binary: config.binary.clone(),
            auto_install: config.auto_install,
            ping_timeout: Duration::from_secs(config.ping_timeout_secs),
        }
    }

    fn command<I, S>(&self, args: I) -> Command
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cmd = Command::new(&self.binary);
        cmd.args(args).kill_on_drop(true);
        cmd
    }

    async fn output<I, S>(&self, args: I) -> Result<String, CliError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let output = self
            .command(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CliError::Missing
                } else {
                    CliError::Io(e)
                }
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
        } else {
            Err(CliError::Failed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }

    /// `(id, name)` for every container, running or not.
    async fn containers(&self) -> Result<Vec<(String, String)>, CliError> {
        let listing = self
            .output(["ps", "-a", "--no-trunc", "--format", "{{.ID}}\t{{.Names}}"])
            .await?;

        Ok(listing
            .lines()
            .filter_map(|line| line.split_once('\t'))
            .map(|(id, name)| (id.to_string(), normalize_name(name).to_string()))
            .collect())
    }
}

fn create_args(name: &str, config: &ContainerConfig, host: &HostConfig) -> Vec<String> {
    let mut args = vec![
        "create".to_string(),
        "--name".to_string(),
        name.to_string(),
        "--interactive".to_string(),
    ];

    for (key, value) in &config.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &config.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }

    if let Some(memory) = host.memory_mib {
        args.push("--memory".to_string());
        args.push(format!("{memory}m"));
    }
    if let Some(cpu) = host.cpu_percent {
        args.push("--cpus".to_string());
        args.push(format!("{:.2}", f64::from(cpu) / 100.0));
    }
    for port in &host.ports {
        args.push("--publish".to_string());
        args.push(format!(
            "{}:{}/{}",
            port.host_port, port.container_port, port.protocol
        ));
    }
    for bind in &host.binds {
        args.push("--volume".to_string());
        args.push(bind.clone());
    }
    if let Some(policy) = &host.restart_policy {
        args.push("--restart".to_string());
        args.push(policy.clone());
    }

    args.push(config.image.clone());
    args.extend(config.cmd.iter().cloned());
    args
}

#[derive(Debug, Deserialize)]
struct StatsLine {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "CPUPerc")]
    cpu_perc: String,
    #[serde(rename = "MemPerc")]
    mem_perc: String,
    #[serde(rename = "MemUsage")]
    mem_usage: String,
    #[serde(rename = "NetIO")]
    net_io: String,
    #[serde(rename = "BlockIO")]
    block_io: String,
    #[serde(rename = "PIDs")]
    pids: String,
}

fn parse_percent(raw: &str) -> Result<f64, EngineError> {
    let value = raw.trim().trim_end_matches('%');
    if value == "--" {
        return Ok(0.0);
    }
    value
        .parse()
        .map_err(|_| EngineError::DecodeFailed(format!("bad percentage '{raw}'")))
}

fn parse_stats(raw: &str) -> Result<ContainerStats, EngineError> {
    let line: StatsLine = serde_json::from_str(raw.trim())
        .map_err(|e| EngineError::DecodeFailed(e.to_string()))?;

    let pids = match line.pids.trim() {
        "--" => 0,
        value => value
            .parse()
            .map_err(|_| EngineError::DecodeFailed(format!("bad pid count '{value}'")))?,
    };

    Ok(ContainerStats {
        cpu_percent: parse_percent(&line.cpu_perc)?,
        memory_percent: parse_percent(&line.mem_perc)?,
        id: line.id,
        name: normalize_name(&line.name).to_string(),
        memory_usage: line.mem_usage,
        net_io: line.net_io,
        block_io: line.block_io,
        pids,
    })
}

fn line_stream<R>(reader: R) -> impl futures::Stream<Item = std::io::Result<String>>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    stream::unfold(reader.lines(), |mut lines| async move {
        match lines.next_line().await {
            Ok(Some(line)) => Some((Ok(line), lines)),
            Ok(None) => None,
            Err(e) => Some((Err(e), lines)),
        }
    })
}

#[async_trait]
impl ContainerEngine for DockerCli {
    async fn init(&self) -> Result<String, EngineError> {
        match self.output(["--version"]).await {
            Ok(_) => {}
            Err(CliError::Missing) if self.auto_install => {
                warn!(binary = %self.binary, "Container engine missing, installing");
                install::install_engine().await?;
            }
            Err(CliError::Missing) => return Err(EngineError::NotInstalled),
            Err(e) => return Err(EngineError::Engine(e.to_string())),
        }

        let version = tokio::time::timeout(
            self.ping_timeout,
            self.output(["version", "--format", "{{.Server.Version}}"]),
        )
        .await
        .map_err(|_| {
            EngineError::Unreachable(format!(
                "no answer within {}s",
                self.ping_timeout.as_secs()
            ))
        })?
        .map_err(|e| EngineError::Unreachable(e.to_string()))?;

        info!(event = "engine_ready", version = %version, "Container engine reachable");
        Ok(version)
    }

    async fn pull_image(&self, image: &str) -> Result<(), EngineError> {
        info!(image = %image, "Pulling image");
        self.output(["pull", "--quiet", image])
            .await
            .map(|_| ())
            .map_err(|e| EngineError::PullFailed(e.to_string()))
    }

    async fn image_exists(&self, image: &str) -> bool {
        self.output(["image", "inspect", "--format", "{{.Id}}", image])
            .await
            .is_ok()
    }

    async fn create(
        &self,
        name: &str,
        config: &ContainerConfig,
        host: &HostConfig,
    ) -> Result<String, EngineError> {
        let id = self
            .output(create_args(name, config, host))
            .await
            .map_err(|e| EngineError::CreateFailed(e.to_string()))?;
        info!(event = "container_created", name = %name, id = %id, "Container created");
        Ok(id)
    }

    async fn start(&self, id: &str) -> Result<(), EngineError> {
        self.output(["start", id])
            .await
            .map(|_| ())
            .map_err(|e| e.for_container(id))
    }

    async fn stop(&self, id: &str, timeout_secs: u32) -> Result<(), EngineError> {
        let timeout = timeout_secs.to_string();
        self.output(["stop", "--time", timeout.as_str(), id])
            .await
            .map(|_| ())
            .map_err(|e| e.for_container(id))
    }

    async fn kill(&self, id: &str) -> Result<(), EngineError> {
        self.output(["kill", id])
            .await
            .map(|_| ())
            .map_err(|e| e.for_container(id))
    }

    async fn restart(&self, id: &str, timeout_secs: u32) -> Result<(), EngineError> {
        let timeout = timeout_secs.to_string();
        self.output(["restart", "--time", timeout.as_str(), id])
            .await
            .map(|_| ())
            .map_err(|e| e.for_container(id))
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), EngineError> {
        let result = if force {
            self.output(["rm", "--force", id]).await
        } else {
            self.output(["rm", id]).await
        };
        result.map(|_| ()).map_err(|e| e.for_container(id))
    }

    async fn exists(&self, name: &str) -> bool {
        match self.containers().await {
            Ok(containers) => containers.iter().any(|(_, n)| n == name),
            Err(e) => {
                debug!(error = %e, "Container listing failed");
                false
            }
        }
    }

    async fn id_of(&self, name: &str) -> Result<String, EngineError> {
        let wanted = normalize_name(name);
        self.containers()
            .await
            .map_err(|e| e.for_container(name))?
            .into_iter()
            .find(|(_, n)| n == wanted)
            .map(|(id, _)| id)
            .ok_or_else(|| EngineError::NotFound(name.to_string()))
    }

    async fn logs(
        &self,
        id: &str,
        tail: Option<u32>,
        follow: bool,
    ) -> Result<LogStream, EngineError> {
        let mut args = vec!["logs".to_string(), "--timestamps".to_string()];
        if let Some(tail) = tail {
            args.push("--tail".to_string());
            args.push(tail.to_string());
        }
        if follow {
            args.push("--follow".to_string());
        }
        args.push(id.to_string());

        let mut child = self
            .command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::Engine(e.to_string()))?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(EngineError::Engine("log pipes unavailable".to_string()));
        };

        // The child rides along with stdout so dropping the stream kills it.
        let stdout = stream::unfold(
            (BufReader::new(stdout).lines(), child),
            |(mut lines, child)| async move {
                match lines.next_line().await {
                    Ok(Some(line)) => Some((Ok(line), (lines, child))),
                    Ok(None) => None,
                    Err(e) => Some((Err(e), (lines, child))),
                }
            },
        );
        let stderr = line_stream(BufReader::new(stderr));

        Ok(stream::select(stdout, stderr).boxed())
    }

    async fn stats(&self, id: &str) -> Result<ContainerStats, EngineError> {
        let raw = self
            .output(["stats", "--no-stream", "--format", "{{json .}}", id])
            .await
            .map_err(|e| e.for_container(id))?;
        parse_stats(&raw)
    }

    async fn send_stdin(&self, id: &str, line: &str) -> Result<(), EngineError> {
        let mut child = self
            .command(["attach", "--sig-proxy=false", id])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| EngineError::AttachFailed(e.to_string()))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::AttachFailed("stdin pipe unavailable".to_string()))?;

        let payload = format!("{line}\n");
        let written = stdin.write_all(payload.as_bytes()).await;
        let flushed = stdin.flush().await;
        tokio::time::sleep(STDIN_SETTLE).await;
        drop(stdin);

        let exited = child
            .try_wait()
            .map_err(|e| EngineError::AttachFailed(e.to_string()))?;
        if exited.is_none() {
            let _ = child.kill().await;
        }

        if let Some(status) = exited
            && !status.success()
        {
            return Err(EngineError::AttachFailed(format!(
                "attach exited with {status}"
            )));
        }

        written
            .and(flushed)
            .map_err(|e| EngineError::AttachFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::engine::PortBinding;

    #[test]
    fn create_args_cover_limits_ports_and_command() {
        let mut config = ContainerConfig {
            image: "itzg/minecraft-server:latest".to_string(),
            cmd: vec!["--nogui".to_string()],
            ..ContainerConfig::default()
        };
        config.env.insert("EULA".to_string(), "TRUE".to_string());

        let host = HostConfig {
            memory_mib: Some(2048),
            cpu_percent: Some(150),
            ports: vec![PortBinding {
                host_port: 25565,
                container_port: 25565,
                protocol: "tcp".to_string(),
            }],
            ..HostConfig::default()
        };

        let args = create_args("mc-1", &config, &host);
        let joined = args.join(" ");

        assert!(joined.starts_with("create --name mc-1 --interactive"));
        assert!(joined.contains("--env EULA=TRUE"));
        assert!(joined.contains("--memory 2048m"));
        assert!(joined.contains("--cpus 1.50"));
        assert!(joined.contains("--publish 25565:25565/tcp"));
        assert!(joined.ends_with("itzg/minecraft-server:latest --nogui"));
    }

    #[test]
    fn decodes_stats_snapshot() {
        let raw = r#"{"BlockIO":"0B / 0B","CPUPerc":"12.50%","Container":"abc","ID":"abc","MemPerc":"3.10%","MemUsage":"64MiB / 2GiB","Name":"/mc-1","NetIO":"1kB / 2kB","PIDs":"17"}"#;
        let stats = parse_stats(raw).unwrap();

        assert_eq!(stats.name, "mc-1");
        assert!((stats.cpu_percent - 12.5).abs() < f64::EPSILON);
        assert_eq!(stats.pids, 17);
    }

    #[test]
    fn stopped_container_stats_read_as_zero() {
        let raw = r#"{"BlockIO":"--","CPUPerc":"--","ID":"abc","MemPerc":"--","MemUsage":"-- / --","Name":"mc-1","NetIO":"--","PIDs":"--"}"#;
        let stats = parse_stats(raw).unwrap();
        assert!(stats.cpu_percent.abs() < f64::EPSILON);
        assert_eq!(stats.pids, 0);
    }

    #[test]
    fn garbage_stats_fail_to_decode() {
        let err = parse_stats("not json").unwrap_err();
        assert_eq!(err.kind(), "decode_failed");
    }

    #[test]
    fn missing_container_maps_to_not_found() {
        let err = CliError::Failed("Error: No such container: abc".to_string()).for_container("abc");
        assert!(matches!(err, EngineError::NotFound(id) if id == "abc"));

        let err = CliError::Failed("permission denied".to_string()).for_container("abc");
        assert_eq!(err.kind(), "engine_error");
    }
}
