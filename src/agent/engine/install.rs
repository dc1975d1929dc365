//! Install-on-absence for the container engine. Linux only.

use std::path::PathBuf;

use tokio::process::Command;
use tracing::info;

use super::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Apt,
    Dnf,
    Yum,
}

impl PackageManager {
    const fn binary(self) -> &'static str {
        match self {
            Self::Apt => "apt-get",
            Self::Dnf => "dnf",
            Self::Yum => "yum",
        }
    }

    /// Vendor repository setup plus the engine packages.
    #[must_use]
    pub const fn install_script(self) -> &'static str {
        match self {
            Self::Apt => {
                "set -e; apt-get update; apt-get install -y ca-certificates curl; \
                 install -m 0755 -d /etc/apt/keyrings; \
                 curl -fsSL https://get.docker.com -o /tmp/get-docker.sh; \
                 sh /tmp/get-docker.sh"
            }
            Self::Dnf => {
                "set -e; dnf -y install dnf-plugins-core; \
                 dnf config-manager --add-repo https://download.docker.com/linux/fedora/docker-ce.repo; \
                 dnf -y install docker-ce docker-ce-cli containerd.io"
            }
            Self::Yum => {
                "set -e; yum install -y yum-utils; \
                 yum-config-manager --add-repo https://download.docker.com/linux/centos/docker-ce.repo; \
                 yum install -y docker-ce docker-ce-cli containerd.io"
            }
        }
    }
}

fn find_in_path(binary: &str, path_var: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    std::env::split_paths(path_var?)
        .map(|dir| dir.join(binary))
        .find(|candidate| candidate.is_file())
}

/// First supported package manager on `PATH`, in apt, dnf, yum order.
#[must_use]
pub fn detect_package_manager() -> Option<PackageManager> {
    let path_var = std::env::var_os("PATH");
    [PackageManager::Apt, PackageManager::Dnf, PackageManager::Yum]
        .into_iter()
        .find(|pm| find_in_path(pm.binary(), path_var.as_deref()).is_some())
}

async fn run_captured(program: &str, args: &[&str]) -> Result<(), EngineError> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|e| EngineError::InstallFailed(format!("{program}: {e}")))?;

    if output.status.success() {
        return Ok(());
    }

    let mut captured = String::from_utf8_lossy(&output.stdout).into_owned();
    captured.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(EngineError::InstallFailed(format!(
        "{program} exited with {}: {}",
        output.status,
        captured.trim()
    )))
}

pub async fn install_engine() -> Result<(), EngineError> {
    if !cfg!(target_os = "linux") {
        return Err(EngineError::Unsupported(std::env::consts::OS.to_string()));
    }

    let manager = detect_package_manager()
        .ok_or_else(|| EngineError::Unsupported("no apt-get, dnf or yum found".to_string()))?;

    info!(event = "engine_install_started", package_manager = manager.binary(), "Installing container engine");

    run_captured("sh", &["-c", manager.install_script()]).await?;
    run_captured("systemctl", &["enable", "--now", "docker"]).await?;

    info!(event = "engine_install_finished", "Container engine installed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_needs_a_path() {
        assert!(find_in_path("sh", None).is_none());
    }

    #[test]
    fn scripts_target_their_own_manager() {
        assert!(PackageManager::Dnf.install_script().contains("dnf -y install docker-ce"));
        assert!(PackageManager::Yum.install_script().contains("yum-config-manager"));
        assert!(PackageManager::Apt.install_script().contains("apt-get update"));
    }
}
