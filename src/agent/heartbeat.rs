use std::sync::Weak;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use tracing::{debug, warn};

use super::AgentState;
use crate::config::{HeartbeatConfig, PanelLinkConfig};
use crate::protocol::{HeartbeatRequest, SystemInfo};
use crate::services::worker::BackgroundWorker;

/// Periodically tells the panel this node is alive.
pub struct HeartbeatReporter {
    client: reqwest::Client,
    worker: BackgroundWorker,
}

impl HeartbeatReporter {
    pub fn new(settings: &HeartbeatConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .user_agent(concat!("birdactyl-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build heartbeat client")?;

        Ok(Self {
            client,
            worker: BackgroundWorker::new(
                "agent_heartbeat",
                Duration::from_secs(settings.interval_secs.max(1)),
            ),
        })
    }

    /// Post one heartbeat. Unpaired agents have nothing to report to.
    pub async fn report(&self, link: &PanelLinkConfig, system: SystemInfo) -> anyhow::Result<bool> {
        let (Some(url), Some(token)) = (&link.url, &link.token) else {
            debug!("Not paired, skipping heartbeat");
            return Ok(false);
        };

        let response = self
            .client
            .post(format!("{}/api/nodes/heartbeat", url.trim_end_matches('/')))
            .bearer_auth(token)
            .json(&HeartbeatRequest { system })
            .send()
            .await
            .context("Heartbeat request failed")?;

        if response.status() == StatusCode::UNAUTHORIZED {
            anyhow::bail!("Panel rejected the node token; re-pair this node");
        }
        response
            .error_for_status()
            .context("Panel refused heartbeat")?;

        Ok(true)
    }

    pub fn start(&self, state: Weak<AgentState>) -> bool {
        self.worker.start(move || {
            let state = state.clone();
            async move {
                let Some(state) = state.upgrade() else {
                    return;
                };
                let link = state.config.panel().await;
                if let Err(e) = state.heartbeat.report(&link, state.system_info()).await {
                    warn!(error = %format!("{e:#}"), "Heartbeat failed");
                }
            }
        })
    }

    pub async fn stop(&self) {
        self.worker.stop().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unpaired_agent_skips_reporting() {
        let reporter = HeartbeatReporter::new(&HeartbeatConfig::default()).unwrap();
        let sent = reporter
            .report(&PanelLinkConfig::default(), SystemInfo::default())
            .await
            .unwrap();
        assert!(!sent);
    }
}
