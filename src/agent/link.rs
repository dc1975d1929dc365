use std::path::PathBuf;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{AgentConfig, PanelLinkConfig};

/// Where pairing results are kept.
#[async_trait]
pub trait PairingSink: Send + Sync {
    async fn persist(&self, link: PanelLinkConfig) -> anyhow::Result<()>;
}

/// Live agent settings. Pairing rewrites the panel section and, when backed
/// by a file, saves it back to `agent.toml`.
pub struct AgentConfigStore {
    path: Option<PathBuf>,
    config: RwLock<AgentConfig>,
}

impl AgentConfigStore {
    #[must_use]
    pub fn new(path: PathBuf, config: AgentConfig) -> Self {
        Self {
            path: Some(path),
            config: RwLock::new(config),
        }
    }

    #[must_use]
    pub fn in_memory(config: AgentConfig) -> Self {
        Self {
            path: None,
            config: RwLock::new(config),
        }
    }

    pub async fn panel(&self) -> PanelLinkConfig {
        self.config.read().await.panel.clone()
    }
}

#[async_trait]
impl PairingSink for AgentConfigStore {
    async fn persist(&self, link: PanelLinkConfig) -> anyhow::Result<()> {
        let mut config = self.config.write().await;
        let mut updated = config.clone();
        updated.panel = link;

        if let Some(path) = &self.path {
            updated.save_to_path(path)?;
        }

        *config = updated;
        info!(event = "panel_link_saved", panel_url = ?config.panel.url, "Panel link updated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn persist_writes_through_to_file() {
        let dir = std::env::temp_dir().join(format!("birdactyl-link-{}", uuid::Uuid::new_v4()));
        let path = dir.join("agent.toml");
        let store = AgentConfigStore::new(path.clone(), AgentConfig::default());

        store
            .persist(PanelLinkConfig {
                url: Some("https://panel.example.com".to_string()),
                token: Some("id.secret".to_string()),
                daemon_token: None,
            })
            .await
            .unwrap();

        assert!(store.panel().await.is_paired());
        let reloaded = AgentConfig::load_from_path(&path).unwrap();
        assert_eq!(reloaded.panel.token.as_deref(), Some("id.secret"));

        let _ = std::fs::remove_dir_all(dir);
    }
}
