//! Edge agent configuration
//!
//! TOML file in the OS config dir (`<config>/labwatch-edge/config.toml`),
//! defaults when absent. Every section is optional in the file.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EdgeConfig {
    pub node: NodeConfig,
    pub hub: HubConfig,
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Force l'identifiant (sinon dérivé de la MAC)
    pub node_id: Option<String>,
    pub capabilities: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub discovery_port: u16,
    /// Port local d'écoute des balises `hub_beacon`
    pub beacon_port: u16,
    pub broadcast_addr: String,
    /// Adresse directe du hub (`host:port`) quand le broadcast est filtré
    pub hub_addr: Option<String>,
    pub announce_interval_ms: u64,
    pub reconnect_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Débit avant la première directive du hub
    pub initial_fps: f64,
    pub frame_bytes: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            discovery_port: 50_000,
            beacon_port: 50_001,
            broadcast_addr: "255.255.255.255".into(),
            hub_addr: None,
            announce_interval_ms: 2_000,
            reconnect_delay_ms: 3_000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self { initial_fps: 1.0, frame_bytes: 16 * 1024 }
    }
}

impl HubConfig {
    pub fn announce_interval(&self) -> Duration {
        Duration::from_millis(self.announce_interval_ms.max(100))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

impl EdgeConfig {
    pub async fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
    }

    pub async fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, toml::to_string_pretty(self)?).await?;
        Ok(())
    }

    pub fn config_file_path() -> Result<PathBuf> {
        let mut path = dirs::config_dir().ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        path.push("labwatch-edge");
        path.push("config.toml");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = EdgeConfig::load_from(&dir.path().join("nope.toml")).await.unwrap();
        assert_eq!(cfg.hub.discovery_port, 50_000);
        assert_eq!(cfg.capture.initial_fps, 1.0);
    }

    #[tokio::test]
    async fn test_partial_file_and_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge/config.toml");
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(&path, "[hub]\nhub_addr = \"10.0.0.5:50000\"\n[node]\ncapabilities = [\"camera\"]\n")
            .await
            .unwrap();
        let cfg = EdgeConfig::load_from(&path).await.unwrap();
        assert_eq!(cfg.hub.hub_addr.as_deref(), Some("10.0.0.5:50000"));
        assert_eq!(cfg.hub.beacon_port, 50_001);
        assert_eq!(cfg.node.capabilities, vec!["camera".to_string()]);

        cfg.save_to(&path).await.unwrap();
        let again = EdgeConfig::load_from(&path).await.unwrap();
        assert_eq!(again.hub.hub_addr, cfg.hub.hub_addr);
    }
}
