/*!
 * CONFIGURATION HUB - Surface de configuration en lecture seule
 *
 * RÔLE :
 * Chargée une seule fois au démarrage depuis `LABWATCH_HUB_CONFIG` (défaut
 * `hub.yaml`). Fichier absent = configuration par défaut ; fichier invalide =
 * erreur fatale de démarrage (avant toute admission de noeud).
 */

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HubConfig {
    pub fleet: FleetConf,
    pub heartbeat: HeartbeatConf,
    pub pipeline: PipelineConf,
    pub session: SessionConf,
    pub network: NetworkConf,
    pub mqtt: Option<MqttConf>,
    pub backend: BackendConf,
    pub logging: LogConf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetConf {
    /// Capacité totale du lien, en images/s cumulées sur la flotte
    pub total_capacity_fps: f64,
    /// Plancher par noeud
    pub min_rate_fps: f64,
    /// Plafond de débit annoncé au noeud par image/s allouée
    pub kbps_per_fps: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConf {
    pub interval_ms: u64,
    /// Nombre d'intervalles manqués avant éviction
    pub missed_threshold: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConf {
    pub workers: usize,
    pub queue_depth: usize,
    pub inference_timeout_ms: u64,
    pub drain_grace_ms: u64,
    pub flush_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConf {
    pub outbound_depth: usize,
    pub send_timeout_ms: u64,
    pub send_retries: u32,
    pub degrade_after_errors: u32,
    pub teardown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConf {
    pub discovery_bind: String,
    pub discovery_port: u16,
    /// Port UDP des noeuds edge pour la balise du hub
    pub edge_port: u16,
    pub beacon_interval_ms: u64,
    pub http_bind: String,
    pub http_port: u16,
    /// Hôte annoncé dans l'ack d'admission (défaut : IP locale détectée)
    pub advertise_host: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConf {
    pub ollama_host: String,
    pub model: String,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConf {
    pub dir: String,
    pub filter: String,
}

impl Default for FleetConf {
    fn default() -> Self {
        Self { total_capacity_fps: 30.0, min_rate_fps: 5.0, kbps_per_fps: 120 }
    }
}

impl Default for HeartbeatConf {
    fn default() -> Self {
        Self { interval_ms: 2_000, missed_threshold: 3 }
    }
}

impl Default for PipelineConf {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_depth: 8,
            inference_timeout_ms: 20_000,
            drain_grace_ms: 3_000,
            flush_timeout_ms: 2_000,
        }
    }
}

impl Default for SessionConf {
    fn default() -> Self {
        Self {
            outbound_depth: 16,
            send_timeout_ms: 1_000,
            send_retries: 2,
            degrade_after_errors: 3,
            teardown_grace_ms: 10_000,
        }
    }
}

impl Default for NetworkConf {
    fn default() -> Self {
        Self {
            discovery_bind: "0.0.0.0".into(),
            discovery_port: 50_000,
            edge_port: 50_001,
            beacon_interval_ms: 5_000,
            http_bind: "0.0.0.0".into(),
            http_port: 8001,
            advertise_host: None,
        }
    }
}

impl Default for BackendConf {
    fn default() -> Self {
        Self {
            ollama_host: "http://localhost:11434".into(),
            model: "llava:7b-v1.5-q4_K_M".into(),
            prompt: "Describe the lab scene in under twenty words; flag any safety hazard.".into(),
        }
    }
}

impl Default for LogConf {
    fn default() -> Self {
        Self { dir: "./log".into(), filter: "info".into() }
    }
}

impl HeartbeatConf {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Âge au-delà duquel un noeud silencieux est évincé
    pub fn eviction_age(&self) -> Duration {
        self.interval() * self.missed_threshold
    }
}

impl PipelineConf {
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_millis(self.inference_timeout_ms)
    }

    pub fn drain_grace(&self) -> Duration {
        Duration::from_millis(self.drain_grace_ms)
    }

    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

impl SessionConf {
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_millis(self.teardown_grace_ms)
    }
}

impl NetworkConf {
    pub fn beacon_interval(&self) -> Duration {
        Duration::from_millis(self.beacon_interval_ms)
    }
}

impl HubConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fleet = &self.fleet;
        if !fleet.total_capacity_fps.is_finite() || !(0.0..=1_000_000.0).contains(&fleet.total_capacity_fps) {
            return Err(invalid("fleet.total_capacity_fps", "must be within 0..=1000000"));
        }
        if !fleet.min_rate_fps.is_finite() || fleet.min_rate_fps < 0.0 {
            return Err(invalid("fleet.min_rate_fps", "must be a non-negative number"));
        }
        if fleet.min_rate_fps > fleet.total_capacity_fps {
            return Err(invalid("fleet.min_rate_fps", "cannot exceed total capacity"));
        }
        if self.heartbeat.interval_ms == 0 {
            return Err(invalid("heartbeat.interval_ms", "must be > 0"));
        }
        if self.heartbeat.missed_threshold == 0 {
            return Err(invalid("heartbeat.missed_threshold", "must be >= 1"));
        }
        if self.pipeline.workers == 0 {
            return Err(invalid("pipeline.workers", "must be >= 1"));
        }
        if self.pipeline.queue_depth == 0 {
            return Err(invalid("pipeline.queue_depth", "must be >= 1"));
        }
        if self.session.outbound_depth == 0 {
            return Err(invalid("session.outbound_depth", "must be >= 1"));
        }
        if self.session.degrade_after_errors == 0 {
            return Err(invalid("session.degrade_after_errors", "must be >= 1"));
        }
        if self.session.send_timeout_ms == 0 {
            return Err(invalid("session.send_timeout_ms", "must be > 0"));
        }
        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.to_string() }
}

/// Charge et valide la configuration du hub
pub async fn load_config() -> Result<HubConfig, ConfigError> {
    let path = std::env::var("LABWATCH_HUB_CONFIG").unwrap_or_else(|_| "hub.yaml".into());
    load_config_from(&path).await
}

pub async fn load_config_from(path: &str) -> Result<HubConfig, ConfigError> {
    if !Path::new(path).exists() {
        tracing::warn!("[config] no {path}, using default configuration");
        return Ok(HubConfig::default());
    }
    let txt = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io { path: path.to_string(), source })?;
    let cfg = if txt.trim().is_empty() {
        HubConfig::default()
    } else {
        serde_yaml::from_str::<HubConfig>(&txt)?
    };
    cfg.validate()?;
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = HubConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.heartbeat.eviction_age(), Duration::from_secs(6));
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let cfg: HubConfig = serde_yaml::from_str("fleet:\n  total_capacity_fps: 60\npipeline:\n  workers: 4\n").unwrap();
        assert_eq!(cfg.fleet.total_capacity_fps, 60.0);
        assert_eq!(cfg.fleet.min_rate_fps, 5.0);
        assert_eq!(cfg.pipeline.workers, 4);
        assert_eq!(cfg.pipeline.queue_depth, 8);
        assert!(cfg.mqtt.is_none());
    }

    #[test]
    fn test_validation_rejects_zero_workers() {
        let mut cfg = HubConfig::default();
        cfg.pipeline.workers = 0;
        assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { field: "pipeline.workers", .. })));
    }

    #[test]
    fn test_validation_rejects_floor_above_capacity() {
        let mut cfg = HubConfig::default();
        cfg.fleet.min_rate_fps = 40.0;
        assert!(cfg.validate().is_err());
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let cfg = load_config_from("/definitely/not/here/hub.yaml").await.unwrap();
        assert_eq!(cfg.network.discovery_port, 50_000);
    }

    #[tokio::test]
    async fn test_invalid_yaml_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.yaml");
        std::fs::write(&path, "fleet: [not, a, map").unwrap();
        assert!(load_config_from(path.to_str().unwrap()).await.is_err());
    }
}
