/*!
 * HEALTH - Compteurs de flotte et publication périodique
 *
 * FONCTIONNEMENT :
 * - `HealthTracker` : uptime + état de la liaison MQTT (mis à jour par la boucle MQTT)
 * - `HubHealth` : instantané sérialisable (registre, plan, pipeline, sessions...)
 * - Publication `labwatch/hub/health@v1` toutes les 30 s quand MQTT est configuré
 */

use crate::discovery::DiscoveryStats;
use crate::memory::JournalStats;
use crate::pipeline::PipelineStats;
use crate::session::SessionStats;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, QoS};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub const HEALTH_TOPIC: &str = "labwatch/hub/health@v1";
const PUBLISH_PERIOD: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize)]
pub struct HubHealth {
    pub hub_id: String,
    pub uptime_seconds: u64,
    pub phase: String,
    pub nodes_total: usize,
    pub nodes_active: usize,
    pub nodes_degraded: usize,
    pub capacity_fps: f64,
    pub allocated_fps: f64,
    pub oversubscribed: bool,
    pub throttled_nodes: usize,
    pub qos_recomputes: u64,
    pub pipeline: PipelineStats,
    pub sessions: SessionStats,
    pub discovery: DiscoveryStats,
    pub memory: JournalStats,
    pub memory_usage_mb: f32,
    pub mqtt_status: String,
    pub mqtt_reconnects: u32,
}

#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    mqtt_reconnects: Arc<AtomicU32>,
    mqtt_status: Arc<Mutex<String>>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            mqtt_reconnects: Arc::new(AtomicU32::new(0)),
            mqtt_status: Arc::new(Mutex::new("disabled".to_string())),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn mark_mqtt_connecting(&self) {
        *self.mqtt_status.lock() = "connecting".to_string();
    }

    pub fn mark_mqtt_connected(&self) {
        *self.mqtt_status.lock() = "connected".to_string();
    }

    pub fn increment_reconnects(&self) {
        self.mqtt_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.mqtt_status.lock() = "reconnecting".to_string();
    }

    pub fn mqtt_status(&self) -> String {
        self.mqtt_status.lock().clone()
    }

    pub fn mqtt_reconnects(&self) -> u32 {
        self.mqtt_reconnects.load(Ordering::Relaxed)
    }

    /// Publie l'instantané fourni par `snapshot` jusqu'au signal d'arrêt
    pub fn spawn_health_publisher<F>(
        &self,
        client: AsyncClient,
        snapshot: F,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()>
    where
        F: Fn() -> HubHealth + Send + 'static,
    {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PUBLISH_PERIOD);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let health = snapshot();
                        let payload = match serde_json::to_string(&health) {
                            Ok(p) => p,
                            Err(e) => {
                                tracing::warn!("[health] cannot serialize snapshot: {e}");
                                continue;
                            }
                        };
                        match client.publish(HEALTH_TOPIC, QoS::AtLeastOnce, false, payload).await {
                            Ok(()) => tracing::debug!(
                                "[health] published hub health (uptime: {}s, nodes: {})",
                                health.uptime_seconds,
                                health.nodes_total
                            ),
                            Err(e) => tracing::warn!("[health] failed to publish: {e}"),
                        }
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }
}

/// RSS du processus en Mo (Linux), 0 ailleurs
pub fn memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            if let Some(mb) = parse_vm_rss_mb(&status) {
                return mb;
            }
        }
    }
    0.0
}

fn parse_vm_rss_mb(status: &str) -> Option<f32> {
    status
        .lines()
        .find(|l| l.starts_with("VmRSS:"))
        .and_then(|l| l.split_whitespace().nth(1))
        .and_then(|kb| kb.parse::<u64>().ok())
        .map(|kb| kb as f32 / 1024.0)
}
