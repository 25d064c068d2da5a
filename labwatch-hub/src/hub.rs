/*!
 * HUB - Câblage de tous les composants
 *
 * RÔLE :
 * Ordre de démarrage et séquence de drain, partagés par `main.rs` et les tests
 * d'intégration (qui pilotent un vrai hub sans jamais appeler `process::exit`).
 *
 * DÉMARRAGE :
 * config validée → collaborateurs (backend, mémoire, MQTT) → bind UDP + HTTP
 * (échec fatal) → sweep, QoS, discovery, balise, pipeline, HTTP, health → Running
 *
 * DRAIN :
 * Draining (discovery coupée, admissions refusées) → pipeline sous grâce →
 * flush mémoire sous deadline → lien MQTT coupé → résumé archivé → writer de
 * log vidé → Terminated. Le lien MQTT survit au flush : le pont mémoire en a
 * besoin pour ses réponses.
 */

use crate::backend::{InferenceBackend, OllamaBackend};
use crate::config::HubConfig;
use crate::discovery::{bind_discovery, spawn_beacon, DiscoveryService};
use crate::error::StartupError;
use crate::health::{memory_usage_mb, HealthTracker, HubHealth};
use crate::lifecycle::{Lifecycle, Phase, Watchdog};
use crate::logging::{archive_run_summary, LoggingGuard};
use crate::memory::{LocalMemoryStore, MemoryJournal, MemoryStore};
use crate::models::NodeState;
use crate::mqtt::{create_mqtt_client, spawn_event_loop, MqttMemoryStore};
use crate::pipeline::{Backends, DeliverySink, DrainReport, Pipeline};
use crate::qos::{QosController, QosPolicy};
use crate::registry::{NodeRegistry, SharedRegistry};
use crate::session::{SessionDirectory, SessionManager};
use parking_lot::Mutex;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

const JOURNAL_DEPTH: usize = 256;
/// Marge du watchdog au-delà de grâce pipeline + flush
const WATCHDOG_SLACK: Duration = Duration::from_secs(2);
const MQTT_CLOSE_WAIT: Duration = Duration::from_millis(500);

/// Collaborateurs injectables ; `None` = implémentation par défaut
#[derive(Default)]
pub struct HubOptions {
    pub vision: Option<Arc<dyn InferenceBackend>>,
    pub speech: Option<Arc<dyn InferenceBackend>>,
    pub memory: Option<Arc<dyn MemoryStore>>,
    /// Clé `x-api-key` de l'API d'admin ; `None` = routes protégées refusées
    pub api_key: Option<String>,
}

/// État partagé des handlers HTTP et du publisher health
#[derive(Clone)]
pub struct HubServices {
    pub hub_id: String,
    pub config: Arc<HubConfig>,
    pub registry: SharedRegistry,
    pub qos: Arc<QosController>,
    pub pipeline: Arc<Pipeline>,
    pub sessions: Arc<SessionManager>,
    pub discovery: Arc<DiscoveryService>,
    pub memory: Arc<dyn MemoryStore>,
    pub journal: MemoryJournal,
    pub health: HealthTracker,
    pub lifecycle: Lifecycle,
    pub api_key: Option<String>,
}

impl HubServices {
    pub fn health_snapshot(&self) -> HubHealth {
        let nodes = self.registry.list_all();
        let count = |state: NodeState| nodes.iter().filter(|n| n.state == state).count();
        let plan = self.qos.current();
        HubHealth {
            hub_id: self.hub_id.clone(),
            uptime_seconds: self.health.uptime().as_secs(),
            phase: format!("{:?}", self.lifecycle.phase()).to_lowercase(),
            nodes_total: nodes.len(),
            nodes_active: count(NodeState::Active),
            nodes_degraded: count(NodeState::Degraded),
            capacity_fps: f64::from(plan.capacity_mfps) / 1000.0,
            allocated_fps: plan.total_mfps() as f64 / 1000.0,
            oversubscribed: plan.oversubscribed,
            throttled_nodes: plan.throttled_count(),
            qos_recomputes: self.qos.recompute_count(),
            pipeline: self.pipeline.stats(),
            sessions: self.sessions.stats(),
            discovery: self.discovery.stats(),
            memory: self.journal.stats(),
            memory_usage_mb: memory_usage_mb(),
            mqtt_status: self.health.mqtt_status(),
            mqtt_reconnects: self.health.mqtt_reconnects(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DrainSummary {
    pub reason: String,
    pub pipeline: DrainReport,
    pub memory_flushed: bool,
    pub health: HubHealth,
}

pub struct Hub {
    services: HubServices,
    http_addr: SocketAddr,
    discovery_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    /// Boucle MQTT et son arrêt propre, coupée après le flush mémoire
    mqtt_link: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
    logging: Mutex<Option<LoggingGuard>>,
}

impl Hub {
    pub async fn start(
        config: HubConfig,
        options: HubOptions,
        logging: Option<LoggingGuard>,
    ) -> Result<Self, StartupError> {
        config.validate()?;
        let config = Arc::new(config);
        let lifecycle = Lifecycle::new();
        let health = HealthTracker::new();
        let hub_id = Uuid::new_v4().to_string();
        let mut tasks = Vec::new();
        tracing::info!("[hub] starting {hub_id}");

        // collaborateurs
        let vision = match options.vision {
            Some(backend) => backend,
            None => {
                let ollama = OllamaBackend::new(&config.backend, config.pipeline.inference_timeout())
                    .map(Arc::new)
                    .map_err(|e| StartupError::Collaborator { collaborator: "vision backend", reason: e.to_string() })?;
                let probe = Arc::clone(&ollama);
                let model = config.backend.model.clone();
                tasks.push(tokio::spawn(async move {
                    match probe.probe().await {
                        Ok(true) => tracing::info!("[hub] vision backend ready ({model})"),
                        Ok(false) => tracing::warn!("[hub] vision backend reachable but model {model} missing"),
                        Err(e) => tracing::warn!("[hub] vision backend not reachable yet: {e}"),
                    }
                }));
                ollama as Arc<dyn InferenceBackend>
            }
        };

        let mut mqtt_client = None;
        let mut mqtt_link = None;
        let mut bridge = None;
        if let Some(mqtt_conf) = &config.mqtt {
            let (client, eventloop) = create_mqtt_client(mqtt_conf, &format!("labwatch-hub-{}", &hub_id[..8]));
            if options.memory.is_none() {
                bridge = Some(Arc::new(MqttMemoryStore::new(client.clone())));
            }
            let (mqtt_stop, mqtt_stop_rx) = watch::channel(false);
            let event_loop = spawn_event_loop(eventloop, client.clone(), bridge.clone(), health.clone(), mqtt_stop_rx);
            mqtt_link = Some((mqtt_stop, event_loop));
            mqtt_client = Some(client);
        }
        let memory: Arc<dyn MemoryStore> = match (options.memory, bridge) {
            (Some(store), _) => store,
            (None, Some(bridge)) => bridge as Arc<dyn MemoryStore>,
            (None, None) => {
                let dir = PathBuf::from(&config.logging.dir);
                std::fs::create_dir_all(&dir).map_err(|e| StartupError::Collaborator {
                    collaborator: "memory store",
                    reason: format!("{}: {e}", dir.display()),
                })?;
                Arc::new(LocalMemoryStore::new(Some(dir.join("memory.jsonl")))) as Arc<dyn MemoryStore>
            }
        };
        tracing::info!("[hub] memory store: {}", memory.name());

        // sockets : échec = fatal, avant toute admission
        let udp = bind_discovery(&config.network).await?;
        let http_bind = format!("{}:{}", config.network.http_bind, config.network.http_port);
        let listener = TcpListener::bind(&http_bind)
            .await
            .map_err(|source| StartupError::HttpBind { addr: http_bind.clone(), source })?;
        let http_addr = listener
            .local_addr()
            .map_err(|source| StartupError::HttpBind { addr: http_bind, source })?;

        let mut network = config.network.clone();
        network.http_port = http_addr.port();

        let registry: SharedRegistry = Arc::new(NodeRegistry::new(config.heartbeat.eviction_age()));
        tasks.push(registry.spawn_sweeper(config.heartbeat.interval(), lifecycle.stop_signal()));

        let qos = QosController::new(Arc::clone(&registry), QosPolicy::from_config(&config.fleet));
        tasks.push(qos.spawn());

        let discovery = DiscoveryService::new(udp, Arc::clone(&registry), &network, config.heartbeat.interval_ms);
        let discovery_addr = discovery
            .local_addr()
            .map_err(|source| StartupError::DiscoveryBind { addr: "discovery".into(), source })?;
        tasks.push(discovery.spawn(lifecycle.stop_signal()));
        tasks.push(spawn_beacon(&network, hub_id.clone(), lifecycle.stop_signal()));

        let (journal, journal_task) = MemoryJournal::spawn(Arc::clone(&memory), JOURNAL_DEPTH);
        tasks.push(journal_task);

        let directory = SessionDirectory::new(Arc::clone(&registry));
        let pipeline = Pipeline::start(
            &config.pipeline,
            Backends { vision, speech: options.speech },
            Arc::clone(&directory) as Arc<dyn DeliverySink>,
            Some(journal.clone()),
        );
        let sessions = SessionManager::new(
            Arc::clone(&registry),
            qos.subscribe(),
            Arc::clone(&pipeline),
            directory,
            config.session.clone(),
            config.heartbeat.eviction_age(),
        );
        tasks.push(sessions.spawn_eviction_watcher());

        let services = HubServices {
            hub_id,
            config: Arc::clone(&config),
            registry,
            qos,
            pipeline,
            sessions,
            discovery,
            memory,
            journal,
            health: health.clone(),
            lifecycle: lifecycle.clone(),
            api_key: options.api_key,
        };

        let router = crate::http::build_router(services.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                tracing::error!("[http] server stopped: {e}");
            }
        }));
        tracing::info!("[http] listening on {http_addr}");

        if let Some(client) = mqtt_client {
            let snapshot_src = services.clone();
            tasks.push(health.spawn_health_publisher(
                client,
                move || snapshot_src.health_snapshot(),
                lifecycle.stop_signal(),
            ));
        }

        lifecycle.advance(Phase::Running);
        tracing::info!("[hub] running (discovery {discovery_addr}, http {http_addr})");
        Ok(Self {
            services,
            http_addr,
            discovery_addr,
            tasks: Mutex::new(tasks),
            mqtt_link: Mutex::new(mqtt_link),
            logging: Mutex::new(logging),
        })
    }

    pub fn services(&self) -> &HubServices {
        &self.services
    }

    pub fn http_addr(&self) -> SocketAddr {
        self.http_addr
    }

    pub fn discovery_addr(&self) -> SocketAddr {
        self.discovery_addr
    }

    /// Échéance du watchdog de drain
    pub fn drain_deadline(&self) -> Duration {
        let p = &self.services.config.pipeline;
        p.drain_grace() + p.flush_timeout() + WATCHDOG_SLACK
    }

    /// Séquence de drain ; `None` si un drain est déjà en cours
    pub async fn drain(&self, reason: &str) -> Option<DrainSummary> {
        let s = &self.services;
        if !s.lifecycle.advance(Phase::Draining) {
            return None;
        }
        tracing::info!("[hub] draining ({reason})");
        s.lifecycle.stop_background();
        s.registry.begin_drain();
        s.sessions.begin_drain();

        let pipeline = s.pipeline.drain(s.config.pipeline.drain_grace()).await;
        let memory_flushed = match s.journal.flush(s.config.pipeline.flush_timeout()).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!("[hub] memory flush incomplete: {e}");
                false
            }
        };
        self.close_mqtt().await;

        let summary = DrainSummary {
            reason: reason.to_string(),
            pipeline,
            memory_flushed,
            health: s.health_snapshot(),
        };
        if let Some(guard) = self.logging.lock().as_mut() {
            match archive_run_summary(guard.run_dir(), &summary) {
                Ok(path) => tracing::info!("[hub] run summary archived to {}", path.display()),
                Err(e) => tracing::warn!("[hub] cannot archive run summary: {e}"),
            }
            guard.flush();
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        s.lifecycle.advance(Phase::Terminated);
        Some(summary)
    }

    async fn close_mqtt(&self) {
        let link = self.mqtt_link.lock().take();
        if let Some((stop, event_loop)) = link {
            let _ = stop.send(true);
            let abort = event_loop.abort_handle();
            if tokio::time::timeout(MQTT_CLOSE_WAIT, event_loop).await.is_err() {
                abort.abort();
            }
        }
    }

    /// Attend un déclencheur, draine sous watchdog ; renvoie le code de sortie
    pub async fn run_until_shutdown(&self) -> i32 {
        let reason = self.services.lifecycle.wait_for_trigger().await;
        let _watchdog = Watchdog::arm(self.drain_deadline());
        match self.drain(&reason).await {
            Some(summary) if summary.pipeline.completed && summary.memory_flushed => 0,
            Some(_) => 1,
            None => 0,
        }
    }
}
