/*!
 * NODE REGISTRY - Flotte des noeuds edge connus
 *
 * RÔLE :
 * Instance unique, injectée (pas de singleton) dans discovery, QoS et sessions.
 * Détient l'état de chaque noeud : métadonnées, ancienneté, état de connexion,
 * quota courant, dernier signe de vie.
 *
 * FONCTIONNEMENT :
 * - Sections critiques courtes (parking_lot), aucun appel réseau sous verrou
 * - Chaque arête de membership (join actif, dégradation, récupération, éviction)
 *   est émise une seule fois sur un canal broadcast → recompute QoS
 * - Balayage périodique : noeud silencieux > interval × seuil → Disconnected puis évincé
 * - En drain : `register` refuse toute admission
 */

use crate::error::RegistryError;
use crate::models::{EdgeNode, NodeId, NodeMetadata, NodeState};
use crate::qos::QosPlan;
use crate::state::{new_state, Shared};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    Joined(NodeId),
    Degraded(NodeId),
    Recovered(NodeId),
    Evicted(NodeId),
}

impl MembershipEvent {
    pub fn node_id(&self) -> &str {
        match self {
            MembershipEvent::Joined(id)
            | MembershipEvent::Degraded(id)
            | MembershipEvent::Recovered(id)
            | MembershipEvent::Evicted(id) => id,
        }
    }
}

#[derive(Default)]
struct Fleet {
    nodes: HashMap<NodeId, EdgeNode>,
    next_seq: u64,
}

pub struct NodeRegistry {
    fleet: Shared<Fleet>,
    events: broadcast::Sender<MembershipEvent>,
    eviction_age: Duration,
    draining: AtomicBool,
}

pub type SharedRegistry = Arc<NodeRegistry>;

impl NodeRegistry {
    pub fn new(eviction_age: Duration) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            fleet: new_state(Fleet::default()),
            events,
            eviction_age,
            draining: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: MembershipEvent) {
        // aucun abonné = aucun contrôleur QoS (tests unitaires), pas une erreur
        let _ = self.events.send(event);
    }

    /// Admission ou rafraîchissement idempotent d'un noeud
    pub fn register(&self, node_id: &str, metadata: NodeMetadata) -> Result<EdgeNode, RegistryError> {
        if self.draining.load(Ordering::Acquire) {
            return Err(RegistryError::AdmissionClosed);
        }
        let mut fleet = self.fleet.lock();
        let now = Instant::now();
        if let Some(node) = fleet.nodes.get_mut(node_id) {
            if node.state != NodeState::Disconnected {
                node.metadata = metadata;
                node.last_seen = now;
                return Ok(node.clone());
            }
        }
        fleet.next_seq += 1;
        let node = EdgeNode {
            node_id: node_id.to_string(),
            metadata,
            join_seq: fleet.next_seq,
            state: NodeState::Connecting,
            quota_mfps: 0,
            throttled: false,
            last_seen: now,
            registered_at: OffsetDateTime::now_utc(),
            outbound_depth: 0,
        };
        fleet.nodes.insert(node.node_id.clone(), node.clone());
        drop(fleet);
        tracing::info!("[registry] admitted node {} (seq {})", node.node_id, node.join_seq);
        Ok(node)
    }

    /// false = noeud inconnu, l'appelant doit ré-annoncer
    pub fn heartbeat(&self, node_id: &str) -> bool {
        let mut fleet = self.fleet.lock();
        match fleet.nodes.get_mut(node_id) {
            Some(node) if node.state != NodeState::Disconnected => {
                node.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Handshake de session réussi : Connecting → Active
    pub fn activate(&self, node_id: &str) -> Result<EdgeNode, RegistryError> {
        let (node, event) = {
            let mut fleet = self.fleet.lock();
            let node = fleet
                .nodes
                .get_mut(node_id)
                .filter(|n| n.state != NodeState::Disconnected)
                .ok_or_else(|| RegistryError::UnknownNode(node_id.to_string()))?;
            node.last_seen = Instant::now();
            let event = match node.state {
                NodeState::Connecting => Some(MembershipEvent::Joined(node_id.to_string())),
                NodeState::Degraded => Some(MembershipEvent::Recovered(node_id.to_string())),
                _ => None,
            };
            node.state = NodeState::Active;
            (node.clone(), event)
        };
        if let Some(event) = event {
            tracing::info!("[registry] node {node_id} active");
            self.emit(event);
        }
        Ok(node)
    }

    pub fn mark_degraded(&self, node_id: &str) -> bool {
        let changed = {
            let mut fleet = self.fleet.lock();
            match fleet.nodes.get_mut(node_id) {
                Some(node) if node.state == NodeState::Active => {
                    node.state = NodeState::Degraded;
                    true
                }
                _ => false,
            }
        };
        if changed {
            tracing::warn!("[registry] node {node_id} degraded");
            self.emit(MembershipEvent::Degraded(node_id.to_string()));
        }
        changed
    }

    pub fn recover(&self, node_id: &str) -> bool {
        let changed = {
            let mut fleet = self.fleet.lock();
            match fleet.nodes.get_mut(node_id) {
                Some(node) if node.state == NodeState::Degraded => {
                    node.state = NodeState::Active;
                    node.last_seen = Instant::now();
                    true
                }
                _ => false,
            }
        };
        if changed {
            tracing::info!("[registry] node {node_id} recovered");
            self.emit(MembershipEvent::Recovered(node_id.to_string()));
        }
        changed
    }

    /// Retire un noeud ; true si il était présent (un seul événement émis)
    pub fn evict(&self, node_id: &str) -> bool {
        let removed = self.fleet.lock().nodes.remove(node_id);
        match removed {
            Some(_) => {
                tracing::info!("[registry] evicted node {node_id}");
                self.emit(MembershipEvent::Evicted(node_id.to_string()));
                true
            }
            None => false,
        }
    }

    /// Noeuds `Active`, triés par ancienneté puis identifiant
    pub fn list_active(&self) -> Vec<EdgeNode> {
        let mut active: Vec<EdgeNode> = self
            .fleet
            .lock()
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.join_seq.cmp(&b.join_seq).then_with(|| a.node_id.cmp(&b.node_id)));
        active
    }

    pub fn list_all(&self) -> Vec<EdgeNode> {
        let mut all: Vec<EdgeNode> = self.fleet.lock().nodes.values().cloned().collect();
        all.sort_by(|a, b| a.join_seq.cmp(&b.join_seq).then_with(|| a.node_id.cmp(&b.node_id)));
        all
    }

    pub fn get(&self, node_id: &str) -> Option<EdgeNode> {
        self.fleet.lock().nodes.get(node_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.fleet.lock().nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Écrit les quotas du plan (seul le contrôleur QoS appelle ceci)
    pub fn set_quotas(&self, plan: &QosPlan) {
        let mut fleet = self.fleet.lock();
        for node in fleet.nodes.values_mut() {
            match plan.allocations.get(&node.node_id) {
                Some(alloc) => {
                    node.quota_mfps = alloc.frame_rate_mfps;
                    node.throttled = alloc.throttled;
                }
                None => {
                    node.quota_mfps = 0;
                    node.throttled = false;
                }
            }
        }
    }

    pub fn set_outbound_depth(&self, node_id: &str, depth: usize) {
        if let Some(node) = self.fleet.lock().nodes.get_mut(node_id) {
            node.outbound_depth = depth;
        }
    }

    /// Ferme les admissions (phase Draining)
    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Évince les noeuds silencieux depuis plus que l'âge d'éviction
    pub fn sweep(&self, now: Instant) -> Vec<NodeId> {
        let evicted: Vec<NodeId> = {
            let mut fleet = self.fleet.lock();
            let stale: Vec<NodeId> = fleet
                .nodes
                .values_mut()
                .filter(|n| now.saturating_duration_since(n.last_seen) > self.eviction_age)
                .map(|n| {
                    n.state = NodeState::Disconnected;
                    n.node_id.clone()
                })
                .collect();
            for id in &stale {
                fleet.nodes.remove(id);
            }
            stale
        };
        for id in &evicted {
            tracing::warn!("[registry] node {id} missed heartbeats, evicted");
            self.emit(MembershipEvent::Evicted(id.clone()));
        }
        evicted
    }

    /// Tâche de balayage périodique, arrêtée quand `stop` passe à true
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        period: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        registry.sweep(Instant::now());
                    }
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("[registry] sweeper stopped");
        })
    }
}
