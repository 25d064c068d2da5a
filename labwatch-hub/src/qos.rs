/*!
 * QOS ALLOCATOR - Partage du lien entre les noeuds actifs
 *
 * RÔLE :
 * `recompute` est une fonction pure (noeuds actifs, politique) → plan complet.
 * Le contrôleur s'abonne aux événements de membership du registre, recalcule
 * à chaque arête et publie le plan via `watch` : un consommateur voit l'ancien
 * ou le nouveau plan, jamais un mélange.
 *
 * POLITIQUE :
 * - Unités entières (milli-images/s), arrondi vers le bas → somme ≤ capacité
 * - n × plancher ≤ capacité : part égale capacité / n
 * - Sursouscription : les noeuds les plus récents (rang d'admission ≥ capacité/plancher)
 *   sont bridés au plancher, le reste est partagé entre les plus anciens
 * - Plus rien à partager pour les anciens (ou plancher > capacité) : part égale
 *   capacité / n pour tous, tous bridés ; jamais d'allocation nulle non bridée
 * - Ancienneté = rang d'admission, identifiant en départage
 */

use crate::config::FleetConf;
use crate::models::{EdgeNode, NodeId};
use crate::registry::{MembershipEvent, SharedRegistry};
use crate::state::Counter;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allocation {
    pub frame_rate_mfps: u32,
    pub bitrate_ceiling_kbps: u32,
    pub throttled: bool,
}

impl Allocation {
    pub fn frame_rate_fps(&self) -> f64 {
        f64::from(self.frame_rate_mfps) / 1000.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QosPolicy {
    pub capacity_mfps: u32,
    pub floor_mfps: u32,
    pub kbps_per_fps: u32,
}

impl QosPolicy {
    pub fn from_config(fleet: &FleetConf) -> Self {
        Self {
            capacity_mfps: (fleet.total_capacity_fps * 1000.0).floor() as u32,
            floor_mfps: (fleet.min_rate_fps * 1000.0).ceil() as u32,
            kbps_per_fps: fleet.kbps_per_fps,
        }
    }

    fn allocation(&self, mfps: u32, throttled: bool) -> Allocation {
        let kbps = u64::from(mfps) * u64::from(self.kbps_per_fps) / 1000;
        Allocation {
            frame_rate_mfps: mfps,
            bitrate_ceiling_kbps: u32::try_from(kbps).unwrap_or(u32::MAX),
            throttled,
        }
    }
}

/// Plan complet, remplacé (jamais muté) à chaque recompute
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QosPlan {
    pub allocations: BTreeMap<NodeId, Allocation>,
    pub capacity_mfps: u32,
    pub floor_mfps: u32,
    pub oversubscribed: bool,
}

impl QosPlan {
    pub fn total_mfps(&self) -> u64 {
        self.allocations.values().map(|a| u64::from(a.frame_rate_mfps)).sum()
    }

    pub fn get(&self, node_id: &str) -> Option<&Allocation> {
        self.allocations.get(node_id)
    }

    pub fn throttled_count(&self) -> usize {
        self.allocations.values().filter(|a| a.throttled).count()
    }
}

pub fn recompute(active_nodes: &[EdgeNode], policy: &QosPolicy) -> QosPlan {
    let mut ranked: Vec<&EdgeNode> = active_nodes.iter().collect();
    ranked.sort_by(|a, b| a.join_seq.cmp(&b.join_seq).then_with(|| a.node_id.cmp(&b.node_id)));
    ranked.dedup_by(|a, b| a.node_id == b.node_id);

    let mut plan = QosPlan {
        capacity_mfps: policy.capacity_mfps,
        floor_mfps: policy.floor_mfps,
        ..Default::default()
    };
    let n = ranked.len() as u64;
    if n == 0 {
        return plan;
    }
    let cap = u64::from(policy.capacity_mfps);
    let floor = u64::from(policy.floor_mfps);

    if floor == 0 || n * floor <= cap {
        let share = (cap / n) as u32;
        for node in ranked {
            plan.allocations.insert(node.node_id.clone(), policy.allocation(share, false));
        }
        return plan;
    }

    plan.oversubscribed = true;
    let slots = cap / floor;
    let throttled = (n - slots + 1).min(slots);
    let seniors = n - throttled;
    let senior_pool = cap - throttled * floor;
    if slots == 0 || (seniors > 0 && senior_pool < seniors) {
        let share = (cap / n) as u32;
        for node in ranked {
            plan.allocations.insert(node.node_id.clone(), policy.allocation(share, true));
        }
        tracing::warn!("[qos] fleet cannot hold the floor, all {n} nodes throttled to {share} mfps");
        return plan;
    }
    let senior_share = if seniors == 0 { 0 } else { (senior_pool / seniors) as u32 };
    for (rank, node) in ranked.into_iter().enumerate() {
        let alloc = if (rank as u64) < seniors {
            policy.allocation(senior_share, false)
        } else {
            policy.allocation(policy.floor_mfps, true)
        };
        plan.allocations.insert(node.node_id.clone(), alloc);
    }
    tracing::warn!(
        "[qos] fleet oversubscribed: {n} nodes for {:.1} fps, {throttled} throttled to {:.1} fps",
        cap as f64 / 1000.0,
        floor as f64 / 1000.0
    );
    plan
}

/// Contrôleur : un recompute par événement de membership
pub struct QosController {
    registry: SharedRegistry,
    policy: QosPolicy,
    plan_tx: watch::Sender<Arc<QosPlan>>,
    recomputes: Counter,
}

impl QosController {
    pub fn new(registry: SharedRegistry, policy: QosPolicy) -> Arc<Self> {
        let (plan_tx, _) = watch::channel(Arc::new(QosPlan {
            capacity_mfps: policy.capacity_mfps,
            floor_mfps: policy.floor_mfps,
            ..Default::default()
        }));
        Arc::new(Self { registry, policy, plan_tx, recomputes: Counter::default() })
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<QosPlan>> {
        self.plan_tx.subscribe()
    }

    pub fn current(&self) -> Arc<QosPlan> {
        self.plan_tx.borrow().clone()
    }

    pub fn recompute_count(&self) -> u64 {
        self.recomputes.get()
    }

    pub fn policy(&self) -> QosPolicy {
        self.policy
    }

    /// Recalcule depuis le registre et publie ; true si le plan a changé
    pub fn recompute_now(&self) -> bool {
        let plan = recompute(&self.registry.list_active(), &self.policy);
        self.recomputes.incr();
        self.registry.set_quotas(&plan);
        let changed = self.plan_tx.send_if_modified(|current| {
            if **current == plan {
                false
            } else {
                *current = Arc::new(plan);
                true
            }
        });
        if changed {
            let plan = self.current();
            tracing::info!(
                "[qos] plan updated: {} nodes, {:.2}/{:.2} fps allocated, {} throttled",
                plan.allocations.len(),
                plan.total_mfps() as f64 / 1000.0,
                f64::from(plan.capacity_mfps) / 1000.0,
                plan.throttled_count()
            );
        }
        changed
    }

    /// L'abonnement est pris avant le spawn : aucun événement perdu au démarrage
    pub fn spawn(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => {
                        tracing::debug!("[qos] membership edge {:?} on {}", event_kind(&event), event.node_id());
                        controller.recompute_now();
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!("[qos] lagged {missed} membership events, recomputing");
                        controller.recompute_now();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

fn event_kind(event: &MembershipEvent) -> &'static str {
    match event {
        MembershipEvent::Joined(_) => "join",
        MembershipEvent::Degraded(_) => "degrade",
        MembershipEvent::Recovered(_) => "recover",
        MembershipEvent::Evicted(_) => "evict",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeMetadata, NodeState};
    use crate::registry::NodeRegistry;
    use std::time::Duration;
    use time::OffsetDateTime;
    use tokio::time::Instant;

    fn policy() -> QosPolicy {
        QosPolicy::from_config(&FleetConf { total_capacity_fps: 30.0, min_rate_fps: 5.0, kbps_per_fps: 100 })
    }

    fn node(id: &str, seq: u64) -> EdgeNode {
        EdgeNode {
            node_id: id.into(),
            metadata: NodeMetadata::default(),
            join_seq: seq,
            state: NodeState::Active,
            quota_mfps: 0,
            throttled: false,
            last_seen: Instant::now(),
            registered_at: OffsetDateTime::UNIX_EPOCH,
            outbound_depth: 0,
        }
    }

    fn fleet(n: u64) -> Vec<EdgeNode> {
        (1..=n).map(|i| node(&format!("node-{i:02}"), i)).collect()
    }

    #[test]
    fn test_five_nodes_share_equally() {
        let plan = recompute(&fleet(5), &policy());
        assert!(plan.allocations.values().all(|a| a.frame_rate_mfps == 6_000 && !a.throttled));
        assert_eq!(plan.total_mfps(), 30_000);
        assert_eq!(plan.get("node-01").unwrap().bitrate_ceiling_kbps, 600);
    }

    #[test]
    fn test_sixth_node_meets_floor_exactly() {
        let plan = recompute(&fleet(6), &policy());
        assert!(!plan.oversubscribed);
        assert!(plan.allocations.values().all(|a| a.frame_rate_mfps == 5_000 && !a.throttled));
        assert_eq!(plan.total_mfps(), 30_000);
    }

    #[test]
    fn test_seventh_node_throttles_two_newest() {
        let plan = recompute(&fleet(7), &policy());
        assert!(plan.oversubscribed);
        for id in ["node-06", "node-07"] {
            let a = plan.get(id).unwrap();
            assert!(a.throttled);
            assert_eq!(a.frame_rate_mfps, 5_000);
        }
        for i in 1..=5 {
            let a = plan.get(&format!("node-{i:02}")).unwrap();
            assert!(!a.throttled);
            assert_eq!(a.frame_rate_mfps, 4_000);
        }
        assert_eq!(plan.total_mfps(), 30_000);
    }

    #[test]
    fn test_heavy_oversubscription_throttles_everyone_equally() {
        // 13 noeuds : les 6 créneaux au plancher ne laissent rien aux anciens
        let plan = recompute(&fleet(13), &policy());
        assert!(plan.oversubscribed);
        assert_eq!(plan.allocations.len(), 13);
        assert!(plan.allocations.values().all(|a| a.throttled && a.frame_rate_mfps == 2_307));
        assert!(plan.total_mfps() <= 30_000);
        for n in 12..=40 {
            let plan = recompute(&fleet(n), &policy());
            assert!(plan.allocations.values().all(|a| a.frame_rate_mfps > 0 || a.throttled));
        }
    }

    #[test]
    fn test_floor_above_capacity_throttles_everyone() {
        let policy = QosPolicy { capacity_mfps: 4_000, floor_mfps: 5_000, kbps_per_fps: 100 };
        let plan = recompute(&fleet(2), &policy);
        assert!(plan.allocations.values().all(|a| a.throttled && a.frame_rate_mfps == 2_000));
    }

    #[test]
    fn test_seniority_ties_broken_by_node_id() {
        let mut nodes = fleet(5);
        nodes.push(node("b-late", 6));
        nodes.push(node("a-late", 6));
        let plan = recompute(&nodes, &policy());
        // rang 6 = "a-late" (départage par id), rang 7 = "b-late"
        assert!(plan.get("a-late").unwrap().throttled);
        assert!(plan.get("b-late").unwrap().throttled);
        assert!(!plan.get("node-05").unwrap().throttled);
    }

    #[test]
    fn test_recompute_is_idempotent() {
        let nodes = fleet(7);
        let mut shuffled = nodes.clone();
        shuffled.reverse();
        assert_eq!(recompute(&nodes, &policy()), recompute(&shuffled, &policy()));
    }

    #[test]
    fn test_empty_fleet_yields_empty_plan() {
        let plan = recompute(&[], &policy());
        assert!(plan.allocations.is_empty());
        assert_eq!(plan.total_mfps(), 0);
    }

    #[test]
    fn test_sum_bounded_over_join_evict_sequences() {
        let policies = [
            policy(),
            QosPolicy { capacity_mfps: 29_999, floor_mfps: 4_000, kbps_per_fps: 80 },
            QosPolicy { capacity_mfps: 7_000, floor_mfps: 0, kbps_per_fps: 80 },
            QosPolicy { capacity_mfps: 10_000, floor_mfps: 3_333, kbps_per_fps: 80 },
        ];
        for policy in policies {
            let mut active: Vec<EdgeNode> = Vec::new();
            let mut seq = 0;
            // pseudo-aléatoire déterministe : joins majoritaires, évictions intercalées
            let mut x: u64 = 0x9e37_79b9;
            for _ in 0..200 {
                x ^= x << 13;
                x ^= x >> 7;
                x ^= x << 17;
                if x % 3 == 0 && !active.is_empty() {
                    let idx = (x as usize / 3) % active.len();
                    active.remove(idx);
                } else {
                    seq += 1;
                    active.push(node(&format!("n{seq}"), seq));
                }
                let plan = recompute(&active, &policy);
                assert!(plan.total_mfps() <= u64::from(policy.capacity_mfps));
                assert_eq!(plan.allocations.len(), active.len());
                assert!(active.iter().all(|n| plan.allocations.contains_key(&n.node_id)));
            }
        }
    }

    #[tokio::test]
    async fn test_controller_recomputes_once_per_edge() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(6)));
        let controller = QosController::new(Arc::clone(&registry), policy());
        let mut plans = controller.subscribe();
        let task = controller.spawn();

        registry.register("n1", NodeMetadata::default()).unwrap();
        registry.activate("n1").unwrap();
        plans.changed().await.unwrap();
        assert_eq!(plans.borrow_and_update().get("n1").unwrap().frame_rate_mfps, 30_000);
        assert_eq!(registry.get("n1").unwrap().quota_mfps, 30_000);

        registry.register("n2", NodeMetadata::default()).unwrap();
        registry.activate("n2").unwrap();
        plans.changed().await.unwrap();
        assert_eq!(plans.borrow_and_update().get("n2").unwrap().frame_rate_mfps, 15_000);
        assert_eq!(controller.recompute_count(), 2);

        // plan inchangé : pas de réveil des consommateurs
        assert!(!controller.recompute_now());
        assert!(!plans.has_changed().unwrap());
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_eviction_triggers_one_recompute() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(6)));
        let controller = QosController::new(Arc::clone(&registry), policy());
        let mut plans = controller.subscribe();
        let task = controller.spawn();

        registry.register("n1", NodeMetadata::default()).unwrap();
        registry.activate("n1").unwrap();
        plans.changed().await.unwrap();
        let before = controller.recompute_count();

        tokio::time::advance(Duration::from_secs(7)).await;
        assert_eq!(registry.sweep(Instant::now()), vec!["n1".to_string()]);
        assert!(registry.sweep(Instant::now()).is_empty());
        plans.changed().await.unwrap();
        assert!(plans.borrow().allocations.is_empty());
        tokio::task::yield_now().await;
        assert_eq!(controller.recompute_count(), before + 1);
        task.abort();
    }
}
