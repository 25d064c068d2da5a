/*!
 * DISCOVERY SERVICE - Admission des noeuds edge sans adressage manuel
 *
 * RÔLE :
 * Écoute UDP sur le port bien connu ; chaque `announce` valide est transmis au
 * registre (admission idempotente) puis acquitté avec l'URL de session.
 *
 * FONCTIONNEMENT :
 * - Datagrammes malformés : ignorés, log debug, jamais fatals
 * - Annonces dupliquées / désordonnées : sans effet (register idempotent)
 * - Balise `hub_beacon` périodique en broadcast pour les noeuds démarrés avant le hub
 * - Drain : la boucle s'arrête immédiatement, le registre refuse les admissions
 */

use crate::config::NetworkConf;
use crate::error::{RegistryError, StartupError};
use crate::models::NodeMetadata;
use crate::protocol::{encode_json, parse_discovery, DiscoveryMessage};
use crate::registry::SharedRegistry;
use crate::state::Counter;
use serde::Serialize;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;

const MAX_DATAGRAM: usize = 2048;

#[derive(Debug, Default, Clone, Serialize)]
pub struct DiscoveryStats {
    pub admitted: u64,
    pub refused: u64,
    pub malformed: u64,
}

#[derive(Default)]
struct DiscoveryCounters {
    admitted: Counter,
    refused: Counter,
    malformed: Counter,
}

pub struct DiscoveryService {
    socket: UdpSocket,
    registry: SharedRegistry,
    advertise_host: Option<String>,
    http_port: u16,
    heartbeat_interval_ms: u64,
    counters: DiscoveryCounters,
}

/// Bind du port discovery ; un échec est fatal au démarrage
pub async fn bind_discovery(conf: &NetworkConf) -> Result<UdpSocket, StartupError> {
    let addr = format!("{}:{}", conf.discovery_bind, conf.discovery_port);
    let socket = UdpSocket::bind(&addr)
        .await
        .map_err(|source| StartupError::DiscoveryBind { addr: addr.clone(), source })?;
    socket
        .set_broadcast(true)
        .map_err(|source| StartupError::DiscoveryBind { addr, source })?;
    Ok(socket)
}

impl DiscoveryService {
    pub fn new(
        socket: UdpSocket,
        registry: SharedRegistry,
        network: &NetworkConf,
        heartbeat_interval_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket,
            registry,
            advertise_host: network.advertise_host.clone(),
            http_port: network.http_port,
            heartbeat_interval_ms,
            counters: DiscoveryCounters::default(),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn stats(&self) -> DiscoveryStats {
        DiscoveryStats {
            admitted: self.counters.admitted.get(),
            refused: self.counters.refused.get(),
            malformed: self.counters.malformed.get(),
        }
    }

    /// Boucle d'écoute, stoppée dès que `stop` passe à true
    pub fn spawn(self: &Arc<Self>, mut stop: watch::Receiver<bool>) -> JoinHandle<()> {
        let service = Arc::clone(self);
        tokio::spawn(async move {
            if let Ok(addr) = service.local_addr() {
                tracing::info!("[discovery] listening for announces on {addr}");
            }
            let mut buf = vec![0u8; MAX_DATAGRAM];
            loop {
                tokio::select! {
                    received = service.socket.recv_from(&mut buf) => match received {
                        Ok((len, src)) => {
                            if let Some(reply) = service.handle_datagram(&buf[..len], src) {
                                service.reply(&reply, src).await;
                            }
                        }
                        Err(e) => {
                            tracing::debug!("[discovery] recv error: {e}");
                        }
                    },
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("[discovery] listener stopped");
        })
    }

    /// Traite un datagramme ; renvoie l'ack à émettre le cas échéant
    pub fn handle_datagram(&self, buf: &[u8], src: SocketAddr) -> Option<DiscoveryMessage> {
        let msg = match parse_discovery(buf) {
            Ok(msg) => msg,
            Err(e) => {
                self.counters.malformed.incr();
                tracing::debug!("[discovery] dropped datagram from {src}: {e}");
                return None;
            }
        };
        let DiscoveryMessage::Announce { node_id, hostname, capabilities, version, .. } = msg else {
            // balises d'autres hubs, acks réfléchis
            return None;
        };
        let metadata = NodeMetadata { hostname, capabilities, version, addr: Some(src) };
        match self.registry.register(&node_id, metadata) {
            Ok(node) => {
                self.counters.admitted.incr();
                tracing::debug!("[discovery] announce from {node_id} at {src} (seq {})", node.join_seq);
                Some(DiscoveryMessage::AdmissionAck {
                    node_id,
                    session_endpoint: self.session_endpoint(src),
                    heartbeat_interval_ms: self.heartbeat_interval_ms,
                })
            }
            Err(RegistryError::AdmissionClosed) => {
                self.counters.refused.incr();
                tracing::info!("[discovery] refused {node_id}: hub draining");
                None
            }
            Err(e) => {
                self.counters.refused.incr();
                tracing::warn!("[discovery] register {node_id} failed: {e}");
                None
            }
        }
    }

    fn session_endpoint(&self, src: SocketAddr) -> String {
        let host = self
            .advertise_host
            .clone()
            .unwrap_or_else(|| route_local_ip(src).to_string());
        format!("ws://{host}:{}/session", self.http_port)
    }

    async fn reply(&self, msg: &DiscoveryMessage, dst: SocketAddr) {
        match encode_json(msg) {
            Ok(txt) => {
                if let Err(e) = self.socket.send_to(txt.as_bytes(), dst).await {
                    tracing::debug!("[discovery] ack to {dst} failed: {e}");
                }
            }
            Err(e) => tracing::warn!("[discovery] cannot encode ack: {e}"),
        }
    }
}

/// IP locale utilisée pour joindre `peer` (aucun paquet émis)
fn route_local_ip(peer: SocketAddr) -> IpAddr {
    let probe = std::net::UdpSocket::bind(("0.0.0.0", 0)).and_then(|s| {
        s.connect(peer)?;
        s.local_addr()
    });
    match probe {
        Ok(addr) if !addr.ip().is_unspecified() => addr.ip(),
        _ => IpAddr::V4(Ipv4Addr::LOCALHOST),
    }
}

/// Balise périodique `hub_beacon` vers le port des noeuds edge
pub fn spawn_beacon(
    network: &NetworkConf,
    hub_id: String,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, network.edge_port);
    let period = network.beacon_interval();
    let discovery_port = network.discovery_port;
    tokio::spawn(async move {
        let socket = match UdpSocket::bind(("0.0.0.0", 0)).await {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("[discovery] beacon disabled, bind failed: {e}");
                return;
            }
        };
        if let Err(e) = socket.set_broadcast(true) {
            tracing::warn!("[discovery] beacon disabled, broadcast refused: {e}");
            return;
        }
        let beacon = match encode_json(&DiscoveryMessage::HubBeacon { hub_id, discovery_port }) {
            Ok(txt) => txt,
            Err(e) => {
                tracing::warn!("[discovery] beacon disabled: {e}");
                return;
            }
        };
        let mut ticker = tokio::time::interval(period.max(Duration::from_millis(100)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = socket.send_to(beacon.as_bytes(), target).await {
                        tracing::debug!("[discovery] beacon send failed: {e}");
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::NodeRegistry;

    async fn service(registry: SharedRegistry) -> Arc<DiscoveryService> {
        let network = NetworkConf {
            discovery_bind: "127.0.0.1".into(),
            discovery_port: 0,
            http_port: 8123,
            advertise_host: Some("hub.lab".into()),
            ..Default::default()
        };
        let socket = bind_discovery(&network).await.unwrap();
        DiscoveryService::new(socket, registry, &network, 2_000)
    }

    fn src() -> SocketAddr {
        "192.168.1.40:50001".parse().unwrap()
    }

    #[tokio::test]
    async fn test_announce_registers_and_acks() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(6)));
        let svc = service(Arc::clone(&registry)).await;
        let ack = svc
            .handle_datagram(br#"{"type":"announce","node_id":"b827eb01","hostname":"bench-3","capabilities":["camera"]}"#, src())
            .unwrap();
        assert_eq!(
            ack,
            DiscoveryMessage::AdmissionAck {
                node_id: "b827eb01".into(),
                session_endpoint: "ws://hub.lab:8123/session".into(),
                heartbeat_interval_ms: 2_000,
            }
        );
        let node = registry.get("b827eb01").unwrap();
        assert_eq!(node.metadata.hostname.as_deref(), Some("bench-3"));
        assert_eq!(node.metadata.addr, Some(src()));
    }

    #[tokio::test]
    async fn test_duplicate_announce_is_harmless() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(6)));
        let svc = service(Arc::clone(&registry)).await;
        let announce = br#"{"type":"announce","node_id":"n1"}"#;
        assert!(svc.handle_datagram(announce, src()).is_some());
        assert!(svc.handle_datagram(announce, src()).is_some());
        assert_eq!(registry.len(), 1);
        assert_eq!(svc.stats().admitted, 2);
    }

    #[tokio::test]
    async fn test_malformed_and_foreign_datagrams_ignored() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(6)));
        let svc = service(Arc::clone(&registry)).await;
        assert!(svc.handle_datagram(b"CMD:SET_FPS:5", src()).is_none());
        assert!(svc.handle_datagram(br#"{"type":"hub_beacon","hub_id":"x","discovery_port":1}"#, src()).is_none());
        assert!(registry.is_empty());
        assert_eq!(svc.stats().malformed, 1);
    }

    #[tokio::test]
    async fn test_draining_refuses_announces() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(6)));
        let svc = service(Arc::clone(&registry)).await;
        registry.begin_drain();
        assert!(svc.handle_datagram(br#"{"type":"announce","node_id":"n1"}"#, src()).is_none());
        assert_eq!(svc.stats().refused, 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_udp_round_trip_and_stop() {
        let registry = Arc::new(NodeRegistry::new(Duration::from_secs(6)));
        let svc = service(Arc::clone(&registry)).await;
        let hub_addr = svc.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let task = svc.spawn(stop_rx);

        let node = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        node.send_to(br#"{"type":"announce","node_id":"n1"}"#, hub_addr).await.unwrap();
        let mut buf = [0u8; 512];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), node.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(parse_discovery(&buf[..len]).unwrap(), DiscoveryMessage::AdmissionAck { .. }));

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    }
}
