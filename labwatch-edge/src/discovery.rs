//! Hub discovery over UDP
//!
//! Announces the node (broadcast, configured hub address, and the source of
//! any `hub_beacon` heard) until an `admission_ack` for this node comes back.

use crate::config::HubConfig;
use crate::identity::NodeIdentity;
use crate::protocol::DiscoveryMessage;
use anyhow::{Context, Result};
use chrono::Utc;
use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct Admission {
    pub session_endpoint: String,
    pub heartbeat_interval: Duration,
}

pub struct Announcer {
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    announce: Vec<u8>,
    node_id: String,
    interval: Duration,
}

impl Announcer {
    pub async fn bind(cfg: &HubConfig, identity: &NodeIdentity, capabilities: &[String]) -> Result<Self> {
        // port balise occupé (deux agents sur la même machine) : port éphémère
        let socket = match UdpSocket::bind(("0.0.0.0", cfg.beacon_port)).await {
            Ok(s) => s,
            Err(e) => {
                warn!("Beacon port {} unavailable ({e}), beacons will be missed", cfg.beacon_port);
                UdpSocket::bind(("0.0.0.0", 0)).await.context("binding discovery socket")?
            }
        };
        socket.set_broadcast(true).context("enabling broadcast")?;

        let mut targets = Vec::new();
        if let Ok(addr) = format!("{}:{}", cfg.broadcast_addr, cfg.discovery_port).parse() {
            targets.push(addr);
        }
        if let Some(hub) = &cfg.hub_addr {
            match hub.to_socket_addrs().map(|mut it| it.next()) {
                Ok(Some(addr)) => targets.push(addr),
                _ => warn!("Ignoring unresolvable hub address {hub}"),
            }
        }

        let announce = serde_json::to_vec(&DiscoveryMessage::Announce {
            node_id: identity.node_id.clone(),
            hostname: Some(identity.hostname.clone()),
            capabilities: capabilities.to_vec(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
            timestamp: Some(Utc::now()),
        })?;

        Ok(Self {
            socket,
            targets,
            announce,
            node_id: identity.node_id.clone(),
            interval: cfg.announce_interval(),
        })
    }

    /// Annonce jusqu'à l'admission
    pub async fn discover(&mut self) -> Result<Admission> {
        let mut buf = [0u8; 2048];
        loop {
            self.send_announces().await;
            let deadline = tokio::time::Instant::now() + self.interval;
            loop {
                let received = match tokio::time::timeout_at(deadline, self.socket.recv_from(&mut buf)).await {
                    Ok(r) => r,
                    Err(_) => break,
                };
                let (len, src) = match received {
                    Ok(r) => r,
                    Err(e) => {
                        debug!("Discovery recv error: {e}");
                        continue;
                    }
                };
                match serde_json::from_slice::<DiscoveryMessage>(&buf[..len]) {
                    Ok(DiscoveryMessage::AdmissionAck { node_id, session_endpoint, heartbeat_interval_ms })
                        if node_id == self.node_id =>
                    {
                        info!("Admitted by hub at {src}, session endpoint {session_endpoint}");
                        return Ok(Admission {
                            session_endpoint,
                            heartbeat_interval: Duration::from_millis(heartbeat_interval_ms.max(100)),
                        });
                    }
                    Ok(DiscoveryMessage::HubBeacon { hub_id, discovery_port }) => {
                        let hub = SocketAddr::new(src.ip(), discovery_port);
                        if !self.targets.contains(&hub) {
                            info!("Heard hub {hub_id} at {hub}");
                            self.targets.push(hub);
                        }
                        self.send_to(hub).await;
                    }
                    Ok(_) => {}
                    Err(e) => debug!("Ignoring datagram from {src}: {e}"),
                }
            }
        }
    }

    async fn send_announces(&self) {
        for target in &self.targets {
            self.send_to(*target).await;
        }
    }

    async fn send_to(&self, target: SocketAddr) {
        if let Err(e) = self.socket.send_to(&self.announce, target).await {
            debug!("Announce to {target} failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> NodeIdentity {
        NodeIdentity {
            node_id: "b827eb000042".into(),
            hostname: "bench-7".into(),
            os: "linux".into(),
            architecture: "aarch64".into(),
            primary_mac: None,
        }
    }

    #[tokio::test]
    async fn test_discover_against_fake_hub() {
        let hub = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cfg = HubConfig {
            beacon_port: 0,
            broadcast_addr: "127.0.0.1".into(),
            discovery_port: 9, // discard
            hub_addr: Some(hub.local_addr().unwrap().to_string()),
            announce_interval_ms: 200,
            ..Default::default()
        };
        let mut announcer = Announcer::bind(&cfg, &identity(), &["camera".into()]).await.unwrap();
        let client = tokio::spawn(async move { announcer.discover().await });

        let mut buf = [0u8; 2048];
        let (len, src) = hub.recv_from(&mut buf).await.unwrap();
        let msg: DiscoveryMessage = serde_json::from_slice(&buf[..len]).unwrap();
        let DiscoveryMessage::Announce { node_id, capabilities, .. } = msg else {
            panic!("expected announce");
        };
        assert_eq!(node_id, "b827eb000042");
        assert_eq!(capabilities, vec!["camera".to_string()]);

        // ack d'un autre noeud ignoré, puis le bon
        for id in ["someone-else", "b827eb000042"] {
            let ack = DiscoveryMessage::AdmissionAck {
                node_id: id.into(),
                session_endpoint: format!("ws://127.0.0.1:1/{id}"),
                heartbeat_interval_ms: 1500,
            };
            hub.send_to(&serde_json::to_vec(&ack).unwrap(), src).await.unwrap();
        }
        let admission = tokio::time::timeout(Duration::from_secs(3), client).await.unwrap().unwrap().unwrap();
        assert_eq!(admission.session_endpoint, "ws://127.0.0.1:1/b827eb000042");
        assert_eq!(admission.heartbeat_interval, Duration::from_millis(1500));
    }
}
