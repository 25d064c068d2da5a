use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use time::OffsetDateTime;
use tokio::time::Instant;

/// Identifiant stable d'un noeud (MAC sans colons côté edge, ou adresse source)
pub type NodeId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Connecting,
    Active,
    Degraded,
    Disconnected,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeMetadata {
    pub hostname: Option<String>,
    pub capabilities: Vec<String>,
    pub version: Option<String>,
    pub addr: Option<SocketAddr>,
}

#[derive(Debug, Clone)]
pub struct EdgeNode {
    pub node_id: NodeId,
    pub metadata: NodeMetadata,
    /// Rang d'admission (ancienneté), réattribué après une éviction
    pub join_seq: u64,
    pub state: NodeState,
    /// Quota courant en milli-images/s, écrit uniquement par le contrôleur QoS
    pub quota_mfps: u32,
    pub throttled: bool,
    pub last_seen: Instant,
    pub registered_at: OffsetDateTime,
    pub outbound_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    Frame,
    Audio,
}

/// Charge utile capteur encodée (JPEG, PCM...), opaque pour le hub
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Frame(Bytes),
    Audio(Bytes),
}

impl Payload {
    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Frame(_) => PayloadKind::Frame,
            Payload::Audio(_) => PayloadKind::Audio,
        }
    }

    pub fn bytes(&self) -> &Bytes {
        match self {
            Payload::Frame(b) | Payload::Audio(b) => b,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes().is_empty()
    }
}
