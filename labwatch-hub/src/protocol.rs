/*!
 * PROTOCOLE FILAIRE - Messages discovery (UDP) et session (WebSocket)
 *
 * FONCTIONNEMENT :
 * - Discovery : datagrammes JSON tagués par `type` (announce / admission_ack / hub_beacon)
 * - Session, contrôle : messages texte JSON (hello, heartbeat, rate, alert, rejected)
 * - Session, données : trames binaires `[kind:u8][seq:u64 BE][payload]`
 *
 * Tout ce qui ne parse pas est une `SessionError::Protocol` ; l'appelant décide
 * (discovery : drop + debug, session : erreur comptée).
 */

use crate::error::SessionError;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const MAX_NODE_ID_LEN: usize = 64;
pub const DATA_HEADER_LEN: usize = 9;

pub const KIND_FRAME: u8 = 0x01;
pub const KIND_AUDIO: u8 = 0x02;
pub const KIND_SPEECH: u8 = 0x03;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Announce {
        node_id: String,
        #[serde(default)]
        hostname: Option<String>,
        #[serde(default)]
        capabilities: Vec<String>,
        #[serde(default)]
        version: Option<String>,
        #[serde(default)]
        timestamp: Option<String>,
    },
    AdmissionAck {
        node_id: String,
        session_endpoint: String,
        heartbeat_interval_ms: u64,
    },
    HubBeacon {
        hub_id: String,
        discovery_port: u16,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    Hello { node_id: String },
    Heartbeat { node_id: String },
    Rate {
        /// images/s
        assigned_frame_rate: f64,
        /// kbit/s
        assigned_bitrate_ceiling: u32,
        throttled: bool,
    },
    Alert { text: String },
    Rejected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataKind {
    Frame,
    Audio,
    Speech,
}

impl DataKind {
    pub fn tag(self) -> u8 {
        match self {
            DataKind::Frame => KIND_FRAME,
            DataKind::Audio => KIND_AUDIO,
            DataKind::Speech => KIND_SPEECH,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            KIND_FRAME => Some(DataKind::Frame),
            KIND_AUDIO => Some(DataKind::Audio),
            KIND_SPEECH => Some(DataKind::Speech),
            _ => None,
        }
    }
}

/// Trame binaire décodée
#[derive(Debug, Clone, PartialEq)]
pub struct DataFrame {
    pub kind: DataKind,
    pub seq: u64,
    pub body: Bytes,
}

/// Message brut d'un transport de session, indépendant de la lib WebSocket
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Text(String),
    Binary(Bytes),
    Close,
}

/// Identifiant de noeud : non vide, ≤ 64 caractères `[A-Za-z0-9_.:-]`
pub fn validate_node_id(node_id: &str) -> Result<(), SessionError> {
    if node_id.is_empty() {
        return Err(SessionError::Protocol("empty node_id".into()));
    }
    if node_id.len() > MAX_NODE_ID_LEN {
        return Err(SessionError::Protocol(format!("node_id longer than {MAX_NODE_ID_LEN} chars")));
    }
    if !node_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | ':' | '-'))
    {
        return Err(SessionError::Protocol(format!("invalid characters in node_id {node_id:?}")));
    }
    Ok(())
}

pub fn parse_discovery(buf: &[u8]) -> Result<DiscoveryMessage, SessionError> {
    let msg: DiscoveryMessage = serde_json::from_slice(buf)
        .map_err(|e| SessionError::Protocol(format!("bad discovery datagram: {e}")))?;
    match &msg {
        DiscoveryMessage::Announce { node_id, .. } | DiscoveryMessage::AdmissionAck { node_id, .. } => {
            validate_node_id(node_id)?
        }
        DiscoveryMessage::HubBeacon { .. } => {}
    }
    Ok(msg)
}

pub fn parse_control(txt: &str) -> Result<ControlMessage, SessionError> {
    let msg: ControlMessage = serde_json::from_str(txt)
        .map_err(|e| SessionError::Protocol(format!("bad control message: {e}")))?;
    if let ControlMessage::Hello { node_id } | ControlMessage::Heartbeat { node_id } = &msg {
        validate_node_id(node_id)?;
    }
    Ok(msg)
}

pub fn encode_json<T: Serialize>(msg: &T) -> Result<String, SessionError> {
    serde_json::to_string(msg).map_err(|e| SessionError::Protocol(format!("encode failed: {e}")))
}

pub fn encode_data(kind: DataKind, seq: u64, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(DATA_HEADER_LEN + body.len());
    buf.put_u8(kind.tag());
    buf.put_u64(seq);
    buf.put_slice(body);
    buf.freeze()
}

pub fn decode_data(buf: Bytes) -> Result<DataFrame, SessionError> {
    if buf.len() < DATA_HEADER_LEN {
        return Err(SessionError::Protocol(format!("binary frame too short ({} bytes)", buf.len())));
    }
    let kind = DataKind::from_tag(buf[0])
        .ok_or_else(|| SessionError::Protocol(format!("unknown payload kind 0x{:02x}", buf[0])))?;
    let mut seq_bytes = [0u8; 8];
    seq_bytes.copy_from_slice(&buf[1..DATA_HEADER_LEN]);
    Ok(DataFrame {
        kind,
        seq: u64::from_be_bytes(seq_bytes),
        body: buf.slice(DATA_HEADER_LEN..),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_announce_with_missing_optionals() {
        let msg = parse_discovery(br#"{"type":"announce","node_id":"b827eb12ab34"}"#).unwrap();
        match msg {
            DiscoveryMessage::Announce { node_id, capabilities, hostname, .. } => {
                assert_eq!(node_id, "b827eb12ab34");
                assert!(capabilities.is_empty());
                assert!(hostname.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_malformed_datagrams_are_rejected() {
        assert!(parse_discovery(b"\xff\x00garbage").is_err());
        assert!(parse_discovery(br#"{"type":"announce"}"#).is_err());
        assert!(parse_discovery(br#"{"type":"announce","node_id":""}"#).is_err());
        assert!(parse_discovery(br#"{"type":"announce","node_id":"a b"}"#).is_err());
        assert!(parse_discovery(br#"{"type":"what","node_id":"a"}"#).is_err());
        let long = format!(r#"{{"type":"announce","node_id":"{}"}}"#, "x".repeat(65));
        assert!(parse_discovery(long.as_bytes()).is_err());
    }

    #[test]
    fn test_ack_wire_shape() {
        let ack = DiscoveryMessage::AdmissionAck {
            node_id: "n1".into(),
            session_endpoint: "ws://10.0.0.2:8001/session".into(),
            heartbeat_interval_ms: 2000,
        };
        let v: serde_json::Value = serde_json::from_str(&encode_json(&ack).unwrap()).unwrap();
        assert_eq!(v["type"], "admission_ack");
        assert_eq!(v["heartbeat_interval_ms"], 2000);
    }

    #[test]
    fn test_rate_directive_wire_shape() {
        let txt = encode_json(&ControlMessage::Rate {
            assigned_frame_rate: 4.0,
            assigned_bitrate_ceiling: 480,
            throttled: false,
        })
        .unwrap();
        let v: serde_json::Value = serde_json::from_str(&txt).unwrap();
        assert_eq!(v["type"], "rate");
        assert_eq!(v["assigned_frame_rate"], 4.0);
        assert_eq!(v["assigned_bitrate_ceiling"], 480);
    }

    #[test]
    fn test_data_frame_header() {
        let buf = encode_data(DataKind::Audio, 0x0102, b"pcm");
        assert_eq!(&buf[..DATA_HEADER_LEN], &[0x02, 0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        let frame = decode_data(buf).unwrap();
        assert_eq!(frame.kind, DataKind::Audio);
        assert_eq!(frame.seq, 0x0102);
        assert_eq!(&frame.body[..], b"pcm");
    }

    #[test]
    fn test_data_frame_errors() {
        assert!(decode_data(Bytes::from_static(&[0x01, 0, 0])).is_err());
        assert!(decode_data(Bytes::from_static(&[0x09, 0, 0, 0, 0, 0, 0, 0, 1])).is_err());
        // en-tête seul : corps vide mais valide
        let empty = decode_data(Bytes::from_static(&[0x01, 0, 0, 0, 0, 0, 0, 0, 7])).unwrap();
        assert!(empty.body.is_empty());
    }
}
