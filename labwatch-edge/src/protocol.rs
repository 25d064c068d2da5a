//! Wire messages exchanged with the hub (discovery datagrams, session control, binary payloads)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const KIND_FRAME: u8 = 0x01;
pub const KIND_SPEECH: u8 = 0x03;
const HEADER_LEN: usize = 9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscoveryMessage {
    Announce {
        node_id: String,
        hostname: Option<String>,
        capabilities: Vec<String>,
        version: Option<String>,
        timestamp: Option<DateTime<Utc>>,
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
        assigned_frame_rate: f64,
        assigned_bitrate_ceiling: u32,
        throttled: bool,
    },
    Alert { text: String },
    Rejected { reason: String },
}

/// `[kind:u8][seq:u64 BE][payload]`
pub fn encode_data(kind: u8, seq: u64, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(kind);
    out.extend_from_slice(&seq.to_be_bytes());
    out.extend_from_slice(body);
    out
}

pub fn decode_data(buf: &[u8]) -> Option<(u8, u64, &[u8])> {
    if buf.len() < HEADER_LEN {
        return None;
    }
    let mut seq = [0u8; 8];
    seq.copy_from_slice(&buf[1..HEADER_LEN]);
    Some((buf[0], u64::from_be_bytes(seq), &buf[HEADER_LEN..]))
}
