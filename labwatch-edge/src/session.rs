//! Session with the hub over WebSocket
//!
//! `hello` first, then one loop multiplexing heartbeats, paced frame capture
//! and inbound control messages (`rate` applied immediately, `alert` logged).

use crate::capture::{Pacer, SyntheticCamera};
use crate::discovery::Admission;
use crate::protocol::{decode_data, encode_data, ControlMessage, KIND_FRAME, KIND_SPEECH};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("hub rejected session: {0}")]
    Rejected(String),
    #[error("websocket error: {0}")]
    Transport(#[from] tungstenite::Error),
    #[error("invalid message: {0}")]
    Protocol(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// fermeture par le hub : retour en discovery
    Closed,
    /// arrêt local demandé
    Stopped,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SessionCounters {
    pub frames_sent: u64,
    pub directives: u64,
    pub alerts: u64,
}

pub struct SessionOptions {
    pub node_id: String,
    pub initial_fps: f64,
    pub frame_bytes: usize,
}

pub async fn run_session(
    admission: &Admission,
    opts: &SessionOptions,
    mut stop: watch::Receiver<bool>,
) -> Result<(SessionEnd, SessionCounters), SessionError> {
    let (ws, _) = tokio_tungstenite::connect_async(admission.session_endpoint.as_str()).await?;
    let (mut sink, mut stream) = ws.split();
    info!("Session open with {}", admission.session_endpoint);

    let hello = serde_json::to_string(&ControlMessage::Hello { node_id: opts.node_id.clone() })?;
    sink.send(Message::Text(hello.into())).await?;
    let heartbeat = serde_json::to_string(&ControlMessage::Heartbeat { node_id: opts.node_id.clone() })?;

    let mut camera = SyntheticCamera::new(opts.frame_bytes);
    let mut pacer = Pacer::new(opts.initial_fps);
    let mut counters = SessionCounters::default();
    let mut heartbeats = tokio::time::interval(admission.heartbeat_interval);
    heartbeats.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        let due = pacer.deadline();
        let frame_due = async move {
            match due {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = heartbeats.tick() => {
                sink.send(Message::Text(heartbeat.clone().into())).await?;
            }
            _ = frame_due => {
                let (seq, body) = camera.capture();
                sink.send(Message::Binary(encode_data(KIND_FRAME, seq, &body).into())).await?;
                counters.frames_sent += 1;
                pacer.advance();
            }
            inbound = stream.next() => {
                let msg = match inbound {
                    Some(msg) => msg?,
                    None => return Ok((SessionEnd::Closed, counters)),
                };
                match msg {
                    Message::Text(text) => match serde_json::from_str::<ControlMessage>(text.as_str())? {
                        ControlMessage::Rate { assigned_frame_rate, assigned_bitrate_ceiling, throttled } => {
                            counters.directives += 1;
                            info!(
                                "Rate directive: {assigned_frame_rate:.2} fps, {assigned_bitrate_ceiling} kbps{}",
                                if throttled { " (throttled)" } else { "" }
                            );
                            pacer.set_rate(assigned_frame_rate);
                            if pacer.is_paused() {
                                info!("Capture paused by hub");
                            }
                        }
                        ControlMessage::Alert { text } => {
                            counters.alerts += 1;
                            warn!("ALERT: {text}");
                        }
                        ControlMessage::Rejected { reason } => return Err(SessionError::Rejected(reason)),
                        other => debug!("Ignoring {other:?}"),
                    },
                    Message::Binary(data) => match decode_data(&data) {
                        Some((KIND_SPEECH, seq, audio)) => info!("Speech #{seq} from hub ({} bytes)", audio.len()),
                        Some((kind, _, _)) => debug!("Ignoring binary kind {kind:#04x}"),
                        None => debug!("Short binary message ({} bytes)", data.len()),
                    },
                    Message::Close(_) => return Ok((SessionEnd::Closed, counters)),
                    _ => {}
                }
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    let _ = sink.send(Message::Close(None)).await;
                    return Ok((SessionEnd::Stopped, counters));
                }
            }
        }
    }
}

/// Délai avant de repasser en discovery
pub fn backoff(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(1 << attempt.min(4)).min(Duration::from_secs(60))
}
