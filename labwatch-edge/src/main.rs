//! LabWatch Edge - capture node agent
//!
//! - Identity derived from the primary MAC address
//! - UDP announce until the hub admits the node (hub beacons heard too)
//! - WebSocket session: hello, heartbeats, frames paced at the assigned rate
//! - Session lost: back to discovery with a capped backoff

mod capture;
mod config;
mod discovery;
mod identity;
mod protocol;
mod session;

use anyhow::{Context, Result};
use config::EdgeConfig;
use discovery::Announcer;
use identity::NodeIdentity;
use session::{backoff, run_session, SessionEnd, SessionOptions};
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_target(false).init();
    info!("Starting LabWatch edge agent v{}", env!("CARGO_PKG_VERSION"));

    let config_path = EdgeConfig::config_file_path()?;
    let config = EdgeConfig::load_from(&config_path).await?;
    if !config_path.exists() {
        // premier lancement : écrit les valeurs par défaut pour édition
        if let Err(e) = config.save_to(&config_path).await {
            warn!("Could not write default config to {}: {e}", config_path.display());
        }
    }

    let identity = NodeIdentity::discover(config.node.node_id.as_deref()).context("Failed to identify node")?;
    info!(
        "Node {} ({}/{}, mac {})",
        identity.node_id,
        identity.os,
        identity.architecture,
        identity.primary_mac.as_deref().unwrap_or("none")
    );
    let mut announcer = Announcer::bind(&config.hub, &identity, &config.node.capabilities).await?;
    let opts = SessionOptions {
        node_id: identity.node_id.clone(),
        initial_fps: config.capture.initial_fps,
        frame_bytes: config.capture.frame_bytes,
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            let _ = stop_tx.send(true);
        }
    });

    let mut failures = 0u32;
    loop {
        let mut stop = stop_rx.clone();
        let admission = tokio::select! {
            admission = announcer.discover() => admission?,
            _ = stop.changed() => break,
        };
        match run_session(&admission, &opts, stop_rx.clone()).await {
            Ok((SessionEnd::Stopped, counters)) => {
                info!("Session stopped after {} frames", counters.frames_sent);
                break;
            }
            Ok((SessionEnd::Closed, counters)) => {
                info!("Hub closed session after {} frames, rediscovering", counters.frames_sent);
                failures = 0;
            }
            Err(e) => {
                error!("Session failed: {e}");
                failures += 1;
            }
        }
        let delay = backoff(failures, config.hub.reconnect_delay());
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.changed() => break,
        }
    }
    info!("Edge agent stopped");
    Ok(())
}
