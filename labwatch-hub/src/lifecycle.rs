/*!
 * LIFECYCLE CONTROLLER - Phases du hub et déclencheurs d'arrêt
 *
 * FONCTIONNEMENT :
 * - Phases `Starting → Running → Draining → Terminated`, publiées sur un watch
 * - Déclencheurs : SIGINT / SIGTERM / Ctrl-C, ou `request_shutdown` (POST /shutdown)
 * - Signal `stop` partagé par les tâches de fond (discovery, balise, sweep, health)
 * - Watchdog : thread OS armé au début du drain, sortie forcée si le drain déborde
 */

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Starting,
    Running,
    Draining,
    Terminated,
}

/// Code de sortie quand le watchdog coupe un drain trop long
pub const WATCHDOG_EXIT_CODE: i32 = 2;

#[derive(Clone)]
pub struct Lifecycle {
    phase_tx: Arc<watch::Sender<Phase>>,
    stop_tx: Arc<watch::Sender<bool>>,
    trigger: Arc<Notify>,
    reason: Arc<parking_lot::Mutex<Option<String>>>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (phase_tx, _) = watch::channel(Phase::Starting);
        let (stop_tx, _) = watch::channel(false);
        Self {
            phase_tx: Arc::new(phase_tx),
            stop_tx: Arc::new(stop_tx),
            trigger: Arc::new(Notify::new()),
            reason: Arc::new(parking_lot::Mutex::new(None)),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    /// Les phases n'avancent que vers l'avant
    pub fn advance(&self, next: Phase) -> bool {
        let moved = self.phase_tx.send_if_modified(|phase| {
            if next > *phase {
                *phase = next;
                true
            } else {
                false
            }
        });
        if moved {
            tracing::info!("[lifecycle] phase -> {next:?}");
        }
        moved
    }

    /// Coupe les tâches de fond ; idempotent
    pub fn stop_background(&self) {
        self.stop_tx.send_replace(true);
    }

    pub fn request_shutdown(&self, reason: &str) {
        {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason.to_string());
            }
        }
        self.trigger.notify_one();
    }

    /// Attend un signal OS ou une demande interne ; renvoie la raison
    pub async fn wait_for_trigger(&self) -> String {
        tokio::select! {
            _ = self.trigger.notified() => {}
            reason = os_signal() => {
                self.reason.lock().get_or_insert(reason.to_string());
            }
        }
        self.reason.lock().clone().unwrap_or_else(|| "unknown".to_string())
    }
}

#[cfg(unix)]
async fn os_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!("[lifecycle] cannot install SIGTERM handler: {e}");
            return ctrl_c().await;
        }
    };
    tokio::select! {
        r = ctrl_c() => r,
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn os_signal() -> &'static str {
    ctrl_c().await
}

async fn ctrl_c() -> &'static str {
    match tokio::signal::ctrl_c().await {
        Ok(()) => "SIGINT",
        Err(e) => {
            tracing::warn!("[lifecycle] cannot listen for Ctrl-C: {e}");
            std::future::pending().await
        }
    }
}

/// Thread OS indépendant du runtime ; désarmé quand la valeur est droppée
pub struct Watchdog {
    _disarm: std::sync::mpsc::Sender<()>,
}

impl Watchdog {
    pub fn arm(deadline: Duration) -> Self {
        let (tx, rx) = std::sync::mpsc::channel::<()>();
        std::thread::spawn(move || {
            if let Err(std::sync::mpsc::RecvTimeoutError::Timeout) = rx.recv_timeout(deadline) {
                eprintln!("[lifecycle] drain overran {deadline:?}, forcing exit");
                std::process::exit(WATCHDOG_EXIT_CODE);
            }
        });
        Self { _disarm: tx }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_only_moves_forward() {
        let lc = Lifecycle::new();
        assert_eq!(lc.phase(), Phase::Starting);
        assert!(lc.advance(Phase::Running));
        assert!(lc.advance(Phase::Draining));
        assert!(!lc.advance(Phase::Running));
        assert!(!lc.advance(Phase::Draining));
        assert_eq!(lc.phase(), Phase::Draining);
    }

    #[tokio::test]
    async fn test_request_shutdown_wakes_waiter() {
        let lc = Lifecycle::new();
        let waiter = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.wait_for_trigger().await })
        };
        lc.request_shutdown("http");
        lc.request_shutdown("second caller");
        assert_eq!(waiter.await.unwrap(), "http");
    }

    #[tokio::test]
    async fn test_stop_signal_observed() {
        let lc = Lifecycle::new();
        let mut stop = lc.stop_signal();
        assert!(!*stop.borrow());
        lc.stop_background();
        stop.changed().await.unwrap();
        assert!(*stop.borrow());
    }

    #[test]
    fn test_dropped_watchdog_is_disarmed() {
        let dog = Watchdog::arm(Duration::from_millis(50));
        drop(dog);
        std::thread::sleep(Duration::from_millis(120));
        // toujours vivant : le thread a vu la déconnexion avant l'échéance
    }
}
