/*!
 * SESSION MANAGER - Une session full-duplex par noeud edge
 *
 * RÔLE :
 * Chaque session est une tâche explicite qui `select!` sur quatre sources :
 * messages entrants, changements de plan QoS, file sortante, minuterie de vie.
 * Aucun callback imbriqué ; tout passe par des canaux bornés.
 *
 * FONCTIONNEMENT :
 * - Handshake : premier message = `hello` ; noeud inconnu ou hub en drain → `rejected`
 * - Directive de débit envoyée à la première apparition dans le plan, puis
 *   uniquement quand l'allocation du noeud change
 * - Charges utiles entrantes : numéro de séquence strictement croissant, sinon
 *   drop compté ; soumission au pipeline sans attente
 * - File sortante bornée, drop du plus ancien à saturation ; envoi avec timeout
 *   et nombre d'essais borné puis drop + log
 * - N erreurs consécutives → Degraded ; pas de récupération pendant la grâce →
 *   teardown + éviction ; fermeture propre → teardown immédiat
 */

use crate::config::SessionConf;
use crate::error::{RegistryError, SessionError};
use crate::models::{NodeId, Payload};
use crate::pipeline::{Delivery, DeliverySink, Pipeline, SubmitError};
use crate::protocol::{
    decode_data, encode_data, encode_json, parse_control, ControlMessage, DataKind, WireMessage,
};
use crate::qos::{Allocation, QosPlan};
use crate::registry::{MembershipEvent, SharedRegistry};
use crate::state::{new_state, Counter, Shared};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;

/// Transport d'une session (WebSocket en production, canal en test)
#[async_trait]
pub trait Transport: Send {
    /// `None` = flux terminé
    async fn recv(&mut self) -> Option<Result<WireMessage, SessionError>>;

    async fn send(&mut self, msg: WireMessage) -> Result<(), SessionError>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Control(ControlMessage),
    Speech(Bytes),
}

#[derive(Default)]
pub struct SessionCounters {
    pub opened: Counter,
    pub closed: Counter,
    pub rejected: Counter,
    pub stale_dropped: Counter,
    pub outbound_dropped: Counter,
    pub send_failures: Counter,
    pub pipeline_rejected: Counter,
    pub frames_in: Counter,
    pub bytes_in: Counter,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct SessionStats {
    pub live: usize,
    pub opened: u64,
    pub closed: u64,
    pub rejected: u64,
    pub stale_dropped: u64,
    pub outbound_dropped: u64,
    pub send_failures: u64,
    pub pipeline_rejected: u64,
    pub frames_in: u64,
    pub bytes_in: u64,
}

/// File sortante bornée, drop-oldest
pub struct OutboundQueue {
    items: Mutex<VecDeque<Outbound>>,
    ready: Notify,
    capacity: usize,
    dropped: Counter,
    counters: Arc<SessionCounters>,
}

impl OutboundQueue {
    pub fn new(capacity: usize, counters: Arc<SessionCounters>) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
            capacity: capacity.max(1),
            dropped: Counter::default(),
            counters,
        }
    }

    /// false si un élément plus ancien a été sacrifié
    pub fn push(&self, item: Outbound) -> bool {
        let evicted = {
            let mut items = self.items.lock();
            let evicted = if items.len() >= self.capacity { items.pop_front() } else { None };
            items.push_back(item);
            evicted
        };
        self.ready.notify_one();
        if evicted.is_some() {
            self.dropped.incr();
            self.counters.outbound_dropped.incr();
            return false;
        }
        true
    }

    pub fn pop(&self) -> Option<Outbound> {
        self.items.lock().pop_front()
    }

    pub async fn next(&self) -> Outbound {
        loop {
            let ready = self.ready.notified();
            if let Some(item) = self.pop() {
                return item;
            }
            ready.await;
        }
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.get()
    }
}

struct DirectoryEntry {
    session_id: u64,
    join_seq: u64,
    outbound: Arc<OutboundQueue>,
    close: Arc<Notify>,
}

/// Annuaire noeud → file sortante ; point d'entrée des résultats du pipeline
pub struct SessionDirectory {
    entries: Shared<HashMap<NodeId, DirectoryEntry>>,
    registry: SharedRegistry,
    counters: Arc<SessionCounters>,
}

impl SessionDirectory {
    pub fn new(registry: SharedRegistry) -> Arc<Self> {
        Arc::new(Self {
            entries: new_state(HashMap::new()),
            registry,
            counters: Arc::new(SessionCounters::default()),
        })
    }

    pub fn counters(&self) -> &Arc<SessionCounters> {
        &self.counters
    }

    pub fn live(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn has_session(&self, node_id: &str) -> bool {
        self.entries.lock().contains_key(node_id)
    }

    /// Dépose un message sortant ; false si le noeud n'a pas de session
    pub fn enqueue(&self, node_id: &str, item: Outbound) -> bool {
        let outbound = match self.entries.lock().get(node_id) {
            Some(entry) => Arc::clone(&entry.outbound),
            None => return false,
        };
        if !outbound.push(item) {
            tracing::debug!("[session] {node_id} outbound saturated, dropped oldest");
        }
        self.registry.set_outbound_depth(node_id, outbound.len());
        true
    }

    fn insert(&self, node_id: &str, entry: DirectoryEntry) {
        let previous = self.entries.lock().insert(node_id.to_string(), entry);
        if let Some(previous) = previous {
            tracing::info!("[session] {node_id} reconnected, closing previous session");
            previous.close.notify_one();
        }
    }

    fn remove(&self, node_id: &str, session_id: u64) {
        let mut entries = self.entries.lock();
        if entries.get(node_id).is_some_and(|e| e.session_id == session_id) {
            entries.remove(node_id);
        }
    }

    /// Ferme la session si le noeud qu'elle sert n'existe plus dans le registre
    fn close_if_evicted(&self, node_id: &str) {
        let current_seq = self.registry.get(node_id).map(|n| n.join_seq);
        let entries = self.entries.lock();
        if let Some(entry) = entries.get(node_id) {
            if current_seq != Some(entry.join_seq) {
                entry.close.notify_one();
            }
        }
    }
}

impl DeliverySink for SessionDirectory {
    fn deliver(&self, node_id: &str, delivery: Delivery) -> bool {
        let item = match delivery {
            Delivery::Alert(text) => Outbound::Control(ControlMessage::Alert { text }),
            Delivery::Speech(audio) => Outbound::Speech(audio),
        };
        let delivered = self.enqueue(node_id, item);
        if !delivered {
            tracing::debug!("[session] result for {node_id} discarded, no live session");
        }
        delivered
    }
}

/// Issue d'une session, pour les logs et les tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Rejected(String),
    Closed,
    TornDown,
    Evicted,
    Superseded,
}

struct Session {
    node_id: NodeId,
    session_id: u64,
    last_seq: Option<u64>,
    frames_in: u64,
    bytes_in: u64,
    consecutive_errors: u32,
    degraded_since: Option<Instant>,
    last_directive: Option<Allocation>,
    /// Dernière directive non délivrée : renvoyée dès que le lien répond
    directive_pending: bool,
}

pub struct SessionManager {
    registry: SharedRegistry,
    plans: watch::Receiver<Arc<QosPlan>>,
    pipeline: Arc<Pipeline>,
    directory: Arc<SessionDirectory>,
    conf: SessionConf,
    liveness: Duration,
    draining: AtomicBool,
    next_session_id: AtomicU64,
}

impl SessionManager {
    pub fn new(
        registry: SharedRegistry,
        plans: watch::Receiver<Arc<QosPlan>>,
        pipeline: Arc<Pipeline>,
        directory: Arc<SessionDirectory>,
        conf: SessionConf,
        liveness: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            plans,
            pipeline,
            directory,
            conf,
            liveness,
            draining: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
        })
    }

    pub fn directory(&self) -> &Arc<SessionDirectory> {
        &self.directory
    }

    pub fn begin_drain(&self) {
        self.draining.store(true, Ordering::Release);
    }

    pub fn stats(&self) -> SessionStats {
        let c = &self.directory.counters;
        SessionStats {
            live: self.directory.live(),
            opened: c.opened.get(),
            closed: c.closed.get(),
            rejected: c.rejected.get(),
            stale_dropped: c.stale_dropped.get(),
            outbound_dropped: c.outbound_dropped.get(),
            send_failures: c.send_failures.get(),
            pipeline_rejected: c.pipeline_rejected.get(),
            frames_in: c.frames_in.get(),
            bytes_in: c.bytes_in.get(),
        }
    }

    /// Ferme les sessions des noeuds évincés par le balayage du registre
    pub fn spawn_eviction_watcher(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let mut events = self.registry.subscribe();
        let directory = Arc::clone(&self.directory);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(MembershipEvent::Evicted(node_id)) => directory.close_if_evicted(&node_id),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        let ids: Vec<NodeId> = directory.entries.lock().keys().cloned().collect();
                        for id in ids {
                            directory.close_if_evicted(&id);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Déroule une session complète sur un transport déjà ouvert
    pub async fn run<T: Transport>(&self, mut transport: T) -> SessionEnd {
        let admitted = match self.handshake(&mut transport).await {
            Ok(node_id) => self.registry.activate(&node_id).map_err(SessionError::from),
            Err(e) => Err(e),
        };
        let node = match admitted {
            Ok(node) => node,
            Err(e) => {
                let reason = match e {
                    SessionError::Rejected(reason) => reason,
                    other => other.to_string(),
                };
                tracing::info!("[session] refused: {reason}");
                let _ = self.reject(&mut transport, &reason).await;
                return SessionEnd::Rejected(reason);
            }
        };
        let node_id = node.node_id.clone();

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let outbound = Arc::new(OutboundQueue::new(self.conf.outbound_depth, Arc::clone(&self.directory.counters)));
        let close = Arc::new(Notify::new());
        self.directory.insert(
            &node_id,
            DirectoryEntry {
                session_id,
                join_seq: node.join_seq,
                outbound: Arc::clone(&outbound),
                close: Arc::clone(&close),
            },
        );
        self.directory.counters.opened.incr();
        tracing::info!("[session] {node_id} session {session_id} open");

        let mut session = Session {
            node_id: node_id.clone(),
            session_id,
            last_seq: None,
            frames_in: 0,
            bytes_in: 0,
            consecutive_errors: 0,
            degraded_since: None,
            last_directive: None,
            directive_pending: false,
        };
        let end = self.drive(&mut session, &mut transport, &outbound, &close).await;

        self.directory.remove(&node_id, session_id);
        self.directory.counters.closed.incr();
        match end {
            SessionEnd::Closed | SessionEnd::TornDown => {
                self.registry.evict(&node_id);
            }
            _ => {}
        }
        let _ = transport.send(WireMessage::Close).await;
        tracing::info!(
            "[session] {node_id} session {session_id} ended ({end:?}) after {} payloads / {} bytes",
            session.frames_in,
            session.bytes_in
        );
        end
    }

    async fn handshake<T: Transport>(&self, transport: &mut T) -> Result<NodeId, SessionError> {
        let draining = || SessionError::Rejected("hub draining".into());
        if self.draining.load(Ordering::Acquire) {
            return Err(draining());
        }
        let first = tokio::time::timeout(self.liveness, transport.recv())
            .await
            .map_err(|_| SessionError::Rejected("no hello before timeout".into()))?;
        let node_id = match first {
            Some(Ok(WireMessage::Text(txt))) => match parse_control(&txt)? {
                ControlMessage::Hello { node_id } => node_id,
                _ => return Err(SessionError::Rejected("first message must be hello".into())),
            },
            Some(Ok(_)) => return Err(SessionError::Rejected("first message must be hello".into())),
            Some(Err(e)) => return Err(e),
            None => return Err(SessionError::Rejected("transport closed during handshake".into())),
        };
        if self.draining.load(Ordering::Acquire) {
            return Err(draining());
        }
        if self.registry.get(&node_id).is_none() {
            return Err(RegistryError::UnknownNode(node_id).into());
        }
        Ok(node_id)
    }

    async fn reject<T: Transport>(&self, transport: &mut T, reason: &str) -> Result<(), SessionError> {
        self.directory.counters.rejected.incr();
        let txt = encode_json(&ControlMessage::Rejected { reason: reason.to_string() })?;
        self.send_with_retry(transport, WireMessage::Text(txt)).await?;
        transport.send(WireMessage::Close).await
    }

    async fn drive<T: Transport>(
        &self,
        session: &mut Session,
        transport: &mut T,
        outbound: &OutboundQueue,
        close: &Notify,
    ) -> SessionEnd {
        let mut plans = self.plans.clone();
        let current = plans.borrow_and_update().clone();
        self.apply_plan(session, transport, &current).await;

        let mut deadline = Instant::now() + self.liveness;
        loop {
            if let Some(since) = session.degraded_since {
                if since.elapsed() >= self.conf.teardown_grace() {
                    tracing::warn!("[session] {} not recovered within grace, tearing down", session.node_id);
                    return SessionEnd::TornDown;
                }
            }
            tokio::select! {
                inbound = transport.recv() => match inbound {
                    None | Some(Ok(WireMessage::Close)) => return SessionEnd::Closed,
                    Some(Ok(msg)) => {
                        deadline = Instant::now() + self.liveness;
                        match self.handle_inbound(session, msg) {
                            Ok(()) => {
                                self.on_healthy(session);
                                self.resend_pending(session, transport, &plans).await;
                            }
                            Err(e) => {
                                tracing::debug!("[session] {} inbound error: {e}", session.node_id);
                                self.on_fault(session);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        tracing::debug!("[session] {} transport error: {e}", session.node_id);
                        self.on_fault(session);
                    }
                },
                changed = plans.changed() => {
                    if changed.is_err() {
                        return SessionEnd::Closed;
                    }
                    let plan = plans.borrow_and_update().clone();
                    self.apply_plan(session, transport, &plan).await;
                },
                item = outbound.next() => {
                    self.registry.set_outbound_depth(&session.node_id, outbound.len());
                    let wire = match item {
                        Outbound::Control(msg) => encode_json(&msg).map(WireMessage::Text),
                        Outbound::Speech(audio) => Ok(WireMessage::Binary(encode_data(DataKind::Speech, 0, &audio))),
                    };
                    match wire {
                        Ok(wire) => {
                            if self.send_with_retry(transport, wire).await.is_err() {
                                self.on_fault(session);
                            }
                        }
                        Err(e) => tracing::warn!("[session] {} dropped unencodable message: {e}", session.node_id),
                    }
                },
                _ = close.notified() => {
                    return if self.registry.get(&session.node_id).is_some() {
                        SessionEnd::Superseded
                    } else {
                        SessionEnd::Evicted
                    };
                },
                _ = tokio::time::sleep_until(deadline) => {
                    deadline = Instant::now() + self.liveness;
                    tracing::debug!("[session] {} silent for {:?}", session.node_id, self.liveness);
                    self.on_fault(session);
                    self.resend_pending(session, transport, &plans).await;
                },
            }
        }
    }

    fn handle_inbound(&self, session: &mut Session, msg: WireMessage) -> Result<(), SessionError> {
        match msg {
            WireMessage::Text(txt) => match parse_control(&txt)? {
                ControlMessage::Heartbeat { node_id } | ControlMessage::Hello { node_id } => {
                    if node_id != session.node_id {
                        return Err(SessionError::Protocol(format!("heartbeat for foreign node {node_id}")));
                    }
                    self.registry.heartbeat(&session.node_id);
                    Ok(())
                }
                other => Err(SessionError::Protocol(format!("unexpected message from node: {other:?}"))),
            },
            WireMessage::Binary(buf) => {
                let frame = decode_data(buf)?;
                let payload = match frame.kind {
                    DataKind::Frame => Payload::Frame(frame.body),
                    DataKind::Audio => Payload::Audio(frame.body),
                    DataKind::Speech => return Err(SessionError::Protocol("speech is hub-to-node only".into())),
                };
                self.registry.heartbeat(&session.node_id);
                if session.last_seq.is_some_and(|last| frame.seq <= last) {
                    let stale = self.directory.counters.stale_dropped.incr();
                    tracing::debug!(
                        "[session] {} stale seq {} (last {:?}), dropped (total {stale})",
                        session.node_id,
                        frame.seq,
                        session.last_seq
                    );
                    return Ok(());
                }
                session.last_seq = Some(frame.seq);
                session.frames_in += 1;
                session.bytes_in += payload.len() as u64;
                self.directory.counters.frames_in.incr();
                self.directory.counters.bytes_in.add(payload.len() as u64);
                match self.pipeline.try_submit(&session.node_id, frame.seq, payload) {
                    Ok(()) => {}
                    Err(SubmitError::Full) | Err(SubmitError::Closed) => {
                        self.directory.counters.pipeline_rejected.incr();
                    }
                }
                Ok(())
            }
            WireMessage::Close => Ok(()),
        }
    }

    fn on_healthy(&self, session: &mut Session) {
        session.consecutive_errors = 0;
        if session.degraded_since.take().is_some() {
            self.registry.recover(&session.node_id);
        }
    }

    fn on_fault(&self, session: &mut Session) {
        session.consecutive_errors += 1;
        if session.degraded_since.is_none() && session.consecutive_errors >= self.conf.degrade_after_errors {
            tracing::warn!(
                "[session] {} degraded after {} consecutive errors",
                session.node_id,
                session.consecutive_errors
            );
            session.degraded_since = Some(Instant::now());
            self.registry.mark_degraded(&session.node_id);
        }
    }

    async fn apply_plan<T: Transport>(&self, session: &mut Session, transport: &mut T, plan: &QosPlan) {
        let Some(alloc) = plan.get(&session.node_id).copied() else {
            return;
        };
        if session.last_directive == Some(alloc) {
            return;
        }
        let directive = ControlMessage::Rate {
            assigned_frame_rate: alloc.frame_rate_fps(),
            assigned_bitrate_ceiling: alloc.bitrate_ceiling_kbps,
            throttled: alloc.throttled,
        };
        let sent = match encode_json(&directive) {
            Ok(txt) => self.send_with_retry(transport, WireMessage::Text(txt)).await,
            Err(e) => Err(e),
        };
        match sent {
            Ok(()) => {
                tracing::debug!(
                    "[session] {} rate {:.2} fps (session {})",
                    session.node_id,
                    alloc.frame_rate_fps(),
                    session.session_id
                );
                session.last_directive = Some(alloc);
                session.directive_pending = false;
            }
            Err(_) => {
                session.directive_pending = true;
                self.on_fault(session);
            }
        }
    }

    async fn resend_pending<T: Transport>(
        &self,
        session: &mut Session,
        transport: &mut T,
        plans: &watch::Receiver<Arc<QosPlan>>,
    ) {
        if !session.directive_pending {
            return;
        }
        let plan = plans.borrow().clone();
        session.directive_pending = false;
        self.apply_plan(session, transport, &plan).await;
    }

    /// Timeout par tentative, essais bornés, puis abandon journalisé
    async fn send_with_retry<T: Transport>(&self, transport: &mut T, msg: WireMessage) -> Result<(), SessionError> {
        let attempts = self.conf.send_retries + 1;
        let mut last = SessionError::SendTimeout;
        for _ in 0..attempts {
            match tokio::time::timeout(self.conf.send_timeout(), transport.send(msg.clone())).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last = e,
                Err(_) => last = SessionError::SendTimeout,
            }
        }
        self.directory.counters.send_failures.incr();
        tracing::warn!("[session] dropping outbound message after {attempts} attempts: {last}");
        Err(last)
    }
}
