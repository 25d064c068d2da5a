/*!
 * INGESTION → INFERENCE PIPELINE - Découplage réception / inférence
 *
 * RÔLE :
 * Les sessions déposent des `FrameTask` sans jamais attendre ; un pool fixe de
 * workers appelle le backend (lent, GPU) et renvoie les résultats vers la
 * session du noeud (alerte / audio) et vers le journal mémoire.
 *
 * FONCTIONNEMENT :
 * - File FIFO bornée (`mpsc`) ; pleine → la tâche entrante est rejetée et comptée
 * - Ticket par noeud attribué à l'acceptation : un worker ne démarre la tâche n
 *   d'un noeud qu'après la fin de la tâche n-1 → ordre par noeud = ordre d'arrivée
 * - Un worker traite une tâche jusqu'au bout avant d'en prendre une autre
 * - File par noeud retirée dès qu'elle est vide (tickets rendus)
 * - `close()` coupe l'admission ; `drain(grace)` laisse finir puis abandonne
 */

use crate::backend::{InferenceBackend, NodeContext};
use crate::config::PipelineConf;
use crate::memory::MemoryJournal;
use crate::models::{NodeId, Payload, PayloadKind};
use crate::state::Counter;
use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Résultat routé vers la session d'un noeud
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Alert(String),
    Speech(Bytes),
}

/// Point de sortie des résultats (implémenté par l'annuaire des sessions)
pub trait DeliverySink: Send + Sync {
    /// false si le noeud n'a plus de session
    fn deliver(&self, node_id: &str, delivery: Delivery) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SubmitError {
    #[error("pipeline queue full")]
    Full,
    #[error("pipeline closed")]
    Closed,
}

/// File d'attente par noeud : tour courant + réveil des workers en attente
#[derive(Default)]
struct Lane {
    turn: AtomicU64,
    notify: Notify,
}

impl Lane {
    async fn wait_turn(&self, ticket: u64) {
        loop {
            let notified = self.notify.notified();
            if self.turn.load(Ordering::Acquire) == ticket {
                return;
            }
            notified.await;
        }
    }

    fn advance(&self) {
        self.turn.fetch_add(1, Ordering::AcqRel);
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct LaneSlot {
    issued: u64,
    lane: Arc<Lane>,
}

type LaneMap = Arc<Mutex<HashMap<NodeId, LaneSlot>>>;

pub struct FrameTask {
    pub node_id: NodeId,
    pub seq: u64,
    pub payload: Payload,
    pub enqueued_at: Instant,
    pub ticket: u64,
    lane: Arc<Lane>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct PipelineStats {
    pub queued: usize,
    pub capacity: usize,
    pub workers: usize,
    pub submitted: u64,
    pub processed: u64,
    pub failed: u64,
    pub dropped_full: u64,
    pub rejected_closed: u64,
}

#[derive(Default)]
struct PipelineCounters {
    submitted: Counter,
    processed: Counter,
    failed: Counter,
    dropped_full: Counter,
    rejected_closed: Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub completed: bool,
    /// tâches acceptées mais jamais terminées
    pub abandoned: u64,
}

pub struct Backends {
    pub vision: Arc<dyn InferenceBackend>,
    pub speech: Option<Arc<dyn InferenceBackend>>,
}

struct WorkerShared {
    rx: tokio::sync::Mutex<mpsc::Receiver<FrameTask>>,
    lanes: LaneMap,
    backends: Backends,
    sink: Arc<dyn DeliverySink>,
    journal: Option<MemoryJournal>,
    counters: Arc<PipelineCounters>,
    inference_timeout: Duration,
}

pub struct Pipeline {
    intake: Mutex<Option<mpsc::Sender<FrameTask>>>,
    lanes: LaneMap,
    counters: Arc<PipelineCounters>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
    worker_count: usize,
}

impl Pipeline {
    pub fn start(
        conf: &PipelineConf,
        backends: Backends,
        sink: Arc<dyn DeliverySink>,
        journal: Option<MemoryJournal>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(conf.queue_depth.max(1));
        let counters = Arc::new(PipelineCounters::default());
        let lanes: LaneMap = Arc::new(Mutex::new(HashMap::new()));
        let shared = Arc::new(WorkerShared {
            rx: tokio::sync::Mutex::new(rx),
            lanes: Arc::clone(&lanes),
            backends,
            sink,
            journal,
            counters: Arc::clone(&counters),
            inference_timeout: conf.inference_timeout(),
        });
        let workers = (0..conf.workers.max(1))
            .map(|id| tokio::spawn(worker_loop(id, Arc::clone(&shared))))
            .collect::<Vec<_>>();
        tracing::info!(
            "[pipeline] started {} workers, queue depth {}",
            workers.len(),
            conf.queue_depth
        );
        Arc::new(Self {
            intake: Mutex::new(Some(tx)),
            lanes,
            counters,
            worker_count: workers.len(),
            workers: Mutex::new(workers),
            capacity: conf.queue_depth.max(1),
        })
    }

    /// Dépôt non bloquant d'une charge utile (ordre d'appel = ordre de traitement par noeud)
    pub fn try_submit(&self, node_id: &str, seq: u64, payload: Payload) -> Result<(), SubmitError> {
        let intake = self.intake.lock();
        let Some(tx) = intake.as_ref() else {
            self.counters.rejected_closed.incr();
            return Err(SubmitError::Closed);
        };
        let permit = match tx.try_reserve() {
            Ok(permit) => permit,
            Err(TrySendError::Full(())) => {
                let dropped = self.counters.dropped_full.incr();
                tracing::debug!("[pipeline] queue full, dropped {node_id}#{seq} (total {dropped})");
                return Err(SubmitError::Full);
            }
            Err(TrySendError::Closed(())) => {
                self.counters.rejected_closed.incr();
                return Err(SubmitError::Closed);
            }
        };
        let (ticket, lane) = {
            let mut lanes = self.lanes.lock();
            let slot = lanes.entry(node_id.to_string()).or_default();
            let ticket = slot.issued;
            slot.issued += 1;
            (ticket, Arc::clone(&slot.lane))
        };
        permit.send(FrameTask {
            node_id: node_id.to_string(),
            seq,
            payload,
            enqueued_at: Instant::now(),
            ticket,
            lane,
        });
        self.counters.submitted.incr();
        Ok(())
    }

    /// Coupe l'admission ; les workers vident la file puis s'arrêtent
    pub fn close(&self) {
        if self.intake.lock().take().is_some() {
            tracing::info!("[pipeline] intake closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.intake.lock().is_none()
    }

    /// Attend la fin des tâches dans la fenêtre de grâce, puis abandonne le reste
    pub async fn drain(&self, grace: Duration) -> DrainReport {
        self.close();
        let handles = std::mem::take(&mut *self.workers.lock());
        let aborts: Vec<_> = handles.iter().map(|h| h.abort_handle()).collect();
        let completed = tokio::time::timeout(grace, futures::future::join_all(handles))
            .await
            .is_ok();
        if !completed {
            for handle in aborts {
                handle.abort();
            }
        }
        let done = self.counters.processed.get() + self.counters.failed.get();
        let abandoned = self.counters.submitted.get().saturating_sub(done);
        if completed {
            tracing::info!("[pipeline] drained cleanly");
        } else {
            tracing::warn!("[pipeline] grace window elapsed, abandoned {abandoned} tasks");
        }
        DrainReport { completed, abandoned }
    }

    pub fn stats(&self) -> PipelineStats {
        let queued = self
            .intake
            .lock()
            .as_ref()
            .map(|tx| tx.max_capacity() - tx.capacity())
            .unwrap_or(0);
        PipelineStats {
            queued,
            capacity: self.capacity,
            workers: self.worker_count,
            submitted: self.counters.submitted.get(),
            processed: self.counters.processed.get(),
            failed: self.counters.failed.get(),
            dropped_full: self.counters.dropped_full.get(),
            rejected_closed: self.counters.rejected_closed.get(),
        }
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped_full.get()
    }
}

async fn worker_loop(id: usize, shared: Arc<WorkerShared>) {
    loop {
        let task = { shared.rx.lock().await.recv().await };
        let Some(task) = task else { break };
        task.lane.wait_turn(task.ticket).await;
        shared.run(&task).await;
        task.lane.advance();
        shared.release_lane(&task);
    }
    tracing::debug!("[pipeline] worker {id} stopped");
}

impl WorkerShared {
    /// Les tickets sont émis sous le même verrou : tour == émis ⇒ plus rien en vol
    fn release_lane(&self, task: &FrameTask) {
        let mut lanes = self.lanes.lock();
        let idle = lanes.get(&task.node_id).is_some_and(|slot| {
            Arc::ptr_eq(&slot.lane, &task.lane) && slot.lane.turn.load(Ordering::Acquire) == slot.issued
        });
        if idle {
            lanes.remove(&task.node_id);
        }
    }

    async fn run(&self, task: &FrameTask) {
        let backend = match task.payload.kind() {
            PayloadKind::Frame => Some(&self.backends.vision),
            PayloadKind::Audio => self.backends.speech.as_ref(),
        };
        let Some(backend) = backend else {
            self.counters.failed.incr();
            tracing::warn!("[pipeline] no speech backend, audio {}#{} failed", task.node_id, task.seq);
            return;
        };
        let ctx = NodeContext { node_id: task.node_id.clone(), seq: task.seq };
        match tokio::time::timeout(self.inference_timeout, backend.infer(&task.payload, &ctx)).await {
            Ok(Ok(outcome)) => {
                self.counters.processed.incr();
                tracing::debug!(
                    "[pipeline] {}#{} done by {} in {:?}",
                    task.node_id,
                    task.seq,
                    backend.name(),
                    task.enqueued_at.elapsed()
                );
                let text = outcome.text.trim();
                if !text.is_empty() {
                    self.sink.deliver(&task.node_id, Delivery::Alert(text.to_string()));
                    if let Some(journal) = &self.journal {
                        journal.record(
                            text,
                            serde_json::json!({
                                "node_id": task.node_id,
                                "seq": task.seq,
                                "kind": task.payload.kind(),
                                "backend": backend.name(),
                                "at": OffsetDateTime::now_utc().unix_timestamp(),
                            }),
                        );
                    }
                }
                if let Some(speech) = outcome.speech {
                    self.sink.deliver(&task.node_id, Delivery::Speech(speech));
                }
            }
            Ok(Err(e)) => {
                self.counters.failed.incr();
                tracing::warn!("[pipeline] {}#{} failed: {e}", task.node_id, task.seq);
            }
            Err(_) => {
                self.counters.failed.incr();
                tracing::warn!(
                    "[pipeline] {}#{} timed out after {:?}",
                    task.node_id,
                    task.seq,
                    self.inference_timeout
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InferenceOutcome;
    use crate::error::InferenceError;
    use async_trait::async_trait;

    /// Backend factice : trace l'ordre de fin, bloque le noeud "blocker" jusqu'au signal
    #[derive(Default)]
    struct ScriptedBackend {
        done: Mutex<Vec<(String, u64)>>,
        gate: Notify,
        entered: Notify,
    }

    #[async_trait]
    impl InferenceBackend for ScriptedBackend {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn infer(&self, payload: &Payload, ctx: &NodeContext) -> Result<InferenceOutcome, InferenceError> {
            if ctx.node_id == "blocker" {
                let released = self.gate.notified();
                self.entered.notify_one();
                released.await;
            } else {
                // durées variables pour provoquer des chevauchements entre workers
                tokio::time::sleep(Duration::from_millis((7 * ctx.seq) % 5)).await;
            }
            if ctx.node_id == "broken" {
                return Err(InferenceError::Unavailable("gpu gone".into()));
            }
            self.done.lock().push((ctx.node_id.clone(), ctx.seq));
            let text = match payload {
                Payload::Frame(b) => format!("frame of {} bytes", b.len()),
                Payload::Audio(_) => "heard something".into(),
            };
            Ok(InferenceOutcome { text, speech: None })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        delivered: Mutex<Vec<(String, Delivery)>>,
    }

    impl DeliverySink for RecordingSink {
        fn deliver(&self, node_id: &str, delivery: Delivery) -> bool {
            self.delivered.lock().push((node_id.to_string(), delivery));
            true
        }
    }

    fn conf(workers: usize, queue_depth: usize) -> PipelineConf {
        PipelineConf { workers, queue_depth, inference_timeout_ms: 5_000, ..Default::default() }
    }

    fn frame(n: u8) -> Payload {
        Payload::Frame(Bytes::from(vec![n; n as usize + 1]))
    }

    async fn wait_until(mut cond: impl FnMut() -> bool) {
        for _ in 0..2_000 {
            if cond() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_per_node_order_with_many_workers() {
        let backend = Arc::new(ScriptedBackend::default());
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::start(
            &conf(4, 64),
            Backends { vision: backend.clone(), speech: None },
            sink.clone(),
            None,
        );
        for seq in 1..=15u64 {
            for node in ["a", "b", "c"] {
                pipeline.try_submit(node, seq, frame(seq as u8)).unwrap();
            }
        }
        let report = pipeline.drain(Duration::from_secs(10)).await;
        assert!(report.completed);
        assert_eq!(report.abandoned, 0);

        let done = backend.done.lock().clone();
        assert_eq!(done.len(), 45);
        for node in ["a", "b", "c"] {
            let seqs: Vec<u64> = done.iter().filter(|(n, _)| n == node).map(|(_, s)| *s).collect();
            assert_eq!(seqs, (1..=15).collect::<Vec<_>>());
        }
        assert_eq!(sink.delivered.lock().len(), 45);
        assert!(pipeline.lanes.lock().is_empty());
    }

    #[tokio::test]
    async fn test_idle_lanes_are_released() {
        let backend = Arc::new(ScriptedBackend::default());
        let pipeline = Pipeline::start(
            &conf(2, 16),
            Backends { vision: backend.clone(), speech: None },
            Arc::new(RecordingSink::default()),
            None,
        );
        for i in 0..10u64 {
            pipeline.try_submit(&format!("transient-{i}"), 1, frame(1)).unwrap();
        }
        wait_until(|| pipeline.stats().processed == 10).await;
        wait_until(|| pipeline.lanes.lock().is_empty()).await;

        // un noeud qui revient repart de zéro, toujours dans l'ordre
        for seq in 1..=3 {
            pipeline.try_submit("transient-0", seq, frame(seq as u8)).unwrap();
        }
        assert!(pipeline.drain(Duration::from_secs(5)).await.completed);
        let seqs: Vec<u64> = backend
            .done
            .lock()
            .iter()
            .filter(|(n, _)| n == "transient-0")
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(seqs, vec![1, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_newest_without_blocking() {
        let backend = Arc::new(ScriptedBackend::default());
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::start(
            &conf(1, 1),
            Backends { vision: backend.clone(), speech: None },
            sink.clone(),
            None,
        );

        // le seul worker est occupé par un autre noeud
        let entered = backend.entered.notified();
        pipeline.try_submit("blocker", 1, frame(1)).unwrap();
        entered.await;

        pipeline.try_submit("A", 1, frame(1)).unwrap();
        assert_eq!(pipeline.try_submit("A", 2, frame(2)), Err(SubmitError::Full));
        assert_eq!(pipeline.dropped(), 1);

        backend.gate.notify_one();
        wait_until(|| pipeline.stats().processed == 2).await;
        pipeline.try_submit("A", 3, frame(3)).unwrap();
        pipeline.drain(Duration::from_secs(5)).await;

        let seqs: Vec<u64> = backend
            .done
            .lock()
            .iter()
            .filter(|(n, _)| n == "A")
            .map(|(_, s)| *s)
            .collect();
        assert_eq!(seqs, vec![1, 3]);
        assert_eq!(pipeline.dropped(), 1);
    }

    #[tokio::test]
    async fn test_drop_counter_is_monotonic() {
        let backend = Arc::new(ScriptedBackend::default());
        let pipeline = Pipeline::start(
            &conf(1, 1),
            Backends { vision: backend.clone(), speech: None },
            Arc::new(RecordingSink::default()),
            None,
        );
        let entered = backend.entered.notified();
        pipeline.try_submit("blocker", 1, frame(1)).unwrap();
        entered.await;
        pipeline.try_submit("blocker", 2, frame(2)).unwrap();
        let mut last = 0;
        for seq in 3..20 {
            assert_eq!(pipeline.try_submit("x", seq, frame(1)), Err(SubmitError::Full));
            let now = pipeline.dropped();
            assert!(now > last);
            last = now;
        }
        pipeline.close();
        assert_eq!(pipeline.try_submit("x", 99, frame(1)), Err(SubmitError::Closed));
        backend.gate.notify_one();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_abandons_stuck_work_after_grace() {
        let backend = Arc::new(ScriptedBackend::default());
        let pipeline = Pipeline::start(
            &conf(1, 4),
            Backends { vision: backend.clone(), speech: None },
            Arc::new(RecordingSink::default()),
            None,
        );
        pipeline.try_submit("blocker", 1, frame(1)).unwrap();
        pipeline.try_submit("blocker", 2, frame(2)).unwrap();
        let started = Instant::now();
        let report = pipeline.drain(Duration::from_secs(3)).await;
        assert!(!report.completed);
        assert_eq!(report.abandoned, 2);
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[tokio::test]
    async fn test_failures_are_counted_and_stream_continues() {
        let backend = Arc::new(ScriptedBackend::default());
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::start(
            &conf(2, 8),
            Backends { vision: backend.clone(), speech: None },
            sink.clone(),
            None,
        );
        pipeline.try_submit("broken", 1, frame(1)).unwrap();
        pipeline.try_submit("ok", 1, frame(1)).unwrap();
        // audio sans backend parole = résultat en échec
        pipeline.try_submit("ok", 2, Payload::Audio(Bytes::from_static(b"pcm"))).unwrap();
        pipeline.drain(Duration::from_secs(5)).await;
        let stats = pipeline.stats();
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.processed, 1);
        assert_eq!(sink.delivered.lock().len(), 1);
    }

    struct Speaker;

    #[async_trait]
    impl InferenceBackend for Speaker {
        fn name(&self) -> &'static str {
            "speaker"
        }
        async fn infer(&self, _: &Payload, _: &NodeContext) -> Result<InferenceOutcome, InferenceError> {
            Ok(InferenceOutcome { text: "turn off the burner".into(), speech: Some(Bytes::from_static(b"wav")) })
        }
    }

    #[tokio::test]
    async fn test_audio_routes_alert_speech_and_journal() {
        use crate::memory::{LocalMemoryStore, MemoryStore};
        let store = Arc::new(LocalMemoryStore::new(None));
        let (journal, _writer) = MemoryJournal::spawn(store.clone(), 16);
        let sink = Arc::new(RecordingSink::default());
        let pipeline = Pipeline::start(
            &conf(1, 4),
            Backends { vision: Arc::new(ScriptedBackend::default()), speech: Some(Arc::new(Speaker)) },
            sink.clone(),
            Some(journal.clone()),
        );
        pipeline.try_submit("n1", 1, Payload::Audio(Bytes::from_static(b"pcm"))).unwrap();
        pipeline.drain(Duration::from_secs(5)).await;
        journal.flush(Duration::from_secs(1)).await.unwrap();

        let delivered = sink.delivered.lock().clone();
        assert_eq!(delivered[0], ("n1".to_string(), Delivery::Alert("turn off the burner".into())));
        assert_eq!(delivered[1], ("n1".to_string(), Delivery::Speech(Bytes::from_static(b"wav"))));
        let hits = store.query("burner", 3).await.unwrap();
        assert_eq!(hits[0].metadata["node_id"], "n1");
    }
}
