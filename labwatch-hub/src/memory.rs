/*!
 * MEMORY STORE - Mémoire textuelle best-effort des résultats d'inférence
 *
 * RÔLE :
 * Contrat `MemoryStore` (store / query / flush) façon Data Port : une interface,
 * plusieurs implémentations (locale en processus, pont MQTT dans `mqtt.rs`).
 *
 * FONCTIONNEMENT :
 * - `LocalMemoryStore` : passages en mémoire, classement par recouvrement de
 *   termes, persistance JSONL au `flush`
 * - `MemoryJournal` : écriture différée (canal borné + tâche writer) pour que
 *   les workers ne bloquent jamais sur le store ; `flush(deadline)` garantit
 *   que tout ce qui a été enregistré avant l'appel est écrit
 */

use crate::error::MemoryError;
use crate::state::{new_state, Counter, Shared};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Passage {
    pub text: String,
    pub metadata: Value,
    pub score: f32,
}

#[async_trait]
pub trait MemoryStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn store(&self, text: &str, metadata: Value) -> Result<(), MemoryError>;

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Passage>, MemoryError>;

    async fn flush(&self) -> Result<(), MemoryError> {
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
struct Entry {
    text: String,
    metadata: Value,
    #[serde(with = "time::serde::rfc3339")]
    stored_at: OffsetDateTime,
}

#[derive(Default)]
struct LocalInner {
    entries: Vec<Entry>,
    /// index du premier passage pas encore persisté
    persisted: usize,
}

pub struct LocalMemoryStore {
    inner: Shared<LocalInner>,
    persist_path: Option<PathBuf>,
}

impl LocalMemoryStore {
    pub fn new(persist_path: Option<PathBuf>) -> Self {
        Self { inner: new_state(LocalInner::default()), persist_path }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn terms(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 1)
        .map(|t| t.to_lowercase())
        .collect()
}

#[async_trait]
impl MemoryStore for LocalMemoryStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn store(&self, text: &str, metadata: Value) -> Result<(), MemoryError> {
        if text.trim().is_empty() {
            return Err(MemoryError::Rejected("empty text".into()));
        }
        self.inner.lock().entries.push(Entry {
            text: text.to_string(),
            metadata,
            stored_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Passage>, MemoryError> {
        let wanted = terms(text);
        if wanted.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        let inner = self.inner.lock();
        let mut ranked: Vec<(usize, Passage)> = inner
            .entries
            .iter()
            .enumerate()
            .filter_map(|(idx, e)| {
                let hits = terms(&e.text).intersection(&wanted).count();
                (hits > 0).then(|| {
                    let passage = Passage {
                        text: e.text.clone(),
                        metadata: e.metadata.clone(),
                        score: hits as f32 / wanted.len() as f32,
                    };
                    (idx, passage)
                })
            })
            .collect();
        // score décroissant, puis le plus récent d'abord
        ranked.sort_by(|(ia, a), (ib, b)| b.score.total_cmp(&a.score).then(ib.cmp(ia)));
        Ok(ranked.into_iter().take(top_k).map(|(_, p)| p).collect())
    }

    async fn flush(&self) -> Result<(), MemoryError> {
        let Some(path) = &self.persist_path else {
            return Ok(());
        };
        let (pending, upto) = {
            let inner = self.inner.lock();
            (inner.entries[inner.persisted..].to_vec(), inner.entries.len())
        };
        if pending.is_empty() {
            return Ok(());
        }
        let mut buf = String::new();
        for entry in &pending {
            buf.push_str(&serde_json::to_string(entry)?);
            buf.push('\n');
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| MemoryError::Unavailable(format!("{}: {e}", path.display())))?;
        file.write_all(buf.as_bytes())
            .await
            .map_err(|e| MemoryError::Unavailable(e.to_string()))?;
        file.sync_all().await.map_err(|e| MemoryError::Unavailable(e.to_string()))?;
        self.inner.lock().persisted = upto;
        Ok(())
    }
}

enum JournalCmd {
    Record { text: String, metadata: Value },
    Flush(oneshot::Sender<Result<(), MemoryError>>),
}

#[derive(Debug, Default, Serialize)]
pub struct JournalStats {
    pub written: u64,
    pub failed: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct JournalCounters {
    written: Counter,
    failed: Counter,
    dropped: Counter,
}

/// Poignée clonable vers la tâche writer
#[derive(Clone)]
pub struct MemoryJournal {
    tx: mpsc::Sender<JournalCmd>,
    counters: Arc<JournalCounters>,
}

impl MemoryJournal {
    pub fn spawn(store: Arc<dyn MemoryStore>, depth: usize) -> (Self, tokio::task::JoinHandle<()>) {
        let (tx, mut rx) = mpsc::channel::<JournalCmd>(depth.max(1));
        let counters = Arc::new(JournalCounters::default());
        let task_counters = Arc::clone(&counters);
        let handle = tokio::spawn(async move {
            while let Some(cmd) = rx.recv().await {
                match cmd {
                    JournalCmd::Record { text, metadata } => match store.store(&text, metadata).await {
                        Ok(()) => {
                            task_counters.written.incr();
                        }
                        Err(e) => {
                            task_counters.failed.incr();
                            tracing::warn!("[memory] {} store failed: {e}", store.name());
                        }
                    },
                    JournalCmd::Flush(done) => {
                        let _ = done.send(store.flush().await);
                    }
                }
            }
        });
        (Self { tx, counters }, handle)
    }

    /// Enregistrement non bloquant ; canal plein = drop compté
    pub fn record(&self, text: &str, metadata: Value) {
        let cmd = JournalCmd::Record { text: text.to_string(), metadata };
        if self.tx.try_send(cmd).is_err() {
            self.counters.dropped.incr();
            tracing::warn!("[memory] journal saturated, dropped one record");
        }
    }

    /// Attend que tout ce qui précède soit écrit puis flush le store, sous deadline
    pub async fn flush(&self, deadline: Duration) -> Result<(), MemoryError> {
        let (done_tx, done_rx) = oneshot::channel();
        let run = async {
            self.tx
                .send(JournalCmd::Flush(done_tx))
                .await
                .map_err(|_| MemoryError::Unavailable("journal writer stopped".into()))?;
            done_rx
                .await
                .map_err(|_| MemoryError::Unavailable("journal writer stopped".into()))?
        };
        tokio::time::timeout(deadline, run).await.map_err(|_| MemoryError::Timeout)?
    }

    pub fn stats(&self) -> JournalStats {
        JournalStats {
            written: self.counters.written.get(),
            failed: self.counters.failed.get(),
            dropped: self.counters.dropped.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_query_ranks_by_overlap() {
        let store = LocalMemoryStore::new(None);
        store.store("beaker left on the hot plate", json!({"node": "a"})).await.unwrap();
        store.store("nobody at the fume hood", json!({"node": "b"})).await.unwrap();
        store.store("hot plate switched off", json!({"node": "c"})).await.unwrap();

        let hits = store.query("is the hot plate on?", 5).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].metadata["node"], "a");
        assert!(hits[0].score >= hits[1].score);
        assert!(store.query("", 5).await.unwrap().is_empty());
        assert_eq!(store.query("hot plate", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_text_rejected() {
        let store = LocalMemoryStore::new(None);
        assert!(store.store("   ", Value::Null).await.is_err());
    }

    #[tokio::test]
    async fn test_flush_persists_only_new_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.jsonl");
        let store = LocalMemoryStore::new(Some(path.clone()));
        store.store("first", Value::Null).await.unwrap();
        store.flush().await.unwrap();
        store.store("second", Value::Null).await.unwrap();
        store.flush().await.unwrap();
        store.flush().await.unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.lines().nth(1).unwrap().contains("second"));
    }

    #[tokio::test]
    async fn test_journal_flush_covers_prior_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("memory.jsonl");
        let store = Arc::new(LocalMemoryStore::new(Some(path.clone())));
        let (journal, _task) = MemoryJournal::spawn(store.clone(), 64);
        for i in 0..10 {
            journal.record(&format!("observation {i}"), json!({"seq": i}));
        }
        journal.flush(Duration::from_secs(2)).await.unwrap();
        assert_eq!(journal.stats().written, 10);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 10);
    }

    struct StuckStore;

    #[async_trait]
    impl MemoryStore for StuckStore {
        fn name(&self) -> &'static str {
            "stuck"
        }
        async fn store(&self, _: &str, _: Value) -> Result<(), MemoryError> {
            std::future::pending().await
        }
        async fn query(&self, _: &str, _: usize) -> Result<Vec<Passage>, MemoryError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_journal_flush_respects_deadline() {
        let (journal, _task) = MemoryJournal::spawn(Arc::new(StuckStore), 4);
        journal.record("never lands", Value::Null);
        let res = journal.flush(Duration::from_millis(500)).await;
        assert!(matches!(res, Err(MemoryError::Timeout)));
    }

    #[tokio::test]
    async fn test_journal_drops_when_saturated() {
        let (journal, _task) = MemoryJournal::spawn(Arc::new(StuckStore), 1);
        for _ in 0..5 {
            journal.record("x", Value::Null);
        }
        // 1 en cours chez le writer (peut-être), 1 dans le canal, le reste droppé
        assert!(journal.stats().dropped >= 3);
    }
}
