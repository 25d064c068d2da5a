/*!
 * MQTT - Liaison broker + memory store ponté
 *
 * RÔLE :
 * Un seul client `rumqttc` pour le hub : publication health et pont vers le
 * service de mémoire externe (plugin RAG) par requête / réponse corrélées.
 *
 * FONCTIONNEMENT :
 * - La boucle d'événements (ré)abonne le topic de réponses à chaque ConnAck
 *   et tient le `HealthTracker` à jour
 * - `MqttMemoryStore` : commande publiée avec un `request_id` uuid, réponse
 *   attendue sur un oneshot, timeout 5 s
 */

use crate::config::MqttConf;
use crate::error::MemoryError;
use crate::health::HealthTracker;
use crate::memory::{MemoryStore, Passage};
use crate::state::{new_state, Shared};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

pub const MEMORY_COMMAND_TOPIC: &str = "labwatch/memory/command@v1";
pub const MEMORY_RESPONSE_TOPIC: &str = "labwatch/memory/response@v1";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

pub fn create_mqtt_client(conf: &MqttConf, client_id: &str) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(15));
    AsyncClient::new(opts, 32)
}

/// Pilote la connexion ; route les réponses mémoire vers le pont
pub fn spawn_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    bridge: Option<Arc<MqttMemoryStore>>,
    health: HealthTracker,
    mut stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    health.mark_mqtt_connecting();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        health.mark_mqtt_connected();
                        tracing::info!("[mqtt] connected");
                        if bridge.is_some() {
                            if let Err(e) = client.subscribe(MEMORY_RESPONSE_TOPIC, QoS::AtLeastOnce).await {
                                tracing::warn!("[mqtt] subscribe {MEMORY_RESPONSE_TOPIC} failed: {e}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) if p.topic == MEMORY_RESPONSE_TOPIC => {
                        let Some(bridge) = &bridge else { continue };
                        match serde_json::from_slice::<MemoryResponse>(&p.payload) {
                            Ok(resp) => bridge.handle_response(resp),
                            Err(e) => tracing::debug!("[mqtt] invalid memory response: {e}"),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("[mqtt] connection error: {e}");
                        health.increment_reconnects();
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                },
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
            }
        }
        if let Err(e) = client.try_disconnect() {
            tracing::debug!("[mqtt] disconnect: {e}");
        }
    })
}

/// Commandes envoyées au service mémoire
#[derive(Debug, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum MemoryCommand {
    Store { request_id: String, text: String, metadata: Value },
    Query { request_id: String, text: String, top_k: usize },
}

impl MemoryCommand {
    fn request_id(&self) -> &str {
        match self {
            MemoryCommand::Store { request_id, .. } | MemoryCommand::Query { request_id, .. } => request_id,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MemoryResponse {
    Success { request_id: String, action: String, data: Value },
    Error { request_id: String, action: String, error: String },
}

impl MemoryResponse {
    fn request_id(&self) -> &str {
        match self {
            MemoryResponse::Success { request_id, .. } | MemoryResponse::Error { request_id, .. } => request_id,
        }
    }
}

pub struct MqttMemoryStore {
    client: AsyncClient,
    /// request_id -> attente de réponse
    pending: Shared<HashMap<String, oneshot::Sender<MemoryResponse>>>,
    timeout: Duration,
}

impl MqttMemoryStore {
    pub fn new(client: AsyncClient) -> Self {
        Self::with_timeout(client, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(client: AsyncClient, timeout: Duration) -> Self {
        Self { client, pending: new_state(HashMap::new()), timeout }
    }

    pub fn pending_requests(&self) -> Vec<String> {
        self.pending.lock().keys().cloned().collect()
    }

    pub fn handle_response(&self, response: MemoryResponse) {
        let sender = self.pending.lock().remove(response.request_id());
        match sender {
            Some(tx) => {
                if tx.send(response).is_err() {
                    tracing::debug!("[mqtt] memory caller went away");
                }
            }
            None => tracing::debug!("[mqtt] response for unknown request {}", response.request_id()),
        }
    }

    async fn send_command(&self, command: MemoryCommand) -> Result<Value, MemoryError> {
        let request_id = command.request_id().to_string();
        let payload = serde_json::to_string(&command)?;
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(request_id.clone(), tx);

        if let Err(e) = self.client.publish(MEMORY_COMMAND_TOPIC, QoS::AtLeastOnce, false, payload).await {
            self.pending.lock().remove(&request_id);
            return Err(MemoryError::Unavailable(e.to_string()));
        }

        let response = match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(resp)) => resp,
            Ok(Err(_)) => {
                self.pending.lock().remove(&request_id);
                return Err(MemoryError::Unavailable("response channel closed".into()));
            }
            Err(_) => {
                self.pending.lock().remove(&request_id);
                return Err(MemoryError::Timeout);
            }
        };
        match response {
            MemoryResponse::Success { data, .. } => Ok(data),
            MemoryResponse::Error { action, error, .. } => Err(MemoryError::Rejected(format!("{action}: {error}"))),
        }
    }
}

#[async_trait]
impl MemoryStore for MqttMemoryStore {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    async fn store(&self, text: &str, metadata: Value) -> Result<(), MemoryError> {
        let command = MemoryCommand::Store {
            request_id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            metadata,
        };
        self.send_command(command).await.map(|_| ())
    }

    async fn query(&self, text: &str, top_k: usize) -> Result<Vec<Passage>, MemoryError> {
        let command = MemoryCommand::Query {
            request_id: Uuid::new_v4().to_string(),
            text: text.to_string(),
            top_k,
        };
        let data = self.send_command(command).await?;
        let passages = data.get("passages").cloned().unwrap_or(data);
        Ok(serde_json::from_value(passages)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> (AsyncClient, EventLoop) {
        create_mqtt_client(&MqttConf { host: "127.0.0.1".into(), port: 1883 }, "labwatch-test")
    }

    #[test]
    fn test_command_wire_shape() {
        let cmd = MemoryCommand::Query { request_id: "r1".into(), text: "fume hood".into(), top_k: 3 };
        let v: Value = serde_json::to_value(&cmd).unwrap();
        assert_eq!(v, json!({"action": "query", "request_id": "r1", "text": "fume hood", "top_k": 3}));
    }

    #[test]
    fn test_response_parsing() {
        let resp: MemoryResponse =
            serde_json::from_str(r#"{"type":"error","request_id":"r9","action":"store","error":"disk full"}"#).unwrap();
        assert_eq!(resp.request_id(), "r9");
        assert!(matches!(resp, MemoryResponse::Error { .. }));
    }

    #[tokio::test]
    async fn test_store_times_out_without_responder() {
        let (client, _eventloop) = client();
        let store = MqttMemoryStore::with_timeout(client, Duration::from_millis(50));
        let res = store.store("beaker unattended", json!({})).await;
        assert!(matches!(res, Err(MemoryError::Timeout)));
        assert!(store.pending_requests().is_empty());
    }

    #[tokio::test]
    async fn test_query_correlates_response() {
        let (client, _eventloop) = client();
        let store = Arc::new(MqttMemoryStore::with_timeout(client, Duration::from_secs(2)));
        let responder = {
            let store = Arc::clone(&store);
            tokio::spawn(async move {
                let request_id = loop {
                    if let Some(id) = store.pending_requests().pop() {
                        break id;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                };
                store.handle_response(MemoryResponse::Success {
                    request_id,
                    action: "query".into(),
                    data: json!({"passages": [{"text": "hot plate on", "metadata": {}, "score": 0.5}]}),
                });
            })
        };
        let hits = store.query("hot plate", 2).await.unwrap();
        responder.await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "hot plate on");
    }

    #[tokio::test]
    async fn test_unknown_response_ignored() {
        let (client, _eventloop) = client();
        let store = MqttMemoryStore::new(client);
        store.handle_response(MemoryResponse::Success { request_id: "ghost".into(), action: "store".into(), data: Value::Null });
        assert!(store.pending_requests().is_empty());
    }
}
