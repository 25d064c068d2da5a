/*!
 * BACKENDS D'INFÉRENCE - Contrat avec les collaborateurs vision / parole
 *
 * RÔLE :
 * Le pipeline n'appelle qu'un `dyn InferenceBackend` : soit un résultat complet,
 * soit une `InferenceError` (jamais de résultat partiel).
 *
 * FONCTIONNEMENT :
 * - `OllamaBackend` : POST `<host>/api/generate` avec l'image en base64,
 *   `stream: false`, réponse texte dans le champ `response`
 * - Le backend parole (ASR/TTS) est optionnel et branché par l'appelant
 */

use crate::config::BackendConf;
use crate::error::InferenceError;
use crate::models::{NodeId, Payload};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Longueur max d'une description renvoyée à un noeud
pub const MAX_ALERT_CHARS: usize = 150;

#[derive(Debug, Clone, PartialEq)]
pub struct NodeContext {
    pub node_id: NodeId,
    pub seq: u64,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferenceOutcome {
    pub text: String,
    /// Audio synthétisé à renvoyer au noeud (backend parole)
    pub speech: Option<Bytes>,
}

#[async_trait]
pub trait InferenceBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn infer(&self, payload: &Payload, ctx: &NodeContext) -> Result<InferenceOutcome, InferenceError>;
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    images: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Deserialize)]
struct TagEntry {
    name: String,
}

pub struct OllamaBackend {
    client: reqwest::Client,
    host: String,
    model: String,
    prompt: String,
}

impl OllamaBackend {
    pub fn new(conf: &BackendConf, timeout: Duration) -> Result<Self, InferenceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| InferenceError::Unavailable(format!("http client: {e}")))?;
        Ok(Self {
            client,
            host: conf.ollama_host.trim_end_matches('/').to_string(),
            model: conf.model.clone(),
            prompt: conf.prompt.clone(),
        })
    }

    fn generate_body(&self, image: &[u8]) -> GenerateRequest<'_> {
        GenerateRequest {
            model: &self.model,
            prompt: &self.prompt,
            images: vec![base64::engine::general_purpose::STANDARD.encode(image)],
            stream: false,
        }
    }

    /// Vérifie que le serveur répond et que le modèle est installé (non fatal)
    pub async fn probe(&self) -> Result<bool, InferenceError> {
        let resp = self
            .client
            .get(format!("{}/api/tags", self.host))
            .send()
            .await
            .map_err(map_transport_error)?;
        let tags: TagsResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::Rejected(format!("bad /api/tags body: {e}")))?;
        Ok(tags.models.iter().any(|m| m.name == self.model))
    }
}

fn map_transport_error(e: reqwest::Error) -> InferenceError {
    if e.is_timeout() {
        InferenceError::Timeout
    } else {
        InferenceError::Unavailable(e.to_string())
    }
}

/// Normalise la description : une ligne, tronquée
pub fn clean_description(raw: &str) -> String {
    let one_line = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    one_line.chars().take(MAX_ALERT_CHARS).collect()
}

#[async_trait]
impl InferenceBackend for OllamaBackend {
    fn name(&self) -> &'static str {
        "ollama"
    }

    async fn infer(&self, payload: &Payload, ctx: &NodeContext) -> Result<InferenceOutcome, InferenceError> {
        let Payload::Frame(image) = payload else {
            return Err(InferenceError::Unsupported("audio"));
        };
        let resp = self
            .client
            .post(format!("{}/api/generate", self.host))
            .json(&self.generate_body(image))
            .send()
            .await
            .map_err(map_transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            return Err(InferenceError::Rejected(format!("HTTP {status}")));
        }
        let body: GenerateResponse = resp
            .json()
            .await
            .map_err(|e| InferenceError::Rejected(format!("bad generate body: {e}")))?;
        tracing::debug!("[backend] ollama described frame {} of {}", ctx.seq, ctx.node_id);
        Ok(InferenceOutcome { text: clean_description(&body.response), speech: None })
    }
}
