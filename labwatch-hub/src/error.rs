/*!
 * ERREURS DU HUB - Taxonomie des erreurs du contrôleur de flotte
 *
 * RÔLE :
 * Une enum `thiserror` par préoccupation. Seules les erreurs de démarrage
 * (`StartupError`) sont fatales ; tout le reste est absorbé en régime établi
 * (drop + compteur, dégradation de session, résultat de tâche en échec).
 */

use crate::models::NodeId;

/// Erreurs de chargement / validation de la configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Erreurs du registre de noeuds
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown node: {0}")]
    UnknownNode(NodeId),
    #[error("admissions closed (hub draining)")]
    AdmissionClosed,
}

/// Erreurs de transport et de session
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("send timed out")]
    SendTimeout,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("handshake rejected: {0}")]
    Rejected(String),
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Échecs du backend d'inférence (jamais de résultat partiel)
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum InferenceError {
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    #[error("inference timed out")]
    Timeout,
    #[error("payload kind not supported by backend: {0}")]
    Unsupported(&'static str),
    #[error("backend rejected request: {0}")]
    Rejected(String),
}

/// Échecs du memory store (best effort, jamais fatals)
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("memory store unavailable: {0}")]
    Unavailable(String),
    #[error("memory store timed out")]
    Timeout,
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("memory store rejected request: {0}")]
    Rejected(String),
}

/// Conditions fatales : uniquement au démarrage, avant toute admission
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("cannot bind discovery listener on {addr}: {source}")]
    DiscoveryBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot bind HTTP listener on {addr}: {source}")]
    HttpBind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot initialize logging: {0}")]
    Logging(String),
    #[error("cannot initialize {collaborator}: {reason}")]
    Collaborator {
        collaborator: &'static str,
        reason: String,
    },
}
