/*!
 * LABWATCH HUB - Contrôleur de flotte edge
 *
 * RÔLE :
 * Découverte des noeuds de capture, allocation QoS du débit, une session
 * full-duplex par noeud, pipeline d'inférence borné et arrêt sans perte.
 */

pub mod backend;
pub mod config;
pub mod discovery;
pub mod error;
pub mod health;
pub mod http;
pub mod hub;
pub mod lifecycle;
pub mod logging;
pub mod memory;
pub mod models;
pub mod mqtt;
pub mod pipeline;
pub mod protocol;
pub mod qos;
pub mod registry;
pub mod session;
pub mod state;

pub use hub::{Hub, HubOptions, HubServices};
