/*!
 * API HTTP DU HUB - Administration + point d'entrée des sessions
 *
 * RÔLE :
 * Inspection de la flotte (noeuds, plan QoS, santé), alertes manuelles,
 * requêtes mémoire, arrêt propre, et upgrade WebSocket `/session` des noeuds.
 *
 * SÉCURITÉ :
 * - Header `x-api-key` obligatoire sauf `/health` et `/session`
 * - Clé absente de la config = routes protégées refusées
 */

use crate::error::SessionError;
use crate::hub::HubServices;
use crate::memory::Passage;
use crate::models::{EdgeNode, NodeState};
use crate::protocol::{ControlMessage, WireMessage};
use crate::session::{Outbound, Transport};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::format_description::well_known::Rfc3339;

#[derive(Debug, Serialize)]
struct NodeView {
    node_id: String,
    state: NodeState,
    join_seq: u64,
    hostname: Option<String>,
    capabilities: Vec<String>,
    version: Option<String>,
    addr: Option<String>,
    quota_fps: f64,
    throttled: bool,
    last_seen_ms_ago: u64,
    stale: bool,
    registered_at: String,
    outbound_depth: usize,
    session: bool,
}

fn to_view(app: &HubServices, node: &EdgeNode) -> NodeView {
    let age = node.last_seen.elapsed();
    NodeView {
        node_id: node.node_id.clone(),
        state: node.state,
        join_seq: node.join_seq,
        hostname: node.metadata.hostname.clone(),
        capabilities: node.metadata.capabilities.clone(),
        version: node.metadata.version.clone(),
        addr: node.metadata.addr.map(|a| a.to_string()),
        quota_fps: f64::from(node.quota_mfps) / 1000.0,
        throttled: node.throttled,
        last_seen_ms_ago: u64::try_from(age.as_millis()).unwrap_or(u64::MAX),
        stale: age > app.config.heartbeat.interval() * 2,
        registered_at: node.registered_at.format(&Rfc3339).unwrap_or_default(),
        outbound_depth: node.outbound_depth,
        session: app.sessions.directory().has_session(&node.node_id),
    }
}

#[derive(Debug, Serialize)]
struct AllocationView {
    frame_rate: f64,
    bitrate_ceiling_kbps: u32,
    throttled: bool,
}

#[derive(Debug, Serialize)]
struct PlanView {
    capacity_fps: f64,
    floor_fps: f64,
    allocated_fps: f64,
    oversubscribed: bool,
    allocations: BTreeMap<String, AllocationView>,
}

async fn require_api_key(State(app): State<HubServices>, req: Request, next: Next) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path.starts_with("/health") || path == "/session" {
        return Ok(next.run(req).await);
    }

    let Some(expected) = app.api_key.as_deref().filter(|k| !k.is_empty()) else {
        tracing::warn!("[http] LABWATCH_API_KEY not set, denied {path}");
        return Err(StatusCode::UNAUTHORIZED);
    };
    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    if !ok {
        tracing::info!("[http] rejected unauthenticated call to {path}");
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app: HubServices) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/nodes", get(get_nodes))
        .route("/nodes/{id}", get(get_node))
        .route("/nodes/{id}/alert", post(post_alert))
        .route("/plan", get(get_plan))
        .route("/memory/query", get(query_memory))
        .route("/shutdown", post(shutdown))
        .route("/session", get(session_upgrade))
        .layer(middleware::from_fn_with_state(app.clone(), require_api_key))
        .with_state(app)
}

// GET /system/health
async fn get_system_health(State(app): State<HubServices>) -> Json<crate::health::HubHealth> {
    Json(app.health_snapshot())
}

// GET /nodes
async fn get_nodes(State(app): State<HubServices>) -> Json<Vec<NodeView>> {
    let nodes = app.registry.list_all();
    Json(nodes.iter().map(|n| to_view(&app, n)).collect())
}

// GET /nodes/{id}
async fn get_node(State(app): State<HubServices>, Path(id): Path<String>) -> Result<Json<NodeView>, StatusCode> {
    let node = app.registry.get(&id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(to_view(&app, &node)))
}

// GET /plan
async fn get_plan(State(app): State<HubServices>) -> Json<PlanView> {
    let plan = app.qos.current();
    Json(PlanView {
        capacity_fps: f64::from(plan.capacity_mfps) / 1000.0,
        floor_fps: f64::from(plan.floor_mfps) / 1000.0,
        allocated_fps: plan.total_mfps() as f64 / 1000.0,
        oversubscribed: plan.oversubscribed,
        allocations: plan
            .allocations
            .iter()
            .map(|(id, a)| {
                let view = AllocationView {
                    frame_rate: a.frame_rate_fps(),
                    bitrate_ceiling_kbps: a.bitrate_ceiling_kbps,
                    throttled: a.throttled,
                };
                (id.clone(), view)
            })
            .collect(),
    })
}

#[derive(Debug, Deserialize)]
struct AlertBody {
    text: String,
}

// POST /nodes/{id}/alert
async fn post_alert(
    State(app): State<HubServices>,
    Path(id): Path<String>,
    Json(body): Json<AlertBody>,
) -> StatusCode {
    if body.text.trim().is_empty() {
        return StatusCode::BAD_REQUEST;
    }
    if app.sessions.directory().enqueue(&id, Outbound::Control(ControlMessage::Alert { text: body.text })) {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    }
}

#[derive(Debug, Deserialize)]
struct MemoryQuery {
    q: String,
    top_k: Option<usize>,
}

// GET /memory/query?q=&top_k=
async fn query_memory(
    State(app): State<HubServices>,
    Query(params): Query<MemoryQuery>,
) -> Result<Json<Vec<Passage>>, (StatusCode, String)> {
    let top_k = params.top_k.unwrap_or(5).clamp(1, 50);
    app.memory
        .query(&params.q, top_k)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::SERVICE_UNAVAILABLE, e.to_string()))
}

// POST /shutdown
async fn shutdown(State(app): State<HubServices>) -> StatusCode {
    app.lifecycle.request_shutdown("http");
    StatusCode::ACCEPTED
}

// GET /session (upgrade WebSocket)
async fn session_upgrade(State(app): State<HubServices>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| async move {
        let end = app.sessions.run(WsTransport { socket }).await;
        tracing::debug!("[http] session ended: {end:?}");
    })
}

/// Adaptateur WebSocket axum → `Transport`
struct WsTransport {
    socket: WebSocket,
}

#[async_trait]
impl Transport for WsTransport {
    async fn recv(&mut self) -> Option<Result<WireMessage, SessionError>> {
        loop {
            let msg = match self.socket.recv().await? {
                Ok(msg) => msg,
                Err(e) => return Some(Err(SessionError::Transport(e.to_string()))),
            };
            let wire = match msg {
                Message::Text(text) => WireMessage::Text(text.to_string()),
                Message::Binary(bytes) => WireMessage::Binary(bytes),
                Message::Close(_) => WireMessage::Close,
                // ping/pong gérés par axum
                Message::Ping(_) | Message::Pong(_) => continue,
            };
            return Some(Ok(wire));
        }
    }

    async fn send(&mut self, msg: WireMessage) -> Result<(), SessionError> {
        let msg = match msg {
            WireMessage::Text(text) => Message::Text(text.into()),
            WireMessage::Binary(bytes) => Message::Binary(bytes),
            WireMessage::Close => Message::Close(None),
        };
        self.socket.send(msg).await.map_err(|e| SessionError::Transport(e.to_string()))
    }
}
