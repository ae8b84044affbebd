use axum::extract::State;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::SocketAddr;
use std::sync::Arc;
use crate::constants::VERSION;
use crate::error::Result;
use crate::p2p::{ConnectionSummary, MeshNode};
use crate::routing::RouteEntry;

#[derive(Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub status: String,
    pub address: String,
    pub listening_port: u16,
    pub active_connections: usize,
    pub relayed_routes: usize,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct ConnectionList {
    pub count: usize,
    pub connections: Vec<ConnectionSummary>,
}

#[derive(Deserialize)]
pub struct ConnectRequest {
    pub address: String,
    pub port: u16,
}

#[derive(Deserialize)]
pub struct LagRequest {
    pub peer: String,
    pub millis: u64,
}

#[derive(Deserialize)]
pub struct BroadcastRequest {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub contents: Value,
}

pub async fn status_handler(State(node): State<Arc<MeshNode>>) -> Json<NodeStatus> {
    let status = node.status().await;
    Json(NodeStatus {
        name: status.name,
        status: if node.is_shut_down() { "stopped" } else { "active" }.to_string(),
        address: status.address,
        listening_port: status.listening_port,
        active_connections: status.connections.len(),
        relayed_routes: status.routes.relayed_routes,
        uptime_seconds: status.uptime_seconds,
        version: VERSION.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn connections_handler(State(node): State<Arc<MeshNode>>) -> Json<ConnectionList> {
    let connections = node.connection_summaries().await;
    Json(ConnectionList {
        count: connections.len(),
        connections,
    })
}

async fn routes_handler(
    State(node): State<Arc<MeshNode>>,
) -> Json<std::collections::BTreeMap<String, RouteEntry>> {
    Json(node.routes_snapshot().await)
}

async fn connect_handler(
    State(node): State<Arc<MeshNode>>,
    Json(req): Json<ConnectRequest>,
) -> Json<Value> {
    let connected = node.connect_to(&req.address, req.port).await;
    Json(serde_json::json!({ "connected": connected }))
}

async fn lag_handler(State(node): State<Arc<MeshNode>>, Json(req): Json<LagRequest>) -> Json<Value> {
    let ok = node.set_lag(&req.peer, req.millis).await;
    Json(serde_json::json!({ "ok": ok }))
}

async fn broadcast_handler(
    State(node): State<Arc<MeshNode>>,
    Json(req): Json<BroadcastRequest>,
) -> Json<Value> {
    let sent = node.broadcast(&req.kind, req.contents).await;
    Json(serde_json::json!({ "sent": sent }))
}

pub fn router(node: Arc<MeshNode>) -> Router {
    Router::new()
        .route("/v1/status", get(status_handler))
        .route("/v1/connections", get(connections_handler))
        .route("/v1/routes", get(routes_handler))
        .route("/v1/connect", post(connect_handler))
        .route("/v1/lag", post(lag_handler))
        .route("/v1/broadcast", post(broadcast_handler))
        .with_state(node)
}

/// Serve the API until the node shuts down.
pub async fn serve(node: Arc<MeshNode>, addr: SocketAddr) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("[{}] 📊 API listening on http://{}", node.name(), listener.local_addr()?);

    let stopping = Arc::clone(&node);
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move { stopping.wait_for_shutdown().await })
        .await?;
    Ok(())
}
