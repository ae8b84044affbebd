// =============================================================================
// MESH CORE :: discovery.rs
// Gossip: learn neighbors-of-neighbors and ask for introductions
// =============================================================================
//
//   A ── sendConnections ──────▶ P     "I know bravo, charlie"
//   A ◀── requestConnections ─── P     "introduce me to charlie"
//   A ── responseConnections ──▶ P     "charlie is at 10.0.0.7:9003"
//                                P ──▶ connect_to(10.0.0.7, 9003)
//
// Only the node whose name sorts first asks for the introduction, so two
// nodes that learn about each other at the same time dial only once.
// =============================================================================

use crate::connection::{startup_jitter, Connection};
use crate::constants::{MSG_REQUEST_CONNECTIONS, MSG_RESPONSE_CONNECTIONS, MSG_SEND_CONNECTIONS};
use crate::network::{
    to_contents, KnownPeer, Message, PeerAddress, RequestConnectionsPayload,
    ResponseConnectionsPayload, SendConnectionsPayload,
};
use crate::p2p::MeshNode;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub async fn gossip_loop(node: Arc<MeshNode>, conn: Arc<Connection>) {
    let rate = node.config.update_network_rate;
    tokio::select! {
        _ = conn.cancelled() => return,
        _ = sleep(startup_jitter(rate)) => {}
    }

    let mut ticker = interval(rate);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = conn.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut known = vec![];
        for peer in node.connections_snapshot().await {
            known.push(KnownPeer {
                peer_name: peer.peer_name.clone(),
                current_ping: peer.current_ping().await,
            });
        }

        match to_contents(&SendConnectionsPayload { connections: known }) {
            Ok(contents) => {
                conn.send(Message::direct(
                    MSG_SEND_CONNECTIONS,
                    contents,
                    node.name(),
                    &conn.peer_name,
                ));
            }
            Err(e) => log::warn!("[{}] Cannot build peer list: {}", node.name(), e),
        }
    }
}

/// Names from a neighbor's peer list this node should be introduced to.
pub fn introductions_wanted(
    self_name: &str,
    listed: &[KnownPeer],
    connected: &HashSet<String>,
) -> Vec<String> {
    listed
        .iter()
        .map(|p| p.peer_name.as_str())
        .filter(|name| *name > self_name)
        .filter(|name| !connected.contains(*name))
        .collect::<BTreeSet<&str>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}

pub async fn handle_send_connections(node: &MeshNode, message: &Message) {
    let Some(origin) = message.origin() else { return };
    let payload: SendConnectionsPayload = match message.payload() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Bad peer list from [{}]: {}", node.name(), origin, e);
            return;
        }
    };

    let connected: HashSet<String> = node.connected_names().await.into_iter().collect();
    let wanted = introductions_wanted(node.name(), &payload.connections, &connected);
    if wanted.is_empty() {
        return;
    }

    let Some(conn) = node.connection(origin).await else { return };
    log::debug!("[{}] 🧭 Asking [{}] to introduce {:?}", node.name(), origin, wanted);
    if let Ok(contents) = to_contents(&RequestConnectionsPayload { names: wanted }) {
        conn.send(Message::direct(MSG_REQUEST_CONNECTIONS, contents, node.name(), origin));
    }
}

pub async fn handle_request_connections(node: &MeshNode, message: &Message) {
    let Some(origin) = message.origin() else { return };
    let payload: RequestConnectionsPayload = match message.payload() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Bad introduction request from [{}]: {}", node.name(), origin, e);
            return;
        }
    };

    let mut addresses = vec![];
    for name in &payload.names {
        if name == origin {
            continue;
        }
        if let Some(conn) = node.connection(name).await {
            addresses.push(PeerAddress {
                name: conn.peer_name.clone(),
                address: conn.address.clone(),
                listening_port: conn.listening_port,
            });
        }
    }
    if addresses.is_empty() {
        return;
    }

    let Some(conn) = node.connection(origin).await else { return };
    if let Ok(contents) = to_contents(&ResponseConnectionsPayload { connections: addresses }) {
        conn.send(Message::direct(MSG_RESPONSE_CONNECTIONS, contents, node.name(), origin));
    }
}

/// Dial every introduced peer in the background; a peer already connected or
/// already being dialled is skipped.
pub async fn handle_response_connections(node: &Arc<MeshNode>, message: &Message) {
    let origin = message.origin().unwrap_or_default();
    let payload: ResponseConnectionsPayload = match message.payload() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Bad introduction from [{}]: {}", node.name(), origin, e);
            return;
        }
    };

    for peer in payload.connections {
        if peer.name == node.name() || node.is_connected(&peer.name).await {
            continue;
        }
        if !node.begin_dial(&peer.name).await {
            continue;
        }

        log::info!(
            "[{}] 🧭 [{}] introduced [{}] at {}:{}",
            node.name(),
            origin,
            peer.name,
            peer.address,
            peer.listening_port
        );
        let node = Arc::clone(node);
        tokio::spawn(async move {
            match node.dial(&peer.address, peer.listening_port).await {
                Ok(name) if name != peer.name => log::warn!(
                    "[{}] Dialled {}:{} expecting [{}], got [{}]",
                    node.name(),
                    peer.address,
                    peer.listening_port,
                    peer.name,
                    name
                ),
                Ok(_) => {}
                Err(e) => log::warn!("[{}] Introduction to [{}] failed: {}", node.name(), peer.name, e),
            }
            node.end_dial(&peer.name).await;
        });
    }
}
