// =============================================================================
// MESH CORE :: router.rs
// Deliver or forward every received message
// =============================================================================

use crate::constants::*;
use crate::handler::MeshHandle;
use crate::network::Message;
use crate::p2p::MeshNode;
use crate::{discovery, heartbeat, optimizer};
use std::sync::Arc;

/// Entry point for every frame the read tasks decode. `from` is the neighbor
/// the frame arrived on, which is not necessarily the origin.
pub async fn handle(node: &Arc<MeshNode>, from: &str, message: Message) {
    if message.is_addressed_to(node.name()) {
        dispatch(node, from, message).await;
    } else {
        forward(node, message).await;
    }
}

/// Pass a message, unchanged, to the hop after this node on its route.
/// A missing next hop drops the message; in-flight traffic is never re-routed.
pub async fn forward(node: &MeshNode, message: Message) -> bool {
    let Some(next) = message.next_hop(node.name()).map(str::to_string) else {
        log::warn!(
            "[{}] Dropping {}: not on its route {:?}",
            node.name(),
            message.kind,
            message.route
        );
        return false;
    };

    match node.connection(&next).await {
        Some(conn) => conn.send(message),
        None => {
            log::warn!(
                "[{}] Dropping {} for [{}]: next hop [{}] not connected",
                node.name(),
                message.kind,
                message.recipient().unwrap_or_default(),
                next
            );
            false
        }
    }
}

async fn dispatch(node: &Arc<MeshNode>, from: &str, message: Message) {
    match message.kind.as_str() {
        MSG_PING => heartbeat::handle_ping(node, &message).await,
        MSG_PONG => heartbeat::handle_pong(node, &message).await,
        MSG_SEND_CONNECTIONS => discovery::handle_send_connections(node, &message).await,
        MSG_REQUEST_CONNECTIONS => discovery::handle_request_connections(node, &message).await,
        MSG_RESPONSE_CONNECTIONS => discovery::handle_response_connections(node, &message).await,
        MSG_OPTIMIZE_ROUTE => optimizer::handle_optimize_route(node, &message).await,
        MSG_RECEIVE_OPTIMIZED_ROUTE => optimizer::handle_optimized_route(node, &message).await,
        MSG_INFO => log::warn!("[{}] Unexpected handshake frame from [{}]", node.name(), from),
        _ => deliver(node, message).await,
    }
}

/// Hand an application message to its registered handler; the handler's
/// reply, if any, goes back to the origin.
async fn deliver(node: &Arc<MeshNode>, message: Message) {
    let sender = message.origin().unwrap_or_default().to_string();
    let Some(handler) = node.handler_for(&message.kind).await else {
        log::info!(
            "[{}] No handler for type {} from [{}], dropped",
            node.name(),
            message.kind,
            sender
        );
        return;
    };

    let mesh = MeshHandle::new(node);
    let reply = handler.handle_message(&mesh, &sender, &message.kind, &message.contents);

    if let Some(reply) = reply {
        if !node.send_message(&sender, &reply.kind, reply.contents).await {
            log::warn!("[{}] Reply {} to [{}] not sent", node.name(), reply.kind, sender);
        }
    }
}
