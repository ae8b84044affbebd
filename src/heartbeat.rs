// =============================================================================
// MESH CORE :: heartbeat.rs
// Ping/pong liveness and latency estimation
// =============================================================================

use crate::connection::{startup_jitter, Connection};
use crate::constants::{MSG_PING, MSG_PONG};
use crate::network::{to_contents, Message, PingPayload};
use crate::p2p::MeshNode;
use std::sync::Arc;
use tokio::time::{interval, sleep, MissedTickBehavior};

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Round trip for a pong stamped with `origin`; clock steps never go negative.
pub fn round_trip(origin: i64, now: i64) -> u64 {
    (now - origin).max(0) as u64
}

/// Per-connection ping ticker. Ends when the connection is cancelled or when
/// it has gone silent for longer than the connection timeout.
pub async fn heartbeat_loop(node: Arc<MeshNode>, conn: Arc<Connection>) {
    let rate = node.config.heartbeat_rate;
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

        if conn.timed_out(node.config.connection_timeout).await {
            log::warn!(
                "[{}] ⏱️ No pong from [{}] for {:?}, disconnecting",
                node.name(),
                conn.peer_name,
                node.config.connection_timeout
            );
            conn.disconnect();
            break;
        }

        let payload = PingPayload {
            ping: now_millis(),
            pong: None,
        };
        match to_contents(&payload) {
            Ok(contents) => {
                conn.send(Message::direct(MSG_PING, contents, node.name(), &conn.peer_name));
            }
            Err(e) => log::warn!("[{}] Cannot build ping: {}", node.name(), e),
        }
    }

    log::debug!("[{}] Heartbeat for [{}] stopped", node.name(), conn.peer_name);
}

/// Answer a ping straight back to the neighbor that sent it.
pub async fn handle_ping(node: &MeshNode, message: &Message) {
    let Some(origin) = message.origin() else { return };
    let payload: PingPayload = match message.payload() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Bad ping from [{}]: {}", node.name(), origin, e);
            return;
        }
    };
    let Some(conn) = node.connection(origin).await else {
        log::debug!("[{}] Ping from [{}] with no connection", node.name(), origin);
        return;
    };

    let pong = PingPayload {
        ping: payload.ping,
        pong: Some(now_millis()),
    };
    if let Ok(contents) = to_contents(&pong) {
        conn.send(Message::direct(MSG_PONG, contents, node.name(), origin));
    }
}

pub async fn handle_pong(node: &MeshNode, message: &Message) {
    let Some(origin) = message.origin() else { return };
    if !message.is_direct() {
        log::warn!("[{}] Ignoring relayed pong from [{}]", node.name(), origin);
        return;
    }
    let payload: PingPayload = match message.payload() {
        Ok(p) => p,
        Err(e) => {
            log::warn!("[{}] Bad pong from [{}]: {}", node.name(), origin, e);
            return;
        }
    };
    let Some(conn) = node.connection(origin).await else { return };

    let rtt = round_trip(payload.ping, now_millis());
    let updated = conn
        .record_rtt(rtt, node.config.ping_update_rate, node.config.ping_dump_rate)
        .await;

    if let Some(current) = updated {
        log::debug!("[{}] 🏓 ping to [{}] = {}ms", node.name(), origin, current);
        let direct = vec![node.name().to_string(), origin.to_string()];
        if node.routes.write().await.offer(origin, direct, current) {
            log::debug!("[{}] Direct route to [{}] now {}ms", node.name(), origin, current);
        }
    }
}
