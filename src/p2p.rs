// =============================================================================
// MESH CORE :: p2p.rs
// MeshNode: listener, handshake, connection lifecycle and the public surface
// =============================================================================
//
// Task layout:
//
//   accept loop ──▶ handshake ──▶ add_connection ──┬─ read task  ──┐
//                                                  ├─ write task   │ MeshEvent
//   dial ─────────▶ handshake ──▶ add_connection   ├─ heartbeat    │
//                                                  ├─ gossip       ▼
//                                                  └─ optimizer   dispatch loop
//                                                                  ├─ router::handle
//                                                                  └─ remove_connection
//
// Locks are held for one table operation at a time and never across a
// socket write: sends only enqueue onto a connection's outbound channel.
// =============================================================================

use crate::config::{resolve_advertise_address, MeshConfig};
use crate::connection::{read_loop, write_loop, Connection, MeshEvent};
use crate::constants::{is_reserved, EVENT_QUEUE_DEPTH, OUTBOUND_QUEUE_DEPTH, TASK_JOIN_TIMEOUT_MS};
use crate::error::{MeshError, Result};
use crate::handler::{HandlerRegistry, MessageHandler};
use crate::network::{codec, decode_handshake, encode_handshake, HandshakeInfo, Message};
use crate::routing::{RouteEntry, RouteStats, RoutingTable};
use crate::table::ConnectionTable;
use crate::{discovery, heartbeat, optimizer, router};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

/// Who this node is. Fixed once the listener is bound.
#[derive(Debug, Clone, Serialize)]
pub struct NodeIdentity {
    pub name: String,
    pub address: String,
    pub listening_port: u16,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub name: String,
    pub address: String,
    pub listening_port: u16,
    pub personal_port: u16,
    pub current_ping: Option<u64>,
    pub lag_millis: u64,
    pub route: Vec<String>,
    pub optimum_ping: Option<u64>,
    pub uptime_seconds: u64,
}

pub struct MeshNode {
    pub config: MeshConfig,
    pub identity: NodeIdentity,

    connections: RwLock<ConnectionTable>,
    pub(crate) routes: RwLock<RoutingTable>,
    handlers: RwLock<HandlerRegistry>,
    /// Peer names with an introduction dial in flight
    dialing: Mutex<HashSet<String>>,

    events: mpsc::Sender<MeshEvent>,
    next_connection_id: AtomicU64,
    shutdown: CancellationToken,
    stopped: AtomicBool,
    loops: StdMutex<Vec<JoinHandle<()>>>,
    pub started_at: Instant,
}

impl MeshNode {
    /// Bind the listener, work out the advertised address and start the
    /// accept, dispatch and status loops.
    pub async fn start(config: MeshConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let (listener, bound) = bind_with_fallback(&config).await?;
        let address = resolve_advertise_address(&config, bound).await;

        let (events, events_rx) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let node = Arc::new(MeshNode {
            identity: NodeIdentity {
                name: config.name.clone(),
                address,
                listening_port: bound.port(),
            },
            routes: RwLock::new(RoutingTable::new(&config.name)),
            config,
            connections: RwLock::new(ConnectionTable::new()),
            handlers: RwLock::new(HandlerRegistry::new()),
            dialing: Mutex::new(HashSet::new()),
            events,
            next_connection_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            stopped: AtomicBool::new(false),
            loops: StdMutex::new(Vec::new()),
            started_at: Instant::now(),
        });

        log::info!(
            "🌐 Node [{}] listening on {} (advertised as {}:{})",
            node.name(),
            bound,
            node.identity.address,
            node.identity.listening_port
        );

        let handles = vec![
            tokio::spawn(Arc::clone(&node).accept_loop(listener)),
            tokio::spawn(Arc::clone(&node).dispatch_loop(events_rx)),
            tokio::spawn(Arc::clone(&node).status_loop()),
        ];
        node.track_loops(handles);

        Ok(node)
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn listening_port(&self) -> u16 {
        self.identity.listening_port
    }

    fn track_loops(&self, handles: Vec<JoinHandle<()>>) {
        match self.loops.lock() {
            Ok(mut loops) => loops.extend(handles),
            Err(poisoned) => poisoned.into_inner().extend(handles),
        }
    }

    // -------------------------------------------------------------------------
    // Node loops
    // -------------------------------------------------------------------------

    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, remote)) => {
                    log::debug!("[{}] 📡 Incoming connection from {}", self.name(), remote);
                    let node = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = node.establish(stream, remote).await {
                            log::warn!("[{}] ❌ Inbound {} rejected: {}", node.name(), remote, e);
                        }
                    });
                }
                Err(e) => log::error!("[{}] ❌ Accept error: {}", self.name(), e),
            }
        }
        log::debug!("[{}] Listener closed", self.name());
    }

    async fn dispatch_loop(self: Arc<Self>, mut events: mpsc::Receiver<MeshEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = events.recv() => event,
            };

            match event {
                Some(MeshEvent::Frame { from, message }) => {
                    router::handle(&self, &from, message).await;
                }
                Some(MeshEvent::Closed { peer, id }) => {
                    self.remove_connection(&peer, Some(id)).await;
                }
                None => break,
            }
        }
    }

    async fn status_loop(self: Arc<Self>) {
        let mut ticker = interval(self.config.status_report_rate);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            log::info!("\n{}", self.list_connections().await);
        }
    }

    // -------------------------------------------------------------------------
    // Connection lifecycle
    // -------------------------------------------------------------------------

    /// Exchange `info` frames on a fresh socket and register the peer.
    async fn establish(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<String> {
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("[{}] set_nodelay on {} failed: {}", self.name(), remote, e);
        }
        let (read_half, write_half) = stream.into_split();
        let mut reader = FramedRead::new(read_half, codec());
        let mut writer = FramedWrite::new(write_half, codec());

        let ours = HandshakeInfo::new(self.name(), &self.identity.address, self.listening_port());
        writer.send(encode_handshake(&ours)?).await?;

        let frame = timeout(self.config.handshake_timeout, reader.next())
            .await
            .map_err(|_| MeshError::Timeout(format!("handshake with {}", remote)))?
            .ok_or_else(|| MeshError::Handshake(format!("{} closed before its info frame", remote)))??;
        let theirs = decode_handshake(&frame)?;

        if theirs.name == self.name() {
            return Err(MeshError::Handshake(format!("{} uses our own name", remote)));
        }

        let address = match theirs.address.parse::<IpAddr>() {
            Ok(ip) if ip.is_unspecified() => remote.ip().to_string(),
            _ if theirs.address.is_empty() => remote.ip().to_string(),
            _ => theirs.address.clone(),
        };

        self.add_connection(&theirs.name, &address, theirs.listening_port, remote.port(), reader, writer)
            .await
    }

    async fn add_connection(
        self: &Arc<Self>,
        peer: &str,
        address: &str,
        listening_port: u16,
        personal_port: u16,
        reader: FramedRead<tokio::net::tcp::OwnedReadHalf, tokio_util::codec::LengthDelimitedCodec>,
        writer: FramedWrite<tokio::net::tcp::OwnedWriteHalf, tokio_util::codec::LengthDelimitedCodec>,
    ) -> Result<String> {
        let id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);
        let (conn, outbound) = Connection::new(
            id,
            self.name(),
            peer,
            address,
            listening_port,
            personal_port,
            OUTBOUND_QUEUE_DEPTH,
        );
        let conn = Arc::new(conn);

        {
            let mut table = self.connections.write().await;
            if self.shutdown.is_cancelled() {
                return Err(MeshError::Shutdown);
            }
            if !table.add(Arc::clone(&conn)) {
                return Err(MeshError::DuplicateConnection(peer.to_string()));
            }
            self.routes.write().await.ensure_direct(peer);

            conn.attach_tasks(vec![
                tokio::spawn(read_loop(Arc::clone(&conn), reader, self.events.clone())),
                tokio::spawn(write_loop(Arc::clone(&conn), writer, outbound)),
                tokio::spawn(heartbeat::heartbeat_loop(Arc::clone(self), Arc::clone(&conn))),
                tokio::spawn(discovery::gossip_loop(Arc::clone(self), Arc::clone(&conn))),
                tokio::spawn(optimizer::optimization_loop(Arc::clone(self), Arc::clone(&conn))),
            ]);
        }

        log::info!(
            "[{}] ✅ Connected to [{}] at {}:{}",
            self.name(),
            peer,
            address,
            listening_port
        );
        Ok(peer.to_string())
    }

    /// Tear down a connection: cancel and join its tasks, then collapse every
    /// route that went through it. With `id` set, a newer connection under
    /// the same name is left alone.
    pub(crate) async fn remove_connection(&self, peer: &str, id: Option<u64>) -> bool {
        let Some(conn) = self.connections.write().await.remove(peer, id) else {
            return false;
        };

        conn.disconnect();
        conn.join_tasks(Duration::from_millis(TASK_JOIN_TIMEOUT_MS)).await;

        let reset = self.routes.write().await.purge(peer);
        log::info!("[{}] 🔌 Removed [{}]", self.name(), peer);
        if !reset.is_empty() {
            log::info!("[{}] Routes through [{}] reset: {:?}", self.name(), peer, reset);
        }
        for name in &reset {
            if let Some(conn) = self.connection(name).await {
                conn.reset_ping().await;
            }
        }
        true
    }

    // -------------------------------------------------------------------------
    // Control surface
    // -------------------------------------------------------------------------

    /// Open a connection and return the name the peer handshook with.
    pub async fn dial(self: &Arc<Self>, address: &str, port: u16) -> Result<String> {
        if self.shutdown.is_cancelled() {
            return Err(MeshError::Shutdown);
        }
        log::info!("[{}] 🔌 Connecting to {}:{}...", self.name(), address, port);

        let stream = timeout(self.config.handshake_timeout, TcpStream::connect((address, port)))
            .await
            .map_err(|_| MeshError::Timeout(format!("connect to {}:{}", address, port)))??;
        let remote = stream.peer_addr()?;
        self.establish(stream, remote).await
    }

    pub async fn connect_to(self: &Arc<Self>, address: &str, port: u16) -> bool {
        match self.dial(address, port).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!("[{}] ❌ connect_to {}:{} failed: {}", self.name(), address, port, e);
                false
            }
        }
    }

    /// Send an application message along the current route to `peer`.
    pub async fn send_message(&self, peer: &str, kind: &str, contents: Value) -> bool {
        if is_reserved(kind) {
            log::warn!("[{}] Refusing to send reserved type {}", self.name(), kind);
            return false;
        }
        let Some(path) = self.route_to(peer).await else {
            log::warn!("[{}] {}", self.name(), MeshError::UnknownPeer(peer.to_string()));
            return false;
        };
        router::forward(self, Message::new(kind, contents, path)).await
    }

    /// Send to every connected peer, each along its own route. Returns how
    /// many messages were queued.
    pub async fn broadcast(&self, kind: &str, contents: Value) -> usize {
        let mut sent = 0;
        for peer in self.connected_names().await {
            if self.send_message(&peer, kind, contents.clone()).await {
                sent += 1;
            }
        }
        sent
    }

    /// Artificial delay added to the measured ping of `peer`. The route to
    /// the peer is relearned from scratch.
    pub async fn set_lag(&self, peer: &str, millis: u64) -> bool {
        let Some(conn) = self.connection(peer).await else {
            return false;
        };
        conn.set_lag(millis);
        self.routes.write().await.reset(peer);
        log::info!("[{}] 🐢 Lag to [{}] set to {}ms", self.name(), peer, millis);
        true
    }

    pub async fn number_of_connections(&self) -> usize {
        self.connections.read().await.len()
    }

    pub async fn register_handler(&self, handler: Arc<dyn MessageHandler>) -> bool {
        match self.handlers.write().await.register(handler) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("[{}] {}", self.name(), e);
                false
            }
        }
    }

    pub async fn list_connections(&self) -> String {
        let summaries = self.connection_summaries().await;
        let mut out = format!("[{}] {} connection(s)", self.name(), summaries.len());
        for s in summaries {
            let ping = s
                .current_ping
                .map(|p| format!("{}ms", p))
                .unwrap_or_else(|| "?".to_string());
            out.push_str(&format!(
                "\n  {:<12} {}:{}  ping {}  lag {}ms  route {}",
                s.name,
                s.address,
                s.listening_port,
                ping,
                s.lag_millis,
                s.route.join(" -> ")
            ));
        }
        out
    }

    /// Stop accepting, stop dispatching and remove every connection.
    /// Calling it again is a no-op.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("[{}] 🛑 Shutting down", self.name());
        self.shutdown.cancel();

        let loops: Vec<JoinHandle<()>> = match self.loops.lock() {
            Ok(mut loops) => loops.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        for handle in loops {
            if let Err(e) = handle.await {
                log::debug!("[{}] Node loop ended badly: {}", self.name(), e);
            }
        }

        let names = self.connections.read().await.names();
        for peer in names {
            self.remove_connection(&peer, None).await;
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub async fn wait_for_shutdown(&self) {
        self.shutdown.cancelled().await
    }

    // -------------------------------------------------------------------------
    // Queries
    // -------------------------------------------------------------------------

    pub(crate) async fn connection(&self, peer: &str) -> Option<Arc<Connection>> {
        self.connections.read().await.get(peer)
    }

    pub(crate) async fn connections_snapshot(&self) -> Vec<Arc<Connection>> {
        self.connections.read().await.snapshot()
    }

    pub async fn connected_names(&self) -> Vec<String> {
        self.connections.read().await.names()
    }

    pub async fn is_connected(&self, peer: &str) -> bool {
        self.connections.read().await.exists(peer)
    }

    pub async fn current_ping(&self, peer: &str) -> Option<u64> {
        let conn = self.connection(peer).await?;
        conn.current_ping().await
    }

    pub async fn route_to(&self, peer: &str) -> Option<Vec<String>> {
        self.routes.read().await.path_to(peer)
    }

    pub async fn routes_snapshot(&self) -> BTreeMap<String, RouteEntry> {
        self.routes.read().await.snapshot()
    }

    pub async fn route_stats(&self) -> RouteStats {
        self.routes.read().await.stats()
    }

    pub(crate) async fn handler_for(&self, kind: &str) -> Option<Arc<dyn MessageHandler>> {
        self.handlers.read().await.get(kind)
    }

    pub async fn connection_summaries(&self) -> Vec<ConnectionSummary> {
        let conns = self.connections_snapshot().await;
        let routes = self.routes_snapshot().await;

        let mut out = Vec::with_capacity(conns.len());
        for conn in conns {
            let entry = routes.get(&conn.peer_name);
            out.push(ConnectionSummary {
                name: conn.peer_name.clone(),
                address: conn.address.clone(),
                listening_port: conn.listening_port,
                personal_port: conn.personal_port,
                current_ping: conn.current_ping().await,
                lag_millis: conn.lag(),
                route: entry.map(|e| e.path.clone()).unwrap_or_default(),
                optimum_ping: entry.and_then(|e| e.optimum_ping),
                uptime_seconds: conn.connected_at.elapsed().as_secs(),
            });
        }
        out
    }

    pub async fn status(&self) -> NodeStatus {
        NodeStatus {
            name: self.name().to_string(),
            address: self.identity.address.clone(),
            listening_port: self.listening_port(),
            connections: self.connected_names().await,
            routes: self.route_stats().await,
            uptime_seconds: self.started_at.elapsed().as_secs(),
        }
    }

    pub(crate) async fn begin_dial(&self, peer: &str) -> bool {
        self.dialing.lock().await.insert(peer.to_string())
    }

    pub(crate) async fn end_dial(&self, peer: &str) {
        self.dialing.lock().await.remove(peer);
    }
}

/// Bind `listen_port`, or the next free port within `port_search_limit`.
/// Port 0 asks the OS for an ephemeral port.
async fn bind_with_fallback(config: &MeshConfig) -> Result<(TcpListener, SocketAddr)> {
    let attempts = if config.listen_port == 0 {
        1
    } else {
        config.port_search_limit.max(1)
    };

    let mut last_error = None;
    for offset in 0..attempts {
        let Some(port) = config.listen_port.checked_add(offset) else { break };
        match TcpListener::bind((config.listen_addr, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?;
                if offset > 0 {
                    log::warn!(
                        "[{}] Port {} busy, listening on {} instead",
                        config.name,
                        config.listen_port,
                        port
                    );
                }
                return Ok((listener, bound));
            }
            Err(e) => last_error = Some(e),
        }
    }

    Err(match last_error {
        Some(e) => MeshError::Io(e),
        None => MeshError::Config(format!("no usable port from {}", config.listen_port)),
    })
}

#[derive(Debug, Serialize)]
pub struct NodeStatus {
    pub name: String,
    pub address: String,
    pub listening_port: u16,
    pub connections: Vec<String>,
    pub routes: RouteStats,
    pub uptime_seconds: u64,
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "═══════════════════════════════════════\n\
             MESH NODE STATUS\n\
             ═══════════════════════════════════════\n\
             Name:     {}\n\
             Addr:     {}:{}\n\
             Peers:    {} connected: {:?}\n\
             Routes:   {} ({} relayed, {} unmeasured)\n\
             Uptime:   {}s\n\
             ═══════════════════════════════════════",
            self.name,
            self.address,
            self.listening_port,
            self.connections.len(),
            self.connections,
            self.routes.routes,
            self.routes.relayed_routes,
            self.routes.unknown_pings,
            self.uptime_seconds
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::{MSG_PING, MSG_PONG, MSG_RECEIVE_OPTIMIZED_ROUTE};
    use crate::handler::{MeshHandle, Reply};
    use crate::network::{decode_message, encode_message, OptimizedRoutePayload, PingPayload};
    use serde_json::json;
    use std::future::Future;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::time::sleep;

    fn ms(millis: u64) -> Duration {
        Duration::from_millis(millis)
    }

    fn test_config(name: &str) -> MeshConfig {
        let mut config = MeshConfig::new(name, 0);
        config.listen_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.heartbeat_rate = ms(20);
        config.connection_timeout = ms(1000);
        config.ping_update_rate = 2;
        config.ping_dump_rate = 20;
        config.update_network_rate = ms(50);
        config.route_optimization_rate = ms(100);
        config.status_report_rate = ms(1000);
        config.handshake_timeout = ms(2000);
        config
    }

    async fn start(name: &str) -> Arc<MeshNode> {
        MeshNode::start(test_config(name)).await.unwrap()
    }

    /// Poll `check` until it holds or `limit_ms` passes.
    async fn wait_until<F, Fut>(node: &Arc<MeshNode>, limit_ms: u64, check: F) -> bool
    where
        F: Fn(Arc<MeshNode>) -> Fut,
        Fut: Future<Output = bool>,
    {
        let deadline = Instant::now() + ms(limit_ms);
        loop {
            if check(Arc::clone(node)).await {
                return true;
            }
            if Instant::now() > deadline {
                return false;
            }
            sleep(ms(10)).await;
        }
    }

    async fn eventually<F: Fn() -> bool>(limit_ms: u64, check: F) -> bool {
        let deadline = Instant::now() + ms(limit_ms);
        while !check() {
            if Instant::now() > deadline {
                return false;
            }
            sleep(ms(10)).await;
        }
        true
    }

    fn path(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    /// Records every message of one type.
    struct Recorder {
        kind: &'static str,
        seen: StdMutex<Vec<(String, Value)>>,
    }

    impl Recorder {
        fn new(kind: &'static str) -> Arc<Self> {
            Arc::new(Recorder { kind, seen: StdMutex::new(vec![]) })
        }

        fn seen(&self) -> Vec<(String, Value)> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl MessageHandler for Recorder {
        fn message_types(&self) -> Vec<String> {
            vec![self.kind.to_string()]
        }

        fn handle_message(&self, _: &MeshHandle, sender: &str, _: &str, contents: &Value) -> Option<Reply> {
            self.seen.lock().unwrap().push((sender.to_string(), contents.clone()));
            None
        }
    }

    struct Echo;

    impl MessageHandler for Echo {
        fn message_types(&self) -> Vec<String> {
            vec!["echo".to_string()]
        }

        fn handle_message(&self, _: &MeshHandle, _: &str, _: &str, contents: &Value) -> Option<Reply> {
            Some(Reply::new("echoed", contents.clone()))
        }
    }

    type FakeReader = FramedRead<tokio::net::tcp::OwnedReadHalf, tokio_util::codec::LengthDelimitedCodec>;
    type FakeWriter = FramedWrite<tokio::net::tcp::OwnedWriteHalf, tokio_util::codec::LengthDelimitedCodec>;

    /// A hand-driven peer speaking raw frames.
    async fn fake_peer(node: &Arc<MeshNode>, name: &str) -> (FakeReader, FakeWriter) {
        let stream = TcpStream::connect(("127.0.0.1", node.listening_port())).await.unwrap();
        let (r, w) = stream.into_split();
        let mut reader = FramedRead::new(r, codec());
        let mut writer = FramedWrite::new(w, codec());

        writer
            .send(encode_handshake(&HandshakeInfo::new(name, "0.0.0.0", 1)).unwrap())
            .await
            .unwrap();
        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(decode_handshake(&frame).unwrap().name, node.name());
        (reader, writer)
    }

    /// Answer the next `count` pings the node sends to the fake peer.
    async fn answer_pings(reader: &mut FakeReader, writer: &mut FakeWriter, name: &str, node: &str, count: usize) {
        let mut answered = 0;
        while answered < count {
            let frame = reader.next().await.unwrap().unwrap();
            let message = decode_message(&frame).unwrap();
            if message.kind != MSG_PING {
                continue;
            }
            let ping: PingPayload = message.payload().unwrap();
            let pong = PingPayload { ping: ping.ping, pong: Some(heartbeat::now_millis()) };
            let reply = Message::direct(MSG_PONG, serde_json::to_value(&pong).unwrap(), name, node);
            writer.send(encode_message(&reply).unwrap()).await.unwrap();
            answered += 1;
        }
    }

    #[tokio::test]
    async fn test_two_nodes_converge_on_direct_routes() {
        let xray = start("xray").await;
        let yankee = start("yankee").await;

        assert!(yankee.connect_to("127.0.0.1", xray.listening_port()).await);

        assert!(wait_until(&xray, 3000, |n| async move { n.current_ping("yankee").await.is_some() }).await);
        assert!(wait_until(&yankee, 3000, |n| async move { n.current_ping("xray").await.is_some() }).await);

        assert_eq!(xray.route_to("yankee").await, Some(path(&["xray", "yankee"])));
        assert_eq!(yankee.route_to("xray").await, Some(path(&["yankee", "xray"])));
        assert_eq!(xray.number_of_connections().await, 1);

        let summary = &yankee.connection_summaries().await[0];
        assert_eq!(summary.name, "xray");
        assert_eq!(summary.listening_port, xray.listening_port());
        assert!(yankee.list_connections().await.contains("xray"));

        xray.shutdown().await;
        yankee.shutdown().await;
    }

    #[tokio::test]
    async fn test_second_connection_is_rejected() {
        let xray = start("xray").await;
        let yankee = start("yankee").await;

        assert!(yankee.connect_to("127.0.0.1", xray.listening_port()).await);
        let first_id = yankee.connection("xray").await.unwrap().id;

        assert!(!yankee.connect_to("127.0.0.1", xray.listening_port()).await);
        sleep(ms(200)).await;

        assert_eq!(yankee.number_of_connections().await, 1);
        assert_eq!(xray.number_of_connections().await, 1);
        assert_eq!(yankee.connection("xray").await.unwrap().id, first_id);
        assert!(wait_until(&yankee, 3000, |n| async move { n.current_ping("xray").await.is_some() }).await);

        xray.shutdown().await;
        yankee.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_with_our_name_is_rejected() {
        let one = start("twin").await;
        let two = start("twin").await;
        assert!(!two.connect_to("127.0.0.1", one.listening_port()).await);
        assert_eq!(one.number_of_connections().await, 0);

        one.shutdown().await;
        two.shutdown().await;
    }

    #[tokio::test]
    async fn test_three_node_mesh_discovers_optimizes_and_recovers() {
        let alpha = start("alpha").await;
        let bravo = start("bravo").await;
        let charlie = start("charlie").await;

        assert!(alpha.connect_to("127.0.0.1", bravo.listening_port()).await);
        assert!(charlie.connect_to("127.0.0.1", bravo.listening_port()).await);

        // gossip through bravo introduces alpha to charlie
        assert!(wait_until(&alpha, 5000, |n| async move { n.is_connected("charlie").await }).await);
        assert!(wait_until(&alpha, 5000, |n| async move { n.current_ping("charlie").await.is_some() }).await);

        // a slow direct link loses to the relay through bravo
        assert!(alpha.set_lag("charlie", 500).await);
        assert!(wait_until(&alpha, 5000, |n| async move {
            n.current_ping("charlie").await.map_or(false, |p| p >= 500)
        })
        .await);
        assert!(wait_until(&alpha, 5000, |n| async move {
            let routes = n.routes_snapshot().await;
            routes.get("charlie").map_or(false, |e| {
                e.path == path(&["alpha", "bravo", "charlie"]) && e.optimum_ping.map_or(false, |p| p < 500)
            })
        })
        .await);

        for (peer, entry) in alpha.routes_snapshot().await {
            assert_eq!(entry.path.first().map(String::as_str), Some("alpha"));
            assert_eq!(entry.path.last(), Some(&peer));
        }

        // application traffic follows the relayed route
        let moves = Recorder::new("move");
        assert!(charlie.register_handler(moves.clone()).await);
        assert!(alpha.send_message("charlie", "move", json!({"x": 1})).await);
        assert!(eventually(3000, || !moves.seen().is_empty()).await);
        assert_eq!(moves.seen()[0], ("alpha".to_string(), json!({"x": 1})));

        // losing the relay collapses the route back to the direct link
        bravo.shutdown().await;
        assert!(wait_until(&alpha, 5000, |n| async move {
            !n.is_connected("bravo").await && n.route_to("charlie").await == Some(path(&["alpha", "charlie"]))
        })
        .await);

        alpha.shutdown().await;
        charlie.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_peer_is_timed_out() {
        let node = start("alpha").await;
        let bravo = start("bravo").await;
        assert!(bravo.connect_to("127.0.0.1", node.listening_port()).await);

        let (mut reader, mut writer) = fake_peer(&node, "ghost").await;
        assert!(wait_until(&node, 2000, |n| async move { n.is_connected("ghost").await }).await);

        // the peer advertised 0.0.0.0, so its socket address is recorded
        assert_eq!(node.connection("ghost").await.unwrap().address, "127.0.0.1");

        answer_pings(&mut reader, &mut writer, "ghost", "alpha", 3).await;
        assert!(wait_until(&node, 2000, |n| async move { n.current_ping("ghost").await.is_some() }).await);

        // bravo is reached through ghost; a zero optimum cannot be displaced
        let relay = path(&["alpha", "ghost", "bravo"]);
        {
            let mut routes = node.routes.write().await;
            routes.reset("bravo");
            assert!(routes.offer("bravo", relay.clone(), 0));
        }
        assert_eq!(node.route_to("bravo").await, Some(relay));

        // stop answering but keep the socket open
        assert!(wait_until(&node, 5000, |n| async move { !n.is_connected("ghost").await }).await);
        assert!(node.route_to("ghost").await.is_none());
        assert_eq!(node.route_to("bravo").await, Some(path(&["alpha", "bravo"])));
        assert!(node.is_connected("bravo").await);

        drop((reader, writer));
        node.shutdown().await;
        bravo.shutdown().await;
    }

    #[tokio::test]
    async fn test_stalled_peer_does_not_stall_the_node() {
        let alpha = start("alpha").await;
        let bravo = start("bravo").await;
        let moves = Recorder::new("move");
        assert!(alpha.register_handler(moves.clone()).await);
        assert!(bravo.connect_to("127.0.0.1", alpha.listening_port()).await);

        let (mut reader, mut writer) = fake_peer(&alpha, "ghost").await;
        answer_pings(&mut reader, &mut writer, "ghost", "alpha", 3).await;

        // ghost stops reading while far more than a socket buffer is queued to it
        let blob = "x".repeat(1024 * 1024);
        for _ in 0..64 {
            assert!(alpha.send_message("ghost", "blob", json!(blob)).await);
        }

        assert!(wait_until(&alpha, 5000, |n| async move { !n.is_connected("ghost").await }).await);
        assert!(bravo.send_message("alpha", "move", json!({"x": 2})).await);
        assert!(eventually(3000, || !moves.seen().is_empty()).await);

        assert!(tokio::time::timeout(ms(3000), alpha.shutdown()).await.is_ok());
        drop((reader, writer));
        bravo.shutdown().await;
    }

    #[tokio::test]
    async fn test_route_result_through_a_departed_peer_is_refused() {
        // no ping is ever published, so only injected results touch the routes
        let quiet = |name: &str| {
            let mut config = test_config(name);
            config.ping_update_rate = 1_000_000;
            config.ping_dump_rate = 1_000_000;
            config
        };
        let alpha = MeshNode::start(quiet("alpha")).await.unwrap();
        let bravo = MeshNode::start(quiet("bravo")).await.unwrap();
        let charlie = MeshNode::start(quiet("charlie")).await.unwrap();
        let delta = MeshNode::start(quiet("delta")).await.unwrap();
        for peer in [&bravo, &charlie, &delta] {
            assert!(alpha.connect_to("127.0.0.1", peer.listening_port()).await);
        }

        let sent_at = alpha.routes.read().await.generation();
        assert!(alpha.routes.write().await.offer("charlie", path(&["alpha", "bravo", "charlie"]), 3));

        bravo.shutdown().await;
        assert!(wait_until(&alpha, 3000, |n| async move { !n.is_connected("bravo").await }).await);
        assert_eq!(
            alpha.routes_snapshot().await.get("charlie"),
            Some(&RouteEntry::direct("alpha", "charlie"))
        );

        let result = |destination: &str, route: &[&str], generation: u64| {
            let payload = OptimizedRoutePayload {
                destination: destination.to_string(),
                probe_id: "late".to_string(),
                final_ping: 1,
                path: path(route),
                generation,
            };
            let mut back = path(route);
            back.reverse();
            Message::new(MSG_RECEIVE_OPTIMIZED_ROUTE, serde_json::to_value(&payload).unwrap(), back)
        };

        // both were measured before bravo left; bravo sits past the first hop
        optimizer::handle_optimized_route(&alpha, &result("charlie", &["alpha", "delta", "bravo", "charlie"], sent_at))
            .await;
        optimizer::handle_optimized_route(&alpha, &result("delta", &["alpha", "charlie", "bravo", "delta"], sent_at))
            .await;
        let routes = alpha.routes_snapshot().await;
        assert_eq!(routes["charlie"], RouteEntry::direct("alpha", "charlie"));
        assert_eq!(routes["delta"], RouteEntry::direct("alpha", "delta"));

        // a result measured after the purge is adopted
        let now = alpha.routes.read().await.generation();
        optimizer::handle_optimized_route(&alpha, &result("charlie", &["alpha", "delta", "charlie"], now)).await;
        assert_eq!(alpha.route_to("charlie").await, Some(path(&["alpha", "delta", "charlie"])));

        for node in [alpha, charlie, delta] {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_malformed_frame_keeps_connection() {
        let node = start("alpha").await;
        let (mut reader, mut writer) = fake_peer(&node, "ghost").await;

        writer.send(bytes::Bytes::from_static(b"{\"type\": 12")).await.unwrap();
        writer.send(bytes::Bytes::from_static(b"{\"type\":\"x\",\"route\":[]}")).await.unwrap();
        answer_pings(&mut reader, &mut writer, "ghost", "alpha", 2).await;

        assert!(wait_until(&node, 2000, |n| async move { n.current_ping("ghost").await.is_some() }).await);
        assert!(node.is_connected("ghost").await);

        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_reply_returns_to_sender() {
        let alpha = start("alpha").await;
        let bravo = start("bravo").await;
        assert!(bravo.register_handler(Arc::new(Echo)).await);
        let echoed = Recorder::new("echoed");
        assert!(alpha.register_handler(echoed.clone()).await);

        assert!(alpha.connect_to("127.0.0.1", bravo.listening_port()).await);
        assert!(alpha.send_message("bravo", "echo", json!("hi")).await);
        assert!(eventually(3000, || !echoed.seen().is_empty()).await);
        assert_eq!(echoed.seen()[0], ("bravo".to_string(), json!("hi")));

        // no handler on alpha for this type: dropped, connection unaffected
        assert!(bravo.send_message("alpha", "unclaimed", json!({})).await);
        sleep(ms(100)).await;
        assert!(alpha.is_connected("bravo").await);

        alpha.shutdown().await;
        bravo.shutdown().await;
    }

    #[tokio::test]
    async fn test_control_surface_rejections() {
        let alpha = start("alpha").await;

        assert!(alpha.register_handler(Recorder::new("move")).await);
        assert!(!alpha.register_handler(Recorder::new("move")).await);
        assert!(!alpha.register_handler(Recorder::new("pong")).await);

        assert!(!alpha.send_message("nobody", "move", json!({})).await);
        assert!(!alpha.send_message("nobody", "ping", json!({})).await);
        assert!(!alpha.set_lag("nobody", 10).await);
        assert_eq!(alpha.broadcast("move", json!({})).await, 0);

        alpha.shutdown().await;
        alpha.shutdown().await;
        assert!(alpha.is_shut_down());
        assert!(alpha.dial("127.0.0.1", 1).await.is_err());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_peer() {
        let hub = start("hub").await;
        let one = start("one").await;
        let two = start("two").await;
        let seen_one = Recorder::new("test");
        let seen_two = Recorder::new("test");
        assert!(one.register_handler(seen_one.clone()).await);
        assert!(two.register_handler(seen_two.clone()).await);

        assert!(one.connect_to("127.0.0.1", hub.listening_port()).await);
        assert!(two.connect_to("127.0.0.1", hub.listening_port()).await);
        assert!(wait_until(&hub, 3000, |n| async move { n.number_of_connections().await == 2 }).await);

        assert_eq!(hub.broadcast("test", json!("hello")).await, 2);
        assert!(eventually(3000, || !seen_one.seen().is_empty() && !seen_two.seen().is_empty()).await);

        for node in [hub, one, two] {
            node.shutdown().await;
        }
    }

    #[tokio::test]
    async fn test_busy_port_falls_back_to_next() {
        let blocker = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = blocker.local_addr().unwrap().port();

        let mut config = test_config("alpha");
        config.listen_port = taken;
        let node = MeshNode::start(config).await.unwrap();
        assert!(node.listening_port() > taken);
        assert!(node.listening_port() < taken.saturating_add(16));

        let status = node.status().await;
        assert_eq!(status.listening_port, node.listening_port());
        assert!(status.to_string().contains("alpha"));

        node.shutdown().await;
    }
}
