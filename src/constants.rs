//! Protocol constants for the mesh.
//!
//! Message type tags, wire limits and the default timings every node
//! starts with unless the configuration overrides them.

/// Name shown in the banner and the status API
pub const NETWORK_NAME: &str = "Mesh Core";

/// Node version
pub const VERSION: &str = "0.1.0-alpha";

// ═══════════════════════════════════════════════════════════════
// Message types
// ═══════════════════════════════════════════════════════════════

/// Handshake frame, sent once in each direction right after connect/accept
pub const MSG_INFO: &str = "info";

pub const MSG_PING: &str = "ping";
pub const MSG_PONG: &str = "pong";

/// Gossip: "these are the peers I know"
pub const MSG_SEND_CONNECTIONS: &str = "sendConnections";
/// Gossip: "introduce me to these peers"
pub const MSG_REQUEST_CONNECTIONS: &str = "requestConnections";
/// Gossip: addresses of the requested peers
pub const MSG_RESPONSE_CONNECTIONS: &str = "responseConnections";

/// Route optimization probe, flooded toward a destination
pub const MSG_OPTIMIZE_ROUTE: &str = "optimizeRoute";
/// Route optimization result, travelling back to the probe origin
pub const MSG_RECEIVE_OPTIMIZED_ROUTE: &str = "receiveOptimizedRoute";

/// Types handled by the node itself and never handed to application handlers
pub const RESERVED_TYPES: [&str; 8] = [
    MSG_INFO,
    MSG_PING,
    MSG_PONG,
    MSG_SEND_CONNECTIONS,
    MSG_REQUEST_CONNECTIONS,
    MSG_RESPONSE_CONNECTIONS,
    MSG_OPTIMIZE_ROUTE,
    MSG_RECEIVE_OPTIMIZED_ROUTE,
];

/// Type broadcast by the console; handled by `ConsoleHandler`
pub const MSG_TEST: &str = "test";

pub fn is_reserved(kind: &str) -> bool {
    RESERVED_TYPES.contains(&kind)
}

// ═══════════════════════════════════════════════════════════════
// Wire limits
// ═══════════════════════════════════════════════════════════════

pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;
pub const OUTBOUND_QUEUE_DEPTH: usize = 1024;
/// Decoded frames waiting for the dispatcher, across all connections
pub const EVENT_QUEUE_DEPTH: usize = 1024;

// ═══════════════════════════════════════════════════════════════
// Default timings
// ═══════════════════════════════════════════════════════════════

pub const DEFAULT_PORT: u16 = 10010;
pub const DEFAULT_PORT_SEARCH_LIMIT: u16 = 16;
pub const DEFAULT_HEARTBEAT_MS: u64 = 1_000;
pub const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 15_000;
pub const DEFAULT_PING_UPDATE_RATE: u64 = 5;
pub const DEFAULT_PING_DUMP_RATE: u64 = 50;
pub const DEFAULT_UPDATE_NETWORK_MS: u64 = 5_000;
pub const DEFAULT_ROUTE_OPTIMIZATION_MS: u64 = 10_000;
pub const DEFAULT_STATUS_REPORT_MS: u64 = 30_000;
pub const DEFAULT_MAX_PROBE_HOPS: usize = 3;
pub const HANDSHAKE_TIMEOUT_SECS: u64 = 10;
pub const PUBLIC_IP_TIMEOUT_SECS: u64 = 4;
/// How long removal waits for a connection's tasks before aborting them
pub const TASK_JOIN_TIMEOUT_MS: u64 = 2_000;

/// Print the node banner
pub fn print_banner() {
    println!("╔════════════════════════════════════════════════════════════╗");
    println!("║                      MESH CORE NODE                        ║");
    println!("║   self-forming mesh • gossip discovery • route optimizer   ║");
    println!("╚════════════════════════════════════════════════════════════╝");
    println!("  version {}", VERSION);
    println!();
}
