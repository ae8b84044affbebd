//! Mesh Core: a self-forming peer-to-peer mesh node.
//!
//! Nodes accept and dial TCP connections, exchange length-prefixed JSON
//! messages, learn neighbors-of-neighbors through gossip, measure link
//! latency with a heartbeat and keep, for every peer, the cheapest path
//! they have proven through route-optimization probes.
//!
//! ```no_run
//! use mesh_core::{MeshConfig, MeshNode};
//!
//! # async fn run() -> mesh_core::Result<()> {
//! let node = MeshNode::start(MeshConfig::new("alpha", 10010)).await?;
//! node.connect_to("10.0.0.2", 10010).await;
//! node.broadcast("test", serde_json::json!("hello")).await;
//! node.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod config;
pub mod connection;
pub mod constants;
pub mod discovery;
pub mod error;
pub mod handler;
pub mod heartbeat;
pub mod network;
pub mod optimizer;
pub mod overlay;
pub mod p2p;
pub mod router;
pub mod routing;
pub mod table;

pub use config::MeshConfig;
pub use error::{MeshError, Result};
pub use handler::{ConsoleHandler, MeshHandle, MessageHandler, Reply};
pub use network::Message;
pub use p2p::MeshNode;
pub use routing::RouteEntry;
