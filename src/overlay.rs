// -----------------------------------------------------------------------------
// Seed bootstrap
// -----------------------------------------------------------------------------
//
// A node joins the mesh by dialling the seeds it was configured with. Once
// one seed is connected, gossip takes care of the rest of the topology.
// -----------------------------------------------------------------------------

use crate::config::parse_seed;
use crate::p2p::MeshNode;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq)]
pub struct SeedNode {
    pub host: String,
    pub port: u16,
}

impl SeedNode {
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parse `host:port` seed entries; malformed ones are logged and skipped.
pub fn parse_seeds(raw: &[String]) -> Vec<SeedNode> {
    let mut out = Vec::new();
    for item in raw {
        match parse_seed(item) {
            Ok((host, port)) => out.push(SeedNode { host, port }),
            Err(e) => log::warn!("Seed entry ignored: {}", e),
        }
    }
    out
}

pub struct BootstrapManager {
    pub seeds: Vec<SeedNode>,
    pub connected_seeds: Vec<String>,
    pub bootstrap_complete: bool,
}

impl BootstrapManager {
    pub fn new(seeds: Vec<SeedNode>) -> Self {
        BootstrapManager {
            seeds,
            connected_seeds: vec![],
            bootstrap_complete: false,
        }
    }

    /// Dial every seed once. Returns how many answered.
    pub async fn bootstrap(&mut self, node: &Arc<MeshNode>) -> usize {
        let mut connected = 0;

        for seed in &self.seeds {
            log::info!("[{}] 🌱 Bootstrap: connect seed {}", node.name(), seed.address());

            match node.dial(&seed.host, seed.port).await {
                Ok(peer) => {
                    log::info!("[{}] ✅ Bootstrap: connected to [{}]", node.name(), peer);
                    self.connected_seeds.push(peer);
                    connected += 1;
                }
                Err(e) => {
                    log::warn!("[{}] ⚠️ Bootstrap: {} failed: {}", node.name(), seed.address(), e);
                }
            }
        }

        self.bootstrap_complete = connected > 0;
        connected
    }
}
