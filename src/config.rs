// -----------------------------------------------------------------------------
// MeshConfig: node configuration
// -----------------------------------------------------------------------------
//
// Everything is read from MESH_* environment variables, falling back to the
// defaults in constants.rs. Durations are given in milliseconds.
//
//   MESH_NAME                   node name (unique in the mesh)
//   MESH_LISTEN_ADDR            bind address, default 0.0.0.0
//   MESH_PORT                   first port to try, default 10010
//   MESH_ADVERTISE_ADDR         address sent in the handshake
//   MESH_PUBLIC_IP_URL          plain-text "what is my ip" endpoint
//   MESH_SEEDS                  host:port,host:port
//   MESH_API_ADDR               status/control API, disabled when unset
//   MESH_HEARTBEAT_MS / MESH_TIMEOUT_MS
//   MESH_PING_UPDATE_RATE / MESH_PING_DUMP_RATE
//   MESH_UPDATE_NETWORK_MS / MESH_ROUTE_OPTIMIZATION_MS
//   MESH_MAX_PROBE_HOPS / MESH_STATUS_MS
// -----------------------------------------------------------------------------

use crate::constants::*;
use crate::error::{MeshError, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct MeshConfig {
    pub name: String,
    pub listen_addr: IpAddr,
    pub listen_port: u16,
    /// How many consecutive ports to try when `listen_port` is taken
    pub port_search_limit: u16,
    pub advertise_address: Option<String>,
    pub public_ip_url: Option<String>,
    pub seeds: Vec<String>,
    pub api_addr: Option<SocketAddr>,

    pub heartbeat_rate: Duration,
    pub connection_timeout: Duration,
    /// Recompute `currentPing` every N samples
    pub ping_update_rate: u64,
    /// Reset the ping accumulator every N samples
    pub ping_dump_rate: u64,
    pub update_network_rate: Duration,
    pub route_optimization_rate: Duration,
    /// Maximum number of hops an optimization probe may travel
    pub max_probe_hops: usize,
    pub status_report_rate: Duration,
    pub handshake_timeout: Duration,
}

impl MeshConfig {
    pub fn new(name: &str, port: u16) -> Self {
        MeshConfig {
            name: name.to_string(),
            listen_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            listen_port: port,
            port_search_limit: DEFAULT_PORT_SEARCH_LIMIT,
            advertise_address: None,
            public_ip_url: None,
            seeds: vec![],
            api_addr: None,
            heartbeat_rate: Duration::from_millis(DEFAULT_HEARTBEAT_MS),
            connection_timeout: Duration::from_millis(DEFAULT_CONNECTION_TIMEOUT_MS),
            ping_update_rate: DEFAULT_PING_UPDATE_RATE,
            ping_dump_rate: DEFAULT_PING_DUMP_RATE,
            update_network_rate: Duration::from_millis(DEFAULT_UPDATE_NETWORK_MS),
            route_optimization_rate: Duration::from_millis(DEFAULT_ROUTE_OPTIMIZATION_MS),
            max_probe_hops: DEFAULT_MAX_PROBE_HOPS,
            status_report_rate: Duration::from_millis(DEFAULT_STATUS_REPORT_MS),
            handshake_timeout: Duration::from_secs(HANDSHAKE_TIMEOUT_SECS),
        }
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from any key/value source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let name = get("MESH_NAME").unwrap_or_else(generated_name);
        let mut config = MeshConfig::new(&name, parse_or(&get, "MESH_PORT", DEFAULT_PORT)?);

        config.listen_addr = parse_or(&get, "MESH_LISTEN_ADDR", config.listen_addr)?;
        config.advertise_address = get("MESH_ADVERTISE_ADDR");
        config.public_ip_url = get("MESH_PUBLIC_IP_URL");
        config.seeds = get("MESH_SEEDS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        config.api_addr = match get("MESH_API_ADDR") {
            Some(raw) => Some(
                raw.parse()
                    .map_err(|_| MeshError::Config(format!("MESH_API_ADDR: invalid address {}", raw)))?,
            ),
            None => None,
        };

        config.heartbeat_rate = millis_or(&get, "MESH_HEARTBEAT_MS", config.heartbeat_rate)?;
        config.connection_timeout = millis_or(&get, "MESH_TIMEOUT_MS", config.connection_timeout)?;
        config.ping_update_rate = parse_or(&get, "MESH_PING_UPDATE_RATE", config.ping_update_rate)?;
        config.ping_dump_rate = parse_or(&get, "MESH_PING_DUMP_RATE", config.ping_dump_rate)?;
        config.update_network_rate =
            millis_or(&get, "MESH_UPDATE_NETWORK_MS", config.update_network_rate)?;
        config.route_optimization_rate =
            millis_or(&get, "MESH_ROUTE_OPTIMIZATION_MS", config.route_optimization_rate)?;
        config.max_probe_hops = parse_or(&get, "MESH_MAX_PROBE_HOPS", config.max_probe_hops)?;
        config.status_report_rate = millis_or(&get, "MESH_STATUS_MS", config.status_report_rate)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(MeshError::Config("node name must not be empty".into()));
        }
        if self.ping_update_rate == 0 || self.ping_dump_rate == 0 {
            return Err(MeshError::Config("ping rates must be at least 1".into()));
        }
        if self.max_probe_hops < 2 {
            return Err(MeshError::Config("MESH_MAX_PROBE_HOPS must be at least 2".into()));
        }
        if self.heartbeat_rate.is_zero()
            || self.update_network_rate.is_zero()
            || self.route_optimization_rate.is_zero()
            || self.status_report_rate.is_zero()
        {
            return Err(MeshError::Config("loop rates must be non-zero".into()));
        }
        Ok(())
    }
}

fn generated_name() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("node-{}", &id[..8])
}

fn parse_or<T, G>(get: &G, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        Some(raw) => raw
            .parse()
            .map_err(|_| MeshError::Config(format!("{}: cannot parse {:?}", key, raw))),
        None => Ok(default),
    }
}

fn millis_or<G>(get: &G, key: &str, default: Duration) -> Result<Duration>
where
    G: Fn(&str) -> Option<String>,
{
    let ms: u64 = parse_or(get, key, default.as_millis() as u64)?;
    Ok(Duration::from_millis(ms))
}

/// Split a `host:port` seed entry.
pub fn parse_seed(seed: &str) -> Result<(String, u16)> {
    let (host, port) = seed
        .trim()
        .rsplit_once(':')
        .ok_or_else(|| MeshError::Config(format!("seed {:?} is not host:port", seed)))?;
    let port = port
        .parse()
        .map_err(|_| MeshError::Config(format!("seed {:?} has an invalid port", seed)))?;
    if host.is_empty() {
        return Err(MeshError::Config(format!("seed {:?} has no host", seed)));
    }
    Ok((host.to_string(), port))
}

// -----------------------------------------------------------------------------
// Advertised address
// -----------------------------------------------------------------------------

/// Address this node puts in its handshake frame.
pub async fn resolve_advertise_address(config: &MeshConfig, bound: SocketAddr) -> String {
    if let Some(address) = &config.advertise_address {
        return address.clone();
    }

    if let Some(url) = &config.public_ip_url {
        match lookup_public_address(url).await {
            Ok(ip) => return ip.to_string(),
            Err(e) => log::warn!("[{}] Public address lookup failed: {}", config.name, e),
        }
    }

    if bound.ip().is_unspecified() {
        Ipv4Addr::LOCALHOST.to_string()
    } else {
        bound.ip().to_string()
    }
}

async fn lookup_public_address(url: &str) -> Result<IpAddr> {
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(PUBLIC_IP_TIMEOUT_SECS))
        .build()?;
    let body = client.get(url).send().await?.error_for_status()?.text().await?;
    body.trim()
        .parse()
        .map_err(|_| MeshError::Protocol(format!("{} did not return an IP address", url)))
}
