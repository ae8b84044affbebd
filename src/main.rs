use mesh_core::overlay::{parse_seeds, BootstrapManager};
use mesh_core::{api, constants, ConsoleHandler, MeshConfig, MeshError, MeshNode};
use std::sync::Arc;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    constants::print_banner();

    let args: Vec<String> = std::env::args().collect();
    if matches!(args.get(1).map(|s| s.as_str()), Some("help" | "--help" | "-h")) {
        print_usage();
        return;
    }

    if let Err(e) = run(&args).await {
        log::error!("❌ {}", e);
        std::process::exit(1);
    }
}

fn print_usage() {
    println!("Usage: mesh-node [name] [port]");
    println!();
    println!("  name   node name, unique in the mesh (MESH_NAME)");
    println!("  port   first port to listen on (MESH_PORT, default {})", constants::DEFAULT_PORT);
    println!();
    println!("  MESH_SEEDS=host:port,...   peers to join through");
    println!("  MESH_API_ADDR=ip:port      enable the HTTP status/control API");
    println!("  RUST_LOG=debug             verbose logging");
}

async fn run(args: &[String]) -> mesh_core::Result<()> {
    let mut config = MeshConfig::from_env()?;
    if let Some(name) = args.get(1) {
        config.name = name.clone();
    }
    if let Some(port) = args.get(2) {
        config.listen_port = port
            .parse()
            .map_err(|_| MeshError::Config(format!("invalid port {:?}", port)))?;
    }

    let node = MeshNode::start(config).await?;
    node.register_handler(Arc::new(ConsoleHandler)).await;

    let seeds = parse_seeds(&node.config.seeds);
    if !seeds.is_empty() {
        let mut bootstrap = BootstrapManager::new(seeds);
        let connected = bootstrap.bootstrap(&node).await;
        log::info!("[{}] 🌱 {} seed(s) connected", node.name(), connected);
    }

    if let Some(addr) = node.config.api_addr {
        let api_node = Arc::clone(&node);
        tokio::spawn(async move {
            if let Err(e) = api::serve(api_node, addr).await {
                log::error!("❌ API server stopped: {}", e);
            }
        });
    }

    println!("{}", node.status().await);

    tokio::signal::ctrl_c().await?;
    node.shutdown().await;
    Ok(())
}
