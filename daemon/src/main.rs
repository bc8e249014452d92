//! Strand daemon — entry point for running a Strand node.

use std::net::Ipv6Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use strand_node::bootstrap::connections::BootstrapConnections;
use strand_node::{Node, NodeConfig, PeerService};
use strand_types::endpoint::parse_endpoint;
use strand_types::{Endpoint, HashOrAccount, NetworkId};

#[derive(Parser)]
#[command(name = "strand-daemon", about = "Strand protocol node daemon")]
struct Cli {
    /// Network to connect to: "live", "test", or "dev".
    #[arg(long, env = "STRAND_NETWORK")]
    network: Option<String>,

    /// Data directory for ledger storage.
    #[arg(long, default_value = "./strand_data", env = "STRAND_DATA_DIR")]
    data_dir: PathBuf,

    /// Port for P2P connections (defaults to the network default).
    #[arg(long, env = "STRAND_P2P_PORT")]
    port: Option<u16>,

    /// Maximum number of peer channels.
    #[arg(long, env = "STRAND_MAX_PEERS")]
    max_peers: Option<usize>,

    /// Accept peers from private address ranges.
    #[arg(long, env = "STRAND_ALLOW_PRIVATE")]
    allow_private: bool,

    /// Peers to dial on startup (comma-separated `<address>:<port>`).
    #[arg(long, env = "STRAND_PEERS", value_delimiter = ',')]
    peers: Vec<String>,

    /// Start a lazy bootstrap from this block hash after startup.
    #[arg(long, env = "STRAND_BOOTSTRAP_FROM")]
    bootstrap_from: Option<String>,

    /// Path to a TOML configuration file. File settings are the base;
    /// CLI flags and env vars override them.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn parse_network(s: &str) -> NetworkId {
    match s.to_lowercase().as_str() {
        "live" => NetworkId::Live,
        "test" => NetworkId::Test,
        _ => NetworkId::Dev,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    strand_utils::logging::init_tracing();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => NodeConfig::from_toml_file(path)?,
        None => NodeConfig::default(),
    };
    if let Some(network) = &cli.network {
        config.network = parse_network(network);
    }
    config.data_dir = cli.data_dir;
    if let Some(port) = cli.port {
        config.port = port;
    }
    if config.port == 0 {
        config.port = config.network.default_port();
    }
    if let Some(max_peers) = cli.max_peers {
        config.max_peers = max_peers;
    }
    if cli.allow_private {
        config.allow_private_addresses = true;
    }
    if !cli.peers.is_empty() {
        config.bootstrap_peers = cli.peers.clone();
    }

    let peers: Vec<Endpoint> = config
        .bootstrap_peers
        .iter()
        .map(|s| parse_endpoint(s).map_err(|e| anyhow::anyhow!("bad peer address {s}: {e}")))
        .collect::<Result<_, _>>()?;

    let endpoint = Endpoint::new(Ipv6Addr::UNSPECIFIED, config.port);
    tracing::info!(
        network = config.network.as_str(),
        port = config.port,
        data_dir = %config.data_dir.display(),
        "starting strand node"
    );
    let network = config.network;
    let node = Arc::new(Node::new(config, endpoint)?);
    let service = PeerService::start(Arc::clone(&node)).await?;

    // Open handshakes with the configured peers.
    for peer in &peers {
        if let Err(e) = service.connect(&node, *peer) {
            tracing::warn!(%peer, "failed to dial peer: {e}");
        }
    }

    if let Some(seed) = &cli.bootstrap_from {
        let hash = strand_types::Account::decode_hex(seed)
            .map_err(|e| anyhow::anyhow!("invalid bootstrap hash: {e}"))?;
        let attempt = node.bootstrap_lazy(HashOrAccount::from(hash), true);
        let pool = BootstrapConnections::new(
            peers.iter().map(|p| p.to_socket_addr()).collect(),
            network,
            Duration::from_secs(10),
        );
        std::thread::spawn(move || {
            if let Err(e) = attempt.run(&pool) {
                tracing::warn!("lazy bootstrap attempt failed: {e}");
            }
        });
    }

    let telemetry = node.telemetry()?;
    tracing::info!(
        blocks = telemetry.block_count,
        accounts = telemetry.account_count,
        "ledger loaded"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    node.message_ring.stop();
    node.block_processor.stop();
    Ok(())
}
