//! envelope-node: replicates per-user envelope logs across a gossip network
//!
//! The daemon serves the peer protocol, pulls missing envelopes from a
//! random sample of peers, ingests locally dropped files, and keeps its
//! storage and peer list tidy. See the library crate for the pieces.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use envelope_node::ingest::InboundWatcher;
use envelope_node::janitor::GarbageCollector;
use envelope_node::peers::expiry::PeerExpiry;
use envelope_node::replication::{server, ApiState, ReplicationClient, HINT_CHANNEL_CAPACITY};
use envelope_node::status::StatusReporter;
use envelope_node::{Config, NodeContext, NodeState};

#[derive(Parser)]
#[command(name = "envelope-node")]
#[command(about = "Gossip node that replicates per-user envelope logs")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "envelope-node.toml")]
    config: String,

    /// Data directory
    #[arg(short, long, env = "ENVELOPE_DATA_DIR")]
    data_dir: Option<String>,

    /// Node ID (overrides config file)
    #[arg(long, env = "ENVELOPE_NODE_ID")]
    node_id: Option<String>,

    /// Listen host (overrides config file)
    #[arg(long, env = "ENVELOPE_HOST")]
    host: Option<String>,

    /// Listen port (overrides config file)
    #[arg(short, long, env = "ENVELOPE_PORT")]
    port: Option<u16>,

    /// Seed peers as host:port, comma separated
    #[arg(long, env = "ENVELOPE_SEEDS", value_delimiter = ',')]
    seeds: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("envelope_node=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    info!("Starting envelope-node");
    info!("Config file: {}", cli.config);

    let mut config = Config::load(std::path::Path::new(&cli.config))?;

    if let Some(node_id) = cli.node_id {
        config.node.id = node_id;
    }
    if let Some(data_dir) = cli.data_dir {
        config.node.data_dir = PathBuf::from(data_dir);
    }
    if let Some(host) = cli.host {
        config.node.host = host;
    }
    if let Some(port) = cli.port {
        config.node.port = port;
    }
    if !cli.seeds.is_empty() {
        config.peers.seeds = cli.seeds;
    }

    info!("Node ID: {}", config.node.id);
    info!("Listen: {}", config.self_address());
    info!("Data dir: {}", config.node.data_dir.display());

    let node = NodeContext::open(config).await?;
    let (hint_tx, hint_rx) = mpsc::channel(HINT_CHANNEL_CAPACITY);
    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let mut tasks = Vec::new();

    let client = Arc::new(ReplicationClient::new(node.clone())?);
    tasks.push(tokio::spawn(client.run(hint_rx, shutdown_tx.subscribe())));

    let watcher = InboundWatcher::new(node.clone(), hint_tx.clone());
    tasks.push(tokio::spawn(watcher.run(shutdown_tx.subscribe())));

    let gc = GarbageCollector::new(node.clone());
    tasks.push(tokio::spawn(gc.run(shutdown_tx.subscribe())));

    let expiry = PeerExpiry::new(
        node.peers.clone(),
        Duration::from_secs(node.config.peers.expiry_check_interval_secs),
        Duration::from_secs(node.config.peers.expiry_secs),
        node.config.peers.seeds.clone(),
    );
    tasks.push(tokio::spawn(expiry.run(shutdown_tx.subscribe())));

    let reporter = StatusReporter::new(node.clone())?;
    tasks.push(tokio::spawn(reporter.run(shutdown_tx.subscribe())));

    let listener = tokio::net::TcpListener::bind(node.self_address()).await?;
    node.set_state(NodeState::Ready).await;

    let state = ApiState {
        node: node.clone(),
        hints: hint_tx,
    };
    let served = server::serve(listener, state, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
        }
        info!("Shutdown signal received");
    })
    .await;

    node.set_state(NodeState::Stopping).await;
    let _ = shutdown_tx.send(());
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    served?;
    info!("envelope-node stopped");
    Ok(())
}
