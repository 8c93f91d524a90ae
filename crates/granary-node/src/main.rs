//! granary-node: the storage peer daemon.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::sync::broadcast;
use tracing::info;

use granary_chunkstore::ChunkStore;
use granary_node::client::CoordinatorClient;
use granary_node::config::NodeConfig;
use granary_node::identity::NodeIdentity;
use granary_node::responder::Responder;
use granary_node::{heartbeat, NodeError};
use granary_transport::quic::{QuicConfig, QuicNode};

#[derive(Parser)]
#[command(name = "granary-node", about = "granary storage peer")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "node.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate an identity, register with the coordinator, write config.
    Init {
        /// Operator-chosen node name.
        #[arg(long)]
        name: String,
        /// Coordinator control-surface URL.
        #[arg(long, default_value = "http://127.0.0.1:8080")]
        coordinator_url: String,
        /// Capacity offered to the network, in GiB.
        #[arg(long, default_value_t = 100)]
        capacity_gib: u64,
        /// QUIC listen address, also advertised to the coordinator.
        #[arg(long, default_value = "127.0.0.1:4533")]
        listen_addr: String,
        /// Data directory for key, index, and chunks.
        #[arg(long, default_value = "data")]
        data_dir: String,
    },
    /// Run the storage daemon.
    Start,
    /// Inspect stored chunks.
    Chunks {
        #[command(subcommand)]
        command: ChunksCommand,
    },
    /// Stop accepting new chunks (or return to service with --resume).
    Drain {
        #[arg(long)]
        resume: bool,
    },
}

#[derive(Subcommand)]
enum ChunksCommand {
    /// Print the chunk inventory.
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("granary=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Init {
            name,
            coordinator_url,
            capacity_gib,
            listen_addr,
            data_dir,
        } => init(&cli.config, name, coordinator_url, capacity_gib, listen_addr, data_dir).await,
        Command::Start => start(&cli.config).await,
        Command::Chunks {
            command: ChunksCommand::List,
        } => chunks_list(&cli.config),
        Command::Drain { resume } => drain(&cli.config, resume).await,
    }
}

async fn init(
    config_path: &PathBuf,
    name: String,
    coordinator_url: String,
    capacity_gib: u64,
    listen_addr: String,
    data_dir: String,
) -> anyhow::Result<()> {
    let mut config = NodeConfig::default();
    config.node.name = name;
    config.node.data_dir = data_dir;
    config.node.declared_capacity_gib = capacity_gib;
    config.coordinator.url = coordinator_url;
    config.p2p.listen_addr = listen_addr;

    std::fs::create_dir_all(config.data_dir())?;
    std::fs::create_dir_all(config.chunk_dir())?;

    let identity = NodeIdentity::generate();
    identity.save(&config.key_path())?;
    info!(peer_id = %identity.peer_id(), "identity generated");

    let client = CoordinatorClient::new(config.coordinator.url.clone())?;
    let reply = client
        .register(
            &identity.peer_id(),
            &identity.pubkey(),
            &config.p2p.listen_addr,
            config.declared_capacity_bytes(),
        )
        .await?;

    config.coordinator.peer_id = reply.peer_id.clone();
    config.coordinator.credential = reply.credential.clone();
    config.save(config_path)?;

    println!("Storage node initialized.");
    println!("  peer id:    {}", reply.peer_id);
    println!("  credential: {} (shown once, stored in config)", reply.credential);
    println!("  config:     {}", config_path.display());
    Ok(())
}

async fn start(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = NodeConfig::load(config_path)?;
    if config.coordinator.credential.is_empty() {
        return Err(NodeError::Config("node is not initialized; run `init` first".into()).into());
    }

    let identity = NodeIdentity::load(&config.key_path())?;
    let store = Arc::new(ChunkStore::open(&config.chunk_dir())?);
    info!(
        peer_id = %identity.peer_id(),
        chunks = store.count()?,
        used_bytes = store.total_bytes()?,
        "chunk store opened"
    );

    let node = Arc::new(QuicNode::bind(QuicConfig {
        bind_addr: config.p2p.listen_addr.parse()?,
        ..QuicConfig::default()
    })?);
    info!(addr = %node.local_addr(), "peer transport listening");

    let (shutdown_tx, _) = broadcast::channel(1);
    let draining = Arc::new(AtomicBool::new(false));

    let responder = Responder::new(node.clone(), store.clone(), draining.clone());
    tokio::spawn(responder.run(shutdown_tx.subscribe()));

    let client = CoordinatorClient::new(config.coordinator.url.clone())?;
    tokio::spawn(heartbeat::run(
        client,
        config.coordinator.peer_id.clone(),
        config.coordinator.credential.clone(),
        config.p2p.listen_addr.clone(),
        store,
        draining,
        Duration::from_secs(config.coordinator.heartbeat_period_secs),
        shutdown_tx.subscribe(),
    ));

    tokio::signal::ctrl_c().await?;
    info!("ctrl-c received, shutting down");
    let _ = shutdown_tx.send(());
    node.close(0, b"node shutting down");
    Ok(())
}

fn chunks_list(config_path: &PathBuf) -> anyhow::Result<()> {
    let config = NodeConfig::load(config_path)?;
    let store = ChunkStore::open(&config.chunk_dir())?;

    let rows = store.list()?;
    println!(
        "Stored chunks ({} total, {} bytes used):",
        store.count()?,
        store.total_bytes()?
    );
    println!("{:<36}  {:<36}  {:>5}  {:>10}", "CHUNK ID", "FILE ID", "INDEX", "SIZE");
    for row in rows {
        println!(
            "{:<36}  {:<36}  {:>5}  {:>10}",
            row.chunk_id, row.file_id, row.chunk_index, row.ciphertext_size_bytes
        );
    }
    Ok(())
}

async fn drain(config_path: &PathBuf, resume: bool) -> anyhow::Result<()> {
    let config = NodeConfig::load(config_path)?;
    let client = CoordinatorClient::new(config.coordinator.url.clone())?;

    if resume {
        client.resume(&config.coordinator.peer_id).await?;
        println!("Node returned to service.");
    } else {
        client.drain(&config.coordinator.peer_id).await?;
        println!("Node set to draining; it will accept no new chunks.");
    }
    Ok(())
}
