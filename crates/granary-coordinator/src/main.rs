//! granary-coordinator: the coordinator daemon.
//!
//! Single OS process on a Tokio runtime: the QUIC transport for peer
//! streams, the HTTP control surface, and the four background loops
//! (repairer, proof scheduler, economics evaluator, liveness sweeper),
//! all stopping cleanly on a shared shutdown signal.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info};

use granary_coordinator::config::CoordinatorConfig;
use granary_coordinator::distributor::{Distributor, DistributorConfig};
use granary_coordinator::economics::{EconomicsConfig, EconomicsEvaluator};
use granary_coordinator::files::FileService;
use granary_coordinator::http::{self, AppState};
use granary_coordinator::registry;
use granary_coordinator::repairer::Repairer;
use granary_coordinator::scheduler::ProofScheduler;
use granary_transport::quic::{QuicConfig, QuicNode};

#[derive(Parser)]
#[command(name = "granary-coordinator", about = "granary network coordinator")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "coordinator.toml")]
    config: PathBuf,
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
    let config = CoordinatorConfig::load(&cli.config)?;
    let options = config.storage.clone();

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    let db_path = config.database_path();
    info!(path = %db_path.display(), "opening metadata store");
    let conn = granary_db::open(&db_path)?;
    let db: granary_coordinator::Db = Arc::new(tokio::sync::Mutex::new(conn));

    let node = Arc::new(QuicNode::bind(QuicConfig {
        bind_addr: config.p2p.bind_addr.parse()?,
        ..QuicConfig::default()
    })?);
    info!(addr = %node.local_addr(), "peer transport listening");

    let (shutdown_tx, _) = broadcast::channel(1);
    let (repair_tx, repair_rx) = mpsc::unbounded_channel();

    let distributor = Arc::new(Distributor::new(
        db.clone(),
        node.clone(),
        DistributorConfig {
            replicas: options.desired_replicas,
            ..DistributorConfig::default()
        },
        repair_tx,
    ));
    let files = Arc::new(FileService::new(
        db.clone(),
        node.clone(),
        distributor.clone(),
        options.clone(),
    ));

    let repairer = Repairer::new(db.clone(), node.clone(), distributor.clone(), options.clone());
    tokio::spawn(repairer.run(repair_rx, shutdown_tx.subscribe()));

    let scheduler = ProofScheduler::new(db.clone(), node.clone(), options.clone());
    tokio::spawn(scheduler.run(shutdown_tx.subscribe()));

    let evaluator = EconomicsEvaluator::new(
        db.clone(),
        EconomicsConfig {
            storage_credit_per_gib_month: options.storage_credit_per_gib_month,
            heartbeat_period_secs: options.heartbeat_period_secs,
        },
    );
    tokio::spawn(evaluator.run(shutdown_tx.subscribe()));

    tokio::spawn(registry::run_sweeper(
        db.clone(),
        options.heartbeat_period_secs,
        options.liveness_window_secs(),
        shutdown_tx.subscribe(),
    ));

    let state = Arc::new(AppState { db, files });
    let listener = tokio::net::TcpListener::bind(&config.server.bind_addr).await?;
    info!(addr = %config.server.bind_addr, "control surface listening");

    let mut http_shutdown = shutdown_tx.subscribe();
    let server = axum::serve(listener, http::router(state)).with_graceful_shutdown(async move {
        let _ = http_shutdown.recv().await;
    });

    tokio::select! {
        result = server => {
            if let Err(e) = result {
                error!(error = %e, "control surface failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down");
        }
    }

    let _ = shutdown_tx.send(());
    node.close(0, b"coordinator shutting down");
    info!("coordinator stopped");
    Ok(())
}
