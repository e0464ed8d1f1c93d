//! Canteen node daemon entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, warn};
use tokio::signal;
use tokio::sync::mpsc;

use canteen::api::{self, ApiState};
use canteen::cluster::Cluster;
use canteen::codec::CapacityCodec;
use canteen::config::Config;
use canteen::discovery;
use canteen::ledger::RpcLedger;
use canteen::runtime::{ContainerRuntime, DockerRuntime};
use canteen::scheduler::Scheduler;

/// Cluster node that advertises capacity in the ledger and runs assigned
/// container images.
#[derive(Parser, Debug)]
#[command(name = "canteen", version, about)]
struct Args {
    /// Advertised memory in GB, overriding the configured value
    #[arg(long)]
    memory: Option<u16>,

    /// P2P port, overriding the configured value
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    let mut cfg = Config::load()?;
    if let Some(memory_gb) = args.memory {
        cfg.memory_mb = memory_gb.saturating_mul(1024);
    }
    if let Some(port) = args.port {
        cfg.p2p_port = port;
    }
    info!("Starting Canteen node with config: {:?}", cfg);

    let codec = CapacityCodec::from_mode(cfg.capacity_codec, &cfg.cluster_secret);
    info!("Capacity codec: {}", codec.mode());

    // Transport first; the scheduler needs a finalized identity.
    let cluster = Cluster::start(cfg.p2p_port, cfg.secret_key_file.as_deref()).await?;

    let (candidate_tx, candidate_rx) = mpsc::channel(64);
    let discovery_handle = {
        let local_id = cluster.local_node_id();
        let p2p_port = cfg.p2p_port;
        let discovery_port = cfg.discovery_port;
        tokio::spawn(async move {
            if let Err(e) =
                discovery::run_discovery(local_id, p2p_port, discovery_port, candidate_tx).await
            {
                error!("Discovery failed: {:#}", e);
            }
        })
    };

    let cluster_handle = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            if let Err(e) = cluster.run(candidate_rx).await {
                error!("Cluster transport failed: {:#}", e);
            }
        })
    };

    // Ledger and runtime; an unresolvable account is a startup error.
    let ledger = Arc::new(
        RpcLedger::connect(&cfg.ledger_url, &cfg.contract_address, &cfg.account).await?,
    );
    info!("Connected to ledger at {}", cfg.ledger_url);

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerRuntime::connect()?);
    if let Err(e) = runtime.prune_exited().await {
        warn!("Could not prune exited containers: {:#}", e);
    }

    let scheduler = Arc::new(Scheduler::new(
        cluster.clone(),
        ledger,
        runtime,
        codec,
        cfg.memory_mb,
    ));
    // Retried by the poll loop when it fails.
    scheduler.register_self().await;
    cluster.set_scheduler(scheduler.clone());

    let api_handle = {
        let state = ApiState {
            scheduler: scheduler.clone(),
            cluster: cluster.clone(),
        };
        let addr = SocketAddr::from(([0, 0, 0, 0], cfg.api_port));
        tokio::spawn(api::serve(addr, state))
    };

    let poll_handle = {
        let scheduler = scheduler.clone();
        let interval = Duration::from_millis(cfg.poll_interval_ms);
        tokio::spawn(scheduler.poll_loop(interval))
    };

    info!("");
    info!("================================================================");
    info!("OPERATOR NODE READY - connect clients with:");
    info!("");
    info!("  canteenctl --node {} --addr <ip>:{} status", cluster.local_node_id(), cfg.p2p_port);
    for addr in cluster.direct_addresses() {
        info!("  listening on {}", addr);
    }
    info!("================================================================");
    info!("");

    match signal::ctrl_c().await {
        Ok(()) => info!("Received Ctrl+C, shutting down..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    scheduler.cleanup().await;

    discovery_handle.abort();
    cluster_handle.abort();
    api_handle.abort();
    poll_handle.abort();

    info!("Shutdown complete.");
    Ok(())
}
