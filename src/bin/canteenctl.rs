//! P2P client for issuing deployment commands to a Canteen operator node.
//! Results are printed as JSON on stdout.

use std::net::SocketAddr;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use iroh::{Endpoint, NodeAddr, NodeId, RelayMode};
use log::info;

use canteen::protocol::{
    self, DeployResponse, Request, StatusResponse, DEPLOYMENT_ALPN, MAX_DEPLOY_RESPONSE_LEN,
    MAX_STATUS_RESPONSE_LEN,
};

/// Deploy container images to Canteen operator nodes.
#[derive(Parser, Debug)]
#[command(name = "canteenctl", version, about)]
struct Args {
    /// Operator node id, printed in the operator's startup banner
    #[arg(long)]
    node: NodeId,

    /// Operator socket address, repeatable
    #[arg(long, required = true)]
    addr: Vec<SocketAddr>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deploy an image across the cluster
    Deploy {
        image: String,
        /// Number of replicas to run
        #[arg(long, default_value_t = 1)]
        replicas: u32,
    },
    /// Show cluster status
    Status,
    /// Remove a deployment
    Remove { image: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let endpoint = Endpoint::builder()
        .relay_mode(RelayMode::Disabled)
        .bind()
        .await?;
    let target = NodeAddr::new(args.node).with_direct_addresses(args.addr.clone());

    let result = match args.command {
        Command::Deploy { image, replicas } => {
            info!("Deploying {} with {} replica(s)...", image, replicas);
            let request = Request::Deploy {
                image: image.clone(),
                replicas,
            };
            let response: DeployResponse =
                exchange(&endpoint, target, &request, MAX_DEPLOY_RESPONSE_LEN).await?;
            serde_json::json!({
                "success": response.success,
                "image": response.image,
                "replicas": response.replicas,
                "message": response.message,
                "error": response.error,
            })
        }
        Command::Remove { image } => {
            info!("Removing deployment: {}", image);
            let request = Request::Undeploy {
                image: image.clone(),
                replicas: 0,
            };
            let response: DeployResponse =
                exchange(&endpoint, target, &request, MAX_DEPLOY_RESPONSE_LEN).await?;
            serde_json::json!({
                "success": response.success,
                "image": image,
                "message": response.message,
                "error": response.error,
            })
        }
        Command::Status => {
            info!("Getting cluster status...");
            let response: StatusResponse =
                exchange(&endpoint, target, &Request::Status, MAX_STATUS_RESPONSE_LEN).await?;
            serde_json::json!({
                "success": response.success,
                "total_members": response.total_members,
                "connected_count": response.connected_count,
                "members": response.members,
                "error": response.error,
            })
        }
    };

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

/// One framed request/response exchange with the operator.
async fn exchange<T: serde::de::DeserializeOwned>(
    endpoint: &Endpoint,
    target: NodeAddr,
    request: &Request,
    max_response: usize,
) -> Result<T> {
    let conn = endpoint
        .connect(target, DEPLOYMENT_ALPN)
        .await
        .context("could not connect to operator")?;
    let (mut send, mut recv) = conn.open_bi().await?;

    send.write_all(&request.to_frame()?).await?;
    send.finish()?;

    let payload = protocol::read_frame(&mut recv, max_response)
        .await?
        .ok_or_else(|| anyhow!("no response from operator"))?;
    conn.close(0u32.into(), b"done");

    serde_json::from_slice(&payload).context("operator sent an undecodable response")
}
