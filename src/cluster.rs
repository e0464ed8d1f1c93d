//! Peer transport: owns the network identity, accepts deployment streams,
//! dials discovered peers and tracks live connections.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::path::Path;
use std::sync::{Arc, OnceLock, RwLock};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use iroh::endpoint::{Connection, Incoming, RecvStream, SendStream};
use iroh::key::SecretKey;
use iroh::{Endpoint, NodeAddr, NodeId, RelayMode};
use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::discovery::PeerCandidate;
use crate::protocol::{
    self, DeployResponse, Reply, Request, StatusResponse, DEPLOYMENT_ALPN, MAX_REQUEST_LEN,
};
use crate::scheduler::Scheduler;

/// Bound on how long a peer may take to deliver a full request frame. The
/// frames themselves are size-bounded; this keeps a stalled sender from
/// holding a handler open indefinitely.
pub const STREAM_READ_TIMEOUT: Duration = Duration::from_secs(10);
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-only view of the transport handed to the scheduler and the HTTP
/// surface. Connectivity is local truth, distinct from ledger membership.
pub trait ClusterView: Send + Sync {
    fn local_id(&self) -> String;
    fn connected_peers(&self) -> Vec<String>;
}

pub struct Cluster {
    endpoint: Endpoint,
    node_id: NodeId,
    direct_addrs: Vec<SocketAddr>,
    conns: RwLock<HashMap<NodeId, Connection>>,
    /// Set exactly once after the scheduler exists; dispatch before that
    /// answers with a deterministic failure response.
    scheduler: OnceLock<Arc<Scheduler>>,
}

impl Cluster {
    /// Bind the endpoint and wait until the identity and listen addresses
    /// are final. Once this returns the node is dialable, `local_id` is
    /// stable, and the scheduler may be constructed.
    pub async fn start(p2p_port: u16, secret_key_file: Option<&Path>) -> Result<Arc<Self>> {
        let secret_key = load_or_generate_secret(secret_key_file)?;
        let endpoint = Endpoint::builder()
            .secret_key(secret_key)
            .alpns(vec![DEPLOYMENT_ALPN.to_vec()])
            .relay_mode(RelayMode::Disabled)
            .bind_addr_v4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, p2p_port))
            .bind()
            .await?;
        let node_id = endpoint.node_id();
        let addr = endpoint.node_addr().await?;
        let direct_addrs: Vec<SocketAddr> = addr.info.direct_addresses.iter().copied().collect();
        info!("Cluster endpoint ready with id {}", node_id);
        Ok(Arc::new(Self {
            endpoint,
            node_id,
            direct_addrs,
            conns: RwLock::new(HashMap::new()),
            scheduler: OnceLock::new(),
        }))
    }

    pub fn local_node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn direct_addresses(&self) -> &[SocketAddr] {
        &self.direct_addrs
    }

    /// Wire the scheduler in after two-phase startup.
    pub fn set_scheduler(&self, scheduler: Arc<Scheduler>) {
        if self.scheduler.set(scheduler).is_err() {
            warn!("Scheduler reference was already set");
        }
    }

    /// Accept inbound connections and dial discovered peers until cancelled.
    pub async fn run(self: Arc<Self>, mut candidate_rx: mpsc::Receiver<PeerCandidate>) -> Result<()> {
        let dialer = self.clone();
        let dial_task = tokio::spawn(async move {
            while let Some(candidate) = candidate_rx.recv().await {
                let dialer = dialer.clone();
                tokio::spawn(async move { dialer.dial(candidate).await });
            }
        });

        while let Some(incoming) = self.endpoint.accept().await {
            let cluster = self.clone();
            tokio::spawn(async move {
                if let Err(e) = cluster.handle_incoming(incoming).await {
                    warn!("Inbound connection failed: {:#}", e);
                }
            });
        }

        dial_task.abort();
        Ok(())
    }

    /// Dial a discovered peer. Failures are logged and non-fatal; the peer
    /// stays known and the next beacon retries it.
    async fn dial(self: Arc<Self>, candidate: PeerCandidate) {
        if candidate.node_id == self.node_id {
            return;
        }
        if self.conns.read().unwrap().contains_key(&candidate.node_id) {
            return;
        }
        debug!("Dialing peer {} at {}", candidate.node_id, candidate.addr);
        let addr = NodeAddr::new(candidate.node_id).with_direct_addresses([candidate.addr]);
        match timeout(DIAL_TIMEOUT, self.endpoint.connect(addr, DEPLOYMENT_ALPN)).await {
            Ok(Ok(conn)) => {
                info!("Connected to peer {}", candidate.node_id);
                self.clone().track(candidate.node_id, conn);
            }
            Ok(Err(e)) => debug!("Could not connect to {}: {:#}", candidate.node_id, e),
            Err(_) => debug!("Connection attempt to {} timed out", candidate.node_id),
        }
    }

    async fn handle_incoming(self: Arc<Self>, incoming: Incoming) -> Result<()> {
        let connecting = incoming.accept()?;
        let conn = connecting.await?;
        let remote = iroh::endpoint::get_remote_node_id(&conn)?;
        info!("Accepted connection from peer {}", remote);
        self.track(remote, conn);
        Ok(())
    }

    /// Register a live connection and serve its streams until it closes.
    /// The table reflects disconnects as soon as the connection ends.
    fn track(self: Arc<Self>, peer: NodeId, conn: Connection) {
        self.conns.write().unwrap().insert(peer, conn.clone());
        let cluster = self.clone();
        tokio::spawn(async move {
            loop {
                match conn.accept_bi().await {
                    Ok((send, recv)) => {
                        let cluster = cluster.clone();
                        tokio::spawn(async move { cluster.serve_stream(send, recv).await });
                    }
                    Err(e) => {
                        debug!("Connection with {} ended: {}", peer, e);
                        break;
                    }
                }
            }
            let mut table = cluster.conns.write().unwrap();
            // A reconnect may have replaced the entry in the meantime.
            if table.get(&peer).map(Connection::stable_id) == Some(conn.stable_id()) {
                table.remove(&peer);
            }
        });
    }

    /// One framed request/response exchange. Every failure past the empty
    /// stream produces a best-effort failure reply before closing.
    async fn serve_stream(self: Arc<Self>, mut send: SendStream, mut recv: RecvStream) {
        let payload = match timeout(
            STREAM_READ_TIMEOUT,
            protocol::read_frame(&mut recv, MAX_REQUEST_LEN),
        )
        .await
        {
            Ok(Ok(Some(payload))) => payload,
            Ok(Ok(None)) => {
                debug!("Peer closed the stream before sending a request");
                return;
            }
            Ok(Err(e)) => {
                warn!("Bad request frame: {}", e);
                send_failure(&mut send, "Invalid request", &e.to_string()).await;
                return;
            }
            Err(_) => {
                warn!("Timed out reading request frame");
                send_failure(&mut send, "Request timed out", "read timed out").await;
                return;
            }
        };

        let reply = match serde_json::from_slice::<Request>(&payload) {
            Ok(request) => self.dispatch(request).await,
            Err(e) => {
                warn!("Undecodable request: {}", e);
                Reply::Deploy(DeployResponse::failure("Invalid request", &e.to_string()))
            }
        };

        if let Err(e) = write_reply(&mut send, &reply).await {
            warn!("Failed to send response: {:#}", e);
            let fallback = reply.failure_like("Internal error", &e.to_string());
            if write_reply(&mut send, &fallback).await.is_err() {
                debug!("Could not deliver failure response, closing stream");
            }
        }
    }

    /// Route a decoded request to the scheduler. The discriminant was read
    /// during decoding; each variant has exactly one handling path.
    async fn dispatch(&self, request: Request) -> Reply {
        let scheduler = self.scheduler.get();
        match request {
            Request::Deploy { image, replicas } => Reply::Deploy(match scheduler {
                Some(scheduler) => scheduler.handle_deploy(&image, replicas).await,
                None => DeployResponse::failure(
                    "Scheduler not available",
                    "no scheduler configured",
                ),
            }),
            Request::Undeploy { image, .. } => Reply::Deploy(match scheduler {
                Some(scheduler) => scheduler.handle_undeploy(&image).await,
                None => DeployResponse::failure(
                    "Scheduler not available",
                    "no scheduler configured",
                ),
            }),
            Request::Status => Reply::Status(match scheduler {
                Some(scheduler) => scheduler.handle_status().await,
                None => StatusResponse::failure("no scheduler configured"),
            }),
        }
    }
}

impl ClusterView for Cluster {
    fn local_id(&self) -> String {
        self.node_id.to_string()
    }

    fn connected_peers(&self) -> Vec<String> {
        self.conns
            .read()
            .unwrap()
            .keys()
            .map(NodeId::to_string)
            .collect()
    }
}

async fn write_reply(send: &mut SendStream, reply: &Reply) -> Result<()> {
    let frame = reply.to_frame()?;
    send.write_all(&frame).await?;
    send.finish()?;
    Ok(())
}

async fn send_failure(send: &mut SendStream, message: &str, error: &str) {
    let reply = Reply::Deploy(DeployResponse::failure(message, error));
    if write_reply(send, &reply).await.is_err() {
        debug!("Could not deliver failure response, closing stream");
    }
}

fn load_or_generate_secret(path: Option<&Path>) -> Result<SecretKey> {
    let Some(path) = path else {
        return Ok(SecretKey::generate());
    };
    if path.exists() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read secret key file {}", path.display()))?;
        let bytes: [u8; 32] = hex::decode(text.trim())
            .context("secret key file is not valid hex")?
            .try_into()
            .map_err(|_| anyhow!("secret key file must hold exactly 32 bytes"))?;
        Ok(SecretKey::from_bytes(&bytes))
    } else {
        let key = SecretKey::generate();
        std::fs::write(path, hex::encode(key.to_bytes()))
            .with_context(|| format!("failed to write secret key file {}", path.display()))?;
        info!("Generated node identity, saved to {}", path.display());
        Ok(key)
    }
}
