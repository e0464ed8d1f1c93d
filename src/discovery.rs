//! LAN discovery: UDP multicast beacons announcing the local endpoint, no
//! central directory. Receivers hand dialable candidates to the cluster
//! over a bounded channel; no connection work happens on the socket task.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use iroh::NodeId;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 72, 85);
const BEACON_INTERVAL: Duration = Duration::from_secs(4);

/// A peer seen on the local network, ready to be dialed.
#[derive(Debug, Clone)]
pub struct PeerCandidate {
    pub node_id: NodeId,
    pub addr: SocketAddr,
}

/// Datagram payload. Announcements go to the multicast group; replies go
/// back unicast so a freshly started node learns its neighbours without
/// waiting a full beacon interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum BeaconMessage {
    Announce { node_id: String, port: u16 },
    Reply { node_id: String, port: u16 },
}

/// Run the discovery subsystem until cancelled.
pub async fn run_discovery(
    local_id: NodeId,
    p2p_port: u16,
    discovery_port: u16,
    candidate_tx: mpsc::Sender<PeerCandidate>,
) -> anyhow::Result<()> {
    let socket = Arc::new(make_multicast_socket(discovery_port)?);
    let dest = SocketAddr::from((MULTICAST_GROUP, discovery_port));
    let announce = serde_json::to_vec(&BeaconMessage::Announce {
        node_id: local_id.to_string(),
        port: p2p_port,
    })?;

    let beacon_socket = socket.clone();
    let beacon_task = tokio::spawn(async move {
        loop {
            if let Err(e) = beacon_socket.send_to(&announce, dest).await {
                debug!("Beacon send failed: {}", e);
            }
            tokio::time::sleep(BEACON_INTERVAL).await;
        }
    });
    let recv_task = tokio::spawn(recv_loop(socket, local_id, p2p_port, candidate_tx));

    let _ = tokio::try_join!(beacon_task, recv_task);
    Ok(())
}

fn make_multicast_socket(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind(("0.0.0.0", discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    local_id: NodeId,
    p2p_port: u16,
    candidate_tx: mpsc::Sender<PeerCandidate>,
) -> std::io::Result<()> {
    let reply = serde_json::to_vec(&BeaconMessage::Reply {
        node_id: local_id.to_string(),
        port: p2p_port,
    })
    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

    let mut buf = vec![0u8; 2048];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await?;
        let message: BeaconMessage = match serde_json::from_slice(&buf[..n]) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring malformed beacon from {}: {}", from, e);
                continue;
            }
        };
        let (peer, port, wants_reply) = match message {
            BeaconMessage::Announce { node_id, port } => (node_id, port, true),
            BeaconMessage::Reply { node_id, port } => (node_id, port, false),
        };
        let node_id: NodeId = match peer.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!("Beacon from {} carries an invalid node id: {}", from, e);
                continue;
            }
        };
        if node_id == local_id {
            continue;
        }
        let candidate = PeerCandidate {
            node_id,
            addr: SocketAddr::new(from.ip(), port),
        };
        // Hand off only; dialing happens on the cluster's own task. A full
        // queue drops the candidate, the next beacon repeats it.
        if candidate_tx.try_send(candidate).is_err() {
            debug!("Discovery queue full, dropping candidate {}", node_id);
        }
        if wants_reply {
            if let Err(e) = socket.send_to(&reply, from).await {
                debug!("Discovery reply to {} failed: {}", from, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn beacon_wire_shape() {
        let message = BeaconMessage::Announce {
            node_id: "abc123".into(),
            port: 5000,
        };
        let json = serde_json::to_string(&message).unwrap();
        assert_eq!(json, r#"{"kind":"announce","node_id":"abc123","port":5000}"#);
        let decoded: BeaconMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn reply_roundtrips() {
        let message = BeaconMessage::Reply {
            node_id: "abc123".into(),
            port: 5001,
        };
        let bytes = serde_json::to_vec(&message).unwrap();
        let decoded: BeaconMessage = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, message);
    }

    #[test]
    fn malformed_beacon_does_not_parse() {
        let result: Result<BeaconMessage, _> = serde_json::from_slice(b"not json");
        assert!(result.is_err());
    }
}
