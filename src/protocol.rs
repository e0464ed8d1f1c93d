//! Deployment protocol: length-prefixed JSON messages exchanged over peer
//! streams. Framing is a 4 byte big-endian payload length followed by the
//! UTF-8 JSON payload.

use serde::{Deserialize, Serialize};

/// Stream protocol identifier, registered as the endpoint ALPN.
pub const DEPLOYMENT_ALPN: &[u8] = b"/canteen/deployment/1.0.0";

/// Largest request frame a node will read from a peer.
pub const MAX_REQUEST_LEN: usize = 8 * 1024;
/// Bound for deploy/undeploy replies.
pub const MAX_DEPLOY_RESPONSE_LEN: usize = 8 * 1024;
/// Status replies carry the full member list, so they get a larger bound.
pub const MAX_STATUS_RESPONSE_LEN: usize = 16 * 1024;

const LEN_SIZE: usize = 4;

/// A command sent to an operator node. The `action` field decides the shape;
/// it is read once and selects exactly one decode path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Request {
    /// Add an image to the deployment catalog and assign it to members.
    Deploy {
        image: String,
        #[serde(default = "default_replicas")]
        replicas: u32,
    },
    /// Remove an image from the catalog and clear its assignments. The
    /// replica count is carried for wire compatibility and ignored.
    Undeploy {
        image: String,
        #[serde(default)]
        replicas: u32,
    },
    /// Ask for a cluster membership snapshot.
    Status,
}

fn default_replicas() -> u32 {
    1
}

impl Request {
    pub fn to_frame(&self) -> Result<Vec<u8>, FrameError> {
        encode_message(self, MAX_REQUEST_LEN)
    }
}

/// Reply to a deploy or undeploy request. Optional fields are serialized as
/// explicit nulls so responses always carry the same keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployResponse {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub replicas: Option<u32>,
    #[serde(default)]
    pub error: Option<String>,
}

impl DeployResponse {
    pub fn failure(message: &str, error: &str) -> Self {
        Self {
            success: false,
            message: message.to_string(),
            image: None,
            replicas: None,
            error: Some(error.to_string()),
        }
    }
}

/// Reply to a status request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub success: bool,
    pub total_members: u64,
    pub connected_count: u64,
    pub members: Vec<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl StatusResponse {
    pub fn failure(error: &str) -> Self {
        Self {
            success: false,
            total_members: 0,
            connected_count: 0,
            members: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// A typed reply, tagged with which size bound applies when encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Deploy(DeployResponse),
    Status(StatusResponse),
}

impl Reply {
    pub fn to_frame(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            Reply::Deploy(response) => encode_message(response, MAX_DEPLOY_RESPONSE_LEN),
            Reply::Status(response) => encode_message(response, MAX_STATUS_RESPONSE_LEN),
        }
    }

    /// A failure reply of the same kind, for when sending `self` went wrong.
    pub fn failure_like(&self, message: &str, error: &str) -> Reply {
        match self {
            Reply::Deploy(_) => Reply::Deploy(DeployResponse::failure(message, error)),
            Reply::Status(_) => Reply::Status(StatusResponse::failure(error)),
        }
    }
}

/// Error encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
    #[error("stream ended mid-frame after {received} bytes")]
    Truncated { received: usize },
    #[error("payload error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode a payload into a single frame: 4 bytes BE length + payload.
pub fn encode_frame(payload: &[u8], max_len: usize) -> Result<Vec<u8>, FrameError> {
    if payload.len() > max_len {
        return Err(FrameError::TooLarge {
            len: payload.len(),
            max: max_len,
        });
    }
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Serialize a message and wrap it in a frame, enforcing `max_len`.
pub fn encode_message<T: Serialize>(message: &T, max_len: usize) -> Result<Vec<u8>, FrameError> {
    let payload = serde_json::to_vec(message)?;
    encode_frame(&payload, max_len)
}

/// Decode one frame from the front of `bytes`. Returns the payload and the
/// number of bytes consumed, or `NeedMore` when the buffer holds less than
/// the declared length.
pub fn decode_frame(bytes: &[u8], max_len: usize) -> Result<(&[u8], usize), FrameError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameError::NeedMore);
    }
    let len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > max_len {
        return Err(FrameError::TooLarge { len, max: max_len });
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Read one frame from a stream. `Ok(None)` means the peer finished the
/// stream without sending anything; a stream that ends while a declared
/// frame is still incomplete is a `Truncated` error, never a short payload.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> Result<Option<Vec<u8>>, FrameError>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut buf: Vec<u8> = Vec::with_capacity(512);
    let mut chunk = [0u8; 2048];
    loop {
        match decode_frame(&buf, max_len) {
            Ok((payload, _)) => return Ok(Some(payload.to_vec())),
            Err(FrameError::NeedMore) => {}
            Err(e) => return Err(e),
        }
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(FrameError::Truncated {
                received: buf.len(),
            });
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}
