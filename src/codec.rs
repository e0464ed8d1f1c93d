//! Capacity codec: obfuscated representations of a node's advertised
//! capacity, stored in the ledger as `0x`-prefixed hex.
//!
//! Two variants exist and the active one is always surfaced to operators
//! (startup log and `/health`), never swapped silently:
//!
//! - `sealed`: the capacity value sealed with ChaCha20-Poly1305 under a key
//!   derived from the cluster secret. Comparing sealed values requires a
//!   ledger runtime that can operate on them.
//! - `masked`: a fixed-key XOR of the plaintext. A reversible placeholder
//!   for stores that cannot hold sealed blobs; it provides no
//!   confidentiality.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{AeadCore, ChaCha20Poly1305, Key, Nonce};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

const MASK_KEY: u32 = 0x5A4D41;
const NONCE_LEN: usize = 12;

/// Which codec variant a node runs, selected by configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecMode {
    Masked,
    Sealed,
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("capacity blob has unexpected length {0}")]
    Length(usize),
    #[error("masked capacity {0} is out of range")]
    Range(u32),
    #[error("sealed capacity could not be opened")]
    Unseal,
    #[error("capacity value could not be sealed")]
    Seal,
    #[error("invalid hex blob: {0}")]
    Hex(#[from] hex::FromHexError),
}

#[derive(Clone)]
pub enum CapacityCodec {
    Masked,
    Sealed(ChaCha20Poly1305),
}

impl CapacityCodec {
    pub fn from_mode(mode: CodecMode, cluster_secret: &str) -> Self {
        match mode {
            CodecMode::Masked => CapacityCodec::Masked,
            CodecMode::Sealed => {
                let key = Sha256::digest(cluster_secret.as_bytes());
                CapacityCodec::Sealed(ChaCha20Poly1305::new(Key::from_slice(&key)))
            }
        }
    }

    /// Variant label shown to operators.
    pub fn mode(&self) -> &'static str {
        match self {
            CapacityCodec::Masked => "masked",
            CapacityCodec::Sealed(_) => "sealed",
        }
    }

    pub fn encode(&self, capacity: u16) -> Result<Vec<u8>, CodecError> {
        match self {
            CapacityCodec::Masked => {
                Ok((u32::from(capacity) ^ MASK_KEY).to_be_bytes().to_vec())
            }
            CapacityCodec::Sealed(cipher) => {
                let nonce = ChaCha20Poly1305::generate_nonce(&mut OsRng);
                let sealed = cipher
                    .encrypt(&nonce, capacity.to_be_bytes().as_slice())
                    .map_err(|_| CodecError::Seal)?;
                let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
                out.extend_from_slice(&nonce);
                out.extend_from_slice(&sealed);
                Ok(out)
            }
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<u16, CodecError> {
        match self {
            CapacityCodec::Masked => {
                let raw: [u8; 4] = bytes
                    .try_into()
                    .map_err(|_| CodecError::Length(bytes.len()))?;
                let value = u32::from_be_bytes(raw) ^ MASK_KEY;
                u16::try_from(value).map_err(|_| CodecError::Range(value))
            }
            CapacityCodec::Sealed(cipher) => {
                if bytes.len() <= NONCE_LEN {
                    return Err(CodecError::Length(bytes.len()));
                }
                let (nonce, sealed) = bytes.split_at(NONCE_LEN);
                let plain = cipher
                    .decrypt(Nonce::from_slice(nonce), sealed)
                    .map_err(|_| CodecError::Unseal)?;
                let raw: [u8; 2] = plain
                    .as_slice()
                    .try_into()
                    .map_err(|_| CodecError::Length(plain.len()))?;
                Ok(u16::from_be_bytes(raw))
            }
        }
    }
}

/// Ledger-facing form of an encoded capacity blob.
pub fn to_ledger_hex(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Parse a capacity blob stored in the ledger, with or without the prefix.
pub fn from_ledger_hex(value: &str) -> Result<Vec<u8>, CodecError> {
    let stripped = value.strip_prefix("0x").unwrap_or(value);
    Ok(hex::decode(stripped)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masked_roundtrips_full_range() {
        let codec = CapacityCodec::Masked;
        for value in 0..=u16::MAX {
            let encoded = codec.encode(value).unwrap();
            assert_eq!(codec.decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn masked_never_equals_plaintext() {
        let codec = CapacityCodec::Masked;
        for value in [0u16, 1, 4096, u16::MAX] {
            let encoded = codec.encode(value).unwrap();
            assert_ne!(encoded, value.to_be_bytes().to_vec());
        }
    }

    #[test]
    fn sealed_roundtrips() {
        let codec = CapacityCodec::from_mode(CodecMode::Sealed, "test secret");
        for value in (0..=u16::MAX).step_by(997).chain([0, 1, u16::MAX]) {
            let encoded = codec.encode(value).unwrap();
            assert_eq!(codec.decode(&encoded).unwrap(), value);
        }
    }

    #[test]
    fn sealed_blob_is_larger_and_never_plaintext() {
        let codec = CapacityCodec::from_mode(CodecMode::Sealed, "test secret");
        let encoded = codec.encode(4096).unwrap();
        assert!(encoded.len() > 2);
        assert_ne!(encoded, 4096u16.to_be_bytes().to_vec());
    }

    #[test]
    fn sealed_rejects_foreign_key() {
        let ours = CapacityCodec::from_mode(CodecMode::Sealed, "ours");
        let theirs = CapacityCodec::from_mode(CodecMode::Sealed, "theirs");
        let encoded = ours.encode(512).unwrap();
        assert!(matches!(theirs.decode(&encoded), Err(CodecError::Unseal)));
    }

    #[test]
    fn masked_rejects_wrong_length() {
        let codec = CapacityCodec::Masked;
        assert!(matches!(
            codec.decode(&[0x01, 0x02]),
            Err(CodecError::Length(2))
        ));
    }

    #[test]
    fn ledger_hex_has_prefix_and_roundtrips() {
        let blob = vec![0xde, 0xad, 0xbe, 0xef];
        let hex = to_ledger_hex(&blob);
        assert_eq!(hex, "0xdeadbeef");
        assert_eq!(from_ledger_hex(&hex).unwrap(), blob);
        assert_eq!(from_ledger_hex("deadbeef").unwrap(), blob);
    }
}
