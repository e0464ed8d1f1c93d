//! Ledger client: typed access to the shared transactional store holding
//! membership, advertised capacity and the deployment catalog.
//!
//! The store is authoritative. Writes are transactions issued from a funded
//! account; acceptance alone is not success, the transaction receipt carries
//! the verdict. Per-member assignment state is keyed by a digest of the
//! member identity, so lookups hash before querying.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use thiserror::Error;

const RECEIPT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const RECEIPT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberDetails {
    /// Image currently assigned to the member, empty when none.
    pub image: String,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDetails {
    pub replicas: u32,
    pub deployed: u32,
    pub active: bool,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("ledger transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("ledger rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("transaction reverted: {0}")]
    Reverted(String),
    #[error("no receipt for transaction {0} within {1:?}")]
    ReceiptTimeout(String, Duration),
    #[error("malformed ledger response: {0}")]
    Malformed(String),
    #[error("no funded account available")]
    NoAccount,
}

/// Digest key under which a member's assignment state is stored.
pub fn identity_key(id: &str) -> String {
    hex::encode(Sha256::digest(id.as_bytes()))
}

/// Operations the coordination engine needs from the store.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn register_member(&self, id: &str, capacity_hex: &str) -> Result<(), LedgerError>;
    async fn remove_member(&self, id: &str) -> Result<(), LedgerError>;
    async fn update_member_capacity(&self, id: &str, capacity_hex: &str)
        -> Result<(), LedgerError>;

    /// Members are an append-only indexed list; there is no list-all call.
    async fn member_count(&self) -> Result<u64, LedgerError>;
    async fn member_at(&self, index: u64) -> Result<Option<String>, LedgerError>;
    async fn member_details(&self, id: &str) -> Result<Option<MemberDetails>, LedgerError>;
    async fn member_images(&self, id: &str) -> Result<Vec<String>, LedgerError>;
    async fn member_capacity(&self, id: &str) -> Result<Option<String>, LedgerError>;

    async fn add_image(&self, name: &str, replicas: u32) -> Result<(), LedgerError>;
    async fn remove_image(&self, name: &str) -> Result<(), LedgerError>;
    /// Assign one image to one member, or clear it with an empty name.
    async fn set_member_image(&self, id: &str, image: &str) -> Result<(), LedgerError>;

    async fn image_count(&self) -> Result<u64, LedgerError>;
    async fn image_at(&self, index: u64) -> Result<Option<String>, LedgerError>;
    async fn image_details(&self, name: &str) -> Result<Option<ImageDetails>, LedgerError>;
    /// Correct the derived deployed counter for a catalog image.
    async fn update_image_deployed(&self, name: &str, deployed: u32) -> Result<(), LedgerError>;
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcErrorBody>,
}

#[derive(Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

/// JSON-RPC client for the ledger store.
pub struct RpcLedger {
    http: reqwest::Client,
    url: String,
    contract: String,
    account: String,
    next_id: AtomicU64,
}

impl RpcLedger {
    /// Connect to the store and resolve the write account. An empty
    /// `account` asks the store for its first funded account, matching a
    /// local development chain. Failure here is a startup error.
    pub async fn connect(
        url: &str,
        contract: &str,
        account: &str,
    ) -> Result<Self, LedgerError> {
        let ledger = Self {
            http: reqwest::Client::new(),
            url: url.to_string(),
            contract: contract.to_string(),
            account: account.to_string(),
            next_id: AtomicU64::new(1),
        };
        let resolved = if account.is_empty() {
            let fallback = ledger.default_account().await?;
            info!("Using ledger account {}", fallback);
            fallback
        } else {
            account.to_string()
        };
        Ok(Self {
            account: resolved,
            ..ledger
        })
    }

    async fn default_account(&self) -> Result<String, LedgerError> {
        let accounts = self.rpc("ledger_accounts", json!([])).await?;
        accounts
            .as_array()
            .and_then(|list| list.first())
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or(LedgerError::NoAccount)
    }

    async fn rpc(&self, method: &str, params: Value) -> Result<Value, LedgerError> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let response: RpcResponse = self
            .http
            .post(&self.url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if let Some(error) = response.error {
            if error.message.to_lowercase().contains("revert") {
                return Err(LedgerError::Reverted(error.message));
            }
            return Err(LedgerError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        Ok(response.result.unwrap_or(Value::Null))
    }

    /// Read-only contract call.
    async fn call(&self, method: &str, args: Value) -> Result<Value, LedgerError> {
        self.rpc(
            "ledger_call",
            json!({ "to": self.contract, "method": method, "args": args }),
        )
        .await
    }

    /// Submit a state-changing transaction and wait for its receipt. The
    /// receipt status flag decides success, even when submission itself
    /// raised no error.
    async fn transact(&self, method: &str, args: Value) -> Result<(), LedgerError> {
        let result = self
            .rpc(
                "ledger_sendTransaction",
                json!({
                    "from": self.account,
                    "to": self.contract,
                    "method": method,
                    "args": args,
                }),
            )
            .await?;
        let hash = result
            .as_str()
            .ok_or_else(|| LedgerError::Malformed("transaction hash missing".into()))?
            .to_string();
        debug!("Submitted {} (tx {})", method, hash);
        self.wait_receipt(&hash).await
    }

    async fn wait_receipt(&self, hash: &str) -> Result<(), LedgerError> {
        let deadline = tokio::time::Instant::now() + RECEIPT_TIMEOUT;
        loop {
            let receipt = self
                .rpc("ledger_getTransactionReceipt", json!([hash]))
                .await?;
            if !receipt.is_null() {
                let status = receipt
                    .get("status")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| LedgerError::Malformed("receipt without status".into()))?;
                if status == 1 {
                    return Ok(());
                }
                let reason = receipt
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("transaction failed")
                    .to_string();
                return Err(LedgerError::Reverted(reason));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(LedgerError::ReceiptTimeout(hash.to_string(), RECEIPT_TIMEOUT));
            }
            tokio::time::sleep(RECEIPT_POLL_INTERVAL).await;
        }
    }
}

fn as_u64(value: &Value, what: &str) -> Result<u64, LedgerError> {
    value
        .as_u64()
        .ok_or_else(|| LedgerError::Malformed(format!("{} is not an integer", what)))
}

#[async_trait]
impl Ledger for RpcLedger {
    async fn register_member(&self, id: &str, capacity_hex: &str) -> Result<(), LedgerError> {
        self.transact("addMember", json!([id, capacity_hex])).await
    }

    async fn remove_member(&self, id: &str) -> Result<(), LedgerError> {
        self.transact("removeMember", json!([id])).await
    }

    async fn update_member_capacity(
        &self,
        id: &str,
        capacity_hex: &str,
    ) -> Result<(), LedgerError> {
        self.transact("updateMemberCapacity", json!([id, capacity_hex]))
            .await
    }

    async fn member_count(&self) -> Result<u64, LedgerError> {
        let result = self.call("memberCount", json!([])).await?;
        as_u64(&result, "member count")
    }

    async fn member_at(&self, index: u64) -> Result<Option<String>, LedgerError> {
        let result = self.call("memberAt", json!([index])).await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn member_details(&self, id: &str) -> Result<Option<MemberDetails>, LedgerError> {
        let result = self
            .call("getMemberDetails", json!([identity_key(id)]))
            .await?;
        if result.is_null() {
            return Ok(None);
        }
        let image = result
            .get("image")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let active = result
            .get("active")
            .and_then(Value::as_bool)
            .ok_or_else(|| LedgerError::Malformed("member details without active flag".into()))?;
        Ok(Some(MemberDetails { image, active }))
    }

    async fn member_images(&self, id: &str) -> Result<Vec<String>, LedgerError> {
        let result = self
            .call("getMemberImages", json!([identity_key(id)]))
            .await?;
        let list = result
            .as_array()
            .ok_or_else(|| LedgerError::Malformed("member images is not a list".into()))?;
        Ok(list
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    async fn member_capacity(&self, id: &str) -> Result<Option<String>, LedgerError> {
        let result = self
            .call("getMemberCapacity", json!([identity_key(id)]))
            .await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn add_image(&self, name: &str, replicas: u32) -> Result<(), LedgerError> {
        self.transact("addImage", json!([name, replicas])).await
    }

    async fn remove_image(&self, name: &str) -> Result<(), LedgerError> {
        self.transact("removeImage", json!([name])).await
    }

    async fn set_member_image(&self, id: &str, image: &str) -> Result<(), LedgerError> {
        self.transact("setImage", json!([identity_key(id), image]))
            .await
    }

    async fn image_count(&self) -> Result<u64, LedgerError> {
        let result = self.call("imageCount", json!([])).await?;
        as_u64(&result, "image count")
    }

    async fn image_at(&self, index: u64) -> Result<Option<String>, LedgerError> {
        let result = self.call("imageAt", json!([index])).await?;
        Ok(result.as_str().map(str::to_string))
    }

    async fn image_details(&self, name: &str) -> Result<Option<ImageDetails>, LedgerError> {
        let result = self.call("getImageDetails", json!([name])).await?;
        if result.is_null() {
            return Ok(None);
        }
        let replicas = as_u64(result.get("replicas").unwrap_or(&Value::Null), "replicas")?;
        let deployed = as_u64(result.get("deployed").unwrap_or(&Value::Null), "deployed")?;
        let active = result
            .get("active")
            .and_then(Value::as_bool)
            .ok_or_else(|| LedgerError::Malformed("image details without active flag".into()))?;
        Ok(Some(ImageDetails {
            replicas: replicas as u32,
            deployed: deployed as u32,
            active,
        }))
    }

    async fn update_image_deployed(&self, name: &str, deployed: u32) -> Result<(), LedgerError> {
        self.transact("setImageDeployed", json!([name, deployed]))
            .await
    }
}

#[derive(Default)]
struct MemberRecord {
    capacity: String,
    images: Vec<String>,
    active: bool,
}

#[derive(Default)]
struct ImageRecord {
    replicas: u32,
    deployed: u32,
    active: bool,
}

#[derive(Default)]
struct MemoryState {
    /// Registry enumeration order, append-only while members stay.
    order: Vec<String>,
    /// Member state keyed by identity digest, like the real store.
    members: HashMap<String, MemberRecord>,
    catalog_order: Vec<String>,
    catalog: HashMap<String, ImageRecord>,
    writes: u64,
}

/// In-process ledger with the same contract semantics as the RPC store.
/// Backs the test suite; every successful state change counts as one write.
#[derive(Default)]
pub struct MemoryLedger {
    state: Mutex<MemoryState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful write transactions so far.
    pub fn writes(&self) -> u64 {
        self.state.lock().unwrap().writes
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn register_member(&self, id: &str, capacity_hex: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let key = identity_key(id);
        if state.members.contains_key(&key) {
            return Err(LedgerError::Reverted("member already registered".into()));
        }
        state.order.push(id.to_string());
        state.members.insert(
            key,
            MemberRecord {
                capacity: capacity_hex.to_string(),
                images: Vec::new(),
                active: true,
            },
        );
        state.writes += 1;
        Ok(())
    }

    async fn remove_member(&self, id: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let key = identity_key(id);
        if state.members.remove(&key).is_none() {
            return Err(LedgerError::Reverted("unknown member".into()));
        }
        state.order.retain(|existing| existing != id);
        state.writes += 1;
        Ok(())
    }

    async fn update_member_capacity(
        &self,
        id: &str,
        capacity_hex: &str,
    ) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let key = identity_key(id);
        let record = state
            .members
            .get_mut(&key)
            .ok_or_else(|| LedgerError::Reverted("unknown member".into()))?;
        record.capacity = capacity_hex.to_string();
        state.writes += 1;
        Ok(())
    }

    async fn member_count(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().unwrap().order.len() as u64)
    }

    async fn member_at(&self, index: u64) -> Result<Option<String>, LedgerError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .order
            .get(index as usize)
            .cloned())
    }

    async fn member_details(&self, id: &str) -> Result<Option<MemberDetails>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.members.get(&identity_key(id)).map(|record| {
            MemberDetails {
                image: record.images.first().cloned().unwrap_or_default(),
                active: record.active,
            }
        }))
    }

    async fn member_images(&self, id: &str) -> Result<Vec<String>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .members
            .get(&identity_key(id))
            .map(|record| record.images.clone())
            .unwrap_or_default())
    }

    async fn member_capacity(&self, id: &str) -> Result<Option<String>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .members
            .get(&identity_key(id))
            .map(|record| record.capacity.clone()))
    }

    async fn add_image(&self, name: &str, replicas: u32) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        if !state.catalog.contains_key(name) {
            state.catalog_order.push(name.to_string());
        }
        let record = state.catalog.entry(name.to_string()).or_default();
        record.replicas = replicas;
        record.active = true;
        state.writes += 1;
        Ok(())
    }

    async fn remove_image(&self, name: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        if state.catalog.remove(name).is_none() {
            return Err(LedgerError::Reverted("unknown image".into()));
        }
        state.catalog_order.retain(|existing| existing != name);
        state.writes += 1;
        Ok(())
    }

    async fn set_member_image(&self, id: &str, image: &str) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let key = identity_key(id);
        let record = state
            .members
            .get_mut(&key)
            .ok_or_else(|| LedgerError::Reverted("unknown member".into()))?;
        record.images = if image.is_empty() {
            Vec::new()
        } else {
            vec![image.to_string()]
        };
        state.writes += 1;
        Ok(())
    }

    async fn image_count(&self) -> Result<u64, LedgerError> {
        Ok(self.state.lock().unwrap().catalog_order.len() as u64)
    }

    async fn image_at(&self, index: u64) -> Result<Option<String>, LedgerError> {
        Ok(self
            .state
            .lock()
            .unwrap()
            .catalog_order
            .get(index as usize)
            .cloned())
    }

    async fn image_details(&self, name: &str) -> Result<Option<ImageDetails>, LedgerError> {
        let state = self.state.lock().unwrap();
        Ok(state.catalog.get(name).map(|record| ImageDetails {
            replicas: record.replicas,
            deployed: record.deployed,
            active: record.active,
        }))
    }

    async fn update_image_deployed(&self, name: &str, deployed: u32) -> Result<(), LedgerError> {
        let mut state = self.state.lock().unwrap();
        let record = state
            .catalog
            .get_mut(name)
            .ok_or_else(|| LedgerError::Reverted("unknown image".into()))?;
        record.deployed = deployed;
        state.writes += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_key_is_a_hex_digest() {
        let key = identity_key("peer-1");
        assert_eq!(key.len(), 64);
        assert_ne!(key, identity_key("peer-2"));
        assert_eq!(key, identity_key("peer-1"));
    }

    #[tokio::test]
    async fn members_enumerate_in_registration_order() {
        let ledger = MemoryLedger::new();
        for id in ["a", "b", "c"] {
            ledger.register_member(id, "0x00").await.unwrap();
        }
        assert_eq!(ledger.member_count().await.unwrap(), 3);
        assert_eq!(ledger.member_at(0).await.unwrap().as_deref(), Some("a"));
        assert_eq!(ledger.member_at(1).await.unwrap().as_deref(), Some("b"));
        assert_eq!(ledger.member_at(2).await.unwrap().as_deref(), Some("c"));
        assert_eq!(ledger.member_at(3).await.unwrap(), None);
    }

    #[tokio::test]
    async fn reregistration_reverts() {
        let ledger = MemoryLedger::new();
        ledger.register_member("a", "0x00").await.unwrap();
        let result = ledger.register_member("a", "0x00").await;
        assert!(matches!(result, Err(LedgerError::Reverted(_))));
    }

    #[tokio::test]
    async fn assignment_set_and_clear() {
        let ledger = MemoryLedger::new();
        ledger.register_member("a", "0x00").await.unwrap();
        ledger.set_member_image("a", "nginx:latest").await.unwrap();
        assert_eq!(
            ledger.member_images("a").await.unwrap(),
            vec!["nginx:latest".to_string()]
        );
        assert_eq!(
            ledger.member_details("a").await.unwrap().unwrap().image,
            "nginx:latest"
        );
        ledger.set_member_image("a", "").await.unwrap();
        assert!(ledger.member_images("a").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn capacity_is_stored_and_updated() {
        let ledger = MemoryLedger::new();
        ledger.register_member("a", "0x005a4d41").await.unwrap();
        assert_eq!(
            ledger.member_capacity("a").await.unwrap().as_deref(),
            Some("0x005a4d41")
        );
        ledger
            .update_member_capacity("a", "0x005a4c99")
            .await
            .unwrap();
        assert_eq!(
            ledger.member_capacity("a").await.unwrap().as_deref(),
            Some("0x005a4c99")
        );
        assert_eq!(ledger.member_capacity("ghost").await.unwrap(), None);
    }

    #[tokio::test]
    async fn catalog_upsert_and_remove() {
        let ledger = MemoryLedger::new();
        ledger.add_image("nginx:latest", 3).await.unwrap();
        ledger.add_image("nginx:latest", 5).await.unwrap();
        assert_eq!(ledger.image_count().await.unwrap(), 1);
        let details = ledger.image_details("nginx:latest").await.unwrap().unwrap();
        assert_eq!(details.replicas, 5);
        assert!(details.active);
        ledger.remove_image("nginx:latest").await.unwrap();
        assert_eq!(ledger.image_count().await.unwrap(), 0);
        assert!(ledger.image_details("nginx:latest").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn writes_are_counted() {
        let ledger = MemoryLedger::new();
        assert_eq!(ledger.writes(), 0);
        ledger.register_member("a", "0x00").await.unwrap();
        ledger.add_image("nginx:latest", 1).await.unwrap();
        ledger.set_member_image("a", "nginx:latest").await.unwrap();
        assert_eq!(ledger.writes(), 3);
        let _ = ledger.remove_image("missing:latest").await;
        assert_eq!(ledger.writes(), 3);
    }
}
