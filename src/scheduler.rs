//! Scheduler: bridges desired ledger state and observed cluster state.
//!
//! The ledger is the single source of truth for membership and assignments.
//! The scheduler registers the local node with an obfuscated capacity
//! advertisement, answers deployment protocol requests, and runs a poll loop
//! that converges local containers to the recorded assignments and corrects
//! derived catalog counters.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::Mutex;

use crate::cluster::ClusterView;
use crate::codec::{self, CapacityCodec};
use crate::ledger::{Ledger, LedgerError};
use crate::protocol::{DeployResponse, StatusResponse};
use crate::runtime::ContainerRuntime;

/// Capacity charged against the advertisement for every container started
/// on this node.
const CONTAINER_CAPACITY_COST_MB: u16 = 200;

/// Result of a first-N assignment pass, shared by the stream and HTTP paths.
#[derive(Debug, Default)]
pub struct AssignOutcome {
    pub assigned: Vec<String>,
    pub failed: Vec<String>,
    pub total_members: usize,
}

/// Result of clearing an image's assignments.
#[derive(Debug, Default)]
pub struct RemoveOutcome {
    pub removed: Vec<String>,
    pub failed: Vec<String>,
}

pub struct Scheduler {
    cluster: Arc<dyn ClusterView>,
    ledger: Arc<dyn Ledger>,
    runtime: Arc<dyn ContainerRuntime>,
    codec: CapacityCodec,
    capacity_mb: Mutex<u16>,
    registered: AtomicBool,
    /// Containers running on this node, container key to container id.
    containers: Mutex<HashMap<String, String>>,
}

impl Scheduler {
    pub fn new(
        cluster: Arc<dyn ClusterView>,
        ledger: Arc<dyn Ledger>,
        runtime: Arc<dyn ContainerRuntime>,
        codec: CapacityCodec,
        capacity_mb: u16,
    ) -> Self {
        Self {
            cluster,
            ledger,
            runtime,
            codec,
            capacity_mb: Mutex::new(capacity_mb),
            registered: AtomicBool::new(false),
            containers: Mutex::new(HashMap::new()),
        }
    }

    /// Variant label of the active capacity codec.
    pub fn codec_mode(&self) -> &'static str {
        self.codec.mode()
    }

    /// Advertise this node in the ledger registry. A revert means an earlier
    /// registration is still on record, which counts as registered. Other
    /// failures are retried by the poll loop and never abort startup.
    pub async fn register_self(&self) -> bool {
        let id = self.cluster.local_id();
        let capacity = *self.capacity_mb.lock().await;
        let blob = match self.codec.encode(capacity) {
            Ok(blob) => blob,
            Err(e) => {
                error!("Could not encode capacity advertisement: {}", e);
                return false;
            }
        };
        info!(
            "Registering node {} with {} MB advertised ({} codec)",
            id,
            capacity,
            self.codec.mode()
        );
        match self
            .ledger
            .register_member(&id, &codec::to_ledger_hex(&blob))
            .await
        {
            Ok(()) => {
                info!("Node registered in ledger");
                self.registered.store(true, Ordering::SeqCst);
                true
            }
            Err(LedgerError::Reverted(reason)) => {
                info!("Node already registered: {}", reason);
                self.registered.store(true, Ordering::SeqCst);
                true
            }
            Err(e) => {
                warn!("Failed to register node, will retry: {}", e);
                false
            }
        }
    }

    /// Active members in ledger enumeration order.
    pub async fn registry_members(&self) -> Result<Vec<String>, LedgerError> {
        let count = self.ledger.member_count().await?;
        let mut members = Vec::with_capacity(count as usize);
        for index in 0..count {
            let Some(id) = self.ledger.member_at(index).await? else {
                break;
            };
            match self.ledger.member_details(&id).await? {
                Some(details) if details.active => members.push(id),
                _ => {}
            }
        }
        Ok(members)
    }

    /// Assign `image` to the first `min(replicas, member_count)` members in
    /// registry order, one assignment each. Members past the cap are left
    /// untouched; there is no load or fairness weighting.
    pub async fn assign_first_n(
        &self,
        image: &str,
        replicas: u32,
    ) -> Result<AssignOutcome, LedgerError> {
        let members = self.registry_members().await?;
        let want = (replicas as usize).min(members.len());
        let mut outcome = AssignOutcome {
            total_members: members.len(),
            ..Default::default()
        };
        for id in &members[..want] {
            match self.ledger.set_member_image(id, image).await {
                Ok(()) => outcome.assigned.push(id.clone()),
                Err(e) => {
                    warn!("Failed to assign {} to {}: {}", image, id, e);
                    outcome.failed.push(id.clone());
                }
            }
        }
        Ok(outcome)
    }

    /// Clear `image` from every member currently carrying it. An image
    /// nobody carries yields an empty outcome and no ledger writes.
    pub async fn clear_carriers(&self, image: &str) -> Result<RemoveOutcome, LedgerError> {
        let mut outcome = RemoveOutcome::default();
        for id in self.registry_members().await? {
            let carries = match self.ledger.member_details(&id).await? {
                Some(details) => details.image == image,
                None => false,
            };
            if !carries {
                continue;
            }
            match self.ledger.set_member_image(&id, "").await {
                Ok(()) => outcome.removed.push(id),
                Err(e) => {
                    warn!("Failed to clear {} from {}: {}", image, id, e);
                    outcome.failed.push(id);
                }
            }
        }
        Ok(outcome)
    }

    /// Deployment request from the peer protocol: record the desired state
    /// in the catalog, then select target members.
    pub async fn handle_deploy(&self, image: &str, replicas: u32) -> DeployResponse {
        info!("Processing deploy request: {} x{}", image, replicas);
        if let Err(e) = self.ledger.add_image(image, replicas).await {
            error!("Deploy failed: {}", e);
            return DeployResponse::failure("Deployment failed", &e.to_string());
        }
        match self.assign_first_n(image, replicas).await {
            Ok(outcome) => {
                let assigned = outcome.assigned.len() as u32;
                DeployResponse {
                    success: true,
                    message: format!("Deployed {} with {} replica(s)", image, assigned),
                    image: Some(image.to_string()),
                    replicas: Some(assigned),
                    error: None,
                }
            }
            Err(e) => {
                error!("Member selection failed: {}", e);
                DeployResponse::failure("Deployment failed", &e.to_string())
            }
        }
    }

    /// Undeploy request from the peer protocol: drop the catalog entry when
    /// it exists, then clear every carrier. Unknown images with no carriers
    /// succeed without touching the ledger.
    pub async fn handle_undeploy(&self, image: &str) -> DeployResponse {
        info!("Processing undeploy request: {}", image);
        let result: Result<RemoveOutcome, LedgerError> = async {
            if self.ledger.image_details(image).await?.is_some() {
                self.ledger.remove_image(image).await?;
            }
            self.clear_carriers(image).await
        }
        .await;
        match result {
            Ok(outcome) => DeployResponse {
                success: true,
                message: format!(
                    "Removed deployment: {} ({} assignment(s) cleared)",
                    image,
                    outcome.removed.len()
                ),
                image: Some(image.to_string()),
                replicas: None,
                error: None,
            },
            Err(e) => {
                error!("Undeploy failed: {}", e);
                DeployResponse::failure("Removal failed", &e.to_string())
            }
        }
    }

    /// Status snapshot: ledger membership plus the live connection count.
    /// An empty registry is a successful answer; only an unreachable ledger
    /// fails.
    pub async fn handle_status(&self) -> StatusResponse {
        match self.registry_members().await {
            Ok(members) => StatusResponse {
                success: true,
                total_members: members.len() as u64,
                connected_count: self.cluster.connected_peers().len() as u64,
                members,
                error: None,
            },
            Err(e) => {
                error!("Status request failed: {}", e);
                StatusResponse::failure(&e.to_string())
            }
        }
    }

    /// Run reconciliation ticks until cancelled.
    pub async fn poll_loop(self: Arc<Self>, interval: Duration) {
        info!("Scheduler poll loop started ({:?} interval)", interval);
        loop {
            self.tick().await;
            tokio::time::sleep(interval).await;
        }
    }

    /// One reconciliation pass. Failures are logged and left for the next
    /// tick; the loop itself never stops.
    pub async fn tick(&self) {
        if !self.registered.load(Ordering::SeqCst) {
            self.register_self().await;
        }
        let id = self.cluster.local_id();
        match self.ledger.member_images(&id).await {
            Ok(images) => self.converge_containers(&images).await,
            Err(e) => warn!("Could not read assignments: {}", e),
        }
        match self.reconcile_deployed_counts().await {
            Ok(0) => {}
            Ok(corrected) => info!("Corrected deployed count for {} image(s)", corrected),
            Err(e) => warn!("Catalog reconciliation failed: {}", e),
        }
    }

    /// Converge local containers to the assigned image list: stop what is no
    /// longer assigned, start what is missing.
    async fn converge_containers(&self, assigned_images: &[String]) {
        let assigned: Vec<String> = assigned_images
            .iter()
            .enumerate()
            .map(|(index, image)| container_key(image, index))
            .collect();
        let mut containers = self.containers.lock().await;

        let surplus: Vec<String> = containers
            .keys()
            .filter(|key| !assigned.contains(key))
            .cloned()
            .collect();
        for key in surplus {
            let Some(container_id) = containers.get(&key).cloned() else {
                continue;
            };
            info!("Removing container {}", key);
            match self.runtime.stop(&key, &container_id).await {
                Ok(()) => {
                    containers.remove(&key);
                }
                Err(e) => warn!("Failed to stop container {}: {:#}", key, e),
            }
        }

        for key in assigned {
            if containers.contains_key(&key) {
                continue;
            }
            let image = image_of_key(&key);
            info!("Starting container for {} ({})", image, key);
            match self.runtime.start(&key, &image).await {
                Ok(container_id) => {
                    containers.insert(key, container_id);
                    self.charge_capacity(CONTAINER_CAPACITY_COST_MB).await;
                }
                Err(e) => warn!("Failed to start container {}: {:#}", key, e),
            }
        }
    }

    /// Reduce the advertised capacity and push the new blob to the ledger.
    async fn charge_capacity(&self, cost_mb: u16) {
        let new_value = {
            let mut capacity = self.capacity_mb.lock().await;
            *capacity = capacity.saturating_sub(cost_mb);
            *capacity
        };
        debug!("Advertised capacity now {} MB", new_value);
        let blob = match self.codec.encode(new_value) {
            Ok(blob) => blob,
            Err(e) => {
                error!("Could not encode capacity advertisement: {}", e);
                return;
            }
        };
        let id = self.cluster.local_id();
        if let Err(e) = self
            .ledger
            .update_member_capacity(&id, &codec::to_ledger_hex(&blob))
            .await
        {
            // The container already runs; a later update refreshes the
            // stale advertisement.
            warn!("Failed to update advertised capacity: {}", e);
        }
    }

    /// Recompute each active catalog image's carrier count from member
    /// assignments and correct the stored counter when it drifted. Returns
    /// the number of corrective writes; an unchanged ledger yields zero.
    pub async fn reconcile_deployed_counts(&self) -> Result<u32, LedgerError> {
        let members = self.registry_members().await?;
        let mut carriers: HashMap<String, u32> = HashMap::new();
        for id in &members {
            for image in self.ledger.member_images(id).await? {
                if !image.is_empty() {
                    *carriers.entry(image).or_insert(0) += 1;
                }
            }
        }
        let mut corrected = 0;
        let image_count = self.ledger.image_count().await?;
        for index in 0..image_count {
            let Some(name) = self.ledger.image_at(index).await? else {
                break;
            };
            let Some(details) = self.ledger.image_details(&name).await? else {
                continue;
            };
            if !details.active {
                continue;
            }
            let actual = carriers.get(&name).copied().unwrap_or(0);
            if details.deployed != actual {
                self.ledger.update_image_deployed(&name, actual).await?;
                corrected += 1;
            }
        }
        Ok(corrected)
    }

    /// Best-effort teardown: local containers first, then the registry
    /// entry. Sub-failures are logged, never propagated.
    pub async fn cleanup(&self) {
        info!("Cleaning up scheduler...");
        let drained: Vec<(String, String)> = {
            let mut containers = self.containers.lock().await;
            containers.drain().collect()
        };
        for (key, container_id) in drained {
            if let Err(e) = self.runtime.stop(&key, &container_id).await {
                warn!("Failed to stop container {} during shutdown: {:#}", key, e);
            }
        }
        if !self.registered.load(Ordering::SeqCst) {
            info!("Node was never registered, skipping unregistration");
            return;
        }
        let id = self.cluster.local_id();
        match self.ledger.remove_member(&id).await {
            Ok(()) => info!("Node unregistered from ledger"),
            Err(e) => warn!("Failed to unregister node: {}", e),
        }
    }
}

fn container_key(image: &str, index: usize) -> String {
    format!("{}:{}", image, index)
}

fn image_of_key(key: &str) -> String {
    key.rsplit_once(':')
        .map(|(image, _)| image.to_string())
        .unwrap_or_else(|| key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{CapacityCodec, CodecMode};
    use crate::ledger::MemoryLedger;
    use anyhow::Result as AnyResult;
    use async_trait::async_trait;
    use std::collections::HashSet;

    struct TestView {
        id: String,
        peers: Vec<String>,
    }

    impl ClusterView for TestView {
        fn local_id(&self) -> String {
            self.id.clone()
        }
        fn connected_peers(&self) -> Vec<String> {
            self.peers.clone()
        }
    }

    #[derive(Default)]
    struct NullRuntime;

    #[async_trait]
    impl ContainerRuntime for NullRuntime {
        async fn start(&self, key: &str, _image: &str) -> AnyResult<String> {
            Ok(format!("container-{}", key))
        }
        async fn stop(&self, _key: &str, _container_id: &str) -> AnyResult<()> {
            Ok(())
        }
        async fn prune_exited(&self) -> AnyResult<usize> {
            Ok(0)
        }
    }

    async fn scheduler_with_members(member_ids: &[&str]) -> (Scheduler, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        for id in member_ids {
            ledger.register_member(id, "0x00").await.unwrap();
        }
        let cluster = Arc::new(TestView {
            id: "self".into(),
            peers: vec!["peer-1".into()],
        });
        let scheduler = Scheduler::new(
            cluster,
            ledger.clone(),
            Arc::new(NullRuntime),
            CapacityCodec::from_mode(CodecMode::Masked, ""),
            4096,
        );
        (scheduler, ledger)
    }

    #[tokio::test]
    async fn deploy_assigns_first_three_of_five() {
        let (scheduler, ledger) =
            scheduler_with_members(&["m0", "m1", "m2", "m3", "m4"]).await;
        let response = scheduler.handle_deploy("nginx:latest", 3).await;
        assert!(response.success);
        assert_eq!(response.image.as_deref(), Some("nginx:latest"));
        assert_eq!(response.replicas, Some(3));
        for id in ["m0", "m1", "m2"] {
            assert_eq!(
                ledger.member_images(id).await.unwrap(),
                vec!["nginx:latest".to_string()]
            );
        }
        for id in ["m3", "m4"] {
            assert!(ledger.member_images(id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn deploy_caps_replicas_at_member_count() {
        let (scheduler, ledger) = scheduler_with_members(&["m0", "m1"]).await;
        let response = scheduler.handle_deploy("nginx:latest", 10).await;
        assert!(response.success);
        assert_eq!(response.replicas, Some(2));
        assert_eq!(
            ledger.member_images("m0").await.unwrap(),
            vec!["nginx:latest".to_string()]
        );
        assert_eq!(
            ledger.member_images("m1").await.unwrap(),
            vec!["nginx:latest".to_string()]
        );
    }

    #[tokio::test]
    async fn deploy_never_assigns_a_member_twice() {
        let (scheduler, _ledger) =
            scheduler_with_members(&["m0", "m1", "m2", "m3"]).await;
        let outcome = scheduler.assign_first_n("nginx:latest", 4).await.unwrap();
        let distinct: HashSet<&String> = outcome.assigned.iter().collect();
        assert_eq!(distinct.len(), outcome.assigned.len());
        assert_eq!(outcome.assigned.len(), 4);
    }

    #[tokio::test]
    async fn undeploy_unknown_image_issues_no_writes() {
        let (scheduler, ledger) = scheduler_with_members(&["m0", "m1"]).await;
        let writes_before = ledger.writes();
        let response = scheduler.handle_undeploy("missing:latest").await;
        assert!(response.success);
        assert_eq!(ledger.writes(), writes_before);
    }

    #[tokio::test]
    async fn undeploy_clears_every_carrier() {
        let (scheduler, ledger) = scheduler_with_members(&["m0", "m1", "m2"]).await;
        scheduler.handle_deploy("nginx:latest", 2).await;
        let outcome = scheduler.clear_carriers("nginx:latest").await.unwrap();
        assert_eq!(outcome.removed, vec!["m0".to_string(), "m1".to_string()]);
        assert!(outcome.failed.is_empty());
        for id in ["m0", "m1", "m2"] {
            assert!(ledger.member_images(id).await.unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn reconcile_converges_to_zero_writes() {
        let (scheduler, ledger) = scheduler_with_members(&["m0", "m1", "m2"]).await;
        scheduler.handle_deploy("nginx:latest", 3).await;
        // The first pass corrects the derived counter, the second finds no
        // drift and writes nothing.
        let first = scheduler.reconcile_deployed_counts().await.unwrap();
        assert_eq!(first, 1);
        let writes_before = ledger.writes();
        let second = scheduler.reconcile_deployed_counts().await.unwrap();
        assert_eq!(second, 0);
        assert_eq!(ledger.writes(), writes_before);
        let details = ledger.image_details("nginx:latest").await.unwrap().unwrap();
        assert_eq!(details.deployed, 3);
    }

    #[tokio::test]
    async fn status_reports_ledger_and_connection_counts() {
        let (scheduler, _ledger) = scheduler_with_members(&["m0", "m1", "m2"]).await;
        let response = scheduler.handle_status().await;
        assert!(response.success);
        assert_eq!(response.total_members, 3);
        assert_eq!(response.connected_count, 1);
        assert_eq!(response.members.len(), 3);
        assert!(response.error.is_none());
    }

    #[tokio::test]
    async fn status_succeeds_on_empty_registry() {
        let (scheduler, _ledger) = scheduler_with_members(&[]).await;
        let response = scheduler.handle_status().await;
        assert!(response.success);
        assert_eq!(response.total_members, 0);
        assert!(response.members.is_empty());
    }

    #[tokio::test]
    async fn registration_revert_counts_as_registered() {
        let (scheduler, ledger) = scheduler_with_members(&[]).await;
        ledger.register_member("self", "0x00").await.unwrap();
        assert!(scheduler.register_self().await);
    }

    #[tokio::test]
    async fn tick_starts_and_stops_assigned_containers() {
        let (scheduler, ledger) = scheduler_with_members(&["self"]).await;
        ledger.set_member_image("self", "nginx:latest").await.unwrap();
        scheduler.tick().await;
        assert_eq!(scheduler.containers.lock().await.len(), 1);
        ledger.set_member_image("self", "").await.unwrap();
        scheduler.tick().await;
        assert!(scheduler.containers.lock().await.is_empty());
    }

    #[test]
    fn container_keys_split_cleanly() {
        let key = container_key("nginx:latest", 0);
        assert_eq!(key, "nginx:latest:0");
        assert_eq!(image_of_key(&key), "nginx:latest");
        assert_eq!(image_of_key("plain"), "plain");
    }
}
