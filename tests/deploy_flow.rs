//! End-to-end deployment flows over the in-process ledger: the scheduler
//! operations exactly as the peer protocol and HTTP surface drive them.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use canteen::cluster::ClusterView;
use canteen::codec::{CapacityCodec, CodecMode};
use canteen::ledger::{Ledger, MemoryLedger};
use canteen::protocol::{decode_frame, Reply, MAX_STATUS_RESPONSE_LEN};
use canteen::runtime::ContainerRuntime;
use canteen::scheduler::Scheduler;

struct FixedView {
    id: String,
    peers: Vec<String>,
}

impl ClusterView for FixedView {
    fn local_id(&self) -> String {
        self.id.clone()
    }
    fn connected_peers(&self) -> Vec<String> {
        self.peers.clone()
    }
}

struct NoopRuntime;

#[async_trait]
impl ContainerRuntime for NoopRuntime {
    async fn start(&self, key: &str, _image: &str) -> Result<String> {
        Ok(format!("container-{}", key))
    }
    async fn stop(&self, _key: &str, _container_id: &str) -> Result<()> {
        Ok(())
    }
    async fn prune_exited(&self) -> Result<usize> {
        Ok(0)
    }
}

async fn cluster_of(member_ids: &[&str]) -> (Arc<Scheduler>, Arc<MemoryLedger>) {
    let ledger = Arc::new(MemoryLedger::new());
    for id in member_ids {
        ledger
            .register_member(id, "0x005a4d41")
            .await
            .expect("registration");
    }
    let view = Arc::new(FixedView {
        id: "operator".into(),
        peers: member_ids.iter().map(|id| id.to_string()).collect(),
    });
    let scheduler = Arc::new(Scheduler::new(
        view,
        ledger.clone(),
        Arc::new(NoopRuntime),
        CapacityCodec::from_mode(CodecMode::Masked, ""),
        4096,
    ));
    (scheduler, ledger)
}

#[tokio::test]
async fn deploy_three_replicas_across_five_members() {
    let (scheduler, ledger) = cluster_of(&["m0", "m1", "m2", "m3", "m4"]).await;

    let response = scheduler.handle_deploy("nginx:latest", 3).await;
    assert!(response.success);
    assert_eq!(response.image.as_deref(), Some("nginx:latest"));
    assert_eq!(response.replicas, Some(3));

    let mut carriers = Vec::new();
    for index in 0..ledger.member_count().await.unwrap() {
        let id = ledger.member_at(index).await.unwrap().unwrap();
        if !ledger.member_images(&id).await.unwrap().is_empty() {
            carriers.push(id);
        }
    }
    assert_eq!(carriers, vec!["m0", "m1", "m2"]);
}

#[tokio::test]
async fn deploy_ten_replicas_across_two_members_reports_two() {
    let (scheduler, _ledger) = cluster_of(&["m0", "m1"]).await;

    let response = scheduler.handle_deploy("nginx:latest", 10).await;
    assert!(response.success);
    assert_eq!(response.replicas, Some(2));

    let outcome = scheduler.assign_first_n("nginx:latest", 10).await.unwrap();
    let distinct: HashSet<String> = outcome.assigned.iter().cloned().collect();
    assert_eq!(distinct.len(), 2);
}

#[tokio::test]
async fn undeploy_of_unknown_image_is_trivially_successful() {
    let (scheduler, ledger) = cluster_of(&["m0", "m1", "m2"]).await;

    let writes_before = ledger.writes();
    let removal = scheduler.clear_carriers("missing:latest").await.unwrap();
    assert!(removal.removed.is_empty());
    assert!(removal.failed.is_empty());

    let response = scheduler.handle_undeploy("missing:latest").await;
    assert!(response.success);
    assert_eq!(ledger.writes(), writes_before);
}

#[tokio::test]
async fn undeploy_clears_catalog_and_carriers() {
    let (scheduler, ledger) = cluster_of(&["m0", "m1", "m2"]).await;
    scheduler.handle_deploy("nginx:latest", 2).await;

    let response = scheduler.handle_undeploy("nginx:latest").await;
    assert!(response.success);
    assert!(ledger
        .image_details("nginx:latest")
        .await
        .unwrap()
        .is_none());
    for id in ["m0", "m1", "m2"] {
        assert!(ledger.member_images(id).await.unwrap().is_empty());
    }
}

#[tokio::test]
async fn repeated_reconciliation_settles_after_one_correction() {
    let (scheduler, ledger) = cluster_of(&["m0", "m1", "m2"]).await;
    scheduler.handle_deploy("nginx:latest", 3).await;

    assert_eq!(scheduler.reconcile_deployed_counts().await.unwrap(), 1);

    let writes_after_first = ledger.writes();
    for _ in 0..3 {
        assert_eq!(scheduler.reconcile_deployed_counts().await.unwrap(), 0);
    }
    assert_eq!(ledger.writes(), writes_after_first);
}

#[tokio::test]
async fn status_snapshot_matches_ledger_and_fits_its_frame() {
    let (scheduler, _ledger) = cluster_of(&["m0", "m1", "m2", "m3"]).await;

    let response = scheduler.handle_status().await;
    assert!(response.success);
    assert_eq!(response.total_members, 4);
    assert_eq!(response.connected_count, 4);

    let frame = Reply::Status(response.clone()).to_frame().unwrap();
    let (payload, consumed) = decode_frame(&frame, MAX_STATUS_RESPONSE_LEN).unwrap();
    assert_eq!(consumed, frame.len());
    let decoded: canteen::protocol::StatusResponse = serde_json::from_slice(payload).unwrap();
    assert_eq!(decoded, response);
}
