//! HTTP surface: cluster info, health, and deployment endpoints backed by
//! the scheduler. Failures surface as structured JSON, never a panic.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use log::{error, info};
use serde::Deserialize;
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::cluster::ClusterView;
use crate::scheduler::Scheduler;

#[derive(Clone)]
pub struct ApiState {
    pub scheduler: Arc<Scheduler>,
    pub cluster: Arc<dyn ClusterView>,
}

pub async fn serve(addr: SocketAddr, state: ApiState) {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(cluster_info))
        .route("/cluster", get(cluster_info))
        .route("/health", get(health))
        .route("/deploy", post(deploy))
        .route("/undeploy", post(undeploy))
        .layer(cors)
        .with_state(state);

    info!("Starting web server on http://{}", addr);
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind web server on {}: {}", addr, e);
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        error!("Web server failed: {}", e);
    }
}

/// Ledger membership with per-member connection status. The ledger is the
/// source of truth for membership; connectivity is the local view.
async fn cluster_info(State(state): State<ApiState>) -> impl IntoResponse {
    let self_id = state.cluster.local_id();
    match state.scheduler.registry_members().await {
        Ok(members) => {
            let connected = state.cluster.connected_peers();
            let member_details: Vec<_> = members
                .iter()
                .map(|id| {
                    json!({
                        "peer_id": id,
                        "connected": connected.contains(id) || *id == self_id,
                        "is_self": *id == self_id,
                    })
                })
                .collect();
            (
                StatusCode::OK,
                Json(json!({
                    "members": members,
                    "member_details": member_details,
                    "self": self_id,
                    "connected_peers": connected,
                    "total_members": members.len(),
                    "connected_count": connected.len(),
                })),
            )
        }
        Err(e) => {
            error!("Error getting cluster info: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({
                    "error": e.to_string(),
                    "members": [],
                    "self": self_id,
                })),
            )
        }
    }
}

async fn health(State(state): State<ApiState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "peer_id": state.cluster.local_id(),
        "capacity_codec": state.scheduler.codec_mode(),
    }))
}

#[derive(Deserialize)]
struct DeployBody {
    image: Option<String>,
    replicas: Option<i64>,
}

async fn deploy(
    State(state): State<ApiState>,
    Json(body): Json<DeployBody>,
) -> impl IntoResponse {
    let Some(image) = body.image.filter(|image| !image.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Image name is required" })),
        );
    };
    let replicas = body.replicas.unwrap_or(1);
    if replicas < 1 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Replicas must be a positive integer" })),
        );
    }

    match state.scheduler.assign_first_n(&image, replicas as u32).await {
        Ok(outcome) => {
            if outcome.total_members == 0 {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(json!({ "success": false, "error": "No members in cluster" })),
                );
            }
            (
                StatusCode::OK,
                Json(json!({
                    "success": !outcome.assigned.is_empty(),
                    "image": image,
                    "requested_replicas": replicas,
                    "actual_replicas": outcome.assigned.len(),
                    "assigned_nodes": outcome.assigned,
                    "failed_nodes": outcome.failed,
                    "total_members": outcome.total_members,
                })),
            )
        }
        Err(e) => {
            error!("Deployment error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}

#[derive(Deserialize)]
struct UndeployBody {
    image: Option<String>,
}

async fn undeploy(
    State(state): State<ApiState>,
    Json(body): Json<UndeployBody>,
) -> impl IntoResponse {
    let Some(image) = body.image.filter(|image| !image.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "success": false, "error": "Image name is required" })),
        );
    };

    match state.scheduler.clear_carriers(&image).await {
        Ok(outcome) => (
            StatusCode::OK,
            Json(json!({
                "success": outcome.failed.is_empty(),
                "image": image,
                "removed_from": outcome.removed,
                "failed": outcome.failed,
                "total_removed": outcome.removed.len(),
            })),
        ),
        Err(e) => {
            error!("Undeployment error: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "error": e.to_string() })),
            )
        }
    }
}
