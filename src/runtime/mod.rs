//! Container runtime seam. The scheduler drives deployments through this
//! trait; container semantics stay with the runtime behind it.

use anyhow::Result;
use async_trait::async_trait;

pub mod docker;
pub use docker::DockerRuntime;

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Pull `image` and start a container for it under the given key.
    /// Returns the runtime's container id.
    async fn start(&self, key: &str, image: &str) -> Result<String>;

    /// Stop and remove a container previously started under `key`.
    async fn stop(&self, key: &str, container_id: &str) -> Result<()>;

    /// Remove exited containers left over from earlier runs. Returns how
    /// many were removed.
    async fn prune_exited(&self) -> Result<usize>;
}
