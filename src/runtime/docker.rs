use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use futures_util::stream::StreamExt;
use log::{debug, info, warn};

use super::ContainerRuntime;

const STOP_GRACE_SECS: i64 = 10;

pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon using default settings.
    /// This handles the unix socket on Linux.
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to Docker daemon")?;
        Ok(Self { docker })
    }

    async fn pull(&self, image: &str) -> Result<()> {
        debug!("Pulling image {}...", image);
        let options = CreateImageOptions {
            from_image: image,
            ..Default::default()
        };
        let mut progress = self.docker.create_image(Some(options), None, None);
        while let Some(step) = progress.next().await {
            step.with_context(|| format!("failed to pull image {}", image))?;
        }
        debug!("Image pulled: {}", image);
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, key: &str, image: &str) -> Result<String> {
        self.pull(image).await?;

        let name = container_name(key);
        let options = CreateContainerOptions {
            name: name.as_str(),
            platform: None,
        };
        let config = Config {
            image: Some(image),
            host_config: Some(HostConfig {
                publish_all_ports: Some(true),
                ..Default::default()
            }),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("failed to create container for {}", image))?;
        self.docker
            .start_container::<String>(&created.id, None)
            .await
            .with_context(|| format!("failed to start container {}", short_id(&created.id)))?;
        info!("Container started: {} ({})", short_id(&created.id), image);
        Ok(created.id)
    }

    async fn stop(&self, key: &str, container_id: &str) -> Result<()> {
        debug!("Stopping container {} ({})", short_id(container_id), key);
        if let Err(e) = self
            .docker
            .stop_container(container_id, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            // The container may already be gone; removal below decides.
            warn!("Stop of {} reported: {}", short_id(container_id), e);
        }
        self.docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
            .with_context(|| format!("failed to remove container {}", short_id(container_id)))?;
        debug!("Container removed: {}", short_id(container_id));
        Ok(())
    }

    async fn prune_exited(&self) -> Result<usize> {
        let mut filters = HashMap::new();
        filters.insert("status", vec!["exited"]);
        let options = ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        };
        let exited = self
            .docker
            .list_containers(Some(options))
            .await
            .context("failed to list exited containers")?;
        let mut removed = 0;
        for container in exited {
            let Some(id) = container.id else { continue };
            match self.docker.remove_container(&id, None).await {
                Ok(()) => {
                    debug!("Removed exited container {}", short_id(&id));
                    removed += 1;
                }
                Err(e) => warn!("Failed to remove exited container {}: {}", short_id(&id), e),
            }
        }
        if removed > 0 {
            info!("Cleaned up {} exited container(s)", removed);
        }
        Ok(removed)
    }
}

/// Container names cannot carry the separators image references use.
fn container_name(key: &str) -> String {
    let safe: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("canteen-{}", safe)
}

fn short_id(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_names_are_sanitized() {
        assert_eq!(container_name("nginx:latest:0"), "canteen-nginx-latest-0");
        assert_eq!(
            container_name("registry.io/app:1.2:3"),
            "canteen-registry.io-app-1.2-3"
        );
    }

    #[test]
    fn short_id_handles_short_input() {
        assert_eq!(short_id("abcdef"), "abcdef");
        assert_eq!(short_id("0123456789abcdef"), "0123456789ab");
    }
}
