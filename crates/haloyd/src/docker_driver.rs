//! Docker Driver: the only module that touches the Docker Engine API
//! directly. Inspects the managed network before creating it, then
//! creates each replica with an endpoint alias on that private bridge
//! network and port-binds only what the app exposes.

use std::collections::HashMap;
use std::time::Duration;

use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder,
    InspectContainerOptions, InspectNetworkOptionsBuilder, ListContainersOptionsBuilder,
    LogsOptionsBuilder, PushImageOptionsBuilder, RemoveContainerOptionsBuilder, RemoveImageOptionsBuilder,
    StartContainerOptions, StopContainerOptionsBuilder, TagImageOptionsBuilder,
};
use bollard::secret::{ContainerCreateBody, EndpointSettings, HostConfig, NetworkCreateRequest, NetworkingConfig};
use futures_util::{Stream, StreamExt, TryStreamExt};
use http_body_util::BodyExt;
use haloyd_common::app::{App, ImageSource};
use haloyd_common::docker::DockerContext;
use haloyd_common::labels::ManagedLabels;
use haloyd_common::DeploymentId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("container {0} has no ip address on the managed network")]
    NoContainerIp(String),
}

pub type Result<T> = std::result::Result<T, DriverError>;

/// A running replica, as reported back to the Deployment Engine /
/// Config Compositor for router wiring.
#[derive(Debug, Clone)]
pub struct Replica {
    pub container_name: String,
    pub ip_address: String,
    pub port: u16,
    pub deployment: DeploymentId,
}

const STOP_GRACE: Duration = Duration::from_secs(10);

pub struct DockerDriver {
    ctx: DockerContext,
}

impl DockerDriver {
    pub fn new(ctx: DockerContext) -> Self {
        Self { ctx }
    }

    pub async fn ensure_network(&self) -> Result<()> {
        let exists = self
            .ctx
            .docker
            .inspect_network(&self.ctx.network_name, Some(InspectNetworkOptionsBuilder::new().verbose(true).build()))
            .await
            .is_ok();
        if !exists {
            self.ctx
                .docker
                .create_network(NetworkCreateRequest {
                    name: self.ctx.network_name.clone(),
                    ..Default::default()
                })
                .await?;
        }
        Ok(())
    }

    /// Pulls a `Registry` image; a no-op for `Local` (already loaded
    /// via the layer-upload/assemble flow — pulling it would fail or
    /// shadow the freshly assembled image).
    pub async fn ensure_image_up_to_date(&self, image: &ImageSource) -> Result<()> {
        match image {
            ImageSource::Local { .. } => Ok(()),
            ImageSource::Registry { reference } => {
                let opts = CreateImageOptionsBuilder::new().from_image(reference).build();
                let mut stream = self.ctx.docker.create_image(Some(opts), None, self.ctx.registry_auth.clone());
                while let Some(progress) = stream.try_next().await? {
                    tracing::debug!(?progress, "pulling image");
                }
                Ok(())
            }
        }
    }

    pub async fn tag_image(&self, source_reference: &str, app_name: &str, deployment: &DeploymentId) -> Result<()> {
        let opts = TagImageOptionsBuilder::new()
            .repo(app_name)
            .tag(&deployment.to_string())
            .build();
        self.ctx.docker.tag_image(source_reference, Some(opts)).await?;
        Ok(())
    }

    fn container_name(app_name: &str, deployment: &DeploymentId, replica_index: u32) -> String {
        format!("{app_name}-{deployment}-{replica_index}")
    }

    pub async fn list_app_containers(&self, app_name: &str, deployment: Option<&DeploymentId>) -> Result<Vec<String>> {
        let selector = ManagedLabels::selector(app_name, deployment);
        let opts = ListContainersOptionsBuilder::new()
            .all(true)
            .filters(&HashMap::from([("label".to_owned(), selector)]))
            .build();
        let containers = self.ctx.docker.list_containers(Some(opts)).await?;
        Ok(containers
            .into_iter()
            .filter_map(|c| c.names.and_then(|n| n.into_iter().next()))
            .map(|n| n.trim_start_matches('/').to_owned())
            .collect())
    }

    /// Same selector as `list_app_containers`, but inspects each match
    /// to resolve its managed-network ip and the port it was labeled
    /// with, for the Health Monitor and Config Compositor.
    pub async fn list_replicas(&self, app_name: &str, deployment: Option<&DeploymentId>) -> Result<Vec<Replica>> {
        let names = self.list_app_containers(app_name, deployment).await?;
        let mut replicas = Vec::with_capacity(names.len());
        for container_name in names {
            let inspected = match self
                .ctx
                .docker
                .inspect_container(&container_name, None::<InspectContainerOptions>)
                .await
            {
                Ok(i) => i,
                Err(_) => continue,
            };
            let Some(ip_address) = inspected
                .network_settings
                .as_ref()
                .and_then(|ns| ns.networks.as_ref())
                .and_then(|nets| nets.get(&self.ctx.network_name))
                .and_then(|ep| ep.ip_address.clone())
                .filter(|ip| !ip.is_empty())
            else {
                continue;
            };
            let Some(labels) = inspected
                .config
                .as_ref()
                .and_then(|c| c.labels.as_ref())
                .and_then(ManagedLabels::from_map)
            else {
                continue;
            };
            replicas.push(Replica { container_name, ip_address, port: labels.port, deployment: labels.deployment });
        }
        Ok(replicas)
    }

    /// Graceful stop (SIGTERM, `STOP_GRACE` to exit) for every
    /// container matching the selector. Split from `remove_containers`
    /// so the rolling strategy can stop old replicas before removing
    /// them.
    pub async fn stop_containers(&self, names: &[String]) -> Result<()> {
        let opts = StopContainerOptionsBuilder::new().t(STOP_GRACE.as_secs() as i32).build();
        for name in names {
            self.ctx.docker.stop_container(name, Some(opts.clone())).await.ok();
        }
        Ok(())
    }

    pub async fn remove_containers(&self, names: &[String]) -> Result<()> {
        let opts = RemoveContainerOptionsBuilder::new().v(true).force(true).build();
        for name in names {
            self.ctx.docker.remove_container(name, Some(opts.clone())).await.ok();
        }
        Ok(())
    }

    pub async fn ensure_volumes(&self, app_name: &str, volumes: &[haloyd_common::app::VolumeMount]) -> Result<()> {
        for v in volumes {
            let volume_name = format!("{app_name}-{}", v.name);
            if self.ctx.docker.inspect_volume(&volume_name).await.is_err() {
                self.ctx
                    .docker
                    .create_volume(bollard::query_parameters::CreateVolumeOptions {
                        name: volume_name,
                        ..Default::default()
                    })
                    .await?;
            }
        }
        Ok(())
    }

    /// Starts `app.replicas` fresh containers for `deployment`, each
    /// joined to the managed network with an endpoint alias equal to
    /// its own name (so replicas can't accidentally resolve each
    /// other under the app's bare name). Returns their ip/port so the
    /// caller can publish a router snapshot once health-checked.
    pub async fn run_replicas(
        &self,
        app: &App,
        deployment: &DeploymentId,
        image_reference: &str,
        resolved_env: &HashMap<String, String>,
    ) -> Result<Vec<Replica>> {
        self.ensure_network().await?;
        let mut replicas = Vec::with_capacity(app.replicas as usize);

        for i in 0..app.replicas {
            let container_name = Self::container_name(&app.name, deployment, i);
            self.ctx
                .docker
                .remove_container(
                    &container_name,
                    Some(RemoveContainerOptionsBuilder::new().v(true).force(true).build()),
                )
                .await
                .ok();

            let labels = ManagedLabels {
                app: app.name.clone(),
                deployment: *deployment,
                port: app.port,
                health_path: app.health_check_path.clone(),
            };

            self.ctx
                .docker
                .create_container(
                    Some(CreateContainerOptionsBuilder::new().name(&container_name).build()),
                    ContainerCreateBody {
                        image: Some(image_reference.to_owned()),
                        env: Some(resolved_env.iter().map(|(k, v)| format!("{k}={v}")).collect()),
                        labels: Some(labels.to_map()),
                        networking_config: Some(NetworkingConfig {
                            endpoints_config: Some(HashMap::from([(
                                self.ctx.network_name.clone(),
                                EndpointSettings {
                                    aliases: Some(vec![container_name.clone()]),
                                    ..Default::default()
                                },
                            )])),
                        }),
                        host_config: Some(HostConfig {
                            binds: Some(
                                app.volumes
                                    .iter()
                                    .map(|v| format!("{app_name}-{vol}:{target}", app_name = app.name, vol = v.name, target = v.target))
                                    .collect(),
                            ),
                            ..Default::default()
                        }),
                        ..Default::default()
                    },
                )
                .await?;

            self.ctx
                .docker
                .start_container(&container_name, None::<StartContainerOptions>)
                .await?;

            let inspected = self
                .ctx
                .docker
                .inspect_container(&container_name, None::<InspectContainerOptions>)
                .await?;
            let ip_address = inspected
                .network_settings
                .and_then(|ns| ns.networks)
                .and_then(|nets| nets.get(&self.ctx.network_name).cloned())
                .and_then(|ep| ep.ip_address)
                .filter(|ip| !ip.is_empty())
                .ok_or_else(|| DriverError::NoContainerIp(container_name.clone()))?;

            replicas.push(Replica {
                container_name,
                ip_address,
                port: app.port,
                deployment: *deployment,
            });
        }

        Ok(replicas)
    }

    /// Follows a single container's combined stdout/stderr from the
    /// moment it's called (no backlog — the Log Hub's ring buffer
    /// covers replay for late subscribers).
    pub fn container_logs(&self, container_name: &str) -> impl Stream<Item = Result<bollard::container::LogOutput>> + '_ {
        let opts = LogsOptionsBuilder::new()
            .follow(true)
            .stdout(true)
            .stderr(true)
            .tail("0")
            .build();
        self.ctx
            .docker
            .logs(container_name, Some(opts))
            .map(|item| item.map_err(DriverError::from))
    }

    /// Deletes local `<app>:<deploymentId>` image tags for deployments
    /// the Durable Store has already pruned.
    pub async fn remove_images(&self, app_name: &str, deployments: &[DeploymentId]) -> Result<()> {
        for d in deployments {
            let reference = format!("{app_name}:{d}");
            let opts = RemoveImageOptionsBuilder::new().force(false).build();
            self.ctx.docker.remove_image(&reference, Some(opts), None).await.ok();
        }
        Ok(())
    }

    pub async fn load_image_tar(&self, tar_path: &std::path::Path) -> Result<()> {
        let bytes = tokio::fs::read(tar_path).await?;
        let body = http_body_util::Full::new(bytes.into())
            .map_err(|never: std::convert::Infallible| match never {})
            .boxed();
        let mut stream = self.ctx.docker.import_image(
            bollard::query_parameters::ImportImageOptionsBuilder::new().build(),
            body,
        );
        while let Some(progress) = stream.try_next().await? {
            tracing::debug!(?progress, "loading image tar");
        }
        Ok(())
    }

    pub async fn push_image(&self, app_name: &str, deployment: &DeploymentId) -> Result<()> {
        let opts = PushImageOptionsBuilder::new().tag(&deployment.to_string()).build();
        let mut stream = self.ctx.docker.push_image(app_name, Some(opts), self.ctx.registry_auth.clone());
        while let Some(progress) = stream.try_next().await? {
            tracing::debug!(?progress, "pushing image");
        }
        Ok(())
    }
}
