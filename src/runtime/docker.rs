//! [`ContainerRuntime`] backed by the Docker Engine API.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, KillContainerOptions,
    ListContainersOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::{HostConfig, PortBinding};
use bollard::{ClientVersion, Docker};
use futures::StreamExt;

use crate::retry::RetryPolicy;
use crate::runtime::error::RuntimeError;
use crate::runtime::{ContainerHandle, ContainerRuntime, RunSpec, connect_with_retry};

#[cfg(unix)]
const DEFAULT_SOCKET: &str = "/var/run/docker.sock";
#[cfg(windows)]
const DEFAULT_SOCKET: &str = "//./pipe/docker_engine";

/// Seconds before an engine request times out.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Which Docker API version the client speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DockerApiVersion {
    /// Ask the daemon and use the highest version both sides support.
    #[default]
    Auto,
    /// Pin the client to a specific version, e.g. `1.41`.
    Pinned { major: usize, minor: usize },
}

impl std::fmt::Display for DockerApiVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Pinned { major, minor } => write!(f, "{major}.{minor}"),
        }
    }
}

impl FromStr for DockerApiVersion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        let invalid = || format!("invalid docker API version '{s}', expected 'auto' or 'MAJOR.MINOR'");
        let (major, minor) = s.split_once('.').ok_or_else(invalid)?;
        Ok(Self::Pinned {
            major: major.parse().map_err(|_| invalid())?,
            minor: minor.parse().map_err(|_| invalid())?,
        })
    }
}

/// Split `repo[:tag]` so pulls fetch a single tag. Digests are passed through.
fn split_image_reference(image: &str) -> (&str, &str) {
    if image.contains('@') {
        return (image, "");
    }
    let last_segment = image.rsplit('/').next().unwrap_or(image);
    match last_segment.rfind(':') {
        Some(idx) => {
            let split = image.len() - last_segment.len() + idx;
            (&image[..split], &image[split + 1..])
        }
        None => (image, "latest"),
    }
}

fn engine_error(name: &str, e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => RuntimeError::from_response(name, status_code, message),
        other => RuntimeError::Api {
            reason: other.to_string(),
        },
    }
}

fn connect_error(e: BollardError) -> RuntimeError {
    match e {
        BollardError::DockerResponseServerError { message, .. } => RuntimeError::Api { reason: message },
        other => RuntimeError::Unreachable {
            reason: other.to_string(),
        },
    }
}

/// Docker client handle.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Wrap an existing client.
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Connect once and ping the daemon.
    ///
    /// `DOCKER_HOST` is honoured in both modes; a pinned version talks to it
    /// (or the platform default socket) directly.
    pub async fn connect(version: DockerApiVersion) -> Result<Self, RuntimeError> {
        let docker = match version {
            DockerApiVersion::Auto => Docker::connect_with_local_defaults()
                .map_err(connect_error)?
                .negotiate_version()
                .await
                .map_err(connect_error)?,
            DockerApiVersion::Pinned { major, minor } => {
                let host = std::env::var("DOCKER_HOST").unwrap_or_else(|_| DEFAULT_SOCKET.to_string());
                Docker::connect_with_socket(
                    &host,
                    REQUEST_TIMEOUT_SECS,
                    &ClientVersion {
                        major_version: major,
                        minor_version: minor,
                    },
                )
                .map_err(connect_error)?
            }
        };

        docker.ping().await.map_err(connect_error)?;
        tracing::debug!("Connected to Docker (API version {})", version);
        Ok(Self { docker })
    }

    /// [`connect`](Self::connect), retried while the daemon is unreachable.
    pub async fn connect_with_retry(version: DockerApiVersion, policy: &RetryPolicy) -> Result<Self, RuntimeError> {
        connect_with_retry(policy, || Self::connect(version)).await
    }

    /// Pull the image unless it is already present locally.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!("Image '{}' exists locally", image);
            return Ok(());
        }

        tracing::info!("Pulling image: {}", image);

        let (from_image, tag) = split_image_reference(image);
        let options = CreateImageOptions {
            from_image: from_image.to_string(),
            tag: tag.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        tracing::trace!("Pull status: {}", status);
                    }
                }
                Err(e) => {
                    return Err(RuntimeError::ImagePullFailed {
                        image: image.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        tracing::info!("Pulled image: {}", image);
        Ok(())
    }

    fn container_config(spec: &RunSpec) -> Config<String> {
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .ports
            .iter()
            .map(|p| {
                (
                    format!("{}/tcp", p.container_port),
                    Some(vec![PortBinding {
                        host_ip: None,
                        host_port: Some(p.host_port.to_string()),
                    }]),
                )
            })
            .collect();

        // bollard expects HashMap<String, HashMap<(), ()>>
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .ports
            .iter()
            .map(|p| (format!("{}/tcp", p.container_port), HashMap::new()))
            .collect();

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{}={}", k, v)).collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn run(&self, spec: &RunSpec) -> Result<ContainerHandle, RuntimeError> {
        self.ensure_image(&spec.image).await?;

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };
        let created = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| engine_error(&spec.name, e))?;

        // Port collisions surface here, after the name is already taken by our
        // created-but-stopped container. Remove it so the name frees up again.
        if let Err(e) = self
            .docker
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            let _ = self
                .docker
                .remove_container(
                    &created.id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await;
            return Err(engine_error(&spec.name, e));
        }

        Ok(ContainerHandle {
            id: created.id,
            name: spec.name.clone(),
        })
    }

    async fn get(&self, name: &str) -> Result<ContainerHandle, RuntimeError> {
        let info = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
            .map_err(|e| engine_error(name, e))?;

        Ok(ContainerHandle {
            id: info.id.unwrap_or_default(),
            name: info
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
        })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerHandle>, RuntimeError> {
        let mut filters = HashMap::new();
        filters.insert("name".to_string(), vec![prefix.to_string()]);

        let summaries = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| engine_error(prefix, e))?;

        // The engine's name filter is a substring match.
        Ok(summaries
            .into_iter()
            .filter_map(|s| {
                let name = s
                    .names?
                    .into_iter()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .find(|n| n.starts_with(prefix))?;
                Some(ContainerHandle {
                    id: s.id.unwrap_or_default(),
                    name,
                })
            })
            .collect())
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        match self
            .docker
            .kill_container(&handle.id, None::<KillContainerOptions<String>>)
            .await
        {
            Ok(()) => Ok(()),
            // Stopped but not yet auto-removed: as good as gone.
            Err(BollardError::DockerResponseServerError {
                status_code: 409,
                message,
            }) if message.contains("is not running") => Err(RuntimeError::NotFound {
                name: handle.name.clone(),
            }),
            Err(e) => Err(engine_error(&handle.name, e)),
        }
    }
}
