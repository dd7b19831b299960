//! Container engine client.
//!
//! [`ContainerRuntime`] is the narrow slice of the engine API the coordinator
//! needs: run, look up by name, list, kill. [`DockerRuntime`] implements it on
//! top of `bollard`; tests use [`crate::testing::StubRuntime`].

pub mod docker;
pub mod error;

use std::future::Future;

use async_trait::async_trait;

pub use docker::{DockerApiVersion, DockerRuntime};
pub use error::RuntimeError;

use crate::container::ContainerConfig;
use crate::retry::{RetryPolicy, retry};

/// Reference to a running container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Engine-assigned container ID.
    pub id: String,
    /// Container name (without the leading `/` Docker reports).
    pub name: String,
}

/// A port published from the container to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host_port: u16,
    pub container_port: u16,
}

/// Everything needed to start a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSpec {
    pub image: String,
    pub name: String,
    pub ports: Vec<PortMapping>,
    pub env: Vec<(String, String)>,
    /// Remove the container once it stops.
    pub auto_remove: bool,
}

impl RunSpec {
    /// Run parameters for a container config: detached, auto-removed, with
    /// the config's deterministic name.
    pub fn from_config(config: &ContainerConfig) -> Self {
        Self {
            image: config.image().to_string(),
            name: config.container_name().to_string(),
            ports: vec![PortMapping {
                host_port: config.host_port(),
                container_port: config.container_port(),
            }],
            env: config.env().to_vec(),
            auto_remove: true,
        }
    }
}

/// Operations the lifecycle coordinator needs from a container engine.
///
/// Implementations must report naming and port collisions as
/// [`RuntimeError::Conflict`] so concurrent creators can tell "someone else
/// got there first" apart from real failures.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a detached container, pulling the image if needed.
    async fn run(&self, spec: &RunSpec) -> Result<ContainerHandle, RuntimeError>;

    /// Look up a container by name.
    async fn get(&self, name: &str) -> Result<ContainerHandle, RuntimeError>;

    /// Containers whose name starts with `prefix`, running or not.
    async fn list(&self, prefix: &str) -> Result<Vec<ContainerHandle>, RuntimeError>;

    /// Kill a container. An already-gone container is
    /// [`RuntimeError::NotFound`].
    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError>;

    /// Release the connection to the engine.
    ///
    /// Clients that close their connection on drop, such as bollard's
    /// [`Docker`](bollard::Docker), keep this default.
    fn close(&self) {}
}

/// Retry an engine connection while the control endpoint is unreachable.
///
/// The socket is frequently not up yet when a CI job starts, so only
/// [`RuntimeError::Unreachable`] is retried; anything else is returned at once.
pub async fn connect_with_retry<R, F, Fut>(policy: &RetryPolicy, connect: F) -> Result<R, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<R, RuntimeError>>,
{
    retry(policy, RuntimeError::is_unreachable, connect).await
}
