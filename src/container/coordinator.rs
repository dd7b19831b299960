//! Create-or-reuse-then-wait-ready container acquisition.

use std::future::Future;
use std::sync::Arc;

use crate::config::Config;
use crate::container::config::ContainerConfig;
use crate::container::error::{ContainerError, Result};
use crate::probe::NotReady;
use crate::retry::{RetryPolicy, retry};
use crate::runtime::{ContainerHandle, ContainerRuntime, RunSpec};
use crate::session::Session;

/// Where an acquisition's step through the lifecycle currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    /// Nothing known about the container yet.
    Unchecked,
    /// The single lock-free probe failed.
    Absent,
    /// Start attempted (here or elsewhere), waiting for readiness.
    Starting,
    /// Accepting connections.
    RunningHealthy,
    /// Readiness budget exhausted or start failed.
    Failed,
}

/// How the healthy container came to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaseOrigin {
    /// Healthy on the first probe; someone else owns it.
    AlreadyRunning,
    /// This process started it.
    StartedHere,
    /// A concurrent creator won the name/port race.
    StartedElsewhere,
}

/// Knobs the coordinator needs from [`Config`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorOptions {
    pub multiprocess_safe: bool,
    pub cleanup: bool,
    pub readiness: RetryPolicy,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            multiprocess_safe: false,
            cleanup: true,
            readiness: RetryPolicy::readiness(),
        }
    }
}

impl From<&Config> for CoordinatorOptions {
    fn from(config: &Config) -> Self {
        Self {
            multiprocess_safe: config.multiprocess_safe,
            cleanup: config.cleanup_container,
            readiness: config.readiness,
        }
    }
}

/// Acquires ready containers on behalf of one test process.
///
/// Each acquisition is sequential: probe once, start if needed, then poll
/// readiness. Run several acquisitions on separate tasks, threads or
/// processes for concurrency; in multi-process-safe mode the per-port creation
/// lock guarantees a single creator per container.
pub struct Coordinator {
    runtime: Arc<dyn ContainerRuntime>,
    session: Arc<Session>,
    options: CoordinatorOptions,
}

impl Coordinator {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        session: Arc<Session>,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            runtime,
            session,
            options,
        }
    }

    pub fn options(&self) -> &CoordinatorOptions {
        &self.options
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Get a ready container for `config`, starting one if necessary.
    pub async fn acquire(&self, config: &ContainerConfig) -> Result<ContainerLease> {
        let name = config.container_name();
        let mut state = AcquireState::Unchecked;

        // Lock-free: a healthy container is never ours to start or kill.
        match config.probe().check(config).await {
            Ok(()) => {
                transition(name, &mut state, AcquireState::RunningHealthy);
                tracing::debug!("Container {} already running on port {}", name, config.host_port());
                return Ok(self.lease(config, None, LeaseOrigin::AlreadyRunning));
            }
            Err(e) => {
                tracing::debug!("Initial probe of {} failed: {}", name, e.reason);
                transition(name, &mut state, AcquireState::Absent);
            }
        }

        let started = match self.start_exclusive(config).await {
            Ok(started) => started,
            Err(e) => {
                transition(name, &mut state, AcquireState::Failed);
                return Err(e);
            }
        };
        transition(name, &mut state, AcquireState::Starting);

        let policy = self.options.readiness;
        let readiness = retry(&policy, |_: &NotReady| true, || config.probe().check(config)).await;

        if let Err(not_ready) = readiness {
            transition(name, &mut state, AcquireState::Failed);
            if let Some(handle) = &started
                && self.kill_eligible()
            {
                kill_logged(self.runtime.as_ref(), handle).await;
            }
            return Err(ContainerError::ContainerCheckFailed {
                name: name.to_string(),
                attempts: policy.effective_attempts(),
                reason: not_ready.reason,
            });
        }
        transition(name, &mut state, AcquireState::RunningHealthy);

        let origin = if started.is_some() {
            LeaseOrigin::StartedHere
        } else {
            LeaseOrigin::StartedElsewhere
        };
        Ok(self.lease(config, started, origin))
    }

    /// Acquire, run `f`, then release, whatever `f` returned.
    ///
    /// If `f` panics the lease's drop still schedules the kill.
    pub async fn with_container<F, Fut, T>(&self, config: &ContainerConfig, f: F) -> Result<T>
    where
        F: FnOnce(ContainerEndpoint) -> Fut,
        Fut: Future<Output = T>,
    {
        let lease = self.acquire(config).await?;
        let output = f(lease.endpoint()).await;
        lease.release().await;
        Ok(output)
    }

    /// Start the container, serialized by the creation lock in
    /// multi-process-safe mode. `None` means a concurrent creator won.
    async fn start_exclusive(&self, config: &ContainerConfig) -> Result<Option<ContainerHandle>> {
        if !self.options.multiprocess_safe {
            let started = self.start(config).await?;
            if let Some(handle) = &started {
                self.session.remember(handle);
            }
            return Ok(started);
        }

        let lock = self.session.creation_lock(config.host_port());
        let _guard = lock.acquire_async().await?;
        tracing::debug!("Holding creation lock {}", lock.path().display());

        let started = self.start(config).await?;
        if let Some(handle) = &started
            && let Err(e) = self.session.record_creation(handle).await
        {
            // Unrecorded means no sweep would ever find it.
            kill_logged(self.runtime.as_ref(), handle).await;
            return Err(e.into());
        }
        Ok(started)
    }

    async fn start(&self, config: &ContainerConfig) -> Result<Option<ContainerHandle>> {
        let spec = RunSpec::from_config(config);
        match self.runtime.run(&spec).await {
            Ok(handle) => {
                tracing::info!(
                    "Started container {} ({}) from {} on port {}",
                    handle.name,
                    short_id(&handle.id),
                    spec.image,
                    config.host_port()
                );
                Ok(Some(handle))
            }
            Err(e) if e.is_conflict() => {
                tracing::debug!("Container {} is being started elsewhere: {}", spec.name, e);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn kill_eligible(&self) -> bool {
        self.options.cleanup && !self.options.multiprocess_safe
    }

    fn lease(
        &self,
        config: &ContainerConfig,
        handle: Option<ContainerHandle>,
        origin: LeaseOrigin,
    ) -> ContainerLease {
        let kill_on_release = origin == LeaseOrigin::StartedHere && self.kill_eligible();
        ContainerLease {
            endpoint: ContainerEndpoint {
                container_name: config.container_name().to_string(),
                host: config.host().to_string(),
                port: config.host_port(),
            },
            handle,
            origin,
            kill_on_release,
            runtime: Arc::clone(&self.runtime),
            released: false,
        }
    }
}

fn transition(name: &str, state: &mut AcquireState, next: AcquireState) {
    tracing::debug!("Container {}: {:?} -> {:?}", name, state, next);
    *state = next;
}

fn short_id(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}

async fn kill_logged(runtime: &dyn ContainerRuntime, handle: &ContainerHandle) {
    match runtime.kill(handle).await {
        Ok(()) => tracing::info!("Killed container {}", handle.name),
        Err(e) if e.is_not_found() => {
            tracing::debug!("Container {} already gone", handle.name)
        }
        Err(e) => tracing::warn!("Failed to kill container {}: {}", handle.name, e),
    }
}

/// Where a ready container can be reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerEndpoint {
    pub container_name: String,
    pub host: String,
    pub port: u16,
}

/// A ready container held for the duration of a test.
///
/// Call [`release`](Self::release) when done. Dropping an unreleased lease that
/// owns its container schedules the kill on the current tokio runtime.
pub struct ContainerLease {
    endpoint: ContainerEndpoint,
    handle: Option<ContainerHandle>,
    origin: LeaseOrigin,
    kill_on_release: bool,
    runtime: Arc<dyn ContainerRuntime>,
    released: bool,
}

impl std::fmt::Debug for ContainerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerLease")
            .field("endpoint", &self.endpoint)
            .field("handle", &self.handle)
            .field("origin", &self.origin)
            .field("kill_on_release", &self.kill_on_release)
            .finish_non_exhaustive()
    }
}

impl ContainerLease {
    pub fn endpoint(&self) -> ContainerEndpoint {
        self.endpoint.clone()
    }

    pub fn container_name(&self) -> &str {
        &self.endpoint.container_name
    }

    pub fn host(&self) -> &str {
        &self.endpoint.host
    }

    pub fn port(&self) -> u16 {
        self.endpoint.port
    }

    /// Set only when this process started the container.
    pub fn handle(&self) -> Option<&ContainerHandle> {
        self.handle.as_ref()
    }

    pub fn origin(&self) -> LeaseOrigin {
        self.origin
    }

    /// Whether releasing this lease kills the container.
    pub fn owns_container(&self) -> bool {
        self.kill_on_release
    }

    /// End the lease, killing the container if this process owns it.
    ///
    /// Teardown failures are logged, never returned.
    pub async fn release(mut self) {
        self.released = true;
        if !self.kill_on_release {
            return;
        }
        if let Some(handle) = self.handle.take() {
            kill_logged(self.runtime.as_ref(), &handle).await;
        }
    }
}

impl Drop for ContainerLease {
    fn drop(&mut self) {
        if self.released || !self.kill_on_release {
            return;
        }
        let Some(handle) = self.handle.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                let runtime = Arc::clone(&self.runtime);
                rt.spawn(async move {
                    kill_logged(runtime.as_ref(), &handle).await;
                });
            }
            Err(_) => tracing::warn!(
                "ContainerLease for {} dropped outside a runtime, container may remain running",
                handle.name
            ),
        }
    }
}
