//! In-memory stand-ins for the container engine and readiness probes.
//!
//! Provides:
//! - [`StubRuntime`]: a [`ContainerRuntime`] that tracks containers in memory
//!   and reports name collisions the way Docker does
//! - [`StubProbe`]: a [`ReadinessProbe`] with scripted outcomes
//!
//! Both count calls so tests can assert on how often the coordinator reached
//! out to the engine or polled readiness.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pmr::container::{ContainerConfig, Coordinator, CoordinatorOptions};
//! use pmr::session::Session;
//! use pmr::testing::{StubProbe, StubRuntime};
//!
//! # async fn example() {
//! let runtime = Arc::new(StubRuntime::new());
//! let probe = StubProbe::ready_when_running(runtime.clone());
//! let session = Arc::new(Session::new(std::env::temp_dir().join("pmr-example")));
//! let coordinator = Coordinator::new(runtime.clone(), session, CoordinatorOptions::default());
//!
//! let config = ContainerConfig::custom("db", "postgres:9.6.10-alpine", 5532, 5432, probe);
//! let lease = coordinator.acquire(&config).await.unwrap();
//! assert_eq!(runtime.successful_runs(), 1);
//! lease.release().await;
//! # }
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::container::ContainerConfig;
use crate::probe::{NotReady, ReadinessProbe};
use crate::runtime::{ContainerHandle, ContainerRuntime, RunSpec, RuntimeError};

/// In-memory container engine.
///
/// Supports:
/// - Duplicate-name rejection with Docker's conflict message
/// - Forced start failures via [`fail_runs_with()`](Self::fail_runs_with)
/// - Forced kill failures via [`fail_kills_with()`](Self::fail_kills_with)
/// - Call counting for run and kill
#[derive(Debug, Default)]
pub struct StubRuntime {
    containers: Mutex<HashMap<String, ContainerHandle>>,
    run_failure: Mutex<Option<String>>,
    kill_failure: Mutex<Option<String>>,
    next_id: AtomicU32,
    run_calls: AtomicU32,
    successful_runs: AtomicU32,
    kill_calls: AtomicU32,
}

impl StubRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `run` fail with this engine message.
    ///
    /// The message is classified like a real engine response, so
    /// "port is already allocated" becomes a conflict and anything else an
    /// API error.
    pub fn fail_runs_with(&self, message: &str) {
        *lock(&self.run_failure) = Some(message.to_string());
    }

    /// Let `run` succeed again.
    pub fn clear_run_failure(&self) {
        *lock(&self.run_failure) = None;
    }

    /// Make every subsequent `kill` fail with this engine message, leaving
    /// the container running.
    pub fn fail_kills_with(&self, message: &str) {
        *lock(&self.kill_failure) = Some(message.to_string());
    }

    pub fn clear_kill_failure(&self) {
        *lock(&self.kill_failure) = None;
    }

    pub fn run_calls(&self) -> u32 {
        self.run_calls.load(Ordering::SeqCst)
    }

    /// Runs that actually created a container.
    pub fn successful_runs(&self) -> u32 {
        self.successful_runs.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> u32 {
        self.kill_calls.load(Ordering::SeqCst)
    }

    pub fn running_count(&self) -> usize {
        lock(&self.containers).len()
    }

    pub fn is_running(&self, name: &str) -> bool {
        lock(&self.containers).contains_key(name)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl ContainerRuntime for StubRuntime {
    async fn run(&self, spec: &RunSpec) -> Result<ContainerHandle, RuntimeError> {
        self.run_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(message) = lock(&self.run_failure).clone() {
            return Err(RuntimeError::from_response(&spec.name, 500, message));
        }

        let mut containers = lock(&self.containers);
        if let Some(existing) = containers.get(&spec.name) {
            return Err(RuntimeError::from_response(
                &spec.name,
                409,
                format!(
                    "Conflict. The container name \"/{}\" is already in use by container \"{}\". \
                     You have to remove (or rename) that container to be able to reuse that name.",
                    spec.name, existing.id
                ),
            ));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = ContainerHandle {
            id: format!("{n:064x}"),
            name: spec.name.clone(),
        };
        containers.insert(spec.name.clone(), handle.clone());
        self.successful_runs.fetch_add(1, Ordering::SeqCst);
        Ok(handle)
    }

    async fn get(&self, name: &str) -> Result<ContainerHandle, RuntimeError> {
        lock(&self.containers)
            .get(name)
            .cloned()
            .ok_or_else(|| RuntimeError::NotFound {
                name: name.to_string(),
            })
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ContainerHandle>, RuntimeError> {
        let mut found: Vec<_> = lock(&self.containers)
            .values()
            .filter(|h| h.name.starts_with(prefix))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(found)
    }

    async fn kill(&self, handle: &ContainerHandle) -> Result<(), RuntimeError> {
        self.kill_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = lock(&self.kill_failure).clone() {
            return Err(RuntimeError::from_response(&handle.name, 500, message));
        }

        let mut containers = lock(&self.containers);
        // Docker accepts either an ID or a name.
        let key = containers
            .iter()
            .find(|(name, h)| h.id == handle.id || **name == handle.name)
            .map(|(name, _)| name.clone());
        match key {
            Some(key) => {
                containers.remove(&key);
                Ok(())
            }
            None => Err(RuntimeError::NotFound {
                name: handle.name.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
enum ProbeMode {
    Ready,
    NeverReady,
    FailFirst(u32),
    WhenRunning(Arc<StubRuntime>),
}

/// Scripted readiness probe. Clones share the call counter.
#[derive(Debug, Clone)]
pub struct StubProbe {
    mode: ProbeMode,
    calls: Arc<AtomicU32>,
}

impl StubProbe {
    fn with_mode(mode: ProbeMode) -> Self {
        Self {
            mode,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn always_ready() -> Self {
        Self::with_mode(ProbeMode::Ready)
    }

    pub fn never_ready() -> Self {
        Self::with_mode(ProbeMode::NeverReady)
    }

    /// Not ready for the first `n` checks, ready afterwards.
    pub fn fail_first(n: u32) -> Self {
        Self::with_mode(ProbeMode::FailFirst(n))
    }

    /// Ready whenever the runtime has a container with the config's name.
    pub fn ready_when_running(runtime: Arc<StubRuntime>) -> Self {
        Self::with_mode(ProbeMode::WhenRunning(runtime))
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ReadinessProbe for StubProbe {
    async fn check(&self, config: &ContainerConfig) -> Result<(), NotReady> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let ready = match &self.mode {
            ProbeMode::Ready => true,
            ProbeMode::NeverReady => false,
            ProbeMode::FailFirst(failures) => n > *failures,
            ProbeMode::WhenRunning(runtime) => runtime.is_running(config.container_name()),
        };
        if ready {
            Ok(())
        } else {
            Err(NotReady::new(format!("stub probe check #{n} not ready")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::TcpProbe;

    fn spec(name: &str) -> RunSpec {
        RunSpec::from_config(&ContainerConfig::custom(name, "img", 1, 1, TcpProbe))
    }

    #[tokio::test]
    async fn test_duplicate_name_is_conflict() {
        let runtime = StubRuntime::new();
        runtime.run(&spec("a")).await.unwrap();

        let err = runtime.run(&spec("a")).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(runtime.run_calls(), 2);
        assert_eq!(runtime.successful_runs(), 1);
    }

    #[tokio::test]
    async fn test_forced_failure() {
        let runtime = StubRuntime::new();
        runtime.fail_runs_with("no space left on device");
        let err = runtime.run(&spec("a")).await.unwrap_err();
        assert_eq!(
            err,
            RuntimeError::Api {
                reason: "no space left on device".to_string()
            }
        );

        runtime.clear_run_failure();
        assert!(runtime.run(&spec("a")).await.is_ok());
    }

    #[tokio::test]
    async fn test_forced_kill_failure() {
        let runtime = StubRuntime::new();
        let a = runtime.run(&spec("a")).await.unwrap();
        runtime.fail_kills_with("engine busy");

        let err = runtime.kill(&a).await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(runtime.is_running("pmr_a"));

        runtime.clear_kill_failure();
        runtime.kill(&a).await.unwrap();
        assert!(!runtime.is_running("pmr_a"));
    }

    #[tokio::test]
    async fn test_get_list_kill() {
        let runtime = StubRuntime::new();
        let a = runtime.run(&spec("a")).await.unwrap();
        runtime.run(&spec("b")).await.unwrap();

        assert_eq!(runtime.get("pmr_a").await.unwrap(), a);
        assert_eq!(runtime.list("pmr_").await.unwrap().len(), 2);

        runtime.kill(&a).await.unwrap();
        assert!(runtime.get("pmr_a").await.unwrap_err().is_not_found());
        assert!(runtime.kill(&a).await.unwrap_err().is_not_found());
        assert_eq!(runtime.kill_calls(), 2);
    }

    #[tokio::test]
    async fn test_probe_modes() {
        let config = ContainerConfig::custom("a", "img", 1, 1, TcpProbe);

        let probe = StubProbe::fail_first(2);
        assert!(probe.check(&config).await.is_err());
        assert!(probe.check(&config).await.is_err());
        assert!(probe.check(&config).await.is_ok());
        assert_eq!(probe.clone().calls(), 3);

        let runtime = Arc::new(StubRuntime::new());
        let probe = StubProbe::ready_when_running(runtime.clone());
        assert!(probe.check(&config).await.is_err());
        runtime.run(&RunSpec::from_config(&config)).await.unwrap();
        assert!(probe.check(&config).await.is_ok());
    }
}
