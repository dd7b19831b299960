//! Ephemeral database containers for integration tests.
//!
//! The [`Coordinator`] hands out ready containers. Many test workers may ask
//! for the same container at once; whoever loses the creation race simply
//! waits for the winner's container to become ready.
//!
//! # Lifecycle
//!
//! ```text
//!   acquire(config)
//!         │
//!         ▼
//!   ┌──────────────┐  healthy   ┌──────────────────────────┐
//!   │ Probe once   │───────────▶│ Lease (AlreadyRunning)   │
//!   │ (lock-free)  │            └──────────────────────────┘
//!   └──────────────┘
//!         │ not ready
//!         ▼
//!   ┌──────────────────────────────────────┐
//!   │ [creation lock, multi-process mode]  │
//!   │ Start container ── conflict ──▶ skip │
//!   │ Record in ledger                     │
//!   └──────────────────────────────────────┘
//!         │
//!         ▼
//!   ┌──────────────┐  exhausted  ┌──────────────────────┐
//!   │ Poll probe   │────────────▶│ ContainerCheckFailed │
//!   │ (retry)      │             └──────────────────────┘
//!   └──────────────┘
//!         │ ready
//!         ▼
//!   Lease (StartedHere / StartedElsewhere) ── release() ──▶ kill if owned
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pmr::config::{Config, EngineSettings};
//! use pmr::container::{Coordinator, CoordinatorOptions, Engine};
//! use pmr::runtime::DockerRuntime;
//! use pmr::session::Session;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = Config::from_env()?;
//! let runtime = DockerRuntime::connect_with_retry(config.docker_api_version, &config.connect).await?;
//! let coordinator = Coordinator::new(
//!     Arc::new(runtime),
//!     Arc::new(Session::from_config(&config)),
//!     CoordinatorOptions::from(&config),
//! );
//!
//! let postgres = EngineSettings::new(Engine::Postgres).to_container_config()?;
//! let lease = coordinator.acquire(&postgres).await?;
//! println!("postgres on {}:{}", lease.host(), lease.port());
//! lease.release().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;

pub use config::{CONTAINER_PREFIX, ContainerConfig, Engine, EngineDefaults, container_name};
pub use coordinator::{
    AcquireState, ContainerEndpoint, ContainerLease, Coordinator, CoordinatorOptions, LeaseOrigin,
};
pub use error::{ContainerError, Result};
