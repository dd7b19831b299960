//! pmr: ephemeral database containers for integration tests.
//!
//! Provisions Postgres, MySQL, Mongo, Redis and Redshift-compatible
//! containers on demand and tears them down afterwards. Many independent test
//! processes may ask for the same container at once; in multi-process-safe
//! mode a per-port file lock makes sure exactly one of them creates it, and a
//! session ledger records what was created so the session owner can sweep it.
//!
//! - [`container::Coordinator`]: probe, start, wait for readiness, lease
//! - [`runtime`]: container engine client (Docker via `bollard`)
//! - [`probe`]: per-engine readiness handshakes
//! - [`lock`] / [`ledger`] / [`session`]: cross-process coordination
//! - [`retry`]: the bounded fixed-interval retry used for readiness and
//!   engine connection

pub mod cli;
pub mod config;
pub mod container;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod probe;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod testing;

pub use config::{Config, EngineSettings};
pub use container::{ContainerConfig, ContainerLease, Coordinator, CoordinatorOptions, Engine};
pub use error::ContainerError;
pub use session::Session;
