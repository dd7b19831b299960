//! Configuration resolved from environment variables.
//!
//! The caller (test harness or CLI) owns flag parsing; this module only turns
//! `PMR_*` variables into typed settings.

mod engine;
pub(crate) mod helpers;

use std::path::PathBuf;
use std::time::Duration;

pub use engine::EngineSettings;
pub use helpers::{Lookup, process_env};

use crate::config::helpers::{optional_env, parse_bool_env, parse_optional_env};
use crate::error::ConfigError;
use crate::retry::{CONNECT_INTERVAL, CONNECT_RETRIES, DEFAULT_INTERVAL, DEFAULT_RETRIES, RetryPolicy};
use crate::runtime::DockerApiVersion;

/// Coordinator-wide settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Serialize container creation across processes with file locks and
    /// defer teardown to the session sweep.
    pub multiprocess_safe: bool,
    /// Kill containers this process started when their lease is released.
    pub cleanup_container: bool,
    /// Readiness polling budget.
    pub readiness: RetryPolicy,
    /// Engine connection budget.
    pub connect: RetryPolicy,
    pub docker_api_version: DockerApiVersion,
    /// Directory shared by every process of one test session. Holds the
    /// creation locks and the ledger.
    pub session_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            multiprocess_safe: false,
            cleanup_container: true,
            readiness: RetryPolicy::readiness(),
            connect: RetryPolicy::connect(),
            docker_api_version: DockerApiVersion::Auto,
            session_dir: std::env::temp_dir().join("pmr"),
        }
    }
}

impl Config {
    /// Resolve from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(&process_env)
    }

    /// Resolve from an arbitrary variable source.
    ///
    /// Under cargo-nextest's process-per-test mode multi-process-safe mode is
    /// on by default and the session directory is scoped to the nextest run,
    /// so every test process of one run shares locks and ledger.
    pub fn resolve(lookup: Lookup<'_>) -> Result<Self, ConfigError> {
        let nextest_run = optional_env(lookup, "NEXTEST_RUN_ID");
        let process_per_test = optional_env(lookup, "NEXTEST_EXECUTION_MODE")
            .is_some_and(|mode| mode == "process-per-test");

        let session_dir = match optional_env(lookup, "PMR_SESSION_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => match &nextest_run {
                Some(run) => std::env::temp_dir().join(format!("pmr-{run}")),
                None => std::env::temp_dir().join("pmr"),
            },
        };

        let docker_api_version = match optional_env(lookup, "PMR_DOCKER_API_VERSION") {
            Some(raw) => raw.parse::<DockerApiVersion>().map_err(|message| ConfigError::InvalidValue {
                key: "PMR_DOCKER_API_VERSION".to_string(),
                message,
            })?,
            None => DockerApiVersion::Auto,
        };

        Ok(Self {
            multiprocess_safe: parse_bool_env(lookup, "PMR_MULTIPROCESS_SAFE", process_per_test)?,
            cleanup_container: parse_bool_env(lookup, "PMR_CLEANUP_CONTAINER", true)?,
            readiness: RetryPolicy::new(
                parse_optional_env(lookup, "PMR_RETRIES", DEFAULT_RETRIES)?,
                Duration::from_millis(parse_optional_env(
                    lookup,
                    "PMR_RETRY_INTERVAL_MS",
                    DEFAULT_INTERVAL.as_millis() as u64,
                )?),
            ),
            connect: RetryPolicy::new(
                parse_optional_env(lookup, "PMR_CONNECT_RETRIES", CONNECT_RETRIES)?,
                Duration::from_millis(parse_optional_env(
                    lookup,
                    "PMR_CONNECT_INTERVAL_MS",
                    CONNECT_INTERVAL.as_millis() as u64,
                )?),
            ),
            docker_api_version,
            session_dir,
        })
    }
}
