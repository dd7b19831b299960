//! Session-scoped state shared by every acquisition of one test run.
//!
//! A [`Session`] owns the directory all cooperating processes agree on: the
//! per-port creation locks and the [`CreationLedger`] live there. It also keeps
//! the in-process list of containers this process started.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::Serialize;

use crate::config::Config;
use crate::ledger::{CreationLedger, LedgerError};
use crate::lock::FileLock;
use crate::runtime::{ContainerHandle, ContainerRuntime};

/// Outcome of [`Session::sweep`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Containers killed.
    pub killed: Vec<String>,
    /// Containers that were already gone.
    pub missing: Vec<String>,
    /// Containers the engine refused to kill, with the reason.
    pub failed: Vec<(String, String)>,
}

/// Session context passed to every coordinator call.
#[derive(Debug)]
pub struct Session {
    root: PathBuf,
    ledger: CreationLedger,
    created: Mutex<Vec<ContainerHandle>>,
}

impl Session {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let ledger = CreationLedger::in_dir(&root);
        Self {
            root,
            ledger,
            created: Mutex::new(Vec::new()),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(&config.session_dir)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn ledger(&self) -> &CreationLedger {
        &self.ledger
    }

    /// Lock serializing container creation on a host port.
    pub fn creation_lock(&self, port: u16) -> FileLock {
        FileLock::new(self.root.join(format!("pmr_create_container_{port}.lock")))
    }

    /// Remember a container this process started.
    pub fn remember(&self, handle: &ContainerHandle) {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle.clone());
    }

    /// Remember a container and append it to the ledger.
    pub async fn record_creation(&self, handle: &ContainerHandle) -> Result<(), LedgerError> {
        self.remember(handle);
        self.ledger.append_async(&handle.id).await?;
        tracing::debug!("Recorded container {} in {}", handle.name, self.ledger.path().display());
        Ok(())
    }

    /// Containers started by this process, in creation order.
    pub fn created(&self) -> Vec<ContainerHandle> {
        self.created
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Kill every container recorded in the ledger and empty it.
    ///
    /// Only the process that owns the session may call this, once all workers
    /// are done with the shared containers. Containers that are already gone
    /// are dropped from the ledger. Kill failures do not stop the sweep; those
    /// IDs are written back so a later sweep can retry them.
    pub async fn sweep(&self, runtime: &dyn ContainerRuntime) -> Result<SweepReport, LedgerError> {
        let ids = self.ledger.take_async().await?;
        let mut report = SweepReport::default();

        for id in ids {
            let handle = ContainerHandle {
                id: id.clone(),
                name: id.clone(),
            };
            match runtime.kill(&handle).await {
                Ok(()) => report.killed.push(id),
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Container {} already gone", id);
                    report.missing.push(id);
                }
                Err(e) => {
                    tracing::warn!("Failed to kill container {}: {}", id, e);
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        if !report.failed.is_empty() {
            let retained = report.failed.iter().map(|(id, _)| id.clone()).collect();
            self.ledger.extend_async(retained).await?;
        }

        tracing::info!(
            killed = report.killed.len(),
            missing = report.missing.len(),
            failed = report.failed.len(),
            "Swept session containers"
        );
        Ok(report)
    }
}
