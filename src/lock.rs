//! Cross-process file locking.
//!
//! Test runners fan out into independent OS processes that all want "the"
//! Postgres container. Thread-level mutexes cannot coordinate them, so
//! creation and ledger updates are serialized with an advisory exclusive lock
//! on a file in a directory every process can see.
//!
//! Uses `fs4` (flock on Unix, LockFileEx on Windows). The lock belongs to the
//! open file handle, so two handles opened by the same process also exclude
//! each other, which is what lets concurrent tasks in one test binary share
//! this mechanism with sibling processes.

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use fs4::FileExt;
use thiserror::Error;
use tracing::debug;

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to create lock file {path}: {source}")]
    CreateFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to acquire lock {path}: {source}")]
    AcquireFailed {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Lock task did not complete: {0}")]
    Task(String),
}

/// A named lock file. Cheap to construct; nothing touches the filesystem until
/// [`acquire`](Self::acquire).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLock {
    path: PathBuf,
}

/// Holds the exclusive lock until dropped.
#[derive(Debug)]
pub struct FileLockGuard {
    _file: File,
    path: PathBuf,
}

impl FileLockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLockGuard {
    fn drop(&mut self) {
        // Closing the handle releases the lock.
        debug!("Releasing lock: {}", self.path.display());
    }
}

impl FileLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Lock guarding the file at `path`, stored next to it as `<path>.lock`.
    ///
    /// - `/tmp/pmr.json` → `/tmp/pmr.json.lock`
    /// - `/tmp/state` → `/tmp/state.lock`
    pub fn sibling_of(path: &Path) -> Self {
        let mut name = path.as_os_str().to_owned();
        name.push(".lock");
        Self::new(PathBuf::from(name))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File, LockError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| LockError::CreateFailed {
                path: self.path.clone(),
                source,
            })?;
        }

        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|source| LockError::CreateFailed {
                path: self.path.clone(),
                source,
            })
    }

    /// Acquire the lock, blocking the calling thread until it is free.
    pub fn acquire(&self) -> Result<FileLockGuard, LockError> {
        debug!("Waiting for lock: {}", self.path.display());
        let file = self.open()?;

        FileExt::lock_exclusive(&file).map_err(|source| LockError::AcquireFailed {
            path: self.path.clone(),
            source,
        })?;

        debug!("Acquired lock: {}", self.path.display());
        Ok(FileLockGuard {
            _file: file,
            path: self.path.clone(),
        })
    }

    /// Acquire the lock if nobody else holds it. `Ok(None)` means contended.
    pub fn try_acquire(&self) -> Result<Option<FileLockGuard>, LockError> {
        let file = self.open()?;

        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(FileLockGuard {
                _file: file,
                path: self.path.clone(),
            })),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(source) => Err(LockError::AcquireFailed {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// [`acquire`](Self::acquire) on the blocking pool so the async runtime
    /// keeps making progress while another process holds the lock.
    pub async fn acquire_async(&self) -> Result<FileLockGuard, LockError> {
        let lock = self.clone();
        tokio::task::spawn_blocking(move || lock.acquire())
            .await
            .map_err(|e| LockError::Task(e.to_string()))?
    }
}
