//! Persisted record of containers created during a test session.
//!
//! The ledger is a JSON array of container IDs. Every read-modify-write runs
//! under the sibling `<path>.lock` file lock so appends from concurrent
//! processes are never lost. A missing file reads as an empty ledger.
//!
//! Writes go to `<path>.tmp` and are renamed over the ledger, so a crash
//! mid-write leaves the previous contents intact.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::lock::{FileLock, LockError};

/// Errors from ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Lock(#[from] LockError),

    #[error("Ledger I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Ledger at {path} is not a JSON array of strings: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to serialize ledger for {path}: {source}")]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Ledger task did not complete: {0}")]
    Task(String),
}

/// Lock-protected JSON list of container IDs.
#[derive(Debug, Clone)]
pub struct CreationLedger {
    path: PathBuf,
    lock: FileLock,
}

impl CreationLedger {
    /// File name used inside a session directory.
    pub const FILE_NAME: &'static str = "pmr.json";

    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lock = FileLock::sibling_of(&path);
        Self { path, lock }
    }

    /// The ledger for a session directory.
    pub fn in_dir(dir: &Path) -> Self {
        Self::new(dir.join(Self::FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` over the current entries while holding the lock, then persist
    /// whatever `f` left behind.
    pub fn update<T>(&self, f: impl FnOnce(&mut Vec<String>) -> T) -> Result<T, LedgerError> {
        let _guard = self.lock.acquire()?;
        let mut ids = self.load()?;
        let out = f(&mut ids);
        self.store(&ids)?;
        Ok(out)
    }

    /// Append a container ID.
    pub fn append(&self, id: &str) -> Result<(), LedgerError> {
        self.update(|ids| ids.push(id.to_string()))
    }

    /// Append several container IDs in one locked write.
    pub fn extend(&self, new_ids: &[String]) -> Result<(), LedgerError> {
        if new_ids.is_empty() {
            return Ok(());
        }
        self.update(|ids| ids.extend_from_slice(new_ids))
    }

    /// Read all entries in append order.
    pub fn read(&self) -> Result<Vec<String>, LedgerError> {
        let _guard = self.lock.acquire()?;
        self.load()
    }

    /// Remove and return every entry, leaving an empty ledger.
    pub fn take(&self) -> Result<Vec<String>, LedgerError> {
        self.update(std::mem::take)
    }

    /// [`append`](Self::append) on the blocking pool.
    pub async fn append_async(&self, id: &str) -> Result<(), LedgerError> {
        let ledger = self.clone();
        let id = id.to_string();
        tokio::task::spawn_blocking(move || ledger.append(&id))
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }

    /// [`extend`](Self::extend) on the blocking pool.
    pub async fn extend_async(&self, ids: Vec<String>) -> Result<(), LedgerError> {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || ledger.extend(&ids))
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }

    /// [`take`](Self::take) on the blocking pool.
    pub async fn take_async(&self) -> Result<Vec<String>, LedgerError> {
        let ledger = self.clone();
        tokio::task::spawn_blocking(move || ledger.take())
            .await
            .map_err(|e| LedgerError::Task(e.to_string()))?
    }

    fn load(&self) -> Result<Vec<String>, LedgerError> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let raw = fs::read(&self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })?;
        if raw.iter().all(u8::is_ascii_whitespace) {
            return Ok(Vec::new());
        }
        serde_json::from_slice(&raw).map_err(|source| LedgerError::Parse {
            path: self.path.clone(),
            source,
        })
    }

    fn store(&self, ids: &[String]) -> Result<(), LedgerError> {
        let payload = serde_json::to_vec(ids).map_err(|source| LedgerError::Serialize {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.tmp_path();
        fs::write(&tmp, payload).map_err(|source| LedgerError::Io {
            path: tmp.clone(),
            source,
        })?;
        fs::rename(&tmp, &self.path).map_err(|source| LedgerError::Io {
            path: self.path.clone(),
            source,
        })
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.clone().into_os_string();
        name.push(".tmp");
        PathBuf::from(name)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let ledger = CreationLedger::in_dir(dir.path());
        assert_eq!(ledger.read().unwrap(), Vec::<String>::new());
        assert!(!ledger.path().exists());
    }

    #[test]
    fn test_append_preserves_order() {
        let dir = TempDir::new().unwrap();
        let ledger = CreationLedger::in_dir(dir.path());
        ledger.append("a").unwrap();
        ledger.append("b").unwrap();
        assert_eq!(ledger.read().unwrap(), vec!["a".to_string(), "b".to_string()]);

        let on_disk: Vec<String> =
            serde_json::from_slice(&fs::read(ledger.path()).unwrap()).unwrap();
        assert_eq!(on_disk, vec!["a", "b"]);
    }

    #[test]
    fn test_take_empties() {
        let dir = TempDir::new().unwrap();
        let ledger = CreationLedger::in_dir(dir.path());
        ledger.append("x").unwrap();
        assert_eq!(ledger.take().unwrap(), vec!["x".to_string()]);
        assert!(ledger.read().unwrap().is_empty());
    }

    #[test]
    fn test_corrupt_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let ledger = CreationLedger::in_dir(dir.path());
        fs::write(ledger.path(), b"{\"not\": \"a list\"}").unwrap();
        assert!(matches!(ledger.read(), Err(LedgerError::Parse { .. })));
    }

    #[test]
    fn test_store_leaves_no_temp_file() {
        let dir = TempDir::new().unwrap();
        let ledger = CreationLedger::in_dir(dir.path());
        ledger.append("a").unwrap();

        assert_eq!(ledger.tmp_path(), dir.path().join("pmr.json.tmp"));
        assert!(!ledger.tmp_path().exists());
        assert_eq!(ledger.read().unwrap(), vec!["a".to_string()]);
    }

    #[test]
    fn test_stale_temp_file_is_overwritten() {
        let dir = TempDir::new().unwrap();
        let ledger = CreationLedger::in_dir(dir.path());
        ledger.append("a").unwrap();
        // Left behind by a writer that died before the rename.
        fs::write(ledger.tmp_path(), b"[\"half").unwrap();

        ledger.append("b").unwrap();

        assert_eq!(ledger.read().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert!(!ledger.tmp_path().exists());
    }

    #[test]
    fn test_extend_appends_in_order() {
        let dir = TempDir::new().unwrap();
        let ledger = CreationLedger::in_dir(dir.path());
        ledger.append("a").unwrap();
        ledger.extend(&["b".to_string(), "c".to_string()]).unwrap();
        ledger.extend(&[]).unwrap();
        assert_eq!(ledger.read().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_lock_file_is_sibling() {
        let ledger = CreationLedger::new("/tmp/session/pmr.json");
        assert_eq!(ledger.lock.path(), Path::new("/tmp/session/pmr.json.lock"));
    }

    #[tokio::test]
    async fn test_async_wrappers() {
        let dir = TempDir::new().unwrap();
        let ledger = CreationLedger::in_dir(dir.path());
        ledger.append_async("one").await.unwrap();
        ledger.append_async("two").await.unwrap();
        assert_eq!(ledger.take_async().await.unwrap(), vec!["one", "two"]);
    }
}
