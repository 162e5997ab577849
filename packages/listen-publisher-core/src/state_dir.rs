//! Persistence location abstraction (§3.A, §6.A).
//!
//! [`StateDirProvider`] is a small async seam that lets tests swap in an
//! in-memory implementation instead of touching the real filesystem,
//! while [`FilesystemStateDir`] is the production implementation used by
//! the CLI binary.
//!
//! Every write goes through [`write_atomic`], a write-to-temp-then-rename
//! pattern applied to an arbitrary file name under an arbitrary directory.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::PublisherResult;

/// A named, append-free key/value blob store rooted at one directory per
/// account. Every component (clock state, rate-limit quota, batch-size
/// history, the remote record cache) persists under its own file name
/// within the same provider.
#[async_trait]
pub trait StateDirProvider: Send + Sync {
    /// Reads the named file's raw bytes, or `None` if it doesn't exist.
    async fn read(&self, name: &str) -> PublisherResult<Option<Vec<u8>>>;

    /// Atomically overwrites the named file with `bytes`.
    async fn write(&self, name: &str, bytes: &[u8]) -> PublisherResult<()>;
}

/// Writes `contents` to `dir/name` via a temp-file-then-rename, so a
/// crash or power loss mid-write never leaves a half-written file in
/// place.
pub fn write_atomic(dir: &Path, name: &str, contents: &[u8]) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(name);
    let temp_path = dir.join(format!("{name}.tmp"));
    std::fs::write(&temp_path, contents)?;
    std::fs::rename(&temp_path, &path)
}

/// Filesystem-backed state directory, one per authenticated account, as
/// described in §3.A.
#[derive(Debug, Clone)]
pub struct FilesystemStateDir {
    root: PathBuf,
}

impl FilesystemStateDir {
    /// Roots persistence at `root` (typically
    /// `<state_root>/<account_did>/`), creating it lazily on first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StateDirProvider for FilesystemStateDir {
    async fn read(&self, name: &str) -> PublisherResult<Option<Vec<u8>>> {
        let path = self.root.join(name);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> PublisherResult<()> {
        let root = self.root.clone();
        let name = name.to_string();
        let bytes = bytes.to_vec();
        tokio::task::spawn_blocking(move || write_atomic(&root, &name, &bytes))
            .await
            .map_err(|e| crate::error::PublisherError::Local(e.to_string()))??;
        Ok(())
    }
}

/// In-memory [`StateDirProvider`] for unit tests.
#[derive(Default)]
pub struct InMemoryStateDir {
    files: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryStateDir {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns an `Arc`-wrapped instance for direct injection.
    pub fn arc() -> Arc<dyn StateDirProvider> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl StateDirProvider for InMemoryStateDir {
    async fn read(&self, name: &str) -> PublisherResult<Option<Vec<u8>>> {
        Ok(self.files.lock().get(name).cloned())
    }

    async fn write(&self, name: &str, bytes: &[u8]) -> PublisherResult<()> {
        self.files.lock().insert(name.to_string(), bytes.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_roundtrips_written_bytes() {
        let dir = InMemoryStateDir::new();
        assert!(dir.read("x.json").await.unwrap().is_none());
        dir.write("x.json", b"hello").await.unwrap();
        assert_eq!(dir.read("x.json").await.unwrap().unwrap(), b"hello");
    }

    #[tokio::test]
    async fn filesystem_state_dir_persists_across_instances() {
        let tmp = tempfile::tempdir().unwrap();
        let a = FilesystemStateDir::new(tmp.path());
        a.write("quota.json", b"{\"remaining\":5}").await.unwrap();

        let b = FilesystemStateDir::new(tmp.path());
        let bytes = b.read("quota.json").await.unwrap().unwrap();
        assert_eq!(bytes, b"{\"remaining\":5}");
    }

    #[tokio::test]
    async fn filesystem_state_dir_read_missing_file_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = FilesystemStateDir::new(tmp.path());
        assert!(dir.read("missing.json").await.unwrap().is_none());
    }

    #[test]
    fn write_atomic_leaves_no_temp_file_behind() {
        let tmp = tempfile::tempdir().unwrap();
        write_atomic(tmp.path(), "state.json", b"{}").unwrap();
        assert!(tmp.path().join("state.json").exists());
        assert!(!tmp.path().join("state.json.tmp").exists());
    }
}
