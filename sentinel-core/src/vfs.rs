//! Virtual filesystem contract: write/read/delete, named checkpoints, and
//! commits. `InMemoryVfs` is the only adapter shipped here; the real
//! content-addressed store is a collaborator this crate does not implement.
//!
//! Grounded on `core/src/rollout.rs`'s append-only session log, generalized
//! to a full read/write/checkpoint/restore/commit/snapshot contract.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::CycleError;

#[async_trait]
pub trait VfsAdapter: Send + Sync {
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), CycleError>;
    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, CycleError>;
    async fn delete(&self, path: &str) -> Result<(), CycleError>;
    async fn checkpoint(&self, label: &str) -> Result<String, CycleError>;
    async fn restore(&self, id: &str) -> Result<(), CycleError>;
    async fn commit(&self, message: &str, author: &str) -> Result<String, CycleError>;
    async fn snapshot(&self) -> Result<HashMap<String, Vec<u8>>, CycleError>;
}

#[derive(Debug, Clone)]
struct Commit {
    message: String,
    author: String,
    files: HashMap<String, Vec<u8>>,
}

struct Inner {
    files: HashMap<String, Vec<u8>>,
    checkpoints: HashMap<String, HashMap<String, Vec<u8>>>,
    commits: Vec<Commit>,
}

/// Reference VFS backed by process memory. Sufficient to exercise the full
/// cycle and its tests; not a production store.
pub struct InMemoryVfs {
    inner: Mutex<Inner>,
}

impl InMemoryVfs {
    pub fn new() -> Self {
        InMemoryVfs {
            inner: Mutex::new(Inner {
                files: HashMap::new(),
                checkpoints: HashMap::new(),
                commits: Vec::new(),
            }),
        }
    }

    pub fn seed(&self, files: impl IntoIterator<Item = (String, Vec<u8>)>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.files.extend(files);
    }

    pub fn commit_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.commits.len()
    }

    pub fn last_commit_message(&self) -> Option<String> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.commits.last().map(|c| c.message.clone())
    }
}

impl Default for InMemoryVfs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VfsAdapter for InMemoryVfs {
    async fn write(&self, path: &str, bytes: Vec<u8>) -> Result<(), CycleError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.files.insert(path.to_string(), bytes);
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Vec<u8>>, CycleError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.files.get(path).cloned())
    }

    async fn delete(&self, path: &str) -> Result<(), CycleError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.files.remove(path);
        Ok(())
    }

    async fn checkpoint(&self, label: &str) -> Result<String, CycleError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let id = format!("{label}-{}", Uuid::new_v4());
        inner.checkpoints.insert(id.clone(), inner.files.clone());
        Ok(id)
    }

    async fn restore(&self, id: &str) -> Result<(), CycleError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let snapshot = inner
            .checkpoints
            .get(id)
            .cloned()
            .ok_or_else(|| CycleError::RestoreFailed(format!("unknown checkpoint {id}")))?;
        inner.files = snapshot;
        Ok(())
    }

    async fn commit(&self, message: &str, author: &str) -> Result<String, CycleError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let files = inner.files.clone();
        inner.commits.push(Commit {
            message: message.to_string(),
            author: author.to_string(),
            files,
        });
        Ok(format!("v{}", inner.commits.len()))
    }

    async fn snapshot(&self) -> Result<HashMap<String, Vec<u8>>, CycleError> {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        Ok(inner.files.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn checkpoint_restore_round_trips_exactly() {
        let vfs = InMemoryVfs::new();
        vfs.write("/a.txt", b"one".to_vec()).await.unwrap();
        let cp = vfs.checkpoint("pre-apply").await.unwrap();
        vfs.write("/a.txt", b"two".to_vec()).await.unwrap();
        vfs.write("/b.txt", b"new".to_vec()).await.unwrap();
        vfs.restore(&cp).await.unwrap();
        let snapshot = vfs.snapshot().await.unwrap();
        assert_eq!(snapshot.get("/a.txt"), Some(&b"one".to_vec()));
        assert_eq!(snapshot.get("/b.txt"), None);
    }

    #[tokio::test]
    async fn restore_unknown_checkpoint_fails() {
        let vfs = InMemoryVfs::new();
        let err = vfs.restore("nope").await.unwrap_err();
        assert!(matches!(err, CycleError::RestoreFailed(_)));
    }

    #[tokio::test]
    async fn commit_records_message_and_author() {
        let vfs = InMemoryVfs::new();
        vfs.write("/a.txt", b"x".to_vec()).await.unwrap();
        let version = vfs.commit("Turn 1: add greet()", "sentinel").await.unwrap();
        assert_eq!(version, "v1");
        assert_eq!(
            vfs.last_commit_message().as_deref(),
            Some("Turn 1: add greet()")
        );
    }
}
