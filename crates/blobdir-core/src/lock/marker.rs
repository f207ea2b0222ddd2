use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use super::Lock;
use crate::blob::{BlobError, BlobResult, BlobStore};
use crate::error::{DirectoryError, DirectoryResult};

/// Cross-machine lock: the marker blob's existence means "locked".
///
/// Obtain is a create-only put, so two machines racing past the
/// existence check cannot both win.
pub struct MarkerLock {
    store: Arc<dyn BlobStore>,
    blob: String,
    name: String,
}

impl MarkerLock {
    /// `blob` is the full remote object name; `name` is written as its body.
    pub fn new(store: Arc<dyn BlobStore>, blob: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            store,
            blob: blob.into(),
            name: name.into(),
        }
    }

    async fn create_marker(&self) -> BlobResult<()> {
        self.store
            .put_blob(&self.blob, self.name.as_bytes().to_vec(), HashMap::new(), false)
            .await
    }
}

#[async_trait]
impl Lock for MarkerLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn obtain(&self) -> DirectoryResult<bool> {
        if self.is_locked().await? {
            return Ok(false);
        }
        let result = match self.create_marker().await {
            Err(e) if e.needs_container() => {
                warn!(lock = %self.name, "container missing, creating and retrying");
                self.store.ensure_container().await?;
                self.create_marker().await
            }
            other => other,
        };
        match result {
            Ok(()) => {
                info!(lock = %self.name, "lock obtained");
                Ok(true)
            }
            Err(BlobError::Conflict(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn release(&self) -> DirectoryResult<()> {
        if !self.is_locked().await? {
            return Ok(());
        }
        self.store.delete_blob(&self.blob).await?;
        if self.store.blob_exists(&self.blob).await? {
            return Err(DirectoryError::LockReleaseFailed(self.name.clone()));
        }
        info!(lock = %self.name, "lock released");
        Ok(())
    }

    async fn is_locked(&self) -> DirectoryResult<bool> {
        match self.store.blob_exists(&self.blob).await {
            Ok(exists) => Ok(exists),
            Err(e) if e.needs_container() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    #[tokio::test]
    async fn test_marker_lock_cycle() {
        let store = Arc::new(MemoryBlobStore::new("c"));
        let a = MarkerLock::new(store.clone(), "idx/write.lock", "a");
        let b = MarkerLock::new(store.clone(), "idx/write.lock", "b");

        assert!(a.obtain().await.unwrap());
        assert!(!b.obtain().await.unwrap());
        assert!(b.is_locked().await.unwrap());
        assert_eq!(store.get_blob("idx/write.lock").await.unwrap().data, b"a");

        a.release().await.unwrap();
        assert!(!a.is_locked().await.unwrap());
        a.release().await.unwrap();
        assert!(b.obtain().await.unwrap());
    }

    #[tokio::test]
    async fn test_marker_lock_creates_container() {
        let store = Arc::new(MemoryBlobStore::without_container("c"));
        let lock = MarkerLock::new(store.clone(), "write.lock", "write.lock");
        assert!(!lock.is_locked().await.unwrap());
        assert!(lock.obtain().await.unwrap());
        assert_eq!(store.blob_names(), vec!["write.lock"]);
    }

    #[tokio::test]
    async fn test_concurrent_obtain_has_one_winner() {
        let store = Arc::new(MemoryBlobStore::new("c"));
        let mut tasks = Vec::new();
        for i in 0..8 {
            let lock = MarkerLock::new(store.clone(), "write.lock", format!("m{i}"));
            tasks.push(tokio::spawn(async move { lock.obtain().await.unwrap() }));
        }
        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }
}
