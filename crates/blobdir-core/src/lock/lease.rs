use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{Lock, CHECK_LEASE};
use crate::blob::{BlobError, BlobResult, BlobStore};
use crate::error::{DirectoryError, DirectoryResult};

struct Held {
    lease_id: String,
    renewal: JoinHandle<()>,
}

/// Cross-machine lock built on the store's native leases.
///
/// While held, a background task renews the lease every `renew`
/// interval. The task is aborted on release and when the lock is dropped;
/// a crashed holder loses the lock once the lease runs out.
pub struct LeaseLock {
    store: Arc<dyn BlobStore>,
    blob: String,
    name: String,
    duration: Duration,
    renew: Duration,
    held: Mutex<Option<Held>>,
}

impl LeaseLock {
    pub fn new(
        store: Arc<dyn BlobStore>,
        blob: impl Into<String>,
        name: impl Into<String>,
        duration: Duration,
        renew: Duration,
    ) -> Self {
        Self {
            store,
            blob: blob.into(),
            name: name.into(),
            duration,
            renew,
            held: Mutex::new(None),
        }
    }

    /// Lease id while this instance holds the lock.
    pub fn lease_id(&self) -> Option<String> {
        self.held.lock().as_ref().map(|h| h.lease_id.clone())
    }

    async fn create_blob(&self) -> BlobResult<()> {
        match self
            .store
            .put_blob(&self.blob, self.name.as_bytes().to_vec(), HashMap::new(), false)
            .await
        {
            Err(BlobError::Conflict(_)) => Ok(()),
            other => other,
        }
    }

    /// The lease needs an object to attach to.
    async fn ensure_blob(&self) -> DirectoryResult<()> {
        match self.create_blob().await {
            Err(e) if e.needs_container() => {
                warn!(lock = %self.name, "container missing, creating and retrying");
                self.store.ensure_container().await?;
                Ok(self.create_blob().await?)
            }
            other => Ok(other?),
        }
    }

    fn spawn_renewal(&self, lease_id: String) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let blob = self.blob.clone();
        let every = self.renew;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.renew_lease(&blob, &lease_id).await {
                    Ok(()) => debug!(blob = %blob, "lease renewed"),
                    Err(e) => warn!(blob = %blob, error = %e, "lease renewal failed"),
                }
            }
        })
    }
}

#[async_trait]
impl Lock for LeaseLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn obtain(&self) -> DirectoryResult<bool> {
        if self.held.lock().is_some() {
            return Ok(false);
        }
        self.ensure_blob().await?;

        let lease_id = match self.store.acquire_lease(&self.blob, self.duration).await {
            Ok(id) => id,
            Err(BlobError::Conflict(_)) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let renewal = self.spawn_renewal(lease_id.clone());
        let mut held = self.held.lock();
        if let Some(previous) = held.replace(Held { lease_id, renewal }) {
            previous.renewal.abort();
        }
        info!(lock = %self.name, "lease obtained");
        Ok(true)
    }

    async fn release(&self) -> DirectoryResult<()> {
        let Some(held) = self.held.lock().take() else {
            return Ok(());
        };
        held.renewal.abort();
        match self.store.release_lease(&self.blob, &held.lease_id).await {
            Ok(()) => {
                info!(lock = %self.name, "lease released");
                Ok(())
            }
            // Expired and taken over, or the blob was removed under us.
            Err(BlobError::Conflict(_)) | Err(BlobError::NotFound(_)) => {
                Err(DirectoryError::LockReleaseFailed(self.name.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn is_locked(&self) -> DirectoryResult<bool> {
        if self.held.lock().is_some() {
            return Ok(true);
        }
        match self.store.acquire_lease(&self.blob, CHECK_LEASE).await {
            Ok(trial) => {
                self.store.release_lease(&self.blob, &trial).await?;
                Ok(false)
            }
            Err(BlobError::Conflict(_)) => Ok(true),
            Err(e) if e.is_not_found() || e.needs_container() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for LeaseLock {
    fn drop(&mut self) {
        if let Some(held) = self.held.get_mut().take() {
            held.renewal.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn lease_lock(store: &Arc<MemoryBlobStore>, owner: &str) -> LeaseLock {
        LeaseLock::new(
            store.clone(),
            "idx/write.lock",
            owner,
            Duration::from_secs(60),
            Duration::from_secs(30),
        )
    }

    #[tokio::test]
    async fn test_lease_lock_cycle() {
        let store = Arc::new(MemoryBlobStore::new("c"));
        let a = lease_lock(&store, "a");
        let b = lease_lock(&store, "b");

        assert!(!b.is_locked().await.unwrap());
        assert!(a.obtain().await.unwrap());
        assert!(a.lease_id().is_some());
        assert!(!b.obtain().await.unwrap());
        assert!(b.is_locked().await.unwrap());

        a.release().await.unwrap();
        assert!(a.lease_id().is_none());
        assert!(!b.is_locked().await.unwrap());
        assert!(b.obtain().await.unwrap());
        b.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_lease_alive() {
        let store = Arc::new(MemoryBlobStore::new("c"));
        let a = lease_lock(&store, "a");
        let b = lease_lock(&store, "b");
        assert!(a.obtain().await.unwrap());

        // Well past the lease duration; renewals keep it held.
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        assert!(!b.obtain().await.unwrap());
        a.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_holder_expires() {
        let store = Arc::new(MemoryBlobStore::new("c"));
        let a = lease_lock(&store, "a");
        let b = lease_lock(&store, "b");
        assert!(a.obtain().await.unwrap());
        drop(a);

        assert!(!b.obtain().await.unwrap());
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(b.obtain().await.unwrap());
    }
}
