//! In-memory blob store.
//!
//! Used for tests and for simulating several machines sharing one remote:
//! wrap it in an `Arc` and hand the same instance to each directory.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

use super::{Blob, BlobError, BlobProperties, BlobResult, BlobStore};
use crate::clock::now_millis;

#[derive(Debug, Clone)]
struct ActiveLease {
    id: String,
    duration: Duration,
    expires: Instant,
}

impl ActiveLease {
    fn is_live(&self) -> bool {
        Instant::now() < self.expires
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    data: Vec<u8>,
    metadata: HashMap<String, String>,
    last_modified: i64,
    lease: Option<ActiveLease>,
}

impl StoredBlob {
    fn properties(&self, name: &str) -> BlobProperties {
        BlobProperties {
            name: name.to_string(),
            length: self.data.len() as u64,
            last_modified: self.last_modified,
            metadata: self.metadata.clone(),
        }
    }

    fn live_lease(&self) -> Option<&ActiveLease> {
        self.lease.as_ref().filter(|l| l.is_live())
    }
}

#[derive(Debug)]
struct Inner {
    container_exists: bool,
    blobs: BTreeMap<String, StoredBlob>,
}

/// In-memory [`BlobStore`] with lease support.
///
/// Thread-safe via internal `RwLock`. All data is lost when dropped.
#[derive(Debug)]
pub struct MemoryBlobStore {
    container: String,
    inner: RwLock<Inner>,
    offline: AtomicBool,
}

impl MemoryBlobStore {
    /// Create a store whose container already exists.
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
            inner: RwLock::new(Inner {
                container_exists: true,
                blobs: BTreeMap::new(),
            }),
            offline: AtomicBool::new(false),
        }
    }

    /// Create a store whose container has not been created yet.
    pub fn without_container(container: impl Into<String>) -> Self {
        let store = Self::new(container);
        store.inner.write().container_exists = false;
        store
    }

    /// Simulate a network partition: every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Names of all stored blobs, sorted.
    pub fn blob_names(&self) -> Vec<String> {
        self.inner.read().blobs.keys().cloned().collect()
    }

    fn check_online(&self) -> BlobResult<()> {
        if self.offline.load(Ordering::SeqCst) {
            Err(BlobError::Unavailable(self.location()))
        } else {
            Ok(())
        }
    }

    fn check_container(&self, inner: &Inner) -> BlobResult<()> {
        if inner.container_exists {
            Ok(())
        } else {
            Err(BlobError::ContainerNotFound(self.container.clone()))
        }
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    fn location(&self) -> String {
        format!("memory://{}", self.container)
    }

    async fn ensure_container(&self) -> BlobResult<()> {
        self.check_online()?;
        self.inner.write().container_exists = true;
        Ok(())
    }

    async fn list_blobs(&self, prefix: &str) -> BlobResult<Vec<BlobProperties>> {
        self.check_online()?;
        let inner = self.inner.read();
        self.check_container(&inner)?;
        Ok(inner
            .blobs
            .range(prefix.to_string()..)
            .take_while(|(name, _)| name.starts_with(prefix))
            .map(|(name, blob)| blob.properties(name))
            .collect())
    }

    async fn get_blob(&self, name: &str) -> BlobResult<Blob> {
        self.check_online()?;
        let inner = self.inner.read();
        self.check_container(&inner)?;
        let blob = inner
            .blobs
            .get(name)
            .ok_or_else(|| BlobError::not_found(name))?;
        Ok(Blob {
            properties: blob.properties(name),
            data: blob.data.clone(),
        })
    }

    async fn get_properties(&self, name: &str) -> BlobResult<BlobProperties> {
        self.check_online()?;
        let inner = self.inner.read();
        self.check_container(&inner)?;
        inner
            .blobs
            .get(name)
            .map(|b| b.properties(name))
            .ok_or_else(|| BlobError::not_found(name))
    }

    async fn put_blob(
        &self,
        name: &str,
        data: Vec<u8>,
        metadata: HashMap<String, String>,
        overwrite: bool,
    ) -> BlobResult<()> {
        self.check_online()?;
        let mut inner = self.inner.write();
        self.check_container(&inner)?;

        if let Some(existing) = inner.blobs.get(name) {
            if !overwrite {
                return Err(BlobError::conflict(format!("{name} already exists")));
            }
            if existing.live_lease().is_some() {
                return Err(BlobError::conflict(format!("{name} is leased")));
            }
        }

        inner.blobs.insert(
            name.to_string(),
            StoredBlob {
                data,
                metadata,
                last_modified: now_millis(),
                lease: None,
            },
        );
        Ok(())
    }

    async fn delete_blob(&self, name: &str) -> BlobResult<bool> {
        self.check_online()?;
        let mut inner = self.inner.write();
        self.check_container(&inner)?;

        if inner
            .blobs
            .get(name)
            .is_some_and(|b| b.live_lease().is_some())
        {
            return Err(BlobError::conflict(format!("{name} is leased")));
        }
        Ok(inner.blobs.remove(name).is_some())
    }

    async fn blob_exists(&self, name: &str) -> BlobResult<bool> {
        self.check_online()?;
        let inner = self.inner.read();
        self.check_container(&inner)?;
        Ok(inner.blobs.contains_key(name))
    }

    async fn acquire_lease(&self, name: &str, duration: Duration) -> BlobResult<String> {
        self.check_online()?;
        let mut inner = self.inner.write();
        self.check_container(&inner)?;

        let blob = inner
            .blobs
            .get_mut(name)
            .ok_or_else(|| BlobError::not_found(name))?;
        if blob.live_lease().is_some() {
            return Err(BlobError::conflict(format!("{name} is already leased")));
        }

        let id = Uuid::new_v4().to_string();
        blob.lease = Some(ActiveLease {
            id: id.clone(),
            duration,
            expires: Instant::now() + duration,
        });
        Ok(id)
    }

    async fn renew_lease(&self, name: &str, lease_id: &str) -> BlobResult<()> {
        self.check_online()?;
        let mut inner = self.inner.write();
        self.check_container(&inner)?;

        let blob = inner
            .blobs
            .get_mut(name)
            .ok_or_else(|| BlobError::not_found(name))?;
        match blob.lease.as_mut() {
            // Renewing an expired lease is allowed as long as nobody took it over.
            Some(lease) if lease.id == lease_id => {
                lease.expires = Instant::now() + lease.duration;
                Ok(())
            }
            _ => Err(BlobError::conflict(format!("lease {lease_id} not held on {name}"))),
        }
    }

    async fn release_lease(&self, name: &str, lease_id: &str) -> BlobResult<()> {
        self.check_online()?;
        let mut inner = self.inner.write();
        self.check_container(&inner)?;

        let blob = inner
            .blobs
            .get_mut(name)
            .ok_or_else(|| BlobError::not_found(name))?;
        match blob.lease.as_ref() {
            Some(lease) if lease.id == lease_id => {
                blob.lease = None;
                Ok(())
            }
            _ => Err(BlobError::conflict(format!("lease {lease_id} not held on {name}"))),
        }
    }

    async fn break_lease(&self, name: &str) -> BlobResult<()> {
        self.check_online()?;
        let mut inner = self.inner.write();
        self.check_container(&inner)?;

        let blob = inner
            .blobs
            .get_mut(name)
            .ok_or_else(|| BlobError::not_found(name))?;
        blob.lease = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryBlobStore::new("indexes");
        store
            .put_blob("idx/a", b"aaa".to_vec(), meta(&[("k", "v")]), true)
            .await
            .unwrap();
        store
            .put_blob("idx/b", b"bb".to_vec(), HashMap::new(), true)
            .await
            .unwrap();
        store
            .put_blob("other/c", b"c".to_vec(), HashMap::new(), true)
            .await
            .unwrap();

        let blob = store.get_blob("idx/a").await.unwrap();
        assert_eq!(blob.data, b"aaa");
        assert_eq!(blob.properties.metadata.get("k").unwrap(), "v");

        let listed: Vec<_> = store
            .list_blobs("idx/")
            .await
            .unwrap()
            .into_iter()
            .map(|p| p.name)
            .collect();
        assert_eq!(listed, vec!["idx/a", "idx/b"]);
    }

    #[tokio::test]
    async fn test_streamed_calls_buffer_through() {
        let store = MemoryBlobStore::new("indexes");
        let body: crate::blob::BlobReader = Box::pin(std::io::Cursor::new(b"segment".to_vec()));
        store
            .put_blob_stream("idx/_0.cfs", body, 7, meta(&[("CachedLength", "7")]), true)
            .await
            .unwrap();

        let mut opened = store.open_blob("idx/_0.cfs").await.unwrap();
        assert_eq!(opened.properties.logical_length(), 7);
        let mut read = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut opened.body, &mut read)
            .await
            .unwrap();
        assert_eq!(read, b"segment");

        let short: crate::blob::BlobReader = Box::pin(std::io::Cursor::new(b"seg".to_vec()));
        assert!(
            store
                .put_blob_stream("idx/_1.cfs", short, 7, HashMap::new(), true)
                .await
                .is_err()
        );
        assert!(!store.blob_exists("idx/_1.cfs").await.unwrap());
    }

    #[tokio::test]
    async fn test_conditional_put() {
        let store = MemoryBlobStore::new("indexes");
        store
            .put_blob("write.lock", b"x".to_vec(), HashMap::new(), false)
            .await
            .unwrap();
        let err = store
            .put_blob("write.lock", b"y".to_vec(), HashMap::new(), false)
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn test_delete_reports_existence() {
        let store = MemoryBlobStore::new("indexes");
        store
            .put_blob("a", b"a".to_vec(), HashMap::new(), true)
            .await
            .unwrap();
        assert!(store.delete_blob("a").await.unwrap());
        assert!(!store.delete_blob("a").await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_container() {
        let store = MemoryBlobStore::without_container("indexes");
        let err = store
            .put_blob("a", b"a".to_vec(), HashMap::new(), true)
            .await
            .unwrap_err();
        assert!(err.needs_container());

        store.ensure_container().await.unwrap();
        store
            .put_blob("a", b"a".to_vec(), HashMap::new(), true)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_offline() {
        let store = MemoryBlobStore::new("indexes");
        store.set_offline(true);
        assert!(matches!(
            store.blob_exists("a").await,
            Err(BlobError::Unavailable(_))
        ));
        store.set_offline(false);
        assert!(!store.blob_exists("a").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_lifecycle() {
        let store = MemoryBlobStore::new("indexes");
        store
            .put_blob("write.lock", Vec::new(), HashMap::new(), true)
            .await
            .unwrap();

        let id = store
            .acquire_lease("write.lock", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(
            store
                .acquire_lease("write.lock", Duration::from_secs(60))
                .await
                .unwrap_err()
                .is_conflict()
        );

        // Leased blobs reject unleased writes.
        assert!(store.delete_blob("write.lock").await.unwrap_err().is_conflict());

        store.renew_lease("write.lock", &id).await.unwrap();
        store.release_lease("write.lock", &id).await.unwrap();
        assert!(store.release_lease("write.lock", &id).await.is_err());

        let second = store
            .acquire_lease("write.lock", Duration::from_secs(60))
            .await
            .unwrap();
        assert_ne!(id, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expires() {
        let store = MemoryBlobStore::new("indexes");
        store
            .put_blob("write.lock", Vec::new(), HashMap::new(), true)
            .await
            .unwrap();
        store
            .acquire_lease("write.lock", Duration::from_secs(15))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(16)).await;
        store
            .acquire_lease("write.lock", Duration::from_secs(15))
            .await
            .unwrap();
    }
}
