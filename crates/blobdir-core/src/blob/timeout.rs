//! Deadline decorator for remote calls.
//!
//! Transports may hang indefinitely; wrapping the store bounds every call
//! so a stuck request surfaces as [`BlobError::Timeout`].

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use super::{Blob, BlobError, BlobProperties, BlobReader, BlobResult, BlobStore, BlobStream};

/// Wraps a [`BlobStore`] and applies a per-call deadline.
pub struct TimeoutBlobStore {
    inner: Arc<dyn BlobStore>,
    limit: Duration,
}

impl std::fmt::Debug for TimeoutBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutBlobStore")
            .field("inner", &self.inner.location())
            .field("limit", &self.limit)
            .finish()
    }
}

impl TimeoutBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, limit: Duration) -> Self {
        Self { inner, limit }
    }

    async fn bounded<T>(
        &self,
        op: &str,
        name: &str,
        fut: impl Future<Output = BlobResult<T>>,
    ) -> BlobResult<T> {
        match tokio::time::timeout(self.limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(BlobError::Timeout(format!(
                "{op} {name} after {:?}",
                self.limit
            ))),
        }
    }
}

#[async_trait]
impl BlobStore for TimeoutBlobStore {
    fn location(&self) -> String {
        self.inner.location()
    }

    async fn ensure_container(&self) -> BlobResult<()> {
        self.bounded("ensure_container", "", self.inner.ensure_container())
            .await
    }

    async fn list_blobs(&self, prefix: &str) -> BlobResult<Vec<BlobProperties>> {
        self.bounded("list", prefix, self.inner.list_blobs(prefix))
            .await
    }

    async fn get_blob(&self, name: &str) -> BlobResult<Blob> {
        self.bounded("get", name, self.inner.get_blob(name)).await
    }

    async fn get_properties(&self, name: &str) -> BlobResult<BlobProperties> {
        self.bounded("head", name, self.inner.get_properties(name))
            .await
    }

    async fn put_blob(
        &self,
        name: &str,
        data: Vec<u8>,
        metadata: HashMap<String, String>,
        overwrite: bool,
    ) -> BlobResult<()> {
        self.bounded(
            "put",
            name,
            self.inner.put_blob(name, data, metadata, overwrite),
        )
        .await
    }

    async fn open_blob(&self, name: &str) -> BlobResult<BlobStream> {
        self.bounded("open", name, self.inner.open_blob(name)).await
    }

    async fn put_blob_stream(
        &self,
        name: &str,
        body: BlobReader,
        length: u64,
        metadata: HashMap<String, String>,
        overwrite: bool,
    ) -> BlobResult<()> {
        self.bounded(
            "put",
            name,
            self.inner
                .put_blob_stream(name, body, length, metadata, overwrite),
        )
        .await
    }

    async fn delete_blob(&self, name: &str) -> BlobResult<bool> {
        self.bounded("delete", name, self.inner.delete_blob(name))
            .await
    }

    async fn blob_exists(&self, name: &str) -> BlobResult<bool> {
        self.bounded("exists", name, self.inner.blob_exists(name))
            .await
    }

    async fn acquire_lease(&self, name: &str, duration: Duration) -> BlobResult<String> {
        self.bounded("acquire_lease", name, self.inner.acquire_lease(name, duration))
            .await
    }

    async fn renew_lease(&self, name: &str, lease_id: &str) -> BlobResult<()> {
        self.bounded("renew_lease", name, self.inner.renew_lease(name, lease_id))
            .await
    }

    async fn release_lease(&self, name: &str, lease_id: &str) -> BlobResult<()> {
        self.bounded("release_lease", name, self.inner.release_lease(name, lease_id))
            .await
    }

    async fn break_lease(&self, name: &str) -> BlobResult<()> {
        self.bounded("break_lease", name, self.inner.break_lease(name))
            .await
    }
}
