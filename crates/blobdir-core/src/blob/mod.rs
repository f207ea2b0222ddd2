//! Remote blob store boundary.
//!
//! The directory talks to durable storage only through [`BlobStore`]:
//! get/put/list/delete/exists, streamed variants of get and put, plus
//! optional leases. Implementations:
//!
//! - [`MemoryBlobStore`] - in-process store, shareable between directories
//! - [`FsBlobStore`] - a directory on a shared filesystem acting as the remote
//! - [`TimeoutBlobStore`] - decorator bounding every remote call

mod error;
mod fs;
mod memory;
mod timeout;

use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};

pub use error::{BlobError, BlobResult};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
pub use timeout::TimeoutBlobStore;

use crate::config::DirectoryConfig;
use crate::error::{DirectoryError, DirectoryResult};

/// Metadata key carrying the uncompressed length of a blob.
pub const META_CACHED_LENGTH: &str = "CachedLength";

/// Metadata key carrying the logical modification time (ms since epoch).
pub const META_CACHED_LAST_MODIFIED: &str = "CachedLastModified";

/// Metadata key naming the codec applied to the blob body.
pub const META_CACHED_COMPRESSION: &str = "CachedCompression";

/// Object metadata as reported by list/head calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    /// Full object name including the root folder.
    pub name: String,
    /// Stored byte length (compressed length for compressed blobs).
    pub length: u64,
    /// Upload time, ms since Unix epoch.
    pub last_modified: i64,
    /// User metadata.
    pub metadata: HashMap<String, String>,
}

impl BlobProperties {
    /// Uncompressed length: `CachedLength` when present, raw length otherwise.
    pub fn logical_length(&self) -> u64 {
        self.metadata
            .get(META_CACHED_LENGTH)
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.length)
    }

    /// Logical modification time: `CachedLastModified` when present,
    /// upload time otherwise.
    pub fn logical_last_modified(&self) -> i64 {
        self.metadata
            .get(META_CACHED_LAST_MODIFIED)
            .and_then(|v| v.parse().ok())
            .unwrap_or(self.last_modified)
    }

    /// Codec recorded at upload, if any.
    pub fn compression(&self) -> Option<&str> {
        self.metadata.get(META_CACHED_COMPRESSION).map(String::as_str)
    }
}

/// A downloaded blob.
#[derive(Debug, Clone)]
pub struct Blob {
    pub properties: BlobProperties,
    pub data: Vec<u8>,
}

/// Streamed blob body.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// A blob opened for a streamed download.
pub struct BlobStream {
    pub properties: BlobProperties,
    pub body: BlobReader,
}

impl std::fmt::Debug for BlobStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStream")
            .field("properties", &self.properties)
            .finish_non_exhaustive()
    }
}

/// Fail an upload whose body did not match its declared length.
pub(crate) fn check_body_length(name: &str, expected: u64, actual: u64) -> BlobResult<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(BlobError::other(format!(
            "{name}: body was {actual} bytes, declared {expected}"
        )))
    }
}

/// Durable key/value blob storage.
///
/// Names are path-like (`{root_folder}{file}`). All calls are fallible;
/// callers decide whether a failure degrades or propagates.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stable identity of the store (account + container), used to scope locks.
    fn location(&self) -> String;

    /// Create the container if it does not exist. Idempotent.
    async fn ensure_container(&self) -> BlobResult<()>;

    /// List all blobs whose name starts with `prefix`.
    async fn list_blobs(&self, prefix: &str) -> BlobResult<Vec<BlobProperties>>;

    /// Download a blob.
    async fn get_blob(&self, name: &str) -> BlobResult<Blob>;

    /// Fetch blob properties without the body.
    async fn get_properties(&self, name: &str) -> BlobResult<BlobProperties>;

    /// Upload a blob.
    ///
    /// With `overwrite == false` the call fails with [`BlobError::Conflict`]
    /// if the blob already exists.
    async fn put_blob(
        &self,
        name: &str,
        data: Vec<u8>,
        metadata: HashMap<String, String>,
        overwrite: bool,
    ) -> BlobResult<()>;

    /// Open a blob for a streamed download.
    ///
    /// The default buffers the body through [`get_blob`](Self::get_blob).
    async fn open_blob(&self, name: &str) -> BlobResult<BlobStream> {
        let blob = self.get_blob(name).await?;
        Ok(BlobStream {
            properties: blob.properties,
            body: Box::pin(Cursor::new(blob.data)),
        })
    }

    /// Upload `length` bytes read from `body`.
    ///
    /// The default collects the body and hands it to [`put_blob`](Self::put_blob).
    async fn put_blob_stream(
        &self,
        name: &str,
        mut body: BlobReader,
        length: u64,
        metadata: HashMap<String, String>,
        overwrite: bool,
    ) -> BlobResult<()> {
        let mut data = Vec::new();
        body.read_to_end(&mut data).await?;
        check_body_length(name, length, data.len() as u64)?;
        self.put_blob(name, data, metadata, overwrite).await
    }

    /// Delete a blob. Succeeds when absent; returns whether it existed.
    async fn delete_blob(&self, name: &str) -> BlobResult<bool>;

    /// Check whether a blob exists.
    async fn blob_exists(&self, name: &str) -> BlobResult<bool>;

    /// Acquire an exclusive lease. Fails with [`BlobError::Conflict`] if held.
    async fn acquire_lease(&self, name: &str, duration: Duration) -> BlobResult<String> {
        let _ = (name, duration);
        Err(BlobError::Unsupported("acquire_lease"))
    }

    /// Extend a held lease.
    async fn renew_lease(&self, name: &str, lease_id: &str) -> BlobResult<()> {
        let _ = (name, lease_id);
        Err(BlobError::Unsupported("renew_lease"))
    }

    /// Release a held lease.
    async fn release_lease(&self, name: &str, lease_id: &str) -> BlobResult<()> {
        let _ = (name, lease_id);
        Err(BlobError::Unsupported("release_lease"))
    }

    /// Break any lease on the blob regardless of holder.
    async fn break_lease(&self, name: &str) -> BlobResult<()> {
        let _ = name;
        Err(BlobError::Unsupported("break_lease"))
    }
}

/// Root folder prefix under which a directory's blobs live.
///
/// Empty, or a logical index name normalized to end with `/`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RootFolder(String);

impl RootFolder {
    /// Normalize a caller-supplied folder name.
    pub fn new(folder: impl AsRef<str>) -> Self {
        let trimmed = folder.as_ref().trim_matches('/');
        if trimmed.is_empty() {
            Self(String::new())
        } else {
            Self(format!("{trimmed}/"))
        }
    }

    /// The normalized prefix (`""` or `"name/"`).
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Remote object name for a directory file.
    pub fn blob_name(&self, file: &str) -> String {
        format!("{}{}", self.0, file)
    }

    /// Directory file name for a remote object, if it lives directly under this root.
    pub fn file_name<'a>(&self, blob: &'a str) -> Option<&'a str> {
        let rest = blob.strip_prefix(self.0.as_str())?;
        if rest.is_empty() || rest.contains('/') {
            None
        } else {
            Some(rest)
        }
    }
}

/// Build the remote store named by `config.connection`.
///
/// Accepts `memory://`, `file:///path` or a bare filesystem path.
pub fn open_store(config: &DirectoryConfig) -> DirectoryResult<Arc<dyn BlobStore>> {
    let connection = config.connection.trim();
    let store: Arc<dyn BlobStore> = if connection.starts_with("memory://") {
        Arc::new(MemoryBlobStore::new(&config.container))
    } else {
        let path = connection.strip_prefix("file://").unwrap_or(connection);
        if path.is_empty() {
            return Err(DirectoryError::config("connection must name a store"));
        }
        Arc::new(FsBlobStore::new(path, &config.container))
    };

    match config.remote_timeout() {
        Some(limit) => Ok(Arc::new(TimeoutBlobStore::new(store, limit))),
        None => Ok(store),
    }
}
