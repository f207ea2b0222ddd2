//! Moving file bytes between the remote store and the local cache.
//!
//! Callers hold the per-file lock for the name being moved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{debug, info, warn};

use crate::blob::{
    BlobError, BlobProperties, BlobStore, BlobStream, META_CACHED_COMPRESSION,
    META_CACHED_LAST_MODIFIED, META_CACHED_LENGTH, RootFolder,
};
use crate::cache::LocalCache;
use crate::compression::{self, DEFLATE, Inflater};
use crate::error::{DirectoryError, DirectoryResult};

/// Read size for streamed downloads.
const PULL_CHUNK: usize = 64 * 1024;

/// Pulls and pushes single files.
pub struct SyncEngine {
    store: Arc<dyn BlobStore>,
    cache: Arc<dyn LocalCache>,
    root: RootFolder,
    compress: bool,
    mtime_tolerance: Duration,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn BlobStore>,
        cache: Arc<dyn LocalCache>,
        root: RootFolder,
        compress: bool,
        mtime_tolerance: Duration,
    ) -> Self {
        Self {
            store,
            cache,
            root,
            compress,
            mtime_tolerance,
        }
    }

    /// Whether pushes of `name` are deflated.
    pub fn compresses(&self, name: &str) -> bool {
        self.compress && compression::is_compressible(name)
    }

    /// True if the cached copy of `name` matches the remote logical length
    /// and modification time (within tolerance).
    pub async fn is_cache_valid(&self, name: &str, remote: &BlobProperties) -> bool {
        let (Ok(length), Ok(modified)) = (
            self.cache.length(name).await,
            self.cache.last_modified(name).await,
        ) else {
            return false;
        };
        let skew = modified.abs_diff(remote.logical_last_modified());
        length == remote.logical_length() && skew <= self.mtime_tolerance.as_millis() as u64
    }

    /// Download `name` into the cache, replacing any cached copy.
    ///
    /// The body is streamed into a cache writer, inflating on the way when
    /// the blob was deflated. With `CachedLength` present, output beyond
    /// it or short of it is [`DirectoryError::Corrupt`] and nothing is
    /// published.
    pub async fn pull(&self, name: &str) -> DirectoryResult<BlobProperties> {
        let blob_name = self.root.blob_name(name);
        let BlobStream {
            properties: props,
            mut body,
        } = self
            .store
            .open_blob(&blob_name)
            .await
            .map_err(|e| DirectoryError::from_blob(name, e))?;
        let expected = props.logical_length();
        let checked = props.metadata.contains_key(META_CACHED_LENGTH);

        let mut inflater = match props.compression() {
            Some(DEFLATE) => Some(Inflater::new()),
            Some(other) => {
                return Err(DirectoryError::other(format!(
                    "{name}: unknown compression {other:?}"
                )));
            }
            // Uploads that predate the codec marker: deflated bodies show up
            // as a length mismatch on an eligible extension.
            None if self.compresses(name) && expected != props.length => Some(Inflater::new()),
            None => None,
        };

        let corrupt = |actual: u64| DirectoryError::Corrupt {
            name: name.to_string(),
            expected,
            actual,
        };
        let mut out = self.cache.create_output(name).await?;
        let mut buf = vec![0u8; PULL_CHUNK];
        let mut remote_bytes = 0u64;
        loop {
            let n = body
                .read(&mut buf)
                .await
                .map_err(|e| DirectoryError::sync(name, BlobError::from(e)))?;
            if n == 0 {
                break;
            }
            remote_bytes += n as u64;
            match inflater.as_mut() {
                Some(inflater) => {
                    let chunk = inflater.update(&buf[..n]).map_err(|e| {
                        warn!(name, error = %e, "inflate failed");
                        corrupt(out.len())
                    })?;
                    out.write(&chunk).await?;
                }
                None => out.write(&buf[..n]).await?,
            }
            if checked && out.len() > expected {
                warn!(name, expected, "download overran its recorded length");
                return Err(corrupt(out.len()));
            }
        }
        if let Some(inflater) = inflater {
            let tail = inflater.finish().map_err(|e| {
                warn!(name, error = %e, "inflate failed");
                corrupt(out.len())
            })?;
            out.write(&tail).await?;
        }
        if checked && out.len() != expected {
            return Err(corrupt(out.len()));
        }

        let bytes = out.finish().await?;
        self.cache
            .set_last_modified(name, props.logical_last_modified())
            .await?;

        info!(name, remote_bytes, bytes, "pulled");
        Ok(props)
    }

    /// Make sure the cache holds a current copy of `name`.
    ///
    /// Returns false if the cached copy was already valid.
    pub async fn ensure_cached(&self, name: &str, remote: &BlobProperties) -> DirectoryResult<bool> {
        if self.is_cache_valid(name, remote).await {
            debug!(name, "cache hit");
            return Ok(false);
        }
        self.pull(name).await?;
        Ok(true)
    }

    /// Upload the cached copy of `name`, attaching its logical length and
    /// modification time as metadata.
    ///
    /// Deflated uploads are built in memory since the put needs the length
    /// up front; everything else streams from the cache file.
    pub async fn push(&self, name: &str) -> DirectoryResult<()> {
        let modified = self.cache.last_modified(name).await?;
        let deflated = if self.compresses(name) {
            let data = self.cache.read_all(name).await?;
            Some((data.len() as u64, compression::deflate(&data)?))
        } else {
            None
        };
        let length = match &deflated {
            Some((length, _)) => *length,
            None => self.cache.length(name).await?,
        };

        let mut metadata = HashMap::from([
            (META_CACHED_LENGTH.to_string(), length.to_string()),
            (META_CACHED_LAST_MODIFIED.to_string(), modified.to_string()),
        ]);
        if deflated.is_some() {
            metadata.insert(META_CACHED_COMPRESSION.to_string(), DEFLATE.to_string());
        }
        let stored = deflated.as_ref().map_or(length, |(_, body)| body.len() as u64);

        let blob_name = self.root.blob_name(name);
        let mut retried = false;
        loop {
            let put = match &deflated {
                Some((_, body)) => {
                    self.store
                        .put_blob(&blob_name, body.clone(), metadata.clone(), true)
                        .await
                }
                None => {
                    let source = self.cache.open_stream(name).await?;
                    self.store
                        .put_blob_stream(&blob_name, source, length, metadata.clone(), true)
                        .await
                }
            };
            match put {
                Ok(()) => break,
                Err(e) if e.needs_container() && !retried => {
                    warn!(name, "container missing, creating and retrying");
                    self.store
                        .ensure_container()
                        .await
                        .map_err(|e| DirectoryError::sync(name, e))?;
                    retried = true;
                }
                Err(e) => return Err(DirectoryError::sync(name, e)),
            }
        }

        info!(name, bytes = length, remote_bytes = stored, "pushed");
        Ok(())
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.store.location())
            .field("root", &self.root)
            .field("compress", &self.compress)
            .finish()
    }
}
