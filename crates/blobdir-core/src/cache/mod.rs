//! Local working copy of remote files.
//!
//! Key components:
//!
//! - [`LocalCache`] - flat, name-based file store the directory reads from
//! - [`FsCache`] - a directory on fast local disk
//! - [`MemoryCache`] - in-memory twin for tests
//!
//! ## Semantics shared by both caches
//!
//! - **Never partially visible**: writers stage bytes and publish on
//!   [`CacheWriter::finish`]; dropping an unfinished writer discards it.
//! - **Delete of an open file fails**: open readers are counted and
//!   [`LocalCache::delete`] returns [`DirectoryError::InUse`] while any
//!   handle is alive, so the engine's retry loop sees the file as still
//!   needed on every platform.

mod fs;
mod memory;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

pub use fs::FsCache;
pub use memory::MemoryCache;

use crate::blob::BlobReader;
use crate::error::{DirectoryError, DirectoryResult};

/// Suffix of staged (not yet published) cache files.
pub const TEMP_SUFFIX: &str = ".blob";

/// Writable handle returned by [`LocalCache::create_output`].
#[async_trait]
pub trait CacheWriter: Send {
    /// Append bytes.
    async fn write(&mut self, data: &[u8]) -> DirectoryResult<()>;

    /// Bytes written so far.
    fn len(&self) -> u64;

    /// Returns true if nothing has been written.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Publish the file. Returns its final length.
    async fn finish(self: Box<Self>) -> DirectoryResult<u64>;
}

/// Readable handle returned by [`LocalCache::open_input`].
///
/// Reads are positional so a handle can be shared by parallel readers.
#[async_trait]
pub trait CacheReader: Send + Sync {
    /// File length at open time.
    fn len(&self) -> u64;

    /// Returns true if the file is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Read up to `size` bytes starting at `offset`.
    ///
    /// Returns fewer bytes if EOF is reached.
    async fn read_at(&self, offset: u64, size: usize) -> DirectoryResult<Vec<u8>>;

    /// Open an independent handle on the same file.
    async fn try_clone(&self) -> DirectoryResult<Box<dyn CacheReader>>;

    /// Read the whole file.
    async fn read_all(&self) -> DirectoryResult<Vec<u8>> {
        self.read_at(0, self.len() as usize).await
    }
}

/// Flat, name-based file store holding the local working copy.
///
/// Names are single path components; timestamps are ms since the Unix epoch.
#[async_trait]
pub trait LocalCache: Send + Sync {
    /// Names of all published files, sorted.
    async fn list(&self) -> DirectoryResult<Vec<String>>;

    /// Check whether a published file exists.
    async fn exists(&self, name: &str) -> DirectoryResult<bool>;

    /// File length. Fails with NotFound if absent.
    async fn length(&self, name: &str) -> DirectoryResult<u64>;

    /// Last modification time. Fails with NotFound if absent.
    async fn last_modified(&self, name: &str) -> DirectoryResult<i64>;

    /// Overwrite the modification time (used after a pull).
    async fn set_last_modified(&self, name: &str, millis: i64) -> DirectoryResult<()>;

    /// Create or truncate a file. The new content appears on finish.
    async fn create_output(&self, name: &str) -> DirectoryResult<Box<dyn CacheWriter>>;

    /// Open a file for reading. Fails with NotFound if absent.
    async fn open_input(&self, name: &str) -> DirectoryResult<Box<dyn CacheReader>>;

    /// Open a file for one sequential pass, as an upload body.
    ///
    /// The stream counts as an open reader until dropped.
    async fn open_stream(&self, name: &str) -> DirectoryResult<BlobReader>;

    /// Remove a file. Fails with InUse while a reader holds it open.
    async fn delete(&self, name: &str) -> DirectoryResult<()>;

    /// Create an empty file only if absent. Returns false if it already existed.
    async fn create_marker(&self, name: &str) -> DirectoryResult<bool>;

    /// Read an entire file.
    async fn read_all(&self, name: &str) -> DirectoryResult<Vec<u8>> {
        self.open_input(name).await?.read_all().await
    }

    /// Replace an entire file.
    async fn write_all(&self, name: &str, data: &[u8]) -> DirectoryResult<()> {
        let mut out = self.create_output(name).await?;
        out.write(data).await?;
        out.finish().await?;
        Ok(())
    }
}

/// Reject names that are not a single plain path component.
pub(crate) fn validate_name(name: &str) -> DirectoryResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.ends_with(TEMP_SUFFIX);
    if invalid {
        Err(DirectoryError::invalid_name(name))
    } else {
        Ok(())
    }
}

/// Open-reader counts per file name.
#[derive(Debug, Clone, Default)]
pub(crate) struct OpenHandles {
    counts: Arc<DashMap<String, usize>>,
}

impl OpenHandles {
    /// Register a new open reader.
    pub(crate) fn open(&self, name: &str) -> OpenHandle {
        *self.counts.entry(name.to_string()).or_insert(0) += 1;
        OpenHandle {
            counts: Arc::clone(&self.counts),
            name: name.to_string(),
        }
    }

    /// Returns true while any reader holds `name`.
    pub(crate) fn is_open(&self, name: &str) -> bool {
        self.counts.get(name).is_some_and(|c| *c > 0)
    }
}

/// Registration of one open reader; unregisters on drop.
#[derive(Debug)]
pub(crate) struct OpenHandle {
    counts: Arc<DashMap<String, usize>>,
    name: String,
}

impl OpenHandle {
    /// Register another reader on the same file.
    pub(crate) fn duplicate(&self) -> OpenHandle {
        *self.counts.entry(self.name.clone()).or_insert(0) += 1;
        OpenHandle {
            counts: Arc::clone(&self.counts),
            name: self.name.clone(),
        }
    }
}

/// Sequential reader registered as an open handle while alive.
pub(crate) struct TrackedReader<R> {
    inner: R,
    _handle: OpenHandle,
}

impl<R> TrackedReader<R> {
    pub(crate) fn new(inner: R, handle: OpenHandle) -> Self {
        Self {
            inner,
            _handle: handle,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for TrackedReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl Drop for OpenHandle {
    fn drop(&mut self) {
        if let Entry::Occupied(mut entry) = self.counts.entry(self.name.clone()) {
            *entry.get_mut() -= 1;
            if *entry.get() == 0 {
                entry.remove();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        assert!(validate_name("segments_1").is_ok());
        assert!(validate_name("_0.cfs").is_ok());
        assert!(validate_name("write.lock").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("a\\b").is_err());
        assert!(validate_name("_0.cfs.blob").is_err());
    }

    #[test]
    fn test_open_handles_count() {
        let handles = OpenHandles::default();
        assert!(!handles.is_open("a"));

        let first = handles.open("a");
        let second = first.duplicate();
        assert!(handles.is_open("a"));

        drop(first);
        assert!(handles.is_open("a"));
        drop(second);
        assert!(!handles.is_open("a"));
    }
}
