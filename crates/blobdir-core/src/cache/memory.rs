//! In-memory cache.
//!
//! Used for testing. All data is ephemeral.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;

use super::{
    CacheReader, CacheWriter, LocalCache, OpenHandle, OpenHandles, TrackedReader, validate_name,
};
use crate::blob::BlobReader;
use crate::clock::now_millis;
use crate::error::{DirectoryError, DirectoryResult};

/// Shared file snapshot readable through a cursor.
struct Snapshot(Arc<Vec<u8>>);

impl AsRef<[u8]> for Snapshot {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[derive(Debug, Clone)]
struct MemFile {
    data: Arc<Vec<u8>>,
    modified: i64,
}

/// In-memory [`LocalCache`] with the same visibility and in-use rules as
/// [`FsCache`](super::FsCache).
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    files: Arc<RwLock<HashMap<String, MemFile>>>,
    handles: OpenHandles,
}

impl MemoryCache {
    /// Create a new empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, name: &str) -> DirectoryResult<MemFile> {
        validate_name(name)?;
        self.files
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DirectoryError::not_found(name))
    }
}

#[async_trait]
impl LocalCache for MemoryCache {
    async fn list(&self) -> DirectoryResult<Vec<String>> {
        let mut names: Vec<_> = self.files.read().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn exists(&self, name: &str) -> DirectoryResult<bool> {
        validate_name(name)?;
        Ok(self.files.read().contains_key(name))
    }

    async fn length(&self, name: &str) -> DirectoryResult<u64> {
        Ok(self.get(name)?.data.len() as u64)
    }

    async fn last_modified(&self, name: &str) -> DirectoryResult<i64> {
        Ok(self.get(name)?.modified)
    }

    async fn set_last_modified(&self, name: &str, millis: i64) -> DirectoryResult<()> {
        validate_name(name)?;
        let mut files = self.files.write();
        let file = files
            .get_mut(name)
            .ok_or_else(|| DirectoryError::not_found(name))?;
        file.modified = millis;
        Ok(())
    }

    async fn create_output(&self, name: &str) -> DirectoryResult<Box<dyn CacheWriter>> {
        validate_name(name)?;
        Ok(Box::new(MemoryWriter {
            files: Arc::clone(&self.files),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn open_input(&self, name: &str) -> DirectoryResult<Box<dyn CacheReader>> {
        let file = self.get(name)?;
        Ok(Box::new(MemoryReader {
            data: file.data,
            handle: self.handles.open(name),
        }))
    }

    async fn open_stream(&self, name: &str) -> DirectoryResult<BlobReader> {
        let file = self.get(name)?;
        let cursor = Cursor::new(Snapshot(file.data));
        Ok(Box::pin(TrackedReader::new(cursor, self.handles.open(name))))
    }

    async fn delete(&self, name: &str) -> DirectoryResult<()> {
        validate_name(name)?;
        if self.handles.is_open(name) {
            return Err(DirectoryError::in_use(name));
        }
        self.files
            .write()
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| DirectoryError::not_found(name))
    }

    async fn create_marker(&self, name: &str) -> DirectoryResult<bool> {
        validate_name(name)?;
        let mut files = self.files.write();
        if files.contains_key(name) {
            return Ok(false);
        }
        files.insert(
            name.to_string(),
            MemFile {
                data: Arc::new(Vec::new()),
                modified: now_millis(),
            },
        );
        Ok(true)
    }
}

struct MemoryWriter {
    files: Arc<RwLock<HashMap<String, MemFile>>>,
    name: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl CacheWriter for MemoryWriter {
    async fn write(&mut self, data: &[u8]) -> DirectoryResult<()> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    fn len(&self) -> u64 {
        self.buffer.len() as u64
    }

    async fn finish(self: Box<Self>) -> DirectoryResult<u64> {
        let len = self.buffer.len() as u64;
        let MemoryWriter {
            files,
            name,
            buffer,
        } = *self;
        files.write().insert(
            name,
            MemFile {
                data: Arc::new(buffer),
                modified: now_millis(),
            },
        );
        Ok(len)
    }
}

struct MemoryReader {
    data: Arc<Vec<u8>>,
    handle: OpenHandle,
}

#[async_trait]
impl CacheReader for MemoryReader {
    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    async fn read_at(&self, offset: u64, size: usize) -> DirectoryResult<Vec<u8>> {
        let start = (offset as usize).min(self.data.len());
        let end = start.saturating_add(size).min(self.data.len());
        Ok(self.data[start..end].to_vec())
    }

    async fn try_clone(&self) -> DirectoryResult<Box<dyn CacheReader>> {
        Ok(Box::new(MemoryReader {
            data: Arc::clone(&self.data),
            handle: self.handle.duplicate(),
        }))
    }
}
