//! Local disk cache.

use async_trait::async_trait;
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    CacheReader, CacheWriter, LocalCache, OpenHandle, OpenHandles, TEMP_SUFFIX, TrackedReader,
    validate_name,
};
use crate::blob::BlobReader;
use crate::clock::{millis_to_system_time, system_time_to_millis};
use crate::error::{DirectoryError, DirectoryResult};

/// Cache stored as plain files in a single directory.
///
/// In-flight writes live next to their target as
/// `{name}.{uuid}.blob` and are renamed into place on finish.
#[derive(Debug, Clone)]
pub struct FsCache {
    root: PathBuf,
    handles: OpenHandles,
}

impl FsCache {
    /// Open (creating if needed) a cache rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> DirectoryResult<Self> {
        let root: PathBuf = root.into();
        fs::create_dir_all(&root).await?;
        // Canonicalize to handle symlinks (e.g. macOS `/tmp` → `/private/tmp`).
        let root = dunce::canonicalize(&root).unwrap_or(root);
        Ok(Self {
            root,
            handles: OpenHandles::default(),
        })
    }

    /// Get the root path.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, name: &str) -> DirectoryResult<PathBuf> {
        validate_name(name)?;
        Ok(self.root.join(name))
    }

    async fn metadata(&self, name: &str) -> DirectoryResult<std::fs::Metadata> {
        let path = self.resolve(name)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| DirectoryError::from_io(name, e))?;
        if meta.is_file() {
            Ok(meta)
        } else {
            Err(DirectoryError::not_found(name))
        }
    }
}

#[async_trait]
impl LocalCache for FsCache {
    async fn list(&self) -> DirectoryResult<Vec<String>> {
        let mut names = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(TEMP_SUFFIX) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }

    async fn exists(&self, name: &str) -> DirectoryResult<bool> {
        match self.metadata(name).await {
            Ok(_) => Ok(true),
            Err(DirectoryError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn length(&self, name: &str) -> DirectoryResult<u64> {
        Ok(self.metadata(name).await?.len())
    }

    async fn last_modified(&self, name: &str) -> DirectoryResult<i64> {
        let meta = self.metadata(name).await?;
        Ok(meta.modified().map(system_time_to_millis)?)
    }

    async fn set_last_modified(&self, name: &str, millis: i64) -> DirectoryResult<()> {
        let path = self.resolve(name)?;
        let file = fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .map_err(|e| DirectoryError::from_io(name, e))?
            .into_std()
            .await;
        let modified = millis_to_system_time(millis);
        tokio::task::spawn_blocking(move || file.set_modified(modified))
            .await
            .map_err(|e| DirectoryError::other(format!("set_last_modified {name}: {e}")))??;
        Ok(())
    }

    async fn create_output(&self, name: &str) -> DirectoryResult<Box<dyn CacheWriter>> {
        let target = self.resolve(name)?;
        let temp = self
            .root
            .join(format!("{name}.{}{TEMP_SUFFIX}", Uuid::new_v4().simple()));
        let file = fs::File::create(&temp).await?;
        Ok(Box::new(FsCacheWriter {
            file: Some(file),
            temp,
            target,
            written: 0,
            published: false,
        }))
    }

    async fn open_input(&self, name: &str) -> DirectoryResult<Box<dyn CacheReader>> {
        let path = self.resolve(name)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| DirectoryError::from_io(name, e))?;
        let len = file.metadata().await?.len();
        Ok(Box::new(FsCacheReader {
            file: Mutex::new(file),
            path,
            len,
            handle: self.handles.open(name),
        }))
    }

    async fn open_stream(&self, name: &str) -> DirectoryResult<BlobReader> {
        let path = self.resolve(name)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| DirectoryError::from_io(name, e))?;
        Ok(Box::pin(TrackedReader::new(file, self.handles.open(name))))
    }

    async fn delete(&self, name: &str) -> DirectoryResult<()> {
        let path = self.resolve(name)?;
        if self.handles.is_open(name) {
            return Err(DirectoryError::in_use(name));
        }
        fs::remove_file(&path).await.map_err(|e| match e.kind() {
            io::ErrorKind::PermissionDenied | io::ErrorKind::ResourceBusy => {
                DirectoryError::in_use(name)
            }
            _ => DirectoryError::from_io(name, e),
        })
    }

    async fn create_marker(&self, name: &str) -> DirectoryResult<bool> {
        let path = self.resolve(name)?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Staged writer; the temp file is removed if never finished.
struct FsCacheWriter {
    file: Option<fs::File>,
    temp: PathBuf,
    target: PathBuf,
    written: u64,
    published: bool,
}

#[async_trait]
impl CacheWriter for FsCacheWriter {
    async fn write(&mut self, data: &[u8]) -> DirectoryResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| DirectoryError::other("writer already finished"))?;
        file.write_all(data).await?;
        self.written += data.len() as u64;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.written
    }

    async fn finish(mut self: Box<Self>) -> DirectoryResult<u64> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_data().await?;
        }
        fs::rename(&self.temp, &self.target).await?;
        self.published = true;
        Ok(self.written)
    }
}

impl Drop for FsCacheWriter {
    fn drop(&mut self) {
        if !self.published {
            let _ = std::fs::remove_file(&self.temp);
        }
    }
}

struct FsCacheReader {
    file: Mutex<fs::File>,
    path: PathBuf,
    len: u64,
    handle: OpenHandle,
}

#[async_trait]
impl CacheReader for FsCacheReader {
    fn len(&self) -> u64 {
        self.len
    }

    async fn read_at(&self, offset: u64, size: usize) -> DirectoryResult<Vec<u8>> {
        let mut file = self.file.lock().await;
        file.seek(io::SeekFrom::Start(offset)).await?;

        let mut buffer = vec![0u8; size];
        let mut filled = 0;
        while filled < size {
            let n = file.read(&mut buffer[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buffer.truncate(filled);
        Ok(buffer)
    }

    async fn try_clone(&self) -> DirectoryResult<Box<dyn CacheReader>> {
        // A dup'd descriptor shares the seek offset, so clones open their own.
        let file = fs::File::open(&self.path).await?;
        Ok(Box::new(FsCacheReader {
            file: Mutex::new(file),
            path: self.path.clone(),
            len: self.len,
            handle: self.handle.duplicate(),
        }))
    }
}
