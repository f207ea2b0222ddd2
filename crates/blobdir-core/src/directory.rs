//! The remote-backed directory.
//!
//! [`BlobDirectory`] answers the index engine's file operations from the
//! local cache while the cache is known to match the remote generation,
//! and from the remote store (pulling into the cache on demand) otherwise.
//!
//! Failure policy: read-path anomalies fall back to the other store and log
//! a warning; a local delete failure and a failed push on close propagate.

use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob::{BlobStore, RootFolder, open_store};
use crate::cache::{CacheReader, CacheWriter, FsCache, LocalCache, MemoryCache, validate_name};
use crate::config::{DirectoryConfig, DirectoryOptions, LockStrategy};
use crate::error::{DirectoryError, DirectoryResult};
use crate::file_locks::FileLocks;
use crate::lock::{LeaseLock, LocalLock, Lock, MarkerLock, MultiLock, NoopLock};
use crate::manifest::{Manifest, ManifestStore};
use crate::staleness::StalenessDetector;
use crate::sync::SyncEngine;

struct Shared {
    store: Arc<dyn BlobStore>,
    cache: Arc<dyn LocalCache>,
    root: RootFolder,
    options: DirectoryOptions,
    state: StalenessDetector,
    sync: SyncEngine,
    files: FileLocks,
    manifests: ManifestStore,
    lock_id: String,
}

/// A directory of index files backed by a remote blob store.
///
/// Cheap to clone; clones share the cache and sync state.
#[derive(Clone)]
pub struct BlobDirectory {
    shared: Arc<Shared>,
}

impl BlobDirectory {
    /// Compose a directory from an existing store and cache.
    pub fn new(
        store: Arc<dyn BlobStore>,
        cache: Arc<dyn LocalCache>,
        options: DirectoryOptions,
    ) -> Self {
        let root = RootFolder::new(&options.root_folder);
        let lock_id = format!("{}/{}", store.location(), root.as_str());
        let state = StalenessDetector::new(store.clone(), cache.clone(), root.clone());
        let sync = SyncEngine::new(
            store.clone(),
            cache.clone(),
            root.clone(),
            options.compress_blobs,
            options.mtime_tolerance,
        );
        let manifests = ManifestStore::new(store.clone(), root.clone());
        // File locks guard one cache, so each instance gets its own scope.
        let files = FileLocks::new(format!("{lock_id}#{}", Uuid::new_v4().simple()));

        Self {
            shared: Arc::new(Shared {
                store,
                cache,
                root,
                options,
                state,
                sync,
                files,
                manifests,
                lock_id,
            }),
        }
    }

    /// Build store, cache and directory from configuration.
    ///
    /// The container is created up front unless the directory is read-only.
    pub async fn open(config: &DirectoryConfig) -> DirectoryResult<Self> {
        config.validate()?;
        let store = open_store(config)?;
        let cache: Arc<dyn LocalCache> = match &config.cache_root {
            Some(path) => Arc::new(FsCache::open(path).await?),
            None => Arc::new(MemoryCache::new()),
        };
        if !config.read_only {
            store.ensure_container().await?;
        }
        info!(
            store = %store.location(),
            root = %config.root_folder,
            read_only = config.read_only,
            "directory opened"
        );
        Ok(Self::new(store, cache, config.options()))
    }

    pub fn root(&self) -> &RootFolder {
        &self.shared.root
    }

    pub fn options(&self) -> &DirectoryOptions {
        &self.shared.options
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.shared.store
    }

    pub fn cache(&self) -> &Arc<dyn LocalCache> {
        &self.shared.cache
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.options.policy.is_read_only()
    }

    /// Identity shared by every instance pointing at the same remote root.
    pub fn lock_id(&self) -> &str {
        &self.shared.lock_id
    }

    /// Last computed sync verdict.
    pub fn in_sync(&self) -> bool {
        self.shared.state.in_sync()
    }

    /// `(local, remote)` generations from the last recomputation.
    pub fn generations(&self) -> (i64, i64) {
        self.shared.state.generations()
    }

    /// Force the sync state to be recomputed now.
    pub async fn refresh(&self) -> bool {
        self.shared.state.mark_dirty();
        self.shared.state.check_dirty().await;
        self.in_sync()
    }

    async fn sync_state(&self) -> (bool, Option<Vec<String>>) {
        let listing = self.shared.state.check_dirty().await;
        (self.shared.state.in_sync(), listing)
    }

    /// Names of all files in the directory.
    pub async fn list(&self) -> DirectoryResult<Vec<String>> {
        let (in_sync, listing) = self.sync_state().await;
        if in_sync {
            return self.shared.cache.list().await;
        }
        let mut names = match listing {
            Some(names) => names,
            None => match self.shared.state.remote_files().await {
                Ok(names) => names,
                Err(e) => {
                    warn!(error = %e, "remote listing failed, listing cache");
                    return self.shared.cache.list().await;
                }
            },
        };
        names.sort();
        Ok(names)
    }

    pub async fn exists(&self, name: &str) -> DirectoryResult<bool> {
        validate_name(name)?;
        let (in_sync, _) = self.sync_state().await;
        if in_sync {
            match self.shared.cache.exists(name).await {
                Ok(exists) => return Ok(exists),
                Err(e) => {
                    warn!(name, error = %e, "local exists failed, checking remote");
                    self.shared.state.mark_dirty();
                }
            }
        }

        match self.shared.store.blob_exists(&self.shared.root.blob_name(name)).await {
            Ok(exists) => Ok(exists),
            Err(e) => {
                warn!(name, error = %e, "remote exists failed, checking cache");
                self.shared.cache.exists(name).await
            }
        }
    }

    /// Uncompressed length of a file.
    pub async fn length(&self, name: &str) -> DirectoryResult<u64> {
        validate_name(name)?;
        let (in_sync, _) = self.sync_state().await;
        if in_sync {
            return self.shared.cache.length(name).await;
        }
        match self.shared.store.get_properties(&self.shared.root.blob_name(name)).await {
            Ok(props) => Ok(props.logical_length()),
            Err(e) => {
                // Files written but not yet visible remotely still need an answer.
                if !e.is_not_found() {
                    warn!(name, error = %e, "remote length failed, using cache");
                }
                self.shared.cache.length(name).await
            }
        }
    }

    /// Logical modification time, ms since the Unix epoch.
    pub async fn last_modified(&self, name: &str) -> DirectoryResult<i64> {
        validate_name(name)?;
        let (in_sync, _) = self.sync_state().await;
        if in_sync {
            return self.shared.cache.last_modified(name).await;
        }
        match self.shared.store.get_properties(&self.shared.root.blob_name(name)).await {
            Ok(props) => Ok(props.logical_last_modified()),
            Err(e) if e.is_not_found() => Err(DirectoryError::not_found(name)),
            Err(e) => {
                warn!(name, error = %e, "remote last_modified failed, using cache");
                self.shared.cache.last_modified(name).await
            }
        }
    }

    /// Delete a file locally, then remotely.
    ///
    /// A local failure (e.g. the file is still open) is returned as is and
    /// the remote copy is left alone. Remote deletion is best effort.
    pub async fn delete(&self, name: &str) -> DirectoryResult<()> {
        validate_name(name)?;
        if self.is_read_only() {
            debug!(name, "read-only, ignoring delete");
            return Ok(());
        }

        let _guard = self.shared.files.lock(name).await;
        match self.shared.cache.delete(name).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => debug!(name, "not cached"),
            Err(e) => return Err(e),
        }
        self.shared.state.mark_dirty();

        match self.shared.store.delete_blob(&self.shared.root.blob_name(name)).await {
            Ok(existed) => debug!(name, existed, "deleted"),
            Err(e) => warn!(name, error = %e, "remote delete failed"),
        }
        Ok(())
    }

    /// Start writing a new file. Content is published locally and pushed on
    /// [`DirectoryOutput::close`].
    pub async fn create_output(&self, name: &str) -> DirectoryResult<DirectoryOutput> {
        validate_name(name)?;
        self.shared.state.mark_dirty();
        if self.is_read_only() {
            debug!(name, "read-only, discarding output");
            return Ok(DirectoryOutput {
                name: name.to_string(),
                sink: Sink::Discard { written: 0 },
            });
        }

        let _guard = self.shared.files.lock(name).await;
        let writer = self.shared.cache.create_output(name).await?;
        Ok(DirectoryOutput {
            name: name.to_string(),
            sink: Sink::Cached {
                shared: Arc::clone(&self.shared),
                writer,
            },
        })
    }

    /// Open a file for reading, pulling it into the cache if needed.
    pub async fn open_input(&self, name: &str) -> DirectoryResult<DirectoryInput> {
        validate_name(name)?;
        let (in_sync, _) = self.sync_state().await;
        let _guard = self.shared.files.lock(name).await;

        if in_sync {
            match self.shared.cache.open_input(name).await {
                Ok(reader) => return Ok(self.input(name, reader)),
                Err(e) if e.is_not_found() => {
                    debug!(name, "missing from in-sync cache, going remote");
                    self.shared.state.mark_dirty();
                }
                Err(e) => warn!(name, error = %e, "local open failed, going remote"),
            }
        }

        let blob_name = self.shared.root.blob_name(name);
        match self.shared.store.get_properties(&blob_name).await {
            Ok(props) => {
                if let Err(e) = self.shared.sync.ensure_cached(name, &props).await {
                    if matches!(e, DirectoryError::Corrupt { .. }) || !self.cached(name).await {
                        return Err(e);
                    }
                    warn!(name, error = %e, "pull failed, serving cached copy");
                }
            }
            Err(e) if e.is_not_found() => {
                if !self.cached(name).await {
                    return Err(DirectoryError::not_found(name));
                }
                debug!(name, "local-only file");
            }
            Err(e) => {
                if !self.cached(name).await {
                    return Err(DirectoryError::from_blob(name, e));
                }
                warn!(name, error = %e, "remote unavailable, serving cached copy");
            }
        }

        let reader = self.shared.cache.open_input(name).await?;
        Ok(self.input(name, reader))
    }

    async fn cached(&self, name: &str) -> bool {
        self.shared.cache.exists(name).await.unwrap_or(false)
    }

    fn input(&self, name: &str, reader: Box<dyn CacheReader>) -> DirectoryInput {
        DirectoryInput {
            shared: Arc::clone(&self.shared),
            name: name.to_string(),
            reader,
        }
    }

    /// Lock for `name`, scoped to this directory's [`lock_id`](Self::lock_id).
    pub fn make_lock(&self, name: &str) -> Box<dyn Lock> {
        let scoped = format!("{}-{name}", self.shared.lock_id);
        if self.is_read_only() {
            return Box::new(NoopLock::new(scoped));
        }

        let blob = self.shared.root.blob_name(name);
        let remote: Box<dyn Lock> = match self.shared.options.lock_strategy {
            LockStrategy::Marker => Box::new(MarkerLock::new(
                self.shared.store.clone(),
                blob,
                scoped.clone(),
            )),
            LockStrategy::Lease => Box::new(LeaseLock::new(
                self.shared.store.clone(),
                blob,
                scoped.clone(),
                self.shared.options.lease_duration,
                self.shared.options.lease_renew,
            )),
        };
        let local = Box::new(LocalLock::new(self.shared.cache.clone(), name));
        Box::new(MultiLock::new(scoped, local, remote))
    }

    /// Forcibly remove a lock regardless of holder.
    pub async fn clear_lock(&self, name: &str) -> DirectoryResult<()> {
        validate_name(name)?;
        if self.is_read_only() {
            return Ok(());
        }
        match self.shared.cache.delete(name).await {
            Err(e) if !e.is_not_found() => return Err(e),
            _ => {}
        }

        let blob = self.shared.root.blob_name(name);
        if self.shared.options.lock_strategy == LockStrategy::Lease {
            match self.shared.store.break_lease(&blob).await {
                Err(e) if !e.is_not_found() => warn!(name, error = %e, "break lease failed"),
                _ => {}
            }
        }
        self.shared.store.delete_blob(&blob).await?;
        info!(lock = name, "lock cleared");
        Ok(())
    }

    /// Record the current remote file set as a new manifest.
    pub async fn commit_manifest(&self) -> DirectoryResult<Manifest> {
        if self.is_read_only() {
            return Err(DirectoryError::other("cannot commit a manifest from a read-only directory"));
        }
        let previous = self.shared.manifests.latest().await?;
        let mut files = self.shared.state.remote_files().await?;
        files.sort();
        let manifest = Manifest::snapshot(&self.shared.root, &files, previous.as_ref());
        self.shared.manifests.save(&manifest).await?;
        Ok(manifest)
    }

    pub fn manifests(&self) -> &ManifestStore {
        &self.shared.manifests
    }

    /// Drop manifests older than the configured retention.
    pub async fn collect_manifests(&self) -> DirectoryResult<Vec<Uuid>> {
        if self.is_read_only() {
            return Ok(Vec::new());
        }
        self.shared
            .manifests
            .collect_garbage(self.shared.options.manifest_retention)
            .await
    }
}

impl std::fmt::Debug for BlobDirectory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobDirectory")
            .field("lock_id", &self.shared.lock_id)
            .field("policy", &self.shared.options.policy)
            .field("state", &self.shared.state)
            .finish()
    }
}

/// Open file. Reads are positional.
pub struct DirectoryInput {
    shared: Arc<Shared>,
    name: String,
    reader: Box<dyn CacheReader>,
}

impl DirectoryInput {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u64 {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub async fn read_at(&self, offset: u64, size: usize) -> DirectoryResult<Vec<u8>> {
        self.reader.read_at(offset, size).await
    }

    pub async fn read_all(&self) -> DirectoryResult<Vec<u8>> {
        self.reader.read_all().await
    }

    /// Independent handle on the same file, for parallel readers.
    ///
    /// Falls back to reopening from the cache if the handle cannot be cloned.
    pub async fn try_clone(&self) -> DirectoryResult<DirectoryInput> {
        let _guard = self.shared.files.lock(&self.name).await;
        let reader = match self.reader.try_clone().await {
            Ok(reader) => reader,
            Err(e) => {
                warn!(name = %self.name, error = %e, "clone failed, reopening");
                self.shared.cache.open_input(&self.name).await?
            }
        };
        Ok(DirectoryInput {
            shared: Arc::clone(&self.shared),
            name: self.name.clone(),
            reader,
        })
    }
}

impl std::fmt::Debug for DirectoryInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryInput")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}

enum Sink {
    Discard { written: u64 },
    Cached {
        shared: Arc<Shared>,
        writer: Box<dyn CacheWriter>,
    },
}

/// File being written.
///
/// Nothing becomes visible until [`close`](Self::close); dropping the
/// handle without closing discards the write.
pub struct DirectoryOutput {
    name: String,
    sink: Sink,
}

impl DirectoryOutput {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bytes written so far.
    pub fn len(&self) -> u64 {
        match &self.sink {
            Sink::Discard { written } => *written,
            Sink::Cached { writer, .. } => writer.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn write(&mut self, data: &[u8]) -> DirectoryResult<()> {
        match &mut self.sink {
            Sink::Discard { written } => {
                *written += data.len() as u64;
                Ok(())
            }
            Sink::Cached { writer, .. } => writer.write(data).await,
        }
    }

    /// Publish the file locally and push it to the remote store.
    ///
    /// Returns the file length. A failed push is an error.
    pub async fn close(self) -> DirectoryResult<u64> {
        let (shared, writer) = match self.sink {
            Sink::Discard { written } => return Ok(written),
            Sink::Cached { shared, writer } => (shared, writer),
        };

        let _guard = shared.files.lock(&self.name).await;
        let len = writer.finish().await?;
        shared.state.mark_dirty();
        shared.sync.push(&self.name).await?;
        shared.state.mark_dirty();
        Ok(len)
    }
}

impl std::fmt::Debug for DirectoryOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectoryOutput")
            .field("name", &self.name)
            .field("len", &self.len())
            .finish()
    }
}
