//! Lazy sync-state tracking.
//!
//! Any mutation marks the state dirty. The next reader recomputes it once:
//! one remote LIST, one local listing, a generation comparison. The remote
//! listing is handed back so the caller that paid for it can reuse it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::blob::{BlobResult, BlobStore, RootFolder};
use crate::cache::LocalCache;
use crate::generation::{UNKNOWN_GENERATION, current_generation};
use crate::manifest::is_manifest_file;

/// Decides whether the local cache can answer on its own.
pub struct StalenessDetector {
    store: Arc<dyn BlobStore>,
    cache: Arc<dyn LocalCache>,
    root: RootFolder,
    dirty: AtomicBool,
    in_sync: AtomicBool,
    local_generation: AtomicI64,
    remote_generation: AtomicI64,
    recompute: Mutex<()>,
}

impl StalenessDetector {
    /// New detector; starts dirty so the first access computes the state.
    pub fn new(store: Arc<dyn BlobStore>, cache: Arc<dyn LocalCache>, root: RootFolder) -> Self {
        Self {
            store,
            cache,
            root,
            dirty: AtomicBool::new(true),
            in_sync: AtomicBool::new(false),
            local_generation: AtomicI64::new(UNKNOWN_GENERATION),
            remote_generation: AtomicI64::new(UNKNOWN_GENERATION),
            recompute: Mutex::new(()),
        }
    }

    /// Force recomputation on the next [`check_dirty`](Self::check_dirty).
    ///
    /// Also withdraws any in-sync verdict until that recomputation.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
        self.in_sync.store(false, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Last computed sync verdict.
    pub fn in_sync(&self) -> bool {
        self.in_sync.load(Ordering::Acquire)
    }

    /// `(local, remote)` generations from the last recomputation.
    pub fn generations(&self) -> (i64, i64) {
        (
            self.local_generation.load(Ordering::Acquire),
            self.remote_generation.load(Ordering::Acquire),
        )
    }

    /// Recompute the sync state if dirty.
    ///
    /// Returns the remote file names when a listing was fetched, `None`
    /// when the state was already clean or the listing failed.
    pub async fn check_dirty(&self) -> Option<Vec<String>> {
        if !self.is_dirty() {
            return None;
        }
        let _guard = self.recompute.lock().await;
        // Claimed before listing: a mark_dirty that lands mid-recompute survives it.
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return None;
        }

        let remote = match self.remote_files().await {
            Ok(names) => names,
            Err(e) => {
                // Stay dirty so the next operation retries.
                warn!(root = %self.root.as_str(), error = %e, "remote listing failed, treating cache as stale");
                self.in_sync.store(false, Ordering::Release);
                self.dirty.store(true, Ordering::Release);
                return None;
            }
        };
        let local_generation = match self.cache.list().await {
            Ok(names) => current_generation(&names),
            Err(e) => {
                warn!(error = %e, "local listing failed");
                UNKNOWN_GENERATION
            }
        };
        let remote_generation = current_generation(&remote);
        let in_sync = local_generation == remote_generation && remote_generation != UNKNOWN_GENERATION;

        self.local_generation.store(local_generation, Ordering::Release);
        self.remote_generation.store(remote_generation, Ordering::Release);
        self.in_sync.store(in_sync, Ordering::SeqCst);
        if self.dirty.load(Ordering::SeqCst) {
            // A mutation raced the listing; the verdict is already stale.
            self.in_sync.store(false, Ordering::SeqCst);
        }
        debug!(local_generation, remote_generation, in_sync, "sync state recomputed");

        Some(remote)
    }

    /// Names of the directory's files in the remote store.
    pub async fn remote_files(&self) -> BlobResult<Vec<String>> {
        let blobs = self.store.list_blobs(self.root.as_str()).await?;
        Ok(blobs
            .iter()
            .filter_map(|b| self.root.file_name(&b.name))
            .filter(|name| !is_manifest_file(name))
            .map(str::to_string)
            .collect())
    }
}

impl std::fmt::Debug for StalenessDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StalenessDetector")
            .field("root", &self.root)
            .field("dirty", &self.is_dirty())
            .field("in_sync", &self.in_sync())
            .field("generations", &self.generations())
            .finish()
    }
}
