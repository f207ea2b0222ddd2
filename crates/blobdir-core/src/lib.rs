//! # blobdir-core
//!
//! A directory of index files that lives in a remote blob store and is
//! worked on through a local cache.
//!
//! The index engine sees a flat, file-like directory:
//! - Reads come from the local cache while its commit generation matches
//!   the remote one, and from the remote store (pulled on demand) otherwise
//! - Writes land in the cache and are pushed on close, optionally deflated
//! - Deletes go local first so files still open by readers are never lost
//! - Write locks span machines through marker blobs or remote leases

pub mod blob;
pub mod cache;
pub mod clock;
pub mod compression;
pub mod config;
pub mod directory;
pub mod error;
pub mod file_locks;
pub mod generation;
pub mod lock;
pub mod manifest;
pub mod staleness;
pub mod sync;

pub use blob::{
    Blob, BlobError, BlobProperties, BlobReader, BlobResult, BlobStore, BlobStream, FsBlobStore,
    MemoryBlobStore, RootFolder, TimeoutBlobStore, open_store,
};
pub use cache::{CacheReader, CacheWriter, FsCache, LocalCache, MemoryCache};
pub use config::{DirectoryConfig, DirectoryOptions, DirectoryPolicy, LockStrategy};
pub use directory::{BlobDirectory, DirectoryInput, DirectoryOutput};
pub use error::{DirectoryError, DirectoryResult};
pub use lock::{LeaseLock, LocalLock, Lock, MarkerLock, MultiLock, NoopLock, obtain_with_timeout};
pub use manifest::{Manifest, ManifestEntry, ManifestStore};
pub use staleness::StalenessDetector;
pub use sync::SyncEngine;
