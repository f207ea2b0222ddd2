//! Directory configuration.
//!
//! Every option is fixed at construction time. Files are RON:
//!
//! ```ron
//! (
//!     connection: "file:///srv/blobs",
//!     container: "indexes",
//!     root_folder: "myindex",
//!     compress_blobs: true,
//!     cache_root: "/var/cache/blobdir/myindex",
//!     lock_strategy: Lease,
//! )
//! ```

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{DirectoryError, DirectoryResult};

/// How cross-machine write locks are taken.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockStrategy {
    /// Presence of a marker blob means locked.
    #[default]
    Marker,
    /// Native remote lease, renewed in the background while held.
    Lease,
}

/// Whether the directory may mutate anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DirectoryPolicy {
    #[default]
    ReadWrite,
    /// Writes are accepted and discarded; locks are no-ops.
    ReadOnly,
}

impl DirectoryPolicy {
    pub fn is_read_only(self) -> bool {
        matches!(self, Self::ReadOnly)
    }
}

/// Serializable configuration for a [`BlobDirectory`](crate::BlobDirectory).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DirectoryConfig {
    /// `memory://`, `file:///path` or a bare path to the shared store.
    pub connection: String,
    pub container: String,
    pub root_folder: String,
    pub compress_blobs: bool,
    pub read_only: bool,
    /// Local working copy. `None` keeps the cache in memory.
    pub cache_root: Option<PathBuf>,
    /// Allowed difference between cached and remote modification times.
    pub mtime_tolerance_ms: u64,
    pub lock_strategy: LockStrategy,
    pub lease_duration_secs: u64,
    pub lease_renew_secs: u64,
    /// Per-call deadline for remote operations. 0 disables it.
    pub remote_timeout_secs: u64,
    /// How long superseded manifests are kept.
    pub manifest_retention_secs: u64,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            connection: "memory://".into(),
            container: "blobdir".into(),
            root_folder: String::new(),
            compress_blobs: false,
            read_only: false,
            cache_root: None,
            mtime_tolerance_ms: 1_000,
            lock_strategy: LockStrategy::default(),
            lease_duration_secs: 60,
            lease_renew_secs: 30,
            remote_timeout_secs: 30,
            manifest_retention_secs: 3_600,
        }
    }
}

impl DirectoryConfig {
    /// Load and validate a RON config file.
    pub fn load(path: impl AsRef<Path>) -> DirectoryResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| DirectoryError::config(format!("{}: {e}", path.display())))?;
        Self::from_ron_str(&text)
    }

    /// Parse and validate RON text.
    pub fn from_ron_str(text: &str) -> DirectoryResult<Self> {
        let config: Self =
            ron::from_str(text).map_err(|e| DirectoryError::config(format!("RON parse error: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> DirectoryResult<()> {
        if self.container.trim().is_empty() {
            return Err(DirectoryError::config("container must not be empty"));
        }
        if self.lease_duration_secs == 0 {
            return Err(DirectoryError::config("lease_duration_secs must be positive"));
        }
        if self.lease_renew_secs == 0 || self.lease_renew_secs >= self.lease_duration_secs {
            return Err(DirectoryError::config(format!(
                "lease_renew_secs ({}) must be between 1 and lease_duration_secs ({})",
                self.lease_renew_secs, self.lease_duration_secs
            )));
        }
        Ok(())
    }

    pub fn policy(&self) -> DirectoryPolicy {
        if self.read_only {
            DirectoryPolicy::ReadOnly
        } else {
            DirectoryPolicy::ReadWrite
        }
    }

    pub fn remote_timeout(&self) -> Option<Duration> {
        (self.remote_timeout_secs > 0).then(|| Duration::from_secs(self.remote_timeout_secs))
    }

    /// Runtime options derived from this config.
    pub fn options(&self) -> DirectoryOptions {
        DirectoryOptions {
            root_folder: self.root_folder.clone(),
            compress_blobs: self.compress_blobs,
            policy: self.policy(),
            mtime_tolerance: Duration::from_millis(self.mtime_tolerance_ms),
            lock_strategy: self.lock_strategy,
            lease_duration: Duration::from_secs(self.lease_duration_secs),
            lease_renew: Duration::from_secs(self.lease_renew_secs),
            manifest_retention: Duration::from_secs(self.manifest_retention_secs),
        }
    }
}

/// Options for a directory built from an already constructed store and cache.
#[derive(Debug, Clone)]
pub struct DirectoryOptions {
    pub root_folder: String,
    pub compress_blobs: bool,
    pub policy: DirectoryPolicy,
    pub mtime_tolerance: Duration,
    pub lock_strategy: LockStrategy,
    pub lease_duration: Duration,
    pub lease_renew: Duration,
    pub manifest_retention: Duration,
}

impl Default for DirectoryOptions {
    fn default() -> Self {
        DirectoryConfig::default().options()
    }
}

impl DirectoryOptions {
    pub fn with_root_folder(mut self, root: impl Into<String>) -> Self {
        self.root_folder = root.into();
        self
    }

    pub fn with_compression(mut self, compress: bool) -> Self {
        self.compress_blobs = compress;
        self
    }

    pub fn read_only(mut self) -> Self {
        self.policy = DirectoryPolicy::ReadOnly;
        self
    }

    pub fn with_lock_strategy(mut self, strategy: LockStrategy) -> Self {
        self.lock_strategy = strategy;
        self
    }
}
