//! Directory error types.

use std::io;
use thiserror::Error;

use crate::blob::BlobError;

/// Errors surfaced to the index engine by directory operations.
#[derive(Debug, Error)]
pub enum DirectoryError {
    /// File absent from every store that was consulted.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local file is open by another handle and cannot be removed yet.
    #[error("file in use: {0}")]
    InUse(String),

    /// File name would escape the cache root or is otherwise unusable.
    #[error("invalid file name: {0}")]
    InvalidName(String),

    /// Pull or push against the remote store failed.
    #[error("sync failed for {name}: {source}")]
    Sync {
        name: String,
        #[source]
        source: BlobError,
    },

    /// Remote content does not match its recorded length.
    #[error("corrupt blob {name}: expected {expected} bytes, got {actual}")]
    Corrupt {
        name: String,
        expected: u64,
        actual: u64,
    },

    /// Lock object still present after delete.
    #[error("failed to release lock: {0}")]
    LockReleaseFailed(String),

    /// Lock could not be obtained before the deadline.
    #[error("timed out obtaining lock: {0}")]
    LockTimeout(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Remote store error outside a file transfer.
    #[error(transparent)]
    Blob(#[from] BlobError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl DirectoryError {
    /// Create a NotFound error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create an InUse error.
    pub fn in_use(name: impl Into<String>) -> Self {
        Self::InUse(name.into())
    }

    /// Create an InvalidName error.
    pub fn invalid_name(name: impl Into<String>) -> Self {
        Self::InvalidName(name.into())
    }

    /// Create a Sync error for a transfer of `name`.
    pub fn sync(name: impl Into<String>, source: BlobError) -> Self {
        Self::Sync {
            name: name.into(),
            source,
        }
    }

    /// Create a Config error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Map an I/O error on `name`, keeping not-found distinguishable.
    pub fn from_io(name: &str, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(name.to_string()),
            _ => Self::Io(err),
        }
    }

    /// Map a remote error on `name`, keeping not-found distinguishable.
    pub fn from_blob(name: &str, err: BlobError) -> Self {
        if err.is_not_found() {
            Self::NotFound(name.to_string())
        } else {
            Self::sync(name, err)
        }
    }

    /// Returns true for [`DirectoryError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Convert DirectoryError to std::io::Error for engines that speak io.
impl From<DirectoryError> for io::Error {
    fn from(e: DirectoryError) -> Self {
        match e {
            DirectoryError::NotFound(msg) => io::Error::new(io::ErrorKind::NotFound, msg),
            DirectoryError::InUse(msg) => io::Error::new(io::ErrorKind::ResourceBusy, msg),
            DirectoryError::InvalidName(msg) => io::Error::new(io::ErrorKind::InvalidInput, msg),
            DirectoryError::Corrupt { name, .. } => {
                io::Error::new(io::ErrorKind::InvalidData, format!("corrupt blob {name}"))
            }
            DirectoryError::LockTimeout(msg) => io::Error::new(io::ErrorKind::TimedOut, msg),
            DirectoryError::Io(e) => e,
            other => io::Error::other(other.to_string()),
        }
    }
}

/// Directory result type.
pub type DirectoryResult<T> = Result<T, DirectoryError>;
