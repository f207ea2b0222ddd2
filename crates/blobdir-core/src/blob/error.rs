//! Remote store error types.

use std::io;
use thiserror::Error;

/// Error returned by a [`BlobStore`](super::BlobStore).
#[derive(Debug, Error)]
pub enum BlobError {
    /// Blob does not exist (404).
    #[error("blob not found: {0}")]
    NotFound(String),

    /// Container/bucket does not exist (404 on the container).
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    /// Write rejected: object exists or is leased by someone else (409).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Operation not offered by this store.
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),

    /// Remote call exceeded its deadline.
    #[error("remote call timed out: {0}")]
    Timeout(String),

    /// Store unreachable.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

impl BlobError {
    /// Create a NotFound error.
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound(name.into())
    }

    /// Create a Conflict error.
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create an Other error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Returns true if the blob itself is missing.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// Returns true for 409-style conflicts.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Returns true for a 404 on the container: create it and retry.
    pub fn needs_container(&self) -> bool {
        matches!(self, Self::ContainerNotFound(_))
    }
}

/// Blob store result type.
pub type BlobResult<T> = Result<T, BlobError>;
