//! Write locks.
//!
//! Contention is not an error: [`Lock::obtain`] returns `Ok(false)` when
//! someone else holds the lock. Strategies:
//!
//! - [`MarkerLock`] - marker blob in the remote store
//! - [`LeaseLock`] - native remote lease with background renewal
//! - [`LocalLock`] - marker file in the local cache
//! - [`MultiLock`] - local and remote together
//! - [`NoopLock`] - read-only directories

mod lease;
mod local;
mod marker;
mod multi;
mod noop;

use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub use lease::LeaseLock;
pub use local::LocalLock;
pub use marker::MarkerLock;
pub use multi::MultiLock;
pub use noop::NoopLock;

use crate::error::{DirectoryError, DirectoryResult};

/// Shortest lease the check in [`LeaseLock::is_locked`] may take.
pub const CHECK_LEASE: Duration = Duration::from_secs(15);

/// A named mutual-exclusion lock.
#[async_trait]
pub trait Lock: Send + Sync {
    /// Scoped lock name, for logs.
    fn name(&self) -> &str;

    /// Try once to take the lock. `Ok(false)` means it is held elsewhere.
    async fn obtain(&self) -> DirectoryResult<bool>;

    /// Give the lock up. Releasing an unheld lock is not an error.
    async fn release(&self) -> DirectoryResult<()>;

    /// Whether anyone holds the lock.
    async fn is_locked(&self) -> DirectoryResult<bool>;
}

/// Poll [`Lock::obtain`] until it succeeds or `timeout` passes.
pub async fn obtain_with_timeout(
    lock: &dyn Lock,
    timeout: Duration,
    poll_interval: Duration,
) -> DirectoryResult<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if lock.obtain().await? {
            return Ok(());
        }
        if tokio::time::Instant::now() + poll_interval > deadline {
            return Err(DirectoryError::LockTimeout(lock.name().to_string()));
        }
        debug!(lock = lock.name(), "lock busy, retrying");
        tokio::time::sleep(poll_interval).await;
    }
}
