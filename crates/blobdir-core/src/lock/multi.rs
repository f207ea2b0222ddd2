use async_trait::async_trait;
use tracing::warn;

use super::Lock;
use crate::error::DirectoryResult;

/// Local lock in front of a distributed one; both must be held.
///
/// Same-machine contenders fail on the cheap local lock without a remote
/// round trip.
pub struct MultiLock {
    name: String,
    local: Box<dyn Lock>,
    remote: Box<dyn Lock>,
}

impl MultiLock {
    pub fn new(name: impl Into<String>, local: Box<dyn Lock>, remote: Box<dyn Lock>) -> Self {
        Self {
            name: name.into(),
            local,
            remote,
        }
    }
}

#[async_trait]
impl Lock for MultiLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn obtain(&self) -> DirectoryResult<bool> {
        if !self.local.obtain().await? {
            return Ok(false);
        }
        match self.remote.obtain().await {
            Ok(true) => Ok(true),
            other => {
                if let Err(e) = self.local.release().await {
                    warn!(lock = %self.name, error = %e, "failed to undo local lock");
                }
                other
            }
        }
    }

    async fn release(&self) -> DirectoryResult<()> {
        let remote = self.remote.release().await;
        let local = self.local.release().await;
        remote.and(local)
    }

    async fn is_locked(&self) -> DirectoryResult<bool> {
        Ok(self.local.is_locked().await? || self.remote.is_locked().await?)
    }
}
