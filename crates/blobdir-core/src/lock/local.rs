use async_trait::async_trait;
use std::sync::Arc;

use super::Lock;
use crate::cache::LocalCache;
use crate::error::DirectoryResult;

/// Same-machine lock: an empty marker file in the local cache.
pub struct LocalLock {
    cache: Arc<dyn LocalCache>,
    file: String,
}

impl LocalLock {
    pub fn new(cache: Arc<dyn LocalCache>, file: impl Into<String>) -> Self {
        Self {
            cache,
            file: file.into(),
        }
    }
}

#[async_trait]
impl Lock for LocalLock {
    fn name(&self) -> &str {
        &self.file
    }

    async fn obtain(&self) -> DirectoryResult<bool> {
        self.cache.create_marker(&self.file).await
    }

    async fn release(&self) -> DirectoryResult<()> {
        match self.cache.delete(&self.file).await {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn is_locked(&self) -> DirectoryResult<bool> {
        self.cache.exists(&self.file).await
    }
}
