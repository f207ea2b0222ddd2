use async_trait::async_trait;

use super::Lock;
use crate::error::DirectoryResult;

/// Lock handed out by read-only directories: always obtainable, never held.
#[derive(Debug, Clone)]
pub struct NoopLock {
    name: String,
}

impl NoopLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[async_trait]
impl Lock for NoopLock {
    fn name(&self) -> &str {
        &self.name
    }

    async fn obtain(&self) -> DirectoryResult<bool> {
        Ok(true)
    }

    async fn release(&self) -> DirectoryResult<()> {
        Ok(())
    }

    async fn is_locked(&self) -> DirectoryResult<bool> {
        Ok(false)
    }
}
