//! Per-file mutexes keyed by `(directory id, file name)`.
//!
//! Serializes the "check cache → maybe pull → open" sequence for one file
//! within a process. Entries are created on demand and dropped once the
//! last guard for them goes away, so the registry does not grow without
//! bound.

use dashmap::DashMap;
use std::sync::{Arc, LazyLock};
use tokio::sync::{Mutex, OwnedMutexGuard};

type Key = (String, String);

/// Registry value. Slots count references to the entry; the owned guard
/// only holds the inner mutex.
#[derive(Debug, Default)]
struct Entry {
    mutex: Arc<Mutex<()>>,
}

static REGISTRY: LazyLock<DashMap<Key, Arc<Entry>>> = LazyLock::new(DashMap::new);

/// Handle onto the process-wide registry, scoped to one directory id.
#[derive(Debug, Clone)]
pub struct FileLocks {
    scope: Arc<str>,
}

impl FileLocks {
    pub fn new(scope: impl Into<Arc<str>>) -> Self {
        Self {
            scope: scope.into(),
        }
    }

    /// Wait for exclusive access to `name` within this scope.
    ///
    /// Cancelling the wait still releases this caller's hold on the entry.
    pub async fn lock(&self, name: &str) -> FileGuard {
        let slot = Slot::acquire((self.scope.to_string(), name.to_string()));
        let guard = Arc::clone(&slot.entry.mutex).lock_owned().await;
        FileGuard {
            _guard: guard,
            _slot: slot,
        }
    }

    /// Number of live registry entries in this scope.
    pub fn active(&self) -> usize {
        REGISTRY
            .iter()
            .filter(|e| e.key().0.as_str() == &*self.scope)
            .count()
    }
}

/// One caller's reference to a registry entry.
///
/// Dropping it removes the entry once no other caller refers to it.
#[derive(Debug)]
struct Slot {
    key: Key,
    entry: Arc<Entry>,
}

impl Slot {
    fn acquire(key: Key) -> Self {
        let entry = REGISTRY.entry(key.clone()).or_default().clone();
        Self { key, entry }
    }
}

impl Drop for Slot {
    fn drop(&mut self) {
        // Our own reference plus the registry's.
        REGISTRY.remove_if(&self.key, |_, entry| Arc::strong_count(entry) == 2);
    }
}

/// Held while a file is being pulled, opened, or published.
#[derive(Debug)]
pub struct FileGuard {
    _guard: OwnedMutexGuard<()>,
    _slot: Slot,
}
