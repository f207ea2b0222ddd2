//! Snapshot manifests.
//!
//! A manifest records which remote blobs make up one logical snapshot of
//! the index. Manifests live next to the files as
//! `{root}cc-{id}.manifest` (JSON) and are kept for a retention window,
//! after which all but the most recent are collected.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::blob::{BlobStore, RootFolder};
use crate::clock::now_millis;
use crate::error::{DirectoryError, DirectoryResult};

const MANIFEST_PREFIX: &str = "cc-";
const MANIFEST_SUFFIX: &str = ".manifest";

/// Whether a directory-relative name is a manifest object.
pub fn is_manifest_file(name: &str) -> bool {
    name.starts_with(MANIFEST_PREFIX) && name.ends_with(MANIFEST_SUFFIX)
}

/// Directory-relative object name for a manifest id.
pub fn manifest_file_name(id: Uuid) -> String {
    format!("{MANIFEST_PREFIX}{id}{MANIFEST_SUFFIX}")
}

/// One file of a snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    /// Name the index engine uses.
    pub lucene_file_name: String,
    /// Full remote object name.
    pub blob_file_name: String,
    /// Manifest that first recorded this file.
    pub original_manifest_id: Uuid,
}

/// A versioned snapshot descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Manifest {
    pub id: Uuid,
    /// ms since the Unix epoch.
    pub modified: i64,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    /// Build a manifest for `files`, carrying origins forward from `previous`.
    pub fn snapshot(root: &RootFolder, files: &[String], previous: Option<&Manifest>) -> Self {
        let id = Uuid::now_v7();
        let origins: HashMap<&str, Uuid> = previous
            .map(|m| {
                m.entries
                    .iter()
                    .map(|e| (e.lucene_file_name.as_str(), e.original_manifest_id))
                    .collect()
            })
            .unwrap_or_default();

        let mut entries: Vec<_> = files
            .iter()
            .map(|name| ManifestEntry {
                lucene_file_name: name.clone(),
                blob_file_name: root.blob_name(name),
                original_manifest_id: origins.get(name.as_str()).copied().unwrap_or(id),
            })
            .collect();
        entries.sort_by(|a, b| a.lucene_file_name.cmp(&b.lucene_file_name));

        Self {
            id,
            modified: now_millis(),
            entries,
        }
    }

    pub fn file_names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.lucene_file_name.as_str())
    }
}

/// Reads and writes manifests for one root folder.
pub struct ManifestStore {
    store: Arc<dyn BlobStore>,
    root: RootFolder,
}

impl ManifestStore {
    pub fn new(store: Arc<dyn BlobStore>, root: RootFolder) -> Self {
        Self { store, root }
    }

    fn blob_name(&self, id: Uuid) -> String {
        self.root.blob_name(&manifest_file_name(id))
    }

    pub async fn save(&self, manifest: &Manifest) -> DirectoryResult<()> {
        let name = self.blob_name(manifest.id);
        let body = serde_json::to_vec_pretty(manifest)
            .map_err(|e| DirectoryError::other(format!("serialize manifest: {e}")))?;

        match self
            .store
            .put_blob(&name, body.clone(), HashMap::new(), true)
            .await
        {
            Ok(()) => {}
            Err(e) if e.needs_container() => {
                self.store.ensure_container().await?;
                self.store.put_blob(&name, body, HashMap::new(), true).await?;
            }
            Err(e) => return Err(DirectoryError::sync(name, e)),
        }
        info!(id = %manifest.id, entries = manifest.entries.len(), "manifest saved");
        Ok(())
    }

    pub async fn load(&self, id: Uuid) -> DirectoryResult<Manifest> {
        let name = self.blob_name(id);
        let blob = self
            .store
            .get_blob(&name)
            .await
            .map_err(|e| DirectoryError::from_blob(&name, e))?;
        serde_json::from_slice(&blob.data)
            .map_err(|e| DirectoryError::other(format!("parse manifest {name}: {e}")))
    }

    /// All readable manifests, oldest first.
    ///
    /// Unparseable manifest objects are skipped with a warning.
    pub async fn list(&self) -> DirectoryResult<Vec<Manifest>> {
        let blobs = match self.store.list_blobs(self.root.as_str()).await {
            Ok(blobs) => blobs,
            Err(e) if e.needs_container() => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let names: Vec<String> = blobs
            .into_iter()
            .filter(|b| self.root.file_name(&b.name).is_some_and(is_manifest_file))
            .map(|b| b.name)
            .collect();
        let fetched = join_all(names.iter().map(|name| self.store.get_blob(name))).await;

        let mut manifests = Vec::new();
        for (name, result) in names.into_iter().zip(fetched) {
            match result {
                Ok(b) => match serde_json::from_slice::<Manifest>(&b.data) {
                    Ok(m) => manifests.push(m),
                    Err(e) => warn!(name = %name, error = %e, "skipping unreadable manifest"),
                },
                // Collected between list and get.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(DirectoryError::sync(name, e)),
            }
        }
        manifests.sort_by_key(|m| (m.modified, m.id));
        Ok(manifests)
    }

    pub async fn latest(&self) -> DirectoryResult<Option<Manifest>> {
        Ok(self.list().await?.pop())
    }

    /// Delete manifests older than `retention`, always keeping the newest.
    ///
    /// Returns the ids removed.
    pub async fn collect_garbage(&self, retention: Duration) -> DirectoryResult<Vec<Uuid>> {
        let mut manifests = self.list().await?;
        if manifests.pop().is_none() {
            return Ok(Vec::new());
        }

        let cutoff = now_millis() - retention.as_millis() as i64;
        let mut removed = Vec::new();
        for manifest in manifests.into_iter().filter(|m| m.modified < cutoff) {
            self.store.delete_blob(&self.blob_name(manifest.id)).await?;
            debug!(id = %manifest.id, "manifest expired");
            removed.push(manifest.id);
        }
        if !removed.is_empty() {
            info!(count = removed.len(), "collected expired manifests");
        }
        Ok(removed)
    }
}

impl std::fmt::Debug for ManifestStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManifestStore")
            .field("store", &self.store.location())
            .field("root", &self.root)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobStore;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_manifest_names() {
        let id = Uuid::now_v7();
        let name = manifest_file_name(id);
        assert!(name.starts_with("cc-"));
        assert!(is_manifest_file(&name));
        assert!(!is_manifest_file("segments_1"));
        assert!(!is_manifest_file("cc-notes.txt"));
    }

    #[test]
    fn test_json_uses_pascal_case() {
        let manifest = Manifest::snapshot(&RootFolder::new("idx"), &names(&["_0.cfs"]), None);
        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"Entries\""));
        assert!(json.contains("\"LuceneFileName\":\"_0.cfs\""));
        assert!(json.contains("\"BlobFileName\":\"idx/_0.cfs\""));
        assert!(json.contains("\"OriginalManifestId\""));
    }

    #[test]
    fn test_snapshot_carries_origin_forward() {
        let root = RootFolder::new("idx");
        let first = Manifest::snapshot(&root, &names(&["_0.cfs", "segments_1"]), None);
        assert!(first.entries.iter().all(|e| e.original_manifest_id == first.id));

        let second = Manifest::snapshot(&root, &names(&["_0.cfs", "_1.cfs", "segments_2"]), Some(&first));
        let origin = |n: &str| {
            second
                .entries
                .iter()
                .find(|e| e.lucene_file_name == n)
                .map(|e| e.original_manifest_id)
        };
        assert_eq!(origin("_0.cfs"), Some(first.id));
        assert_eq!(origin("_1.cfs"), Some(second.id));
        assert_eq!(origin("segments_1"), None);
    }

    #[tokio::test]
    async fn test_save_load_list() {
        let store = Arc::new(MemoryBlobStore::new("c"));
        let manifests = ManifestStore::new(store.clone(), RootFolder::new("idx"));
        assert!(manifests.latest().await.unwrap().is_none());

        let root = RootFolder::new("idx");
        let first = Manifest::snapshot(&root, &names(&["segments_1"]), None);
        manifests.save(&first).await.unwrap();
        let mut second = Manifest::snapshot(&root, &names(&["segments_2"]), Some(&first));
        second.modified = first.modified + 1;
        manifests.save(&second).await.unwrap();

        assert_eq!(manifests.load(first.id).await.unwrap(), first);
        assert_eq!(manifests.list().await.unwrap().len(), 2);
        assert_eq!(manifests.latest().await.unwrap().unwrap().id, second.id);
        assert!(manifests.load(Uuid::now_v7()).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_garbage_collection_keeps_newest() {
        let store = Arc::new(MemoryBlobStore::new("c"));
        let manifests = ManifestStore::new(store.clone(), RootFolder::default());
        let root = RootFolder::default();

        let mut old = Manifest::snapshot(&root, &names(&["segments_1"]), None);
        old.modified = now_millis() - 10_000;
        manifests.save(&old).await.unwrap();
        let mut older_but_newest = Manifest::snapshot(&root, &names(&["segments_2"]), None);
        older_but_newest.modified = now_millis() - 5_000;
        manifests.save(&older_but_newest).await.unwrap();

        let removed = manifests
            .collect_garbage(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(removed, vec![old.id]);
        let left = manifests.list().await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id, older_but_newest.id);

        // Nothing is ever collected while it is the only one.
        assert!(manifests.collect_garbage(Duration::ZERO).await.unwrap().is_empty());
    }
}
