//! Filesystem-backed blob store.
//!
//! Treats a directory on shared storage (NFS, SMB, a mounted bucket) as the
//! remote. Layout under `base`:
//!
//! ```text
//! {container}/{blob name}            blob bodies
//! {container}.meta/{blob name}.json  user metadata
//! {container}.meta/.staging/         in-flight uploads
//! ```
//!
//! Uploads are staged and then published with a rename (overwrite) or a
//! hard link (create-only), so readers never see a partial body.

use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::{
    Blob, BlobError, BlobProperties, BlobReader, BlobResult, BlobStore, BlobStream,
    check_body_length,
};
use crate::clock::system_time_to_millis;

const STAGING_DIR: &str = ".staging";

/// [`BlobStore`] over a plain directory tree. Leases are not supported.
#[derive(Debug, Clone)]
pub struct FsBlobStore {
    base: PathBuf,
    container: String,
}

impl FsBlobStore {
    /// Create a store rooted at `base` using `container` as the top-level folder.
    pub fn new(base: impl Into<PathBuf>, container: impl Into<String>) -> Self {
        Self {
            base: base.into(),
            container: container.into(),
        }
    }

    fn container_dir(&self) -> PathBuf {
        self.base.join(&self.container)
    }

    fn meta_dir(&self) -> PathBuf {
        self.base.join(format!("{}.meta", self.container))
    }

    /// Validate a blob name and return its relative path.
    fn relative(name: &str) -> BlobResult<PathBuf> {
        let path = Path::new(name);
        let valid = !name.is_empty()
            && path
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if valid {
            Ok(path.to_path_buf())
        } else {
            Err(BlobError::other(format!("invalid blob name: {name}")))
        }
    }

    fn data_path(&self, name: &str) -> BlobResult<PathBuf> {
        Ok(self.container_dir().join(Self::relative(name)?))
    }

    fn meta_path(&self, name: &str) -> BlobResult<PathBuf> {
        let rel = Self::relative(name)?;
        let mut file = rel.into_os_string();
        file.push(".json");
        Ok(self.meta_dir().join(file))
    }

    async fn check_container(&self) -> BlobResult<()> {
        match fs::metadata(self.container_dir()).await {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(BlobError::other(format!(
                "{} is not a directory",
                self.container_dir().display()
            ))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(BlobError::ContainerNotFound(self.container.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Map a not-found on a blob path to the right 404 flavour.
    async fn not_found(&self, name: &str, err: io::Error) -> BlobError {
        if err.kind() != io::ErrorKind::NotFound {
            return err.into();
        }
        match self.check_container().await {
            Ok(()) => BlobError::not_found(name),
            Err(e) => e,
        }
    }

    async fn read_metadata(&self, name: &str) -> BlobResult<HashMap<String, String>> {
        match fs::read(self.meta_path(name)?).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| BlobError::other(format!("bad metadata for {name}: {e}"))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_metadata(&self, name: &str, metadata: &HashMap<String, String>) -> BlobResult<()> {
        let path = self.meta_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_vec(metadata)
            .map_err(|e| BlobError::other(format!("encode metadata for {name}: {e}")))?;
        let staged = self.stage(&json).await?;
        fs::rename(&staged, &path).await?;
        Ok(())
    }

    async fn staging_path(&self) -> BlobResult<PathBuf> {
        let staging = self.meta_dir().join(STAGING_DIR);
        fs::create_dir_all(&staging).await?;
        Ok(staging.join(Uuid::new_v4().to_string()))
    }

    /// Write bytes into the staging area and return the staged path.
    async fn stage(&self, data: &[u8]) -> BlobResult<PathBuf> {
        let path = self.staging_path().await?;
        fs::write(&path, data).await?;
        Ok(path)
    }

    /// Copy a body into the staging area, checking its length.
    async fn stage_stream(&self, name: &str, body: &mut BlobReader, length: u64) -> BlobResult<PathBuf> {
        let path = self.staging_path().await?;
        let copied = async {
            let mut file = fs::File::create(&path).await?;
            let copied = tokio::io::copy(body, &mut file).await?;
            file.flush().await?;
            Ok::<u64, io::Error>(copied)
        }
        .await;
        let checked = copied
            .map_err(BlobError::from)
            .and_then(|copied| check_body_length(name, length, copied));
        if let Err(e) = checked {
            let _ = fs::remove_file(&path).await;
            return Err(e);
        }
        Ok(path)
    }

    /// Move a staged body into place under `name`.
    async fn publish(
        &self,
        name: &str,
        staged: PathBuf,
        metadata: &HashMap<String, String>,
        overwrite: bool,
    ) -> BlobResult<()> {
        let path = self.data_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        if overwrite {
            // Metadata first so a reader never sees new bytes with stale metadata.
            self.write_metadata(name, metadata).await?;
            fs::rename(&staged, &path).await?;
        } else {
            let linked = fs::hard_link(&staged, &path).await;
            let _ = fs::remove_file(&staged).await;
            match linked {
                Ok(()) => self.write_metadata(name, metadata).await?,
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    return Err(BlobError::conflict(format!("{name} already exists")));
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn properties(&self, name: &str, meta: &std::fs::Metadata) -> BlobResult<BlobProperties> {
        let modified = meta.modified().map(system_time_to_millis).unwrap_or(0);
        Ok(BlobProperties {
            name: name.to_string(),
            length: meta.len(),
            last_modified: modified,
            metadata: self.read_metadata(name).await?,
        })
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    fn location(&self) -> String {
        format!("file://{}/{}", self.base.display(), self.container)
    }

    async fn ensure_container(&self) -> BlobResult<()> {
        fs::create_dir_all(self.container_dir()).await?;
        fs::create_dir_all(self.meta_dir()).await?;
        Ok(())
    }

    async fn list_blobs(&self, prefix: &str) -> BlobResult<Vec<BlobProperties>> {
        self.check_container().await?;

        let root = self.container_dir();
        let mut result = Vec::new();
        let mut pending = vec![root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                    continue;
                }

                let Ok(rel) = path.strip_prefix(&root) else {
                    continue;
                };
                let name = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/");
                if !name.starts_with(prefix) {
                    continue;
                }

                // Deleted between readdir and stat: skip it.
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                result.push(self.properties(&name, &meta).await?);
            }
        }

        result.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(result)
    }

    async fn get_blob(&self, name: &str) -> BlobResult<Blob> {
        let path = self.data_path(name)?;
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) => return Err(self.not_found(name, e).await),
        };
        let meta = fs::metadata(&path).await?;
        let mut properties = self.properties(name, &meta).await?;
        properties.length = data.len() as u64;
        Ok(Blob { properties, data })
    }

    async fn get_properties(&self, name: &str) -> BlobResult<BlobProperties> {
        let path = self.data_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => self.properties(name, &meta).await,
            Err(e) => Err(self.not_found(name, e).await),
        }
    }

    async fn put_blob(
        &self,
        name: &str,
        data: Vec<u8>,
        metadata: HashMap<String, String>,
        overwrite: bool,
    ) -> BlobResult<()> {
        self.check_container().await?;
        Self::relative(name)?;
        let staged = self.stage(&data).await?;
        self.publish(name, staged, &metadata, overwrite).await
    }

    async fn open_blob(&self, name: &str) -> BlobResult<BlobStream> {
        let path = self.data_path(name)?;
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) => return Err(self.not_found(name, e).await),
        };
        let meta = file.metadata().await?;
        let properties = self.properties(name, &meta).await?;
        Ok(BlobStream {
            properties,
            body: Box::pin(file),
        })
    }

    async fn put_blob_stream(
        &self,
        name: &str,
        mut body: BlobReader,
        length: u64,
        metadata: HashMap<String, String>,
        overwrite: bool,
    ) -> BlobResult<()> {
        self.check_container().await?;
        Self::relative(name)?;
        let staged = self.stage_stream(name, &mut body, length).await?;
        self.publish(name, staged, &metadata, overwrite).await
    }

    async fn delete_blob(&self, name: &str) -> BlobResult<bool> {
        let path = self.data_path(name)?;
        let existed = match fs::remove_file(&path).await {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.check_container().await?;
                false
            }
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = fs::remove_file(self.meta_path(name)?).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(blob = %name, error = %e, "failed to remove blob metadata");
            }
        }
        Ok(existed)
    }

    async fn blob_exists(&self, name: &str) -> BlobResult<bool> {
        let path = self.data_path(name)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) => match self.not_found(name, e).await {
                BlobError::NotFound(_) => Ok(false),
                other => Err(other),
            },
        }
    }
}
