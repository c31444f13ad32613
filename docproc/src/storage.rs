//! Object storage consumed by stage handlers.
//!
//! Handlers only see [`ObjectStore`]; the coordinator never knows which
//! backend sits behind it.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use tracing::debug;

use crate::{Error, Result};

pub type ObjectMetadata = serde_json::Map<String, serde_json::Value>;

const METADATA_SUFFIX: &str = ".meta.json";

/// Key/value object storage.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn read_object(&self, key: &str) -> Result<Bytes>;

    async fn write_object(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> Result<()>;

    /// Metadata written with the object, if any.
    async fn object_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>>;
}

/// Reject keys that could escape the storage root.
fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::validation("object key must not be empty"));
    }
    let path = Path::new(key);
    let escapes = path
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || key.ends_with(METADATA_SUFFIX) {
        return Err(Error::validation(format!("invalid object key: {}", key)));
    }
    Ok(())
}

/// Objects stored as files under a root directory, with metadata in a JSON
/// sidecar next to each object.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    fn metadata_path(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(METADATA_SUFFIX);
        PathBuf::from(name)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn read_object(&self, key: &str) -> Result<Bytes> {
        let path = self.object_path(key)?;
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::not_found("Object", key)),
            Err(e) => Err(Error::Storage(format!("reading {}: {}", path.display(), e))),
        }
    }

    async fn write_object(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> Result<()> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Storage(format!("creating {}: {}", parent.display(), e)))?;
        }

        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| Error::Storage(format!("writing {}: {}", path.display(), e)))?;

        let meta_path = Self::metadata_path(&path);
        let meta_json = serde_json::to_vec_pretty(&metadata)?;
        tokio::fs::write(&meta_path, meta_json)
            .await
            .map_err(|e| Error::Storage(format!("writing {}: {}", meta_path.display(), e)))?;

        debug!(key, bytes = data.len(), "Stored object");
        Ok(())
    }

    async fn object_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        let path = Self::metadata_path(&self.object_path(key)?);
        match tokio::fs::read(&path).await {
            Ok(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("reading {}: {}", path.display(), e))),
        }
    }
}

/// In-process object store.
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: RwLock<HashMap<String, (Bytes, ObjectMetadata)>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn read_object(&self, key: &str) -> Result<Bytes> {
        self.objects
            .read()
            .get(key)
            .map(|(data, _)| data.clone())
            .ok_or_else(|| Error::not_found("Object", key))
    }

    async fn write_object(&self, key: &str, data: Bytes, metadata: ObjectMetadata) -> Result<()> {
        validate_key(key)?;
        self.objects
            .write()
            .insert(key.to_string(), (data, metadata));
        Ok(())
    }

    async fn object_metadata(&self, key: &str) -> Result<Option<ObjectMetadata>> {
        Ok(self.objects.read().get(key).map(|(_, meta)| meta.clone()))
    }
}
