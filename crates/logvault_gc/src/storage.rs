//! Physical storage of archives and streams.
//!
//! Deleting a key that does not exist is not an error: a crash may leave a
//! target buffered after its object was already removed.

use async_trait::async_trait;
use futures::TryStreamExt;
use logvault_protocol::StorageConfig;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::ObjectStore;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::{GcError, Result};

#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn describe(&self) -> String;

    /// Remove the object (or directory) at `key`. Returns `false` when
    /// there was nothing to remove.
    async fn delete(&self, key: &str) -> Result<bool>;
}

/// Build the backend for a storage section of the config.
pub fn from_config(config: &StorageConfig) -> Result<Arc<dyn StorageBackend>> {
    match config {
        StorageConfig::Fs { directory } => Ok(Arc::new(FsStorage::new(directory))),
        StorageConfig::S3 {
            bucket,
            region,
            key_prefix,
            endpoint_url,
        } => {
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_region(region);
            if let Some(endpoint) = endpoint_url {
                builder = builder
                    .with_endpoint(endpoint)
                    .with_virtual_hosted_style_request(false)
                    .with_allow_http(endpoint.starts_with("http://"));
            }
            let store = builder.build()?;
            Ok(Arc::new(ObjectStorage::new(
                Arc::new(store),
                key_prefix.clone(),
                format!("s3://{}", bucket),
            )))
        }
    }
}

/// Keys are relative paths; anything that could leave the root is refused.
fn check_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    let escapes = key.is_empty()
        || path
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        return Err(GcError::InvalidTarget(key.to_string()));
    }
    Ok(())
}

// ============================================================================
// Local filesystem
// ============================================================================

pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

#[async_trait]
impl StorageBackend for FsStorage {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        let path = self.root.join(key);

        let metadata = match tokio::fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(false),
            Err(source) => {
                return Err(GcError::Delete {
                    key: key.to_string(),
                    source,
                })
            }
        };

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(GcError::Delete {
                key: key.to_string(),
                source,
            }),
        }
    }
}

// ============================================================================
// Object storage
// ============================================================================

pub struct ObjectStorage {
    store: Arc<dyn ObjectStore>,
    key_prefix: String,
    label: String,
}

impl ObjectStorage {
    pub fn new(store: Arc<dyn ObjectStore>, key_prefix: String, label: String) -> Self {
        Self {
            store,
            key_prefix,
            label,
        }
    }

    fn location(&self, key: &str) -> ObjectPath {
        let prefix = self.key_prefix.trim_matches('/');
        if prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", prefix, key))
        }
    }
}

#[async_trait]
impl StorageBackend for ObjectStorage {
    fn describe(&self) -> String {
        format!("{}/{}", self.label, self.key_prefix.trim_matches('/'))
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        check_key(key)?;
        let location = self.location(key);

        match self.store.delete(&location).await {
            Ok(()) => return Ok(true),
            Err(object_store::Error::NotFound { .. }) => {}
            Err(e) => return Err(e.into()),
        }

        // Multi-object archives live under the key as a prefix.
        let children = match self
            .store
            .list(Some(&location))
            .try_collect::<Vec<_>>()
            .await
        {
            Ok(children) => children,
            Err(object_store::Error::NotFound { .. }) => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        if children.is_empty() {
            return Ok(false);
        }
        for child in children {
            match self.store.delete(&child.location).await {
                Ok(()) | Err(object_store::Error::NotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::local::LocalFileSystem;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_fs_deletes_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        let storage = FsStorage::new(tmp.path());

        std::fs::create_dir_all(tmp.path().join("42/archiveA")).unwrap();
        std::fs::write(tmp.path().join("42/archiveA/segment.0"), b"data").unwrap();
        std::fs::write(tmp.path().join("stream.jsonl"), b"{}").unwrap();

        assert!(storage.delete("42/archiveA").await.unwrap());
        assert!(storage.delete("stream.jsonl").await.unwrap());
        assert!(!tmp.path().join("42/archiveA").exists());
        assert!(!tmp.path().join("stream.jsonl").exists());
        assert!(tmp.path().join("42").exists());

        // Second delete finds nothing and still succeeds.
        assert!(!storage.delete("42/archiveA").await.unwrap());
    }

    #[tokio::test]
    async fn test_fs_refuses_keys_outside_root() {
        let tmp = TempDir::new().unwrap();
        let storage = FsStorage::new(tmp.path().join("root"));
        for key in ["../escape", "/etc/passwd", ""] {
            let err = storage.delete(key).await.unwrap_err();
            assert!(matches!(err, GcError::InvalidTarget(_)), "key {:?}", key);
        }
    }

    #[tokio::test]
    async fn test_object_storage_missing_key_is_success() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("streams")).unwrap();
        std::fs::write(tmp.path().join("streams/s1.jsonl"), b"{}").unwrap();

        let store = LocalFileSystem::new_with_prefix(tmp.path()).unwrap();
        let storage = ObjectStorage::new(
            Arc::new(store),
            "streams/".to_string(),
            "file://test".to_string(),
        );

        assert!(storage.delete("s1.jsonl").await.unwrap());
        assert!(!tmp.path().join("streams/s1.jsonl").exists());
        assert!(!storage.delete("s1.jsonl").await.unwrap());
    }
}
