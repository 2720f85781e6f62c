//! FsBackend: a directory used as an object store.
//!
//! Objects live at `{root}/{key}`. Keys produced by the router are sharded by
//! fingerprint prefix, so the layout looks like:
//! ```text
//! {root}/
//! └── uploads/
//!     ├── 5c/
//!     │   └── 735d76fe3537a0f35cf4a4eb14a532.png
//!     └── e1/
//!         └── 0b...jpg
//! ```
//! Public URLs are `{public_base_url}/{key}`; the picshelf server mounts each
//! filesystem backend under `/objects/{id}` to serve them.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use uuid::Uuid;

use super::{check_key, join_url, Backend};

/// Filesystem-backed object store.
#[derive(Debug, Clone)]
pub struct FsBackend {
    id: String,
    root: PathBuf,
    public_base_url: String,
}

impl FsBackend {
    /// Create a backend rooted at `root`, creating the directory if needed.
    pub fn new(
        id: impl Into<String>,
        root: impl Into<PathBuf>,
        public_base_url: impl Into<String>,
    ) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create backend root {}", root.display()))?;

        Ok(Self {
            id: id.into(),
            root,
            public_base_url: public_base_url.into(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the object stored under `key`, rejecting keys that escape the root.
    pub fn object_path(&self, key: &str) -> Result<PathBuf> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl Backend for FsBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upload(&self, key: &str, data: Bytes, _mime_type: &str) -> Result<String> {
        let path = self.object_path(key)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .context("failed to create object prefix directory")?;
        }

        // Write to a unique temp name, then rename: readers never see a
        // partially written object.
        let temp_path = path.with_extension(format!("tmp-{}", Uuid::new_v4().simple()));
        fs::write(&temp_path, &data)
            .await
            .context("failed to write object file")?;
        if let Err(e) = fs::rename(&temp_path, &path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e).context("failed to move object into place");
        }

        tracing::debug!(backend = %self.id, key, bytes = data.len(), "stored object");
        Ok(self.public_url(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = self.object_path(key)?;
        fs::try_exists(&path)
            .await
            .with_context(|| format!("failed to stat {}", path.display()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
        }
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.public_base_url, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn backend(temp_dir: &TempDir) -> Result<FsBackend> {
        FsBackend::new("small", temp_dir.path(), "http://localhost:8090/objects/small")
    }

    #[tokio::test]
    async fn test_upload_and_read_back() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = backend(&temp_dir)?;

        let url = store
            .upload("uploads/ab/cdef.png", Bytes::from_static(b"Hello, World!"), "image/png")
            .await?;

        assert_eq!(url, "http://localhost:8090/objects/small/uploads/ab/cdef.png");
        assert_eq!(store.root(), temp_dir.path());
        let on_disk = std::fs::read(store.root().join("uploads/ab/cdef.png"))?;
        assert_eq!(on_disk, b"Hello, World!");
        Ok(())
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = backend(&temp_dir)?;
        store
            .upload("uploads/ab/x.jpg", Bytes::from_static(b"jpeg"), "image/jpeg")
            .await?;

        let entries: Vec<_> = std::fs::read_dir(temp_dir.path().join("uploads/ab"))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["x.jpg".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_exists_and_delete() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = backend(&temp_dir)?;

        assert!(!store.exists("uploads/00/missing.png").await?);
        store
            .upload("uploads/00/there.png", Bytes::from_static(b"x"), "image/png")
            .await?;
        assert!(store.exists("uploads/00/there.png").await?);

        store.delete("uploads/00/there.png").await?;
        assert!(!store.exists("uploads/00/there.png").await?);

        // Deleting again is fine
        store.delete("uploads/00/there.png").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_rejects_escaping_keys() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = backend(&temp_dir)?;

        let result = store
            .upload("../outside.png", Bytes::from_static(b"x"), "image/png")
            .await;
        assert!(result.is_err());
        assert!(store.exists("/etc/passwd").await.is_err());
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_writes_same_key() -> Result<()> {
        let temp_dir = TempDir::new()?;
        let store = Arc::new(backend(&temp_dir)?);

        let mut handles = vec![];
        for _ in 0..10 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store
                    .upload("uploads/5c/same.png", Bytes::from_static(b"Concurrent Data"), "image/png")
                    .await
            }));
        }
        for handle in handles {
            handle.await??;
        }

        let on_disk = std::fs::read(temp_dir.path().join("uploads/5c/same.png"))?;
        assert_eq!(on_disk, b"Concurrent Data");
        Ok(())
    }
}
