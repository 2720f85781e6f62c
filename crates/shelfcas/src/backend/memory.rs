use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;

use super::{check_key, join_url, Backend};

/// In-process object store.
///
/// Keeps objects in a map and counts operations, which makes it the backend
/// of choice for tests. Can be switched into a failing mode to simulate an
/// outage.
#[derive(Debug)]
pub struct MemoryBackend {
    id: String,
    base_url: String,
    objects: Mutex<HashMap<String, (Bytes, String)>>,
    uploads: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryBackend {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let base_url = format!("memory://{id}");
        Self::with_base_url(id, base_url)
    }

    pub fn with_base_url(id: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            base_url: base_url.into(),
            objects: Mutex::new(HashMap::new()),
            uploads: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Number of successful `upload` calls so far.
    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    pub fn object_count(&self) -> usize {
        self.objects.lock().map(|o| o.len()).unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects
            .lock()
            .ok()
            .and_then(|o| o.get(key).map(|(data, _)| data.clone()))
    }

    /// Object bytes together with the MIME type they were uploaded with.
    pub fn object(&self, key: &str) -> Option<(Bytes, String)> {
        self.objects.lock().ok().and_then(|o| o.get(key).cloned())
    }

    /// Make every subsequent call fail (or succeed again).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Drop an object behind the registry's back, as an expired CDN entry would.
    pub fn forget(&self, key: &str) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(key);
        }
    }

    fn check_available(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(anyhow!("backend {} is unavailable", self.id));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn upload(&self, key: &str, data: Bytes, mime_type: &str) -> Result<String> {
        self.check_available()?;
        check_key(key)?;
        self.objects
            .lock()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?
            .insert(key.to_string(), (data, mime_type.to_string()));
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(self.public_url(key))
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_available()?;
        Ok(self
            .objects
            .lock()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?
            .contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_available()?;
        self.objects
            .lock()
            .map_err(|_| anyhow!("memory backend lock poisoned"))?
            .remove(key);
        Ok(())
    }

    fn public_url(&self, key: &str) -> String {
        join_url(&self.base_url, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_upload_exists_delete() -> Result<()> {
        let backend = MemoryBackend::new("small");
        let url = backend
            .upload("uploads/a.png", Bytes::from_static(b"png"), "image/png")
            .await?;

        assert_eq!(url, "memory://small/uploads/a.png");
        assert!(backend.exists("uploads/a.png").await?);
        assert_eq!(backend.upload_count(), 1);
        assert_eq!(backend.get("uploads/a.png"), Some(Bytes::from_static(b"png")));

        assert_eq!(backend.object_count(), 1);

        backend.delete("uploads/a.png").await?;
        assert!(!backend.exists("uploads/a.png").await?);
        assert_eq!(backend.object_count(), 0);
        backend.delete("uploads/a.png").await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_failing_mode() {
        let backend = MemoryBackend::new("large");
        backend.set_failing(true);
        let result = backend
            .upload("uploads/b.png", Bytes::from_static(b"x"), "image/png")
            .await;
        assert!(result.unwrap_err().to_string().contains("unavailable"));
        assert_eq!(backend.upload_count(), 0);

        backend.set_failing(false);
        assert!(!backend.exists("uploads/b.png").await.unwrap());
    }
}
