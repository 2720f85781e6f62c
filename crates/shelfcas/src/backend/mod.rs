//! Storage backends: the object stores that actually hold uploaded bytes.
//!
//! The router talks to exactly two of them (small and large), both through
//! [`Backend`]. Anything that can put bytes under a key and hand back a URL
//! can be a backend.

mod fs;
mod memory;

pub use fs::FsBackend;
pub use memory::MemoryBackend;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;

/// An object store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Identifier used in configuration and logs.
    fn id(&self) -> &str;

    /// Store `data` under `key` and return its public URL.
    ///
    /// Uploading the same key twice overwrites; callers avoid that through
    /// the registry rather than relying on the backend.
    async fn upload(&self, key: &str, data: Bytes, mime_type: &str) -> Result<String>;

    /// Whether an object currently exists under `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Delete the object under `key`. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// The URL the backend currently serves `key` at.
    fn public_url(&self, key: &str) -> String;
}

/// Join a base URL and an object key with exactly one slash between them.
pub(crate) fn join_url(base: &str, key: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), key.trim_start_matches('/'))
}

/// Reject keys that could escape a backend's namespace.
pub(crate) fn check_key(key: &str) -> Result<()> {
    if key.is_empty()
        || key.starts_with('/')
        || key.split('/').any(|part| part.is_empty() || part == "." || part == "..")
    {
        anyhow::bail!("invalid object key: {key:?}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://a/b/", "/k/x.png"), "http://a/b/k/x.png");
        assert_eq!(join_url("http://a/b", "k/x.png"), "http://a/b/k/x.png");
    }

    #[test]
    fn test_check_key() {
        assert!(check_key("uploads/ab/cdef.png").is_ok());
        assert!(check_key("").is_err());
        assert!(check_key("/abs").is_err());
        assert!(check_key("uploads/../../etc/passwd").is_err());
        assert!(check_key("uploads//double").is_err());
    }
}
