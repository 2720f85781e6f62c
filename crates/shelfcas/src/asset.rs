//! Asset types: who owns an upload, where it lives, and the transient payload.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CasError;
use crate::hash::Fingerprint;

/// Identity of the user an asset belongs to.
///
/// Supplied by the session layer and trusted as given; we only check that it
/// is a plain identifier so it can be used in keys and logs.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn new(id: impl Into<String>) -> Result<Self, CasError> {
        let id = id.into();
        if id.is_empty() || id.len() > 64 {
            return Err(CasError::InvalidInput(format!(
                "owner id must be 1-64 characters, got {}",
                id.len()
            )));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(CasError::InvalidInput(format!(
                "owner id {id:?} contains characters other than [A-Za-z0-9_-]"
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which of the two stores holds an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Payloads at or below the size threshold.
    SmallStore,
    LargeStore,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::SmallStore => "small_store",
            Tier::LargeStore => "large_store",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "small_store" => Ok(Tier::SmallStore),
            "large_store" => Ok(Tier::LargeStore),
            other => Err(CasError::InvalidInput(format!("unknown tier {other:?}"))),
        }
    }
}

/// Persistent record of one stored asset.
///
/// Keyed by `(owner_id, fingerprint)` in the registry. Only `public_url` ever
/// changes after registration (refreshed by a sweep).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetDescriptor {
    pub fingerprint: Fingerprint,
    pub backend: Tier,
    /// Object key inside the backend, e.g. `uploads/5c/735d....png`.
    pub remote_key: String,
    pub public_url: String,
    pub owner_id: OwnerId,
    pub created_at: DateTime<Utc>,
    /// Client file name of the upload that created this record.
    pub file_name: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl AssetDescriptor {
    /// Build a descriptor for a fresh registration, stamped now.
    pub fn new(
        fingerprint: Fingerprint,
        backend: Tier,
        remote_key: impl Into<String>,
        public_url: impl Into<String>,
        owner_id: OwnerId,
    ) -> Self {
        Self {
            fingerprint,
            backend,
            remote_key: remote_key.into(),
            public_url: public_url.into(),
            owner_id,
            created_at: Utc::now(),
            file_name: String::new(),
            mime_type: "application/octet-stream".to_string(),
            size_bytes: 0,
        }
    }

    /// Attach the upload's file details.
    pub fn with_file(
        mut self,
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        size_bytes: u64,
    ) -> Self {
        self.file_name = file_name.into();
        self.mime_type = mime_type.into();
        self.size_bytes = size_bytes;
        self
    }

    /// Same object, new owner: used when global dedup hands an existing
    /// upload to a different user.
    pub fn linked_for(&self, owner_id: OwnerId, file_name: impl Into<String>) -> Self {
        Self {
            owner_id,
            created_at: Utc::now(),
            file_name: file_name.into(),
            ..self.clone()
        }
    }

    /// True if `other` is the same registration (not merely the same key).
    pub fn same_registration(&self, other: &AssetDescriptor) -> bool {
        self.owner_id == other.owner_id
            && self.fingerprint == other.fingerprint
            && self.created_at == other.created_at
    }
}

/// An uploaded image for the duration of one request.
#[derive(Debug, Clone)]
pub struct ImagePayload {
    pub bytes: Bytes,
    pub file_name: String,
}

impl ImagePayload {
    pub fn new(bytes: impl Into<Bytes>, file_name: impl Into<String>) -> Self {
        Self {
            bytes: bytes.into(),
            file_name: file_name.into(),
        }
    }

    pub fn size_bytes(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// Lowercased extension without the dot, if the file name has one.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.file_name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// MIME type for the image extensions we accept.
pub fn mime_for_extension(ext: &str) -> &'static str {
    match ext {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "bmp" => "image/bmp",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).unwrap()
    }

    #[test]
    fn test_owner_id_validation() {
        assert!(OwnerId::new("alice").is_ok());
        assert!(OwnerId::new("bob_42-x").is_ok());
        assert!(OwnerId::new("").is_err());
        assert!(OwnerId::new("../etc").is_err());
        assert!(OwnerId::new("a b").is_err());
        assert!(OwnerId::new("x".repeat(65)).is_err());
    }

    #[test]
    fn test_tier_roundtrip_through_str() {
        for tier in [Tier::SmallStore, Tier::LargeStore] {
            assert_eq!(tier.as_str().parse::<Tier>().unwrap(), tier);
        }
        assert!("medium_store".parse::<Tier>().is_err());
    }

    #[test]
    fn test_descriptor_serde() {
        let fp = Fingerprint::of(b"serde test").unwrap();
        let desc = AssetDescriptor::new(
            fp,
            Tier::SmallStore,
            "uploads/ab/cdef.png",
            "http://localhost/objects/small/uploads/ab/cdef.png",
            owner("alice"),
        )
        .with_file("cat.png", "image/png", 10);

        let json = serde_json::to_string(&desc).unwrap();
        assert!(json.contains("\"backend\":\"small_store\""));
        let restored: AssetDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(desc, restored);
    }

    #[test]
    fn test_linked_for_keeps_object_and_changes_owner() {
        let fp = Fingerprint::of(b"shared").unwrap();
        let original = AssetDescriptor::new(fp, Tier::LargeStore, "k", "u", owner("alice"))
            .with_file("a.jpg", "image/jpeg", 6);
        let linked = original.linked_for(owner("bob"), "b.jpg");

        assert_eq!(linked.owner_id, owner("bob"));
        assert_eq!(linked.remote_key, original.remote_key);
        assert_eq!(linked.public_url, original.public_url);
        assert_eq!(linked.backend, original.backend);
        assert_eq!(linked.file_name, "b.jpg");
        assert!(!linked.same_registration(&original));
    }

    #[test]
    fn test_payload_extension() {
        assert_eq!(ImagePayload::new(vec![1], "Cat.JPG").extension().as_deref(), Some("jpg"));
        assert_eq!(ImagePayload::new(vec![1], "noext").extension(), None);
        assert_eq!(mime_for_extension("png"), "image/png");
        assert_eq!(mime_for_extension("tiff"), "application/octet-stream");
    }
}
