//! The storage router: hash, deduplicate, place, upload, register.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::instrument;

use crate::asset::{mime_for_extension, AssetDescriptor, ImagePayload, OwnerId, Tier};
use crate::backend::Backend;
use crate::config::PlacementConfig;
use crate::error::{CasError, Result};
use crate::hash::Fingerprint;
use crate::placement::{PlacementDecision, PlacementPolicy};
use crate::registry::AssetRegistry;
use crate::sweep::{self, LivenessProbe, SweepReport};

/// Result of a successful upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    /// New content, uploaded and registered.
    Stored(AssetDescriptor),
    /// Content was already stored; nothing was uploaded.
    Duplicate(AssetDescriptor),
}

impl UploadOutcome {
    pub fn descriptor(&self) -> &AssetDescriptor {
        match self {
            UploadOutcome::Stored(d) | UploadOutcome::Duplicate(d) => d,
        }
    }

    pub fn into_descriptor(self) -> AssetDescriptor {
        match self {
            UploadOutcome::Stored(d) | UploadOutcome::Duplicate(d) => d,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, UploadOutcome::Duplicate(_))
    }
}

/// A session start: the sweep that ran and the gallery that resulted.
#[derive(Debug, Clone)]
pub struct Session {
    pub report: SweepReport,
    pub assets: Vec<AssetDescriptor>,
}

/// Holds a fingerprint's lock and drops the map entry when nobody else wants it.
struct FingerprintGuard<'a> {
    locks: &'a DashMap<String, Arc<Mutex<()>>>,
    key: String,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for FingerprintGuard<'_> {
    fn drop(&mut self) {
        // Two references left: the map's and the one inside our guard.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 2);
    }
}

/// Routes uploads to the small or large backend and keeps the registry
/// consistent with what was actually uploaded.
pub struct StorageRouter {
    policy: PlacementPolicy,
    registry: Arc<dyn AssetRegistry>,
    small: Arc<dyn Backend>,
    large: Arc<dyn Backend>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl std::fmt::Debug for StorageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageRouter")
            .field("policy", &self.policy)
            .field("small", &self.small.id())
            .field("large", &self.large.id())
            .finish()
    }
}

impl StorageRouter {
    /// Build a router. Fails with `InvalidConfig` if the placement config is
    /// invalid or the backends' ids don't match it.
    pub fn new(
        config: PlacementConfig,
        registry: Arc<dyn AssetRegistry>,
        small: Arc<dyn Backend>,
        large: Arc<dyn Backend>,
    ) -> Result<Self> {
        config.validate()?;
        if small.id() != config.small_backend_id {
            return Err(CasError::InvalidConfig(format!(
                "small backend is {:?} but placement expects {:?}",
                small.id(),
                config.small_backend_id
            )));
        }
        if large.id() != config.large_backend_id {
            return Err(CasError::InvalidConfig(format!(
                "large backend is {:?} but placement expects {:?}",
                large.id(),
                config.large_backend_id
            )));
        }

        Ok(Self {
            policy: PlacementPolicy::new(config),
            registry,
            small,
            large,
            locks: DashMap::new(),
        })
    }

    pub fn config(&self) -> &PlacementConfig {
        self.policy.config()
    }

    pub fn registry(&self) -> &Arc<dyn AssetRegistry> {
        &self.registry
    }

    pub fn backend(&self, tier: Tier) -> &Arc<dyn Backend> {
        match tier {
            Tier::SmallStore => &self.small,
            Tier::LargeStore => &self.large,
        }
    }

    async fn lock(&self, fingerprint: &Fingerprint) -> FingerprintGuard<'_> {
        let key = fingerprint.as_str().to_string();
        let lock = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        FingerprintGuard {
            locks: &self.locks,
            key,
            _guard: lock.lock_owned().await,
        }
    }

    /// Store an image for `owner`, or return the existing record if the same
    /// bytes are already stored.
    ///
    /// Concurrent uploads of the same content are serialized, so new content
    /// is uploaded to a backend exactly once. A failed backend upload leaves
    /// the registry untouched.
    #[instrument(skip_all, fields(owner = %owner, file = %payload.file_name, size = payload.bytes.len()))]
    pub async fn upload(&self, owner: &OwnerId, payload: ImagePayload) -> Result<UploadOutcome> {
        if payload.bytes.is_empty() {
            return Err(CasError::InvalidInput("empty payload".to_string()));
        }
        let extension = payload.extension();
        if !self.config().accepts_extension(extension.as_deref()) {
            return Err(CasError::InvalidInput(format!(
                "file {:?} is not an allowed image type ({})",
                payload.file_name,
                self.config().allowed_extensions.join(", ")
            )));
        }

        let fingerprint = Fingerprint::of(&payload.bytes)?;
        let _guard = self.lock(&fingerprint).await;

        let decision = self.policy.place(
            owner,
            &fingerprint,
            payload.size_bytes(),
            self.registry.as_ref(),
        )?;

        match decision {
            PlacementDecision::Duplicate(existing) if &existing.owner_id == owner => {
                tracing::info!(fingerprint = %fingerprint, url = %existing.public_url, "duplicate upload");
                Ok(UploadOutcome::Duplicate(existing))
            }
            PlacementDecision::Duplicate(existing) => {
                // Global dedup hit on someone else's upload: link it.
                let linked = existing.linked_for(owner.clone(), payload.file_name);
                self.registry.register(linked.clone())?;
                tracing::info!(
                    fingerprint = %fingerprint,
                    from = %existing.owner_id,
                    "linked existing asset"
                );
                Ok(UploadOutcome::Duplicate(linked))
            }
            PlacementDecision::New(tier) => {
                let ext = extension.unwrap_or_else(|| "bin".to_string());
                self.store_new(owner, fingerprint, tier, &ext, payload).await
            }
        }
    }

    async fn store_new(
        &self,
        owner: &OwnerId,
        fingerprint: Fingerprint,
        tier: Tier,
        ext: &str,
        payload: ImagePayload,
    ) -> Result<UploadOutcome> {
        let backend = self.backend(tier);
        let remote_key = remote_key(&fingerprint, ext);
        let mime_type = mime_for_extension(ext);
        let size_bytes = payload.size_bytes();

        let public_url = backend
            .upload(&remote_key, payload.bytes, mime_type)
            .await
            .map_err(|source| CasError::UploadFailed {
                backend: backend.id().to_string(),
                source,
            })?;

        let descriptor = AssetDescriptor::new(
            fingerprint.clone(),
            tier,
            remote_key,
            public_url,
            owner.clone(),
        )
        .with_file(payload.file_name, mime_type, size_bytes);

        match self.registry.register(descriptor.clone()) {
            Ok(()) => {
                tracing::info!(
                    fingerprint = %fingerprint,
                    backend = %backend.id(),
                    url = %descriptor.public_url,
                    "stored new asset"
                );
                Ok(UploadOutcome::Stored(descriptor))
            }
            // Another writer on the shared registry got there first. Our upload
            // wrote the same bytes under the same key, so the object stays.
            Err(CasError::DuplicateKey { .. }) => {
                let existing = self.registry.lookup(owner, &fingerprint)?;
                tracing::warn!(
                    owner = %owner,
                    fingerprint = %fingerprint,
                    backend = %backend.id(),
                    existing_url = existing.as_ref().map(|d| d.public_url.as_str()).unwrap_or("<removed>"),
                    "registration lost to a concurrent writer after a redundant upload"
                );
                Err(CasError::DuplicateKey {
                    owner: owner.clone(),
                    fingerprint,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// The owner's assets, newest first.
    pub fn gallery(&self, owner: &OwnerId) -> Result<Vec<AssetDescriptor>> {
        self.registry.all(owner)
    }

    /// Remove one of the owner's assets. The backend object is deleted once no
    /// descriptor refers to it any more.
    #[instrument(skip_all, fields(owner = %owner, fingerprint = %fingerprint))]
    pub async fn remove(&self, owner: &OwnerId, fingerprint: &Fingerprint) -> Result<AssetDescriptor> {
        let _guard = self.lock(fingerprint).await;

        let descriptor = self
            .registry
            .remove(owner, fingerprint)?
            .ok_or_else(|| CasError::NotFound {
                owner: owner.clone(),
                fingerprint: fingerprint.clone(),
            })?;

        let remaining = self
            .registry
            .references(descriptor.backend, &descriptor.remote_key)?;
        if remaining == 0 {
            let backend = self.backend(descriptor.backend);
            if let Err(e) = backend.delete(&descriptor.remote_key).await {
                tracing::warn!(
                    backend = %backend.id(),
                    key = %descriptor.remote_key,
                    error = %format!("{e:#}"),
                    "failed to delete object, leaving it orphaned"
                );
            }
        } else {
            tracing::debug!(remaining, "object still referenced, keeping it");
        }

        Ok(descriptor)
    }

    /// Sweep dead descriptors, for one owner or for everyone.
    #[instrument(skip_all, fields(owner = ?owner.map(OwnerId::as_str)))]
    pub async fn sweep(
        &self,
        owner: Option<&OwnerId>,
        probe: &dyn LivenessProbe,
    ) -> Result<SweepReport> {
        sweep::sweep(self.registry.as_ref(), owner, probe).await
    }

    /// What happens when a user logs in: sweep their assets, then list them.
    pub async fn begin_session(
        &self,
        owner: &OwnerId,
        probe: Option<&dyn LivenessProbe>,
    ) -> Result<Session> {
        let report = match probe {
            Some(probe) => self.sweep(Some(owner), probe).await?,
            None => SweepReport::default(),
        };
        Ok(Session {
            report,
            assets: self.gallery(owner)?,
        })
    }
}

/// Object key for content: sharded by the first two hex digits.
pub fn remote_key(fingerprint: &Fingerprint, ext: &str) -> String {
    format!(
        "uploads/{}/{}.{}",
        fingerprint.prefix(),
        fingerprint.remainder(),
        ext
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::config::DedupScope;
    use crate::registry::MemoryRegistry;

    struct Fixture {
        router: StorageRouter,
        small: Arc<MemoryBackend>,
        large: Arc<MemoryBackend>,
    }

    fn fixture(config: PlacementConfig) -> Fixture {
        let small = Arc::new(MemoryBackend::new(config.small_backend_id.clone()));
        let large = Arc::new(MemoryBackend::new(config.large_backend_id.clone()));
        let router = StorageRouter::new(
            config,
            Arc::new(MemoryRegistry::new()),
            small.clone(),
            large.clone(),
        )
        .unwrap();
        Fixture { router, small, large }
    }

    fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).unwrap()
    }

    #[test]
    fn test_remote_key_layout() {
        let fp = Fingerprint::of(b"Concurrent Data").unwrap();
        assert_eq!(
            remote_key(&fp, "png"),
            "uploads/5c/735d76fe3537a0f35cf4a4eb14a532.png"
        );
    }

    #[test]
    fn test_rejects_mismatched_backends() {
        let err = StorageRouter::new(
            PlacementConfig::default(),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryBackend::new("firebase")),
            Arc::new(MemoryBackend::new("large")),
        )
        .unwrap_err();
        assert!(matches!(err, CasError::InvalidConfig(_)), "got {err:?}");
    }

    #[tokio::test]
    async fn test_rejects_bad_input() {
        let f = fixture(PlacementConfig::default());

        let err = f
            .router
            .upload(&owner("alice"), ImagePayload::new(Vec::<u8>::new(), "empty.png"))
            .await
            .unwrap_err();
        assert!(matches!(err, CasError::InvalidInput(_)));

        let err = f
            .router
            .upload(&owner("alice"), ImagePayload::new(b"MZ".to_vec(), "virus.exe"))
            .await
            .unwrap_err();
        assert!(matches!(err, CasError::InvalidInput(_)));
        assert_eq!(f.small.upload_count() + f.large.upload_count(), 0);
    }

    #[tokio::test]
    async fn test_extension_is_case_insensitive() {
        let f = fixture(PlacementConfig::default());
        let outcome = f
            .router
            .upload(&owner("alice"), ImagePayload::new(b"jpeg!".to_vec(), "HOLIDAY.JPG"))
            .await
            .unwrap();
        assert_eq!(outcome.descriptor().mime_type, "image/jpeg");
        assert!(outcome.descriptor().remote_key.ends_with(".jpg"));
    }

    #[tokio::test]
    async fn test_remove_keeps_shared_object() {
        let f = fixture(PlacementConfig::default().with_scope(DedupScope::Global));
        let payload = ImagePayload::new(b"shared pixels".to_vec(), "a.png");

        let stored = f
            .router
            .upload(&owner("alice"), payload.clone())
            .await
            .unwrap()
            .into_descriptor();
        let linked = f.router.upload(&owner("bob"), payload).await.unwrap();
        assert!(linked.is_duplicate());
        assert_eq!(f.small.upload_count(), 1);

        f.router
            .remove(&owner("alice"), &stored.fingerprint)
            .await
            .unwrap();
        assert!(f.small.get(&stored.remote_key).is_some());

        f.router
            .remove(&owner("bob"), &stored.fingerprint)
            .await
            .unwrap();
        assert!(f.small.get(&stored.remote_key).is_none());
    }

    /// A registry shared with another writer that always registers the same
    /// content a moment before we do.
    struct ContendedRegistry {
        inner: MemoryRegistry,
    }

    impl AssetRegistry for ContendedRegistry {
        fn lookup(&self, owner: &OwnerId, fp: &Fingerprint) -> Result<Option<AssetDescriptor>> {
            self.inner.lookup(owner, fp)
        }

        fn find_any(&self, fp: &Fingerprint) -> Result<Option<AssetDescriptor>> {
            self.inner.find_any(fp)
        }

        fn register(&self, descriptor: AssetDescriptor) -> Result<()> {
            let mut theirs = descriptor.clone();
            theirs.public_url = "http://other-writer.test/x.png".to_string();
            self.inner.register(theirs)?;
            self.inner.register(descriptor)
        }

        fn remove(&self, owner: &OwnerId, fp: &Fingerprint) -> Result<Option<AssetDescriptor>> {
            self.inner.remove(owner, fp)
        }

        fn remove_exact(&self, descriptor: &AssetDescriptor) -> Result<bool> {
            self.inner.remove_exact(descriptor)
        }

        fn refresh_url(&self, descriptor: &AssetDescriptor, public_url: &str) -> Result<bool> {
            self.inner.refresh_url(descriptor, public_url)
        }

        fn all(&self, owner: &OwnerId) -> Result<Vec<AssetDescriptor>> {
            self.inner.all(owner)
        }

        fn snapshot(&self) -> Result<Vec<AssetDescriptor>> {
            self.inner.snapshot()
        }

        fn references(&self, backend: Tier, remote_key: &str) -> Result<usize> {
            self.inner.references(backend, remote_key)
        }
    }

    #[tokio::test]
    async fn test_lost_registration_race_is_reported() {
        let config = PlacementConfig::default();
        let small = Arc::new(MemoryBackend::new(config.small_backend_id.clone()));
        let large = Arc::new(MemoryBackend::new(config.large_backend_id.clone()));
        let registry = Arc::new(ContendedRegistry {
            inner: MemoryRegistry::new(),
        });
        let router = StorageRouter::new(config, registry.clone(), small.clone(), large).unwrap();

        let err = router
            .upload(&owner("alice"), ImagePayload::new(b"raced".to_vec(), "a.png"))
            .await
            .unwrap_err();

        assert!(matches!(err, CasError::DuplicateKey { .. }), "got {err:?}");
        assert_eq!(small.upload_count(), 1);
        assert_eq!(small.object_count(), 1);
        let kept = registry
            .lookup(&owner("alice"), &Fingerprint::of(b"raced").unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(kept.public_url, "http://other-writer.test/x.png");
    }

    #[tokio::test]
    async fn test_remove_unknown_is_not_found() {
        let f = fixture(PlacementConfig::default());
        let fp = Fingerprint::of(b"never uploaded").unwrap();
        let err = f.router.remove(&owner("alice"), &fp).await.unwrap_err();
        assert!(matches!(err, CasError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_locks_are_released() {
        let f = fixture(PlacementConfig::default());
        f.router
            .upload(&owner("alice"), ImagePayload::new(b"one".to_vec(), "1.png"))
            .await
            .unwrap();
        f.router
            .upload(&owner("alice"), ImagePayload::new(b"one".to_vec(), "1.png"))
            .await
            .unwrap();
        assert!(f.router.locks.is_empty());
        assert_eq!(f.large.upload_count(), 0);
    }
}
