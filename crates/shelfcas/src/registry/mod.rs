//! Asset registry: `(owner, fingerprint) -> AssetDescriptor`.
//!
//! The registry is the only record of what has been uploaded where. Backends
//! never see it. Two implementations:
//! - [`MemoryRegistry`]: process-local, for tests and ephemeral runs
//! - [`SqliteRegistry`]: durable across restarts

mod memory;
mod sqlite;

pub use memory::MemoryRegistry;
pub use sqlite::SqliteRegistry;

use crate::asset::{AssetDescriptor, OwnerId, Tier};
use crate::error::Result;
use crate::hash::Fingerprint;

/// Storage for asset descriptors.
///
/// Implementations must make `register` an atomic insert-if-absent: of two
/// concurrent registrations for one key, exactly one succeeds and the other
/// gets [`CasError::DuplicateKey`](crate::CasError::DuplicateKey).
pub trait AssetRegistry: Send + Sync {
    /// Get the owner's descriptor for a fingerprint.
    fn lookup(&self, owner: &OwnerId, fingerprint: &Fingerprint)
        -> Result<Option<AssetDescriptor>>;

    /// Get any owner's descriptor for a fingerprint, oldest registration first.
    fn find_any(&self, fingerprint: &Fingerprint) -> Result<Option<AssetDescriptor>>;

    /// Insert a new descriptor. Fails with `DuplicateKey` if the key exists.
    fn register(&self, descriptor: AssetDescriptor) -> Result<()>;

    /// Remove the owner's descriptor for a fingerprint, returning it.
    fn remove(&self, owner: &OwnerId, fingerprint: &Fingerprint)
        -> Result<Option<AssetDescriptor>>;

    /// Remove a descriptor only if the stored entry is that same registration.
    ///
    /// A descriptor that was removed and re-registered in the meantime has a
    /// new `created_at` and is left alone.
    fn remove_exact(&self, descriptor: &AssetDescriptor) -> Result<bool>;

    /// Replace `public_url` of the given registration. Returns false if the
    /// registration is gone or was replaced.
    fn refresh_url(&self, descriptor: &AssetDescriptor, public_url: &str) -> Result<bool>;

    /// The owner's descriptors, most recent first.
    fn all(&self, owner: &OwnerId) -> Result<Vec<AssetDescriptor>>;

    /// Every descriptor, in no particular order.
    fn snapshot(&self) -> Result<Vec<AssetDescriptor>>;

    /// How many descriptors point at one stored object.
    fn references(&self, backend: Tier, remote_key: &str) -> Result<usize>;

    fn count(&self) -> Result<usize> {
        Ok(self.snapshot()?.len())
    }
}

/// Shared behaviour checks run against every implementation.
#[cfg(test)]
pub(crate) mod conformance {
    use super::*;
    use crate::error::CasError;
    use chrono::{Duration, Utc};
    use pretty_assertions::assert_eq;

    pub fn owner(id: &str) -> OwnerId {
        OwnerId::new(id).unwrap()
    }

    pub fn descriptor(owner_id: &str, content: &[u8]) -> AssetDescriptor {
        let fp = Fingerprint::of(content).unwrap();
        let key = format!("uploads/{}.png", fp);
        AssetDescriptor::new(
            fp,
            Tier::SmallStore,
            key.clone(),
            format!("http://cdn.test/{key}"),
            owner(owner_id),
        )
        .with_file("img.png", "image/png", content.len() as u64)
    }

    pub fn register_then_lookup(registry: &dyn AssetRegistry) {
        let desc = descriptor("alice", b"one");
        registry.register(desc.clone()).unwrap();

        let found = registry.lookup(&owner("alice"), &desc.fingerprint).unwrap();
        assert_eq!(found, Some(desc.clone()));
        assert_eq!(registry.lookup(&owner("bob"), &desc.fingerprint).unwrap(), None);
    }

    pub fn duplicate_register_fails(registry: &dyn AssetRegistry) {
        let desc = descriptor("alice", b"dup");
        registry.register(desc.clone()).unwrap();

        let err = registry.register(desc).unwrap_err();
        assert!(matches!(err, CasError::DuplicateKey { .. }), "got {err:?}");
        assert_eq!(registry.count().unwrap(), 1);
    }

    pub fn same_content_different_owners(registry: &dyn AssetRegistry) {
        let a = descriptor("alice", b"shared");
        let mut b = a.linked_for(owner("bob"), "copy.png");
        b.created_at = a.created_at + Duration::seconds(1);
        registry.register(a.clone()).unwrap();
        registry.register(b.clone()).unwrap();

        assert_eq!(registry.find_any(&a.fingerprint).unwrap(), Some(a.clone()));
        assert_eq!(registry.references(Tier::SmallStore, &a.remote_key).unwrap(), 2);
        assert_eq!(registry.references(Tier::LargeStore, &a.remote_key).unwrap(), 0);
    }

    pub fn all_is_newest_first(registry: &dyn AssetRegistry) {
        let now = Utc::now();
        for (i, content) in [b"first".as_slice(), b"second", b"third"].iter().enumerate() {
            let mut desc = descriptor("alice", content);
            desc.created_at = now + Duration::milliseconds(i as i64 * 10);
            registry.register(desc).unwrap();
        }
        registry.register(descriptor("bob", b"other")).unwrap();

        let gallery = registry.all(&owner("alice")).unwrap();
        let sizes: Vec<u64> = gallery.iter().map(|d| d.size_bytes).collect();
        assert_eq!(sizes, vec![5, 6, 5]);
        assert_eq!(gallery[0].fingerprint, Fingerprint::of(b"third").unwrap());
        assert_eq!(gallery[2].fingerprint, Fingerprint::of(b"first").unwrap());
        assert_eq!(registry.snapshot().unwrap().len(), 4);
    }

    pub fn remove_exact_respects_reregistration(registry: &dyn AssetRegistry) {
        let old = descriptor("alice", b"cycle");
        registry.register(old.clone()).unwrap();
        assert!(registry.remove(&owner("alice"), &old.fingerprint).unwrap().is_some());

        let mut fresh = old.clone();
        fresh.created_at = old.created_at + Duration::seconds(5);
        registry.register(fresh.clone()).unwrap();

        assert!(!registry.remove_exact(&old).unwrap());
        assert_eq!(
            registry.lookup(&owner("alice"), &old.fingerprint).unwrap(),
            Some(fresh.clone())
        );
        assert!(registry.remove_exact(&fresh).unwrap());
        assert_eq!(registry.lookup(&owner("alice"), &old.fingerprint).unwrap(), None);
    }

    pub fn refresh_url_updates_only_url(registry: &dyn AssetRegistry) {
        let desc = descriptor("alice", b"moved");
        registry.register(desc.clone()).unwrap();

        assert!(registry.refresh_url(&desc, "http://new.test/x.png").unwrap());
        let found = registry
            .lookup(&owner("alice"), &desc.fingerprint)
            .unwrap()
            .unwrap();
        assert_eq!(found.public_url, "http://new.test/x.png");
        assert_eq!(found.remote_key, desc.remote_key);
        assert_eq!(found.created_at, desc.created_at);

        registry.remove(&owner("alice"), &desc.fingerprint).unwrap();
        assert!(!registry.refresh_url(&desc, "http://gone.test").unwrap());
    }

    pub fn run_all(make: impl Fn() -> Box<dyn AssetRegistry>) {
        register_then_lookup(make().as_ref());
        duplicate_register_fails(make().as_ref());
        same_content_different_owners(make().as_ref());
        all_is_newest_first(make().as_ref());
        remove_exact_respects_reregistration(make().as_ref());
        refresh_url_updates_only_url(make().as_ref());
    }
}
