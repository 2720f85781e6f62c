use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::anyhow;

use super::AssetRegistry;
use crate::asset::{AssetDescriptor, OwnerId, Tier};
use crate::error::{CasError, Result};
use crate::hash::Fingerprint;

type Key = (OwnerId, Fingerprint);

/// In-memory registry (HashMap-backed). Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryRegistry {
    assets: RwLock<HashMap<Key, AssetDescriptor>>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_descriptors(descriptors: Vec<AssetDescriptor>) -> Self {
        let map = descriptors
            .into_iter()
            .map(|d| ((d.owner_id.clone(), d.fingerprint.clone()), d))
            .collect();
        Self {
            assets: RwLock::new(map),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<Key, AssetDescriptor>>> {
        self.assets
            .read()
            .map_err(|_| CasError::Storage(anyhow!("registry lock poisoned")))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<Key, AssetDescriptor>>> {
        self.assets
            .write()
            .map_err(|_| CasError::Storage(anyhow!("registry lock poisoned")))
    }
}

impl AssetRegistry for MemoryRegistry {
    fn lookup(
        &self,
        owner: &OwnerId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AssetDescriptor>> {
        let assets = self.read()?;
        Ok(assets.get(&(owner.clone(), fingerprint.clone())).cloned())
    }

    fn find_any(&self, fingerprint: &Fingerprint) -> Result<Option<AssetDescriptor>> {
        let assets = self.read()?;
        Ok(assets
            .values()
            .filter(|d| &d.fingerprint == fingerprint)
            .min_by_key(|d| d.created_at)
            .cloned())
    }

    fn register(&self, descriptor: AssetDescriptor) -> Result<()> {
        let mut assets = self.write()?;
        match assets.entry((descriptor.owner_id.clone(), descriptor.fingerprint.clone())) {
            Entry::Occupied(_) => Err(CasError::DuplicateKey {
                owner: descriptor.owner_id,
                fingerprint: descriptor.fingerprint,
            }),
            Entry::Vacant(slot) => {
                slot.insert(descriptor);
                Ok(())
            }
        }
    }

    fn remove(
        &self,
        owner: &OwnerId,
        fingerprint: &Fingerprint,
    ) -> Result<Option<AssetDescriptor>> {
        let mut assets = self.write()?;
        Ok(assets.remove(&(owner.clone(), fingerprint.clone())))
    }

    fn remove_exact(&self, descriptor: &AssetDescriptor) -> Result<bool> {
        let mut assets = self.write()?;
        let key = (descriptor.owner_id.clone(), descriptor.fingerprint.clone());
        let same = assets
            .get(&key)
            .is_some_and(|current| current.same_registration(descriptor));
        if same {
            assets.remove(&key);
        }
        Ok(same)
    }

    fn refresh_url(&self, descriptor: &AssetDescriptor, public_url: &str) -> Result<bool> {
        let mut assets = self.write()?;
        let key = (descriptor.owner_id.clone(), descriptor.fingerprint.clone());
        match assets.get_mut(&key) {
            Some(current) if current.same_registration(descriptor) => {
                current.public_url = public_url.to_string();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn all(&self, owner: &OwnerId) -> Result<Vec<AssetDescriptor>> {
        let assets = self.read()?;
        let mut owned: Vec<_> = assets
            .values()
            .filter(|d| &d.owner_id == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(owned)
    }

    fn snapshot(&self) -> Result<Vec<AssetDescriptor>> {
        let assets = self.read()?;
        Ok(assets.values().cloned().collect())
    }

    fn references(&self, backend: Tier, remote_key: &str) -> Result<usize> {
        let assets = self.read()?;
        Ok(assets
            .values()
            .filter(|d| d.backend == backend && d.remote_key == remote_key)
            .count())
    }

    fn count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }
}
