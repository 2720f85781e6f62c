//! Placement: is this upload a duplicate, and if not, which store gets it?

use crate::asset::{AssetDescriptor, OwnerId, Tier};
use crate::config::{DedupScope, PlacementConfig};
use crate::error::Result;
use crate::hash::Fingerprint;
use crate::registry::AssetRegistry;

/// Outcome of consulting the placement policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementDecision {
    /// Content already stored; reuse this descriptor, upload nothing.
    Duplicate(AssetDescriptor),
    /// New content; upload it to this store.
    New(Tier),
}

/// Decides duplicate-or-new and small-or-large.
///
/// Never writes to the registry. Registration happens only after the backend
/// upload succeeds, so a failed upload leaves no descriptor behind.
#[derive(Debug, Clone)]
pub struct PlacementPolicy {
    config: PlacementConfig,
}

impl PlacementPolicy {
    pub fn new(config: PlacementConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PlacementConfig {
        &self.config
    }

    /// Store for a payload of `size_bytes`. The threshold is inclusive.
    pub fn tier_for(&self, size_bytes: u64) -> Tier {
        if size_bytes <= self.config.threshold_bytes {
            Tier::SmallStore
        } else {
            Tier::LargeStore
        }
    }

    /// Backend id configured for a tier.
    pub fn backend_id(&self, tier: Tier) -> &str {
        match tier {
            Tier::SmallStore => &self.config.small_backend_id,
            Tier::LargeStore => &self.config.large_backend_id,
        }
    }

    pub fn place(
        &self,
        owner: &OwnerId,
        fingerprint: &Fingerprint,
        size_bytes: u64,
        registry: &dyn AssetRegistry,
    ) -> Result<PlacementDecision> {
        if let Some(existing) = registry.lookup(owner, fingerprint)? {
            return Ok(PlacementDecision::Duplicate(existing));
        }

        if self.config.dedup_scope == DedupScope::Global {
            if let Some(existing) = registry.find_any(fingerprint)? {
                return Ok(PlacementDecision::Duplicate(existing));
            }
        }

        Ok(PlacementDecision::New(self.tier_for(size_bytes)))
    }
}
