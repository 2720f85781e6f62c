//! Content-addressed upload routing for picshelf.
//!
//! Every uploaded image is fingerprinted, checked against the asset registry,
//! and (if new) uploaded to one of two backends chosen by size:
//! - **small store**: payloads up to the threshold (140 KiB by default)
//! - **large store**: everything bigger
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use shelfcas::{ImagePayload, MemoryBackend, MemoryRegistry, OwnerId, PlacementConfig, StorageRouter};
//!
//! # async fn demo() -> shelfcas::Result<()> {
//! let router = StorageRouter::new(
//!     PlacementConfig::default(),
//!     Arc::new(MemoryRegistry::new()),
//!     Arc::new(MemoryBackend::new("small")),
//!     Arc::new(MemoryBackend::new("large")),
//! )?;
//!
//! let alice = OwnerId::new("alice")?;
//! let outcome = router
//!     .upload(&alice, ImagePayload::new(std::fs::read("cat.png").unwrap(), "cat.png"))
//!     .await?;
//! println!("{} -> {}", outcome.descriptor().fingerprint, outcome.descriptor().public_url);
//! # Ok(())
//! # }
//! ```
//!
//! # Sweeping
//!
//! Backends can lose objects behind our back (expiry, manual deletion). A
//! sweep probes every descriptor and drops the dead ones; see [`sweep()`].

pub mod asset;
pub mod backend;
pub mod config;
pub mod error;
pub mod hash;
pub mod placement;
pub mod registry;
pub mod router;
pub mod sweep;

pub use asset::{mime_for_extension, AssetDescriptor, ImagePayload, OwnerId, Tier};
pub use backend::{Backend, FsBackend, MemoryBackend};
pub use config::{DedupScope, PlacementConfig, DEFAULT_THRESHOLD_BYTES};
pub use error::{CasError, Result};
pub use hash::{Fingerprint, FingerprintError, FINGERPRINT_LEN};
pub use placement::{PlacementDecision, PlacementPolicy};
pub use registry::{AssetRegistry, MemoryRegistry, SqliteRegistry};
pub use router::{remote_key, Session, StorageRouter, UploadOutcome};
pub use sweep::{probe_fn, sweep, BackendProbe, FnProbe, HttpProbe, Liveness, LivenessProbe, SweepReport};
