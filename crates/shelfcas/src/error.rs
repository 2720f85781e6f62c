use thiserror::Error;

use crate::asset::OwnerId;
use crate::hash::{Fingerprint, FingerprintError};

/// Errors surfaced by the placement, registry and routing layers.
#[derive(Debug, Error)]
pub enum CasError {
    /// Empty payload, unsupported file type, malformed identifier.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// `register` was called for a key that is already present. Either the
    /// caller skipped the lookup or two uploads raced past the lock.
    #[error("asset {fingerprint} is already registered for owner {owner}")]
    DuplicateKey {
        owner: OwnerId,
        fingerprint: Fingerprint,
    },

    #[error("upload to backend {backend} failed: {source}")]
    UploadFailed {
        backend: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("no asset {fingerprint} for owner {owner}")]
    NotFound {
        owner: OwnerId,
        fingerprint: Fingerprint,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Registry persistence failure.
    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<FingerprintError> for CasError {
    fn from(e: FingerprintError) -> Self {
        CasError::InvalidInput(e.to_string())
    }
}

pub type Result<T, E = CasError> = std::result::Result<T, E>;
