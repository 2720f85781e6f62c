//! Fingerprint: a BLAKE3 digest of an image payload, truncated to 128 bits.
//!
//! The fingerprint is the dedup key. It depends only on the payload bytes, so
//! the same image uploaded by another owner, under another file name or at a
//! later time always maps to the same value.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::error::CasError;

/// Length of a fingerprint in hex characters (16 bytes of BLAKE3).
pub const FINGERPRINT_LEN: usize = 32;

/// Content fingerprint - 128 bits (32 lowercase hex chars) of BLAKE3.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

/// Errors from parsing a fingerprint string.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FingerprintError {
    #[error("invalid fingerprint length: expected {FINGERPRINT_LEN} hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in fingerprint")]
    InvalidHex,
}

impl Fingerprint {
    /// Hash a payload. Empty payloads are rejected before hashing.
    pub fn of(payload: &[u8]) -> Result<Self, CasError> {
        if payload.is_empty() {
            return Err(CasError::InvalidInput("payload is empty".to_string()));
        }
        let digest = blake3::hash(payload);
        Ok(Self(hex::encode(&digest.as_bytes()[..FINGERPRINT_LEN / 2])))
    }

    /// Parse a fingerprint received from outside (URL path, database row).
    pub fn parse(s: &str) -> Result<Self, FingerprintError> {
        if s.len() != FINGERPRINT_LEN {
            return Err(FingerprintError::InvalidLength(s.len()));
        }
        if !s.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(FingerprintError::InvalidHex);
        }
        Ok(Self(s.to_ascii_lowercase()))
    }

    /// First two characters, used to shard remote keys.
    pub fn prefix(&self) -> &str {
        &self.0[..2]
    }

    pub fn remainder(&self) -> &str {
        &self.0[2..]
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = FingerprintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for Fingerprint {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_of_produces_32_hex_chars() {
        let fp = Fingerprint::of(b"Hello, World!").unwrap();
        assert_eq!(fp.as_str().len(), FINGERPRINT_LEN);
        assert!(fp.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_identical_bytes_match() {
        let a = Fingerprint::of(b"same image bytes").unwrap();
        let b = Fingerprint::of(b"same image bytes".to_vec().as_slice()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_empty_payload_is_invalid() {
        let err = Fingerprint::of(b"").unwrap_err();
        assert!(matches!(err, CasError::InvalidInput(_)));
    }

    #[test]
    fn test_known_value() {
        // Same truncation the CAS object store has always used.
        let fp = Fingerprint::of(b"Concurrent Data").unwrap();
        assert_eq!(fp.as_str(), "5c735d76fe3537a0f35cf4a4eb14a532");
    }

    #[test]
    fn test_no_collisions_across_corpus() {
        let mut seen = HashSet::new();
        for i in 0u32..20_000 {
            let mut payload = i.to_le_bytes().to_vec();
            payload.extend_from_slice(b"-image");
            let fp = Fingerprint::of(&payload).unwrap();
            assert!(seen.insert(fp), "collision at payload {i}");
        }
    }

    #[test]
    fn test_single_bit_flip_changes_fingerprint() {
        let mut payload = vec![0xAAu8; 4096];
        let before = Fingerprint::of(&payload).unwrap();
        payload[2048] ^= 0x01;
        let after = Fingerprint::of(&payload).unwrap();
        assert_ne!(before, after);
    }

    #[test]
    fn test_parse_normalizes_case() {
        let fp: Fingerprint = "ABCDEF01234567890123456789ABCDEF".parse().unwrap();
        assert_eq!(fp.as_str(), "abcdef01234567890123456789abcdef");
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert_eq!(
            Fingerprint::parse("short"),
            Err(FingerprintError::InvalidLength(5))
        );
        assert_eq!(
            Fingerprint::parse("zzzzzzzzzzzzzzzzzzzzzzzzzzzzzzzz"),
            Err(FingerprintError::InvalidHex)
        );
    }

    #[test]
    fn test_prefix_and_remainder() {
        let fp = Fingerprint::of(b"shard me").unwrap();
        assert_eq!(format!("{}{}", fp.prefix(), fp.remainder()), fp.as_str());
    }
}
