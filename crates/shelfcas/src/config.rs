//! Placement configuration: size threshold, backend identifiers, dedup scope.
//!
//! By default, payloads up to 140 KiB go to the small store, everything else
//! to the large store, and duplicates are only detected within one owner's
//! uploads.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::CasError;

/// Default size threshold: 140 KiB.
pub const DEFAULT_THRESHOLD_BYTES: u64 = 140 * 1024;

/// Whether a duplicate is detected among one owner's uploads or everyone's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DedupScope {
    /// Only the requesting owner's assets are consulted. Nobody learns the
    /// URL of another user's upload by re-uploading the same bytes.
    #[default]
    PerOwner,
    /// Any owner's asset satisfies the lookup; the stored object is shared.
    Global,
}

impl fmt::Display for DedupScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DedupScope::PerOwner => f.write_str("per_owner"),
            DedupScope::Global => f.write_str("global"),
        }
    }
}

impl FromStr for DedupScope {
    type Err = CasError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "per_owner" | "per-owner" | "owner" => Ok(DedupScope::PerOwner),
            "global" => Ok(DedupScope::Global),
            other => Err(CasError::InvalidConfig(format!(
                "unknown dedup scope {other:?} (expected per_owner or global)"
            ))),
        }
    }
}

/// Configuration for the placement policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlacementConfig {
    /// Inclusive upper bound for the small store.
    #[serde(default = "default_threshold")]
    pub threshold_bytes: u64,

    #[serde(default = "default_small_backend")]
    pub small_backend_id: String,

    #[serde(default = "default_large_backend")]
    pub large_backend_id: String,

    #[serde(default)]
    pub dedup_scope: DedupScope,

    /// Accepted file extensions, lowercase, without the dot.
    /// Empty means any extension is accepted.
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_threshold() -> u64 {
    DEFAULT_THRESHOLD_BYTES
}

fn default_small_backend() -> String {
    "small".to_string()
}

fn default_large_backend() -> String {
    "large".to_string()
}

fn default_extensions() -> Vec<String> {
    ["jpg", "jpeg", "png", "gif", "bmp"]
        .into_iter()
        .map(String::from)
        .collect()
}

impl Default for PlacementConfig {
    fn default() -> Self {
        Self {
            threshold_bytes: default_threshold(),
            small_backend_id: default_small_backend(),
            large_backend_id: default_large_backend(),
            dedup_scope: DedupScope::default(),
            allowed_extensions: default_extensions(),
        }
    }
}

impl PlacementConfig {
    /// Config with a custom threshold, other fields default.
    pub fn with_threshold(threshold_bytes: u64) -> Self {
        Self {
            threshold_bytes,
            ..Self::default()
        }
    }

    pub fn with_backends(mut self, small: impl Into<String>, large: impl Into<String>) -> Self {
        self.small_backend_id = small.into();
        self.large_backend_id = large.into();
        self
    }

    pub fn with_scope(mut self, scope: DedupScope) -> Self {
        self.dedup_scope = scope;
        self
    }

    /// Check the config is usable. Called when a router is built.
    pub fn validate(&self) -> Result<(), CasError> {
        if self.threshold_bytes == 0 {
            return Err(CasError::InvalidConfig(
                "threshold_bytes must be greater than zero".to_string(),
            ));
        }
        if self.small_backend_id.is_empty() || self.large_backend_id.is_empty() {
            return Err(CasError::InvalidConfig(
                "backend ids must not be empty".to_string(),
            ));
        }
        if self.small_backend_id == self.large_backend_id {
            return Err(CasError::InvalidConfig(format!(
                "small and large backends must differ (both are {:?})",
                self.small_backend_id
            )));
        }
        if let Some(bad) = self
            .allowed_extensions
            .iter()
            .find(|e| e.starts_with('.') || e.chars().any(|c| c.is_ascii_uppercase()))
        {
            return Err(CasError::InvalidConfig(format!(
                "allowed extension {bad:?} must be lowercase without a leading dot"
            )));
        }
        Ok(())
    }

    pub fn accepts_extension(&self, ext: Option<&str>) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        ext.is_some_and(|e| self.allowed_extensions.iter().any(|a| a == e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PlacementConfig::default();
        assert_eq!(config.threshold_bytes, 143_360);
        assert_eq!(config.dedup_scope, DedupScope::PerOwner);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let config = PlacementConfig::with_threshold(0);
        assert!(matches!(config.validate(), Err(CasError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_same_backend() {
        let config = PlacementConfig::default().with_backends("one", "one");
        assert!(matches!(config.validate(), Err(CasError::InvalidConfig(_))));
    }

    #[test]
    fn test_validate_rejects_dotted_extension() {
        let mut config = PlacementConfig::default();
        config.allowed_extensions.push(".tiff".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_accepts_extension() {
        let config = PlacementConfig::default();
        assert!(config.accepts_extension(Some("png")));
        assert!(!config.accepts_extension(Some("exe")));
        assert!(!config.accepts_extension(None));

        let open = PlacementConfig {
            allowed_extensions: vec![],
            ..PlacementConfig::default()
        };
        assert!(open.accepts_extension(None));
    }

    #[test]
    fn test_dedup_scope_parse() {
        assert_eq!("global".parse::<DedupScope>().unwrap(), DedupScope::Global);
        assert_eq!("per-owner".parse::<DedupScope>().unwrap(), DedupScope::PerOwner);
        assert!("everyone".parse::<DedupScope>().is_err());
    }

    #[test]
    fn test_serde_defaults_fill_missing_fields() {
        let config: PlacementConfig =
            serde_json::from_str(r#"{"threshold_bytes": 1024, "dedup_scope": "global"}"#).unwrap();
        assert_eq!(config.threshold_bytes, 1024);
        assert_eq!(config.dedup_scope, DedupScope::Global);
        assert_eq!(config.small_backend_id, "small");
        assert_eq!(config.allowed_extensions.len(), 5);
    }
}
