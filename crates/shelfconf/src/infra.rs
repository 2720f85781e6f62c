//! Configuration sections. All of these are read once at startup.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Filesystem paths for picshelf state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Base directory for the registry database and filesystem backends.
    /// Default: ~/.local/share/picshelf
    #[serde(default = "PathsConfig::default_state_dir")]
    pub state_dir: PathBuf,

    /// Registry database file. Default: `{state_dir}/registry.db`
    #[serde(default)]
    pub registry_db: Option<PathBuf>,
}

impl PathsConfig {
    fn default_state_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".local/share/picshelf"))
            .unwrap_or_else(|| PathBuf::from(".local/share/picshelf"))
    }

    /// Effective registry database path.
    pub fn registry_path(&self) -> PathBuf {
        self.registry_db
            .clone()
            .unwrap_or_else(|| self.state_dir.join("registry.db"))
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            state_dir: Self::default_state_dir(),
            registry_db: None,
        }
    }
}

/// Where the HTTP server listens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BindConfig {
    /// Default: 127.0.0.1
    #[serde(default = "BindConfig::default_host")]
    pub host: String,

    /// Default: 8090
    #[serde(default = "BindConfig::default_http_port")]
    pub http_port: u16,
}

impl BindConfig {
    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_http_port() -> u16 {
        8090
    }

    /// Base URL clients reach the server at.
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.http_port)
    }
}

impl Default for BindConfig {
    fn default() -> Self {
        Self {
            host: Self::default_host(),
            http_port: Self::default_http_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Log level or filter directive, used when RUST_LOG is unset.
    /// Default: info
    #[serde(default = "TelemetryConfig::default_log_level")]
    pub log_level: String,
}

impl TelemetryConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: Self::default_log_level(),
        }
    }
}

/// Upload placement settings, as written in the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacementSection {
    /// Payloads up to this size go to the small backend.
    /// Default: 143360 (140 KiB)
    #[serde(default = "PlacementSection::default_threshold_bytes")]
    pub threshold_bytes: u64,

    #[serde(default = "PlacementSection::default_small_backend")]
    pub small_backend: String,

    #[serde(default = "PlacementSection::default_large_backend")]
    pub large_backend: String,

    /// `per_owner` or `global`. Default: per_owner
    #[serde(default = "PlacementSection::default_dedup_scope")]
    pub dedup_scope: String,

    /// Lowercase extensions without the dot. Empty accepts anything.
    #[serde(default = "PlacementSection::default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

impl PlacementSection {
    fn default_threshold_bytes() -> u64 {
        140 * 1024
    }

    fn default_small_backend() -> String {
        "small".to_string()
    }

    fn default_large_backend() -> String {
        "large".to_string()
    }

    fn default_dedup_scope() -> String {
        "per_owner".to_string()
    }

    fn default_allowed_extensions() -> Vec<String> {
        ["jpg", "jpeg", "png", "gif", "bmp"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }
}

impl Default for PlacementSection {
    fn default() -> Self {
        Self {
            threshold_bytes: Self::default_threshold_bytes(),
            small_backend: Self::default_small_backend(),
            large_backend: Self::default_large_backend(),
            dedup_scope: Self::default_dedup_scope(),
            allowed_extensions: Self::default_allowed_extensions(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Directory on local disk, served by picshelf under `/objects/{id}`.
    #[default]
    Fs,
    /// Process memory; contents vanish on restart.
    Memory,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Fs => "fs",
            BackendKind::Memory => "memory",
        }
    }
}

/// One `[backends.<id>]` table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendSection {
    #[serde(default)]
    pub kind: BackendKind,

    /// Object directory for `fs` backends. Default: `{state_dir}/objects/{id}`
    #[serde(default)]
    pub root: Option<PathBuf>,

    /// URL prefix for public object URLs.
    /// Default: `http://{host}:{http_port}/objects/{id}`
    #[serde(default)]
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProbeKind {
    /// Ask the owning backend whether the object exists.
    #[default]
    Backend,
    /// HEAD the public URL.
    Http,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Backend => "backend",
            ProbeKind::Http => "http",
        }
    }
}

/// Dead-asset sweep settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepSection {
    #[serde(default)]
    pub probe: ProbeKind,

    /// Sweep an owner's assets when their session starts. Default: true
    #[serde(default = "SweepSection::default_on_session_start")]
    pub on_session_start: bool,

    /// Timeout for each HTTP probe. Default: 5000
    #[serde(default = "SweepSection::default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

impl SweepSection {
    fn default_on_session_start() -> bool {
        true
    }

    fn default_http_timeout_ms() -> u64 {
        5000
    }
}

impl Default for SweepSection {
    fn default() -> Self {
        Self {
            probe: ProbeKind::default(),
            on_session_start: Self::default_on_session_start(),
            http_timeout_ms: Self::default_http_timeout_ms(),
        }
    }
}

/// `[backends.<id>]` tables keyed by id.
pub type BackendsConfig = BTreeMap<String, BackendSection>;
