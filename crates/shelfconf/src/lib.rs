//! Minimal configuration loading for picshelf.
//!
//! Kept to a handful of dependencies so the server binary and any tooling can
//! share it without pulling in the storage stack.
//!
//! # Usage
//!
//! ```rust,no_run
//! use shelfconf::ShelfConfig;
//!
//! let config = ShelfConfig::load().expect("Failed to load config");
//!
//! println!("Registry: {}", config.paths.registry_path().display());
//! println!("HTTP port: {}", config.bind.http_port);
//! println!("Threshold: {} bytes", config.placement.threshold_bytes);
//! ```
//!
//! # Config File Locations
//!
//! Files are loaded in order (later wins):
//! 1. `/etc/picshelf/config.toml` (system)
//! 2. `~/.config/picshelf/config.toml` (user)
//! 3. `./picshelf.toml` (local override, or the `--config` path)
//! 4. Environment variables (`PICSHELF_*`)
//!
//! # Example Config
//!
//! ```toml
//! [paths]
//! state_dir = "~/.local/share/picshelf"
//!
//! [bind]
//! host = "127.0.0.1"
//! http_port = 8090
//!
//! [telemetry]
//! log_level = "info"
//!
//! [placement]
//! threshold_bytes = 143360
//! small_backend = "small"
//! large_backend = "large"
//! dedup_scope = "per_owner"
//!
//! [backends.small]
//! kind = "fs"
//!
//! [backends.large]
//! kind = "fs"
//! root = "/srv/picshelf/large"
//!
//! [sweep]
//! probe = "backend"
//! on_session_start = true
//! ```

pub mod infra;
pub mod loader;

pub use infra::{
    BackendKind, BackendSection, BackendsConfig, BindConfig, PathsConfig, PlacementSection,
    ProbeKind, SweepSection, TelemetryConfig,
};
pub use loader::{discover_config_files_with_override, ConfigSources};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Complete picshelf configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ShelfConfig {
    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub bind: BindConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,

    #[serde(default)]
    pub placement: PlacementSection,

    #[serde(default)]
    pub backends: BackendsConfig,

    #[serde(default)]
    pub sweep: SweepSection,
}

impl ShelfConfig {
    /// Load configuration from all sources.
    ///
    /// Load order (later wins):
    /// 1. Compiled defaults
    /// 2. `/etc/picshelf/config.toml`
    /// 3. `~/.config/picshelf/config.toml`
    /// 4. `./picshelf.toml`
    /// 5. Environment variables
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load configuration with `config_path` in place of `./picshelf.toml`.
    /// System and user configs still load first.
    pub fn load_from(config_path: Option<&Path>) -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(config_path)?;
        Ok(config)
    }

    /// Load configuration and return information about sources.
    pub fn load_with_sources() -> Result<(Self, ConfigSources), ConfigError> {
        Self::load_with_sources_from(None)
    }

    /// Load configuration from optional path and return information about sources.
    pub fn load_with_sources_from(
        config_path: Option<&Path>,
    ) -> Result<(Self, ConfigSources), ConfigError> {
        let files = loader::discover_config_files_with_override(config_path);
        Self::load_files(&files)
    }

    /// Load exactly these files, in order, then apply env overrides.
    pub fn load_files(files: &[PathBuf]) -> Result<(Self, ConfigSources), ConfigError> {
        let mut sources = ConfigSources::default();
        let mut merged = toml::Table::new();

        for path in files {
            let table = loader::load_table(path)?;
            loader::merge_tables(&mut merged, table);
            sources.files.push(path.clone());
        }

        let origin = sources
            .files
            .last()
            .cloned()
            .unwrap_or_else(|| PathBuf::from("<defaults>"));
        let mut config = loader::from_table(merged, &origin)?;

        loader::apply_env_overrides(&mut config, &mut sources)?;

        Ok((config, sources))
    }

    /// Settings for a backend id; unconfigured ids get the defaults.
    pub fn backend(&self, id: &str) -> BackendSection {
        self.backends.get(id).cloned().unwrap_or_default()
    }

    /// Object directory for an `fs` backend.
    pub fn backend_root(&self, id: &str) -> PathBuf {
        self.backend(id)
            .root
            .unwrap_or_else(|| self.paths.state_dir.join("objects").join(id))
    }

    /// URL prefix for a backend's public object URLs.
    pub fn backend_public_url(&self, id: &str) -> String {
        self.backend(id)
            .public_base_url
            .unwrap_or_else(|| format!("{}/objects/{}", self.bind.base_url(), id))
    }

    pub(crate) fn expand_paths(&mut self) {
        self.paths.state_dir = loader::expand_path(&self.paths.state_dir.to_string_lossy());
        if let Some(db) = &self.paths.registry_db {
            self.paths.registry_db = Some(loader::expand_path(&db.to_string_lossy()));
        }
        for backend in self.backends.values_mut() {
            if let Some(root) = &backend.root {
                backend.root = Some(loader::expand_path(&root.to_string_lossy()));
            }
        }
    }

    /// Serialize the effective config to a TOML string.
    pub fn to_toml(&self) -> String {
        // Built by hand so implied backends and paths are spelled out.
        let mut output = String::new();

        output.push_str("# picshelf configuration\n\n");

        output.push_str("[paths]\n");
        output.push_str(&format!(
            "state_dir = {}\n",
            toml_path(&self.paths.state_dir)
        ));
        output.push_str(&format!(
            "registry_db = {}\n",
            toml_path(&self.paths.registry_path())
        ));

        output.push_str("\n[bind]\n");
        output.push_str(&format!("host = {}\n", toml_str(&self.bind.host)));
        output.push_str(&format!("http_port = {}\n", self.bind.http_port));

        output.push_str("\n[telemetry]\n");
        output.push_str(&format!(
            "log_level = {}\n",
            toml_str(&self.telemetry.log_level)
        ));

        output.push_str("\n[placement]\n");
        output.push_str(&format!(
            "threshold_bytes = {}\n",
            self.placement.threshold_bytes
        ));
        output.push_str(&format!(
            "small_backend = {}\n",
            toml_str(&self.placement.small_backend)
        ));
        output.push_str(&format!(
            "large_backend = {}\n",
            toml_str(&self.placement.large_backend)
        ));
        output.push_str(&format!(
            "dedup_scope = {}\n",
            toml_str(&self.placement.dedup_scope)
        ));
        let extensions: Vec<String> = self
            .placement
            .allowed_extensions
            .iter()
            .map(|e| toml_str(e))
            .collect();
        output.push_str(&format!(
            "allowed_extensions = [{}]\n",
            extensions.join(", ")
        ));

        let mut ids: Vec<&str> = self.backends.keys().map(String::as_str).collect();
        for id in [&self.placement.small_backend, &self.placement.large_backend] {
            if !ids.contains(&id.as_str()) {
                ids.push(id);
            }
        }
        ids.sort();
        for id in ids {
            let backend = self.backend(id);
            output.push_str(&format!("\n[backends.{}]\n", toml_key(id)));
            output.push_str(&format!("kind = {}\n", toml_str(backend.kind.as_str())));
            if backend.kind == BackendKind::Fs {
                output.push_str(&format!(
                    "root = {}\n",
                    toml_path(&self.backend_root(id))
                ));
            }
            output.push_str(&format!(
                "public_base_url = {}\n",
                toml_str(&self.backend_public_url(id))
            ));
        }

        output.push_str("\n[sweep]\n");
        output.push_str(&format!(
            "probe = {}\n",
            toml_str(self.sweep.probe.as_str())
        ));
        output.push_str(&format!(
            "on_session_start = {}\n",
            self.sweep.on_session_start
        ));
        output.push_str(&format!(
            "http_timeout_ms = {}\n",
            self.sweep.http_timeout_ms
        ));

        output
    }
}

/// A TOML string literal, escaped.
fn toml_str(value: &str) -> String {
    toml::Value::String(value.to_string()).to_string()
}

fn toml_path(path: &Path) -> String {
    toml_str(&path.to_string_lossy())
}

/// Bare keys only allow `[A-Za-z0-9_-]`; anything else is quoted.
fn toml_key(key: &str) -> String {
    let bare = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if bare {
        key.to_string()
    } else {
        toml_str(key)
    }
}
