//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, ShelfConfig};
use std::env;
use std::path::{Path, PathBuf};

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// Discover config files in standard locations.
///
/// Returns paths in load order (system, user, local).
/// Only returns files that exist.
pub fn discover_config_files() -> Vec<PathBuf> {
    discover_config_files_with_override(None)
}

/// Discover config files, optionally with a CLI override path.
///
/// If `cli_path` is provided it replaces the local override, and it is
/// returned even if missing so that loading reports the bad path.
pub fn discover_config_files_with_override(cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let system = PathBuf::from("/etc/picshelf/config.toml");
    if system.exists() {
        files.push(system);
    }

    // XDG_CONFIG_HOME or ~/.config
    if let Some(config_dir) = directories::BaseDirs::new().map(|d| d.config_dir().to_path_buf()) {
        let user = config_dir.join("picshelf/config.toml");
        if user.exists() {
            files.push(user);
        }
    }

    if let Some(path) = cli_path {
        files.push(path.to_path_buf());
        return files;
    }

    let local = PathBuf::from("picshelf.toml");
    if local.exists() {
        files.push(local);
    }

    files
}

/// Read a config file as a raw TOML table, checking that it deserializes.
pub fn load_table(path: &Path) -> Result<toml::Table, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_table(&contents, path)
}

fn parse_table(contents: &str, path: &Path) -> Result<toml::Table, ConfigError> {
    let table: toml::Table = contents.parse().map_err(|e: toml::de::Error| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    // Catch type errors here so they name the offending file.
    toml::Value::Table(table.clone())
        .try_into::<ShelfConfig>()
        .map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    Ok(table)
}

/// Parse a single config document on top of the defaults.
pub fn parse_toml(contents: &str, path: &Path) -> Result<ShelfConfig, ConfigError> {
    let table = parse_table(contents, path)?;
    from_table(table, path)
}

/// Deserialize a merged table, filling in defaults and expanding paths.
pub fn from_table(table: toml::Table, origin: &Path) -> Result<ShelfConfig, ConfigError> {
    let mut config: ShelfConfig =
        toml::Value::Table(table)
            .try_into()
            .map_err(|e: toml::de::Error| ConfigError::Parse {
                path: origin.to_path_buf(),
                message: e.to_string(),
            })?;
    config.expand_paths();
    Ok(config)
}

/// Merge `overlay` into `base`. Tables merge key by key; anything else in
/// `overlay` replaces what `base` had.
pub fn merge_tables(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        match value {
            toml::Value::Table(incoming) => match base.get_mut(&key) {
                Some(toml::Value::Table(existing)) => merge_tables(existing, incoming),
                _ => {
                    base.insert(key, toml::Value::Table(incoming));
                }
            },
            other => {
                base.insert(key, other);
            }
        }
    }
}

/// Apply `PICSHELF_*` environment variable overrides to config.
pub fn apply_env_overrides(
    config: &mut ShelfConfig,
    sources: &mut ConfigSources,
) -> Result<(), ConfigError> {
    apply_overrides_from(config, sources, |key| env::var(key).ok())
}

/// Apply overrides from any variable source.
pub fn apply_overrides_from(
    config: &mut ShelfConfig,
    sources: &mut ConfigSources,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    let mut take = |key: &str| {
        let value = var(key)?;
        sources.env_overrides.push(key.to_string());
        Some(value)
    };

    // Paths
    if let Some(v) = take("PICSHELF_STATE_DIR") {
        config.paths.state_dir = expand_path(&v);
    }
    if let Some(v) = take("PICSHELF_REGISTRY_DB") {
        config.paths.registry_db = Some(expand_path(&v));
    }

    // Bind
    if let Some(v) = take("PICSHELF_HOST") {
        config.bind.host = v;
    }
    if let Some(v) = take("PICSHELF_HTTP_PORT") {
        config.bind.http_port = parse_var("PICSHELF_HTTP_PORT", &v)?;
    }

    // Telemetry
    if let Some(v) = take("PICSHELF_LOG_LEVEL") {
        config.telemetry.log_level = v;
    }

    // Placement
    if let Some(v) = take("PICSHELF_THRESHOLD_BYTES") {
        config.placement.threshold_bytes = parse_var("PICSHELF_THRESHOLD_BYTES", &v)?;
    }
    if let Some(v) = take("PICSHELF_DEDUP_SCOPE") {
        config.placement.dedup_scope = v;
    }

    // Sweep
    if let Some(v) = take("PICSHELF_SWEEP_PROBE") {
        config.sweep.probe = match v.to_ascii_lowercase().as_str() {
            "backend" => crate::ProbeKind::Backend,
            "http" => crate::ProbeKind::Http,
            _ => {
                return Err(ConfigError::InvalidValue {
                    key: "PICSHELF_SWEEP_PROBE".to_string(),
                    message: format!("expected backend or http, got {v:?}"),
                })
            }
        };
    }

    Ok(())
}

fn parse_var<T>(key: &str, value: &str) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{value:?}: {e}"),
    })
}

/// Expand ~ and environment variables in a path.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            home.join(stripped)
        } else {
            PathBuf::from(path)
        }
    } else if let Some(stripped) = path.strip_prefix('$') {
        // $VAR/rest/of/path
        if let Some(slash_pos) = stripped.find('/') {
            let var_name = &stripped[..slash_pos];
            if let Ok(var_value) = env::var(var_name) {
                PathBuf::from(var_value).join(&stripped[slash_pos + 1..])
            } else {
                PathBuf::from(path)
            }
        } else {
            env::var(stripped)
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(path))
        }
    } else {
        PathBuf::from(path)
    }
}
