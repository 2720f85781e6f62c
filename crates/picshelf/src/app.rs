//! Wiring: turn a loaded [`ShelfConfig`] into a running storage stack.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use shelfcas::{
    Backend, BackendProbe, FsBackend, HttpProbe, LivenessProbe, MemoryBackend, PlacementConfig,
    SqliteRegistry, StorageRouter,
};
use shelfconf::{BackendKind, ProbeKind, ShelfConfig};

/// A backend whose objects picshelf itself serves under `/objects/{id}`.
#[derive(Clone)]
pub enum ObjectSource {
    Fs(Arc<FsBackend>),
    Memory(Arc<MemoryBackend>),
}

impl ObjectSource {
    fn backend(&self) -> Arc<dyn Backend> {
        match self {
            ObjectSource::Fs(b) => b.clone(),
            ObjectSource::Memory(b) => b.clone(),
        }
    }
}

/// Everything the HTTP layer needs, built once at startup.
#[derive(Clone)]
pub struct AppContext {
    pub router: Arc<StorageRouter>,
    pub probe: Arc<dyn LivenessProbe>,
    pub objects: Arc<HashMap<String, ObjectSource>>,
    pub sweep_on_session: bool,
}

/// Placement settings from the `[placement]` section.
pub fn placement_config(config: &ShelfConfig) -> Result<PlacementConfig> {
    let section = &config.placement;
    Ok(PlacementConfig {
        threshold_bytes: section.threshold_bytes,
        small_backend_id: section.small_backend.clone(),
        large_backend_id: section.large_backend.clone(),
        dedup_scope: section.dedup_scope.parse()?,
        allowed_extensions: section.allowed_extensions.clone(),
    })
}

fn build_backend(config: &ShelfConfig, id: &str) -> Result<ObjectSource> {
    let section = config.backend(id);
    let public_url = config.backend_public_url(id);

    let source = match section.kind {
        BackendKind::Fs => {
            let root = config.backend_root(id);
            let backend = FsBackend::new(id, &root, public_url)
                .with_context(|| format!("Failed to open backend {id}"))?;
            tracing::info!("   {} (fs): {}", id, backend.root().display());
            ObjectSource::Fs(Arc::new(backend))
        }
        BackendKind::Memory => {
            tracing::info!("   {} (memory, not persistent)", id);
            ObjectSource::Memory(Arc::new(MemoryBackend::with_base_url(id, public_url)))
        }
    };
    Ok(source)
}

impl AppContext {
    pub fn from_config(config: &ShelfConfig) -> Result<Self> {
        let placement = placement_config(config).context("Invalid [placement] section")?;

        tracing::info!("🗂️  Opening asset registry...");
        let registry_path = config.paths.registry_path();
        let registry = SqliteRegistry::open(&registry_path)
            .with_context(|| format!("Failed to open registry at {}", registry_path.display()))?;
        tracing::info!("   Registry at: {}", registry.path().display());

        tracing::info!("🪣 Initializing storage backends...");
        let small = build_backend(config, &placement.small_backend_id)?;
        let large = build_backend(config, &placement.large_backend_id)?;

        let probe: Arc<dyn LivenessProbe> = match config.sweep.probe {
            ProbeKind::Backend => Arc::new(BackendProbe::new(small.backend(), large.backend())),
            ProbeKind::Http => Arc::new(HttpProbe::new(Duration::from_millis(
                config.sweep.http_timeout_ms,
            ))?),
        };

        tracing::info!(
            "📐 Placement: <= {} bytes -> {}, larger -> {}, dedup {}",
            placement.threshold_bytes,
            placement.small_backend_id,
            placement.large_backend_id,
            placement.dedup_scope
        );

        let mut objects = HashMap::new();
        objects.insert(placement.small_backend_id.clone(), small.clone());
        objects.insert(placement.large_backend_id.clone(), large.clone());

        let router = StorageRouter::new(
            placement,
            Arc::new(registry),
            small.backend(),
            large.backend(),
        )
        .context("Failed to build storage router")?;

        Ok(Self {
            router: Arc::new(router),
            probe,
            objects: Arc::new(objects),
            sweep_on_session: config.sweep.on_session_start,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_placement_from_config() {
        let mut config = ShelfConfig::default();
        config.placement.threshold_bytes = 2048;
        config.placement.dedup_scope = "global".to_string();

        let placement = placement_config(&config).unwrap();
        assert_eq!(placement.threshold_bytes, 2048);
        assert_eq!(placement.dedup_scope, shelfcas::DedupScope::Global);
    }

    #[test]
    fn test_bad_dedup_scope_is_rejected() {
        let mut config = ShelfConfig::default();
        config.placement.dedup_scope = "sometimes".to_string();
        assert!(placement_config(&config).is_err());
    }

    #[test]
    fn test_from_config_builds_fs_backends() {
        let temp_dir = TempDir::new().unwrap();
        let mut config = ShelfConfig::default();
        config.paths.state_dir = temp_dir.path().to_path_buf();

        let app = AppContext::from_config(&config).unwrap();
        assert!(temp_dir.path().join("registry.db").exists());
        assert!(temp_dir.path().join("objects/small").is_dir());
        assert!(temp_dir.path().join("objects/large").is_dir());
        assert!(matches!(app.objects.get("small"), Some(ObjectSource::Fs(_))));
        assert!(app.sweep_on_session);
    }
}
