//! Sweeping the registry for descriptors whose objects have disappeared.
//!
//! A sweep works from a snapshot taken when it starts. Each snapshotted
//! descriptor is probed once and removed with `remove_exact`, so anything
//! registered (or re-registered) while the sweep runs is never touched.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;

use crate::asset::{AssetDescriptor, OwnerId, Tier};
use crate::backend::Backend;
use crate::error::Result;
use crate::registry::AssetRegistry;

/// What a probe learned about one descriptor's object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Liveness {
    Alive,
    /// Still there, but now served from a different URL.
    Relocated(String),
    Gone,
}

/// Decides whether a descriptor's object still exists.
///
/// An `Err` means "could not tell": the sweep logs it and keeps the
/// descriptor.
#[async_trait]
pub trait LivenessProbe: Send + Sync {
    async fn probe(&self, descriptor: &AssetDescriptor) -> anyhow::Result<Liveness>;
}

/// Adapts a plain closure into a probe.
pub struct FnProbe<F>(F);

/// Wrap a closure as a [`LivenessProbe`].
pub fn probe_fn<F>(f: F) -> FnProbe<F>
where
    F: Fn(&AssetDescriptor) -> anyhow::Result<Liveness> + Send + Sync,
{
    FnProbe(f)
}

#[async_trait]
impl<F> LivenessProbe for FnProbe<F>
where
    F: Fn(&AssetDescriptor) -> anyhow::Result<Liveness> + Send + Sync,
{
    async fn probe(&self, descriptor: &AssetDescriptor) -> anyhow::Result<Liveness> {
        (self.0)(descriptor)
    }
}

/// Asks the owning backend directly.
pub struct BackendProbe {
    small: Arc<dyn Backend>,
    large: Arc<dyn Backend>,
}

impl BackendProbe {
    pub fn new(small: Arc<dyn Backend>, large: Arc<dyn Backend>) -> Self {
        Self { small, large }
    }
}

#[async_trait]
impl LivenessProbe for BackendProbe {
    async fn probe(&self, descriptor: &AssetDescriptor) -> anyhow::Result<Liveness> {
        let backend = match descriptor.backend {
            Tier::SmallStore => &self.small,
            Tier::LargeStore => &self.large,
        };

        if !backend.exists(&descriptor.remote_key).await? {
            return Ok(Liveness::Gone);
        }

        let current = backend.public_url(&descriptor.remote_key);
        if current != descriptor.public_url {
            return Ok(Liveness::Relocated(current));
        }
        Ok(Liveness::Alive)
    }
}

/// Fetches the public URL with a HEAD request.
///
/// 2xx is alive, 404 and 410 are gone. Anything else, including transport
/// errors, is reported as a probe failure.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client for liveness probes")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LivenessProbe for HttpProbe {
    async fn probe(&self, descriptor: &AssetDescriptor) -> anyhow::Result<Liveness> {
        let response = self
            .client
            .head(&descriptor.public_url)
            .send()
            .await
            .with_context(|| format!("HEAD {} failed", descriptor.public_url))?;

        let status = response.status();
        if status.is_success() {
            Ok(Liveness::Alive)
        } else if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
            Ok(Liveness::Gone)
        } else {
            anyhow::bail!("HEAD {} returned {}", descriptor.public_url, status)
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub examined: usize,
    pub removed: usize,
    pub refreshed: usize,
    pub probe_failures: usize,
}

/// Probe every descriptor in the snapshot (optionally one owner's) and drop
/// the ones whose objects are gone.
pub async fn sweep(
    registry: &dyn AssetRegistry,
    owner: Option<&OwnerId>,
    probe: &dyn LivenessProbe,
) -> Result<SweepReport> {
    let snapshot = match owner {
        Some(owner) => registry.all(owner)?,
        None => registry.snapshot()?,
    };

    let mut report = SweepReport::default();
    for descriptor in &snapshot {
        report.examined += 1;

        match probe.probe(descriptor).await {
            Ok(Liveness::Alive) => {}
            Ok(Liveness::Gone) => {
                if registry.remove_exact(descriptor)? {
                    report.removed += 1;
                    tracing::info!(
                        owner = %descriptor.owner_id,
                        fingerprint = %descriptor.fingerprint,
                        url = %descriptor.public_url,
                        "removed dead asset"
                    );
                }
            }
            Ok(Liveness::Relocated(url)) => {
                if registry.refresh_url(descriptor, &url)? {
                    report.refreshed += 1;
                    tracing::debug!(
                        fingerprint = %descriptor.fingerprint,
                        old = %descriptor.public_url,
                        new = %url,
                        "refreshed asset url"
                    );
                }
            }
            Err(e) => {
                report.probe_failures += 1;
                tracing::warn!(
                    owner = %descriptor.owner_id,
                    fingerprint = %descriptor.fingerprint,
                    error = %format!("{e:#}"),
                    "liveness probe failed, keeping asset"
                );
            }
        }
    }

    tracing::info!(
        examined = report.examined,
        removed = report.removed,
        refreshed = report.refreshed,
        probe_failures = report.probe_failures,
        "sweep complete"
    );
    Ok(report)
}
