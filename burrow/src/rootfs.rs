//! Rootfs acquisition.
//!
//! A container's root filesystem comes from a provider selected by the URI
//! scheme of the create spec's rootfs field. The empty scheme is the default
//! provider; an unregistered scheme is rejected before any host work happens.
//! The chosen scheme is persisted next to the container so a destroy after a
//! daemon restart routes to the same provider's cleanup.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use burrow_shared::{BurrowError, BurrowResult};

use crate::shell::HostShell;

/// A parsed rootfs URI: `scheme://path`, or a bare path with empty scheme.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootfsUri {
    pub scheme: String,
    pub path: String,
}

impl RootfsUri {
    pub fn parse(raw: &str) -> Self {
        match raw.split_once("://") {
            Some((scheme, path)) => Self {
                scheme: scheme.to_string(),
                path: path.to_string(),
            },
            None => Self {
                scheme: String::new(),
                path: raw.to_string(),
            },
        }
    }
}

/// Materializes and reclaims per-container root filesystems.
#[async_trait]
pub trait RootfsProvider: Send + Sync {
    /// Produce the directory to use as the container's root filesystem.
    async fn provide(&self, container_id: &str, uri: &RootfsUri) -> BurrowResult<PathBuf>;

    /// Release any storage allocated for the container.
    async fn cleanup(&self, container_id: &str) -> BurrowResult<()>;
}

impl std::fmt::Debug for dyn RootfsProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn RootfsProvider").finish()
    }
}

/// Scheme-keyed provider registry.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn RootfsProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self {
            providers: HashMap::new(),
        }
    }

    pub fn register(mut self, scheme: impl Into<String>, provider: Arc<dyn RootfsProvider>) -> Self {
        self.providers.insert(scheme.into(), provider);
        self
    }

    pub fn get(&self, scheme: &str) -> BurrowResult<Arc<dyn RootfsProvider>> {
        self.providers
            .get(scheme)
            .cloned()
            .ok_or_else(|| BurrowError::UnknownRootfsProvider(scheme.to_string()))
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Default provider: assembles an overlay of the base rootfs under the
/// overlays directory via `overlay.sh`.
pub struct OverlayProvider {
    shell: Arc<dyn HostShell>,
    overlays_dir: PathBuf,
    default_rootfs: PathBuf,
}

impl OverlayProvider {
    pub fn new(
        shell: Arc<dyn HostShell>,
        overlays_dir: impl Into<PathBuf>,
        default_rootfs: impl Into<PathBuf>,
    ) -> Self {
        Self {
            shell,
            overlays_dir: overlays_dir.into(),
            default_rootfs: default_rootfs.into(),
        }
    }

    fn overlay_path(&self, container_id: &str) -> PathBuf {
        self.overlays_dir.join(container_id)
    }
}

#[async_trait]
impl RootfsProvider for OverlayProvider {
    async fn provide(&self, container_id: &str, uri: &RootfsUri) -> BurrowResult<PathBuf> {
        let base = if uri.path.is_empty() {
            self.default_rootfs.clone()
        } else {
            PathBuf::from(&uri.path)
        };

        let overlay = self.overlay_path(container_id);
        self.shell
            .run(
                "overlay.sh",
                &[],
                &[
                    ("id".to_string(), container_id.to_string()),
                    ("base_rootfs_path".to_string(), base.display().to_string()),
                    ("overlay_path".to_string(), overlay.display().to_string()),
                ],
            )
            .await?;

        Ok(overlay)
    }

    async fn cleanup(&self, container_id: &str) -> BurrowResult<()> {
        let overlay = self.overlay_path(container_id);
        match tokio::fs::remove_dir_all(&overlay).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
