//! Registry of live containers, grace-time reclamation, and shutdown
//! snapshotting.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Duration;

use burrow_shared::protocol::ContainerSpec;
use burrow_shared::{BurrowError, BurrowResult};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::config::DaemonConfig;
use crate::container::{Container, ContainerSnapshot};
use crate::pool::ContainerPool;
use crate::shell::HostShell;
use crate::sysinfo;

/// System capacity as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capacity {
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub max_containers: u64,
}

struct Entry {
    container: Arc<Container>,
    /// Activity pulse for the grace watchdog. Dropping the entry drops the
    /// sender, which retires the watchdog.
    activity: watch::Sender<Instant>,
}

struct BackendInner {
    pool: ContainerPool,
    registry: RwLock<HashMap<String, Entry>>,
    shell: Arc<dyn HostShell>,
    default_grace_time: Duration,
    snapshots_dir: Option<PathBuf>,
    depot_dir: PathBuf,
}

/// The daemon's container registry.
#[derive(Clone)]
pub struct Backend {
    inner: Arc<BackendInner>,
}

impl Backend {
    pub fn new(config: &DaemonConfig, pool: ContainerPool, shell: Arc<dyn HostShell>) -> Self {
        Self {
            inner: Arc::new(BackendInner {
                depot_dir: config.depot_dir.clone(),
                default_grace_time: config.default_grace_time,
                snapshots_dir: config.snapshots_dir.clone(),
                pool,
                registry: RwLock::new(HashMap::new()),
                shell,
            }),
        }
    }

    pub fn pool(&self) -> &ContainerPool {
        &self.inner.pool
    }

    /// Prepare the host and resume persisted containers, then prune the
    /// depot of anything that did not come back.
    pub async fn start(&self) -> BurrowResult<()> {
        self.inner.pool.setup().await?;

        let mut restored = HashSet::new();
        if let Some(dir) = self.inner.snapshots_dir.clone() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    self.inner.pool.prune(&restored).await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                match self.restore_file(&path).await {
                    Ok(id) => {
                        restored.insert(id);
                        tokio::fs::remove_file(&path).await.ok();
                    }
                    Err(e) => {
                        tracing::warn!(snapshot = %path.display(), error = %e, "snapshot not restored");
                    }
                }
            }
        }

        self.inner.pool.prune(&restored).await
    }

    async fn restore_file(&self, path: &std::path::Path) -> BurrowResult<String> {
        let raw = tokio::fs::read_to_string(path).await?;
        let snapshot: ContainerSnapshot = serde_json::from_str(&raw)
            .map_err(|e| BurrowError::Storage(format!("undecodable snapshot: {}", e)))?;
        let container = self.inner.pool.restore(snapshot).await?;
        let id = container.id().to_string();
        self.register(container)?;
        Ok(id)
    }

    /// Snapshot every live container (when persistence is enabled) and
    /// retire all grace watchdogs.
    pub async fn stop(&self) -> BurrowResult<()> {
        let entries: Vec<Entry> = {
            let mut registry = self.inner.registry.write();
            registry.drain().map(|(_, entry)| entry).collect()
        };

        let Some(dir) = self.inner.snapshots_dir.clone() else {
            return Ok(());
        };

        tokio::fs::create_dir_all(&dir).await?;
        for entry in entries {
            let snapshot = entry.container.snapshot();
            let raw = serde_json::to_vec(&snapshot)
                .map_err(|e| BurrowError::Storage(format!("unencodable snapshot: {}", e)))?;
            let path = dir.join(&snapshot.id);
            tokio::fs::write(&path, raw).await?;
            tracing::info!(handle = %snapshot.handle, snapshot = %path.display(), "wrote snapshot");
        }
        Ok(())
    }

    /// Create a container and arm its idle timer. A zero grace time in the
    /// spec takes the daemon default.
    pub async fn create(&self, mut spec: ContainerSpec) -> BurrowResult<Arc<Container>> {
        let grace_time = spec
            .grace_time
            .take()
            .filter(|grace| !grace.is_zero())
            .unwrap_or(self.inner.default_grace_time);

        if let Some(handle) = spec.handle.as_deref() {
            if self.inner.registry.read().contains_key(handle) {
                return Err(BurrowError::InvalidArgument(format!(
                    "handle {:?} already in use",
                    handle
                )));
            }
        }

        let container = self.inner.pool.create(&spec, grace_time).await?;
        if let Err(e) = self.register(Arc::clone(&container)) {
            // Lost a registration race; take the fresh container down again
            // so its resources go back to the pools.
            if let Err(destroy_err) = self.inner.pool.destroy(&container).await {
                tracing::warn!(error = %destroy_err, "teardown after lost registration race failed");
            }
            return Err(e);
        }
        Ok(container)
    }

    fn register(&self, container: Arc<Container>) -> BurrowResult<()> {
        let handle = container.handle().to_string();
        let grace_time = container.grace_time();
        let (activity, activity_rx) = watch::channel(Instant::now());

        {
            let mut registry = self.inner.registry.write();
            if registry.contains_key(&handle) {
                return Err(BurrowError::InvalidArgument(format!(
                    "handle {:?} already in use",
                    handle
                )));
            }
            registry.insert(
                handle.clone(),
                Entry {
                    container,
                    activity,
                },
            );
        }

        if !grace_time.is_zero() {
            tokio::spawn(grace_watchdog(
                Arc::downgrade(&self.inner),
                handle,
                grace_time,
                activity_rx,
            ));
        }
        Ok(())
    }

    /// Remove and tear down a container. Concurrent destroys serialize on
    /// the registry: exactly one performs the release, the rest observe
    /// container-not-found.
    pub async fn destroy(&self, handle: &str) -> BurrowResult<()> {
        destroy_in(&self.inner, handle).await
    }

    /// Find a live container. Every hit resets the container's idle timer;
    /// this is how requests extend a container's lifetime.
    pub fn lookup(&self, handle: &str) -> BurrowResult<Arc<Container>> {
        let registry = self.inner.registry.read();
        let entry = registry
            .get(handle)
            .ok_or_else(|| BurrowError::ContainerNotFound(handle.to_string()))?;
        entry.activity.send_replace(Instant::now());
        Ok(Arc::clone(&entry.container))
    }

    /// All live containers whose properties are a superset of `filter`.
    pub fn containers(&self, filter: &HashMap<String, String>) -> Vec<Arc<Container>> {
        self.inner
            .registry
            .read()
            .values()
            .filter(|entry| entry.container.matches_properties(filter))
            .map(|entry| Arc::clone(&entry.container))
            .collect()
    }

    pub fn handles(&self, filter: &HashMap<String, String>) -> Vec<String> {
        let mut handles: Vec<String> = self
            .containers(filter)
            .iter()
            .map(|c| c.handle().to_string())
            .collect();
        handles.sort();
        handles
    }

    pub fn capacity(&self) -> BurrowResult<Capacity> {
        Ok(Capacity {
            memory_bytes: sysinfo::total_memory()?,
            disk_bytes: sysinfo::disk_size(&self.inner.depot_dir)?,
            max_containers: self.inner.pool.max_containers() as u64,
        })
    }

    pub async fn ping(&self) -> BurrowResult<()> {
        self.inner.shell.run("ping.sh", &[], &[]).await
    }
}

async fn destroy_in(inner: &Arc<BackendInner>, handle: &str) -> BurrowResult<()> {
    let entry = {
        let mut registry = inner.registry.write();
        registry
            .remove(handle)
            .ok_or_else(|| BurrowError::ContainerNotFound(handle.to_string()))?
    };
    // The watchdog retires when the activity sender above drops.
    inner.pool.destroy(&entry.container).await
}

/// Destroys the container once `grace` elapses with no activity pulse. A
/// pulse restarts the countdown from zero; a racing explicit destroy retires
/// the watchdog via the dropped channel or a benign container-not-found.
async fn grace_watchdog(
    inner: Weak<BackendInner>,
    handle: String,
    grace: Duration,
    mut activity: watch::Receiver<Instant>,
) {
    loop {
        let deadline = *activity.borrow() + grace;
        tokio::select! {
            changed = activity.changed() => {
                if changed.is_err() {
                    return;
                }
            }
            _ = tokio::time::sleep_until(deadline) => {
                let Some(inner) = inner.upgrade() else { return };
                tracing::info!(%handle, "grace time expired, reclaiming container");
                match destroy_in(&inner, &handle).await {
                    Ok(()) | Err(BurrowError::ContainerNotFound(_)) => {}
                    Err(e) => {
                        tracing::warn!(%handle, error = %e, "timer-fired destroy failed");
                    }
                }
                return;
            }
        }
    }
}
