//! Container factory and destroyer.
//!
//! The pool owns the three resource pools and the rootfs provider registry.
//! Create acquires resources, materializes a rootfs, and drives `create.sh`;
//! destroy tears down in the opposite order, with host-side teardown strictly
//! before pool release so a reused uid or subnet never races a half-dead
//! container.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use burrow_shared::protocol::ContainerSpec;
use burrow_shared::BurrowResult;

use crate::config::DaemonConfig;
use crate::container::{Container, ContainerInit, ContainerSnapshot, Resources};
use crate::pools::{PortPool, Subnet, SubnetPool, UidPool};
use crate::rootfs::{ProviderRegistry, RootfsUri};
use crate::shell::HostShell;

const PROVIDER_TAG_FILE: &str = "rootfs-provider";
const PRE_PIVOT_HOOK: &str = "lib/hook-pre-pivot.sh";

pub struct ContainerPool {
    depot_dir: PathBuf,
    cgroup_root: PathBuf,
    deny_networks: Vec<String>,
    allow_networks: Vec<String>,
    disable_quotas: bool,

    shell: Arc<dyn HostShell>,
    providers: ProviderRegistry,

    uid_pool: UidPool,
    subnet_pool: SubnetPool,
    port_pool: Arc<PortPool>,

    container_num: AtomicU64,
}

impl ContainerPool {
    pub fn new(
        config: &DaemonConfig,
        shell: Arc<dyn HostShell>,
        providers: ProviderRegistry,
    ) -> BurrowResult<Self> {
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_nanos() as u64;

        let cgroup_root = config.cgroup_root.clone().unwrap_or_else(|| {
            PathBuf::from(format!("/tmp/burrow{}/cgroup", config.uniqueness_tag))
        });

        Ok(Self {
            depot_dir: config.depot_dir.clone(),
            cgroup_root,
            deny_networks: config.deny_networks.clone(),
            allow_networks: config.allow_networks.clone(),
            disable_quotas: config.disable_quotas,
            shell,
            providers,
            uid_pool: UidPool::new(config.uid_pool_start, config.uid_pool_size),
            subnet_pool: SubnetPool::new(&config.network_pool)?,
            port_pool: Arc::new(PortPool::new(config.port_pool_start, config.port_pool_size)),
            container_num: AtomicU64::new(seed),
        })
    }

    pub fn max_containers(&self) -> u32 {
        self.subnet_pool
            .initial_size()
            .min(self.uid_pool.initial_size())
    }

    pub fn uid_pool(&self) -> &UidPool {
        &self.uid_pool
    }

    pub fn subnet_pool(&self) -> &SubnetPool {
        &self.subnet_pool
    }

    pub fn port_pool(&self) -> &Arc<PortPool> {
        &self.port_pool
    }

    pub fn depot_dir(&self) -> &PathBuf {
        &self.depot_dir
    }

    /// One-time host preparation, run at daemon start.
    pub async fn setup(&self) -> BurrowResult<()> {
        self.shell
            .run(
                "setup.sh",
                &[],
                &[
                    (
                        "POOL_NETWORK".to_string(),
                        self.subnet_pool.network().to_string(),
                    ),
                    ("DENY_NETWORKS".to_string(), self.deny_networks.join(" ")),
                    ("ALLOW_NETWORKS".to_string(), self.allow_networks.join(" ")),
                    (
                        "CONTAINER_DEPOT_PATH".to_string(),
                        self.depot_dir.display().to_string(),
                    ),
                    (
                        "CONTAINER_DEPOT_MOUNT_POINT_PATH".to_string(),
                        self.depot_dir.display().to_string(),
                    ),
                    (
                        "DISK_QUOTA_ENABLED".to_string(),
                        (!self.disable_quotas).to_string(),
                    ),
                ],
            )
            .await
    }

    // ========================================================================
    // CREATE
    // ========================================================================

    pub async fn create(
        &self,
        spec: &ContainerSpec,
        grace_time: Duration,
    ) -> BurrowResult<Arc<Container>> {
        let uid = self.uid_pool.acquire()?;
        let subnet = match self.subnet_pool.acquire() {
            Ok(subnet) => subnet,
            Err(e) => {
                self.uid_pool.release(uid);
                return Err(e);
            }
        };

        let id = self.next_container_id();
        let path = self.depot_dir.join(&id);

        let uri = RootfsUri::parse(spec.rootfs.as_deref().unwrap_or(""));
        let provider = match self.providers.get(&uri.scheme) {
            Ok(provider) => provider,
            Err(e) => {
                self.release_pair(uid, subnet);
                return Err(e);
            }
        };

        let rootfs_path = match provider.provide(&id, &uri).await {
            Ok(path) => path,
            Err(e) => {
                self.release_pair(uid, subnet);
                return Err(e);
            }
        };

        let create_env = vec![
            ("id".to_string(), id.clone()),
            (
                "rootfs_path".to_string(),
                rootfs_path.display().to_string(),
            ),
            ("user_uid".to_string(), uid.to_string()),
            (
                "network_host_ip".to_string(),
                subnet.host_ip().to_string(),
            ),
            (
                "network_container_ip".to_string(),
                subnet.container_ip().to_string(),
            ),
        ];
        if let Err(e) = self
            .shell
            .run("create.sh", &[path.display().to_string()], &create_env)
            .await
        {
            self.undo_create(uid, subnet, &id, provider.as_ref()).await;
            return Err(e);
        }

        if let Err(e) = self.save_provider_tag(&id, &uri.scheme).await {
            self.undo_create(uid, subnet, &id, provider.as_ref()).await;
            return Err(e);
        }

        if let Err(e) = self.write_bind_mounts(&path, spec).await {
            self.undo_create(uid, subnet, &id, provider.as_ref()).await;
            return Err(e);
        }

        let handle = spec
            .handle
            .clone()
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| id.clone());

        tracing::info!(%handle, container = %id, uid, subnet = %subnet, "created container");

        let container = Container::new(
            ContainerInit {
                id,
                handle,
                path,
                cgroup_root: self.cgroup_root.clone(),
                created_at: chrono::Utc::now(),
                grace_time,
                properties: spec.properties.clone(),
                resources: Resources::new(uid, subnet),
                rootfs_provider: uri.scheme,
            },
            Arc::clone(&self.shell),
            Arc::clone(&self.port_pool),
        );
        Ok(Arc::new(container))
    }

    fn release_pair(&self, uid: u32, subnet: Subnet) {
        self.uid_pool.release(uid);
        self.subnet_pool.release(subnet);
    }

    async fn undo_create(
        &self,
        uid: u32,
        subnet: Subnet,
        id: &str,
        provider: &dyn crate::rootfs::RootfsProvider,
    ) {
        self.release_pair(uid, subnet);
        if let Err(e) = provider.cleanup(id).await {
            tracing::warn!(container = id, error = %e, "rootfs cleanup after failed create");
        }
    }

    // ========================================================================
    // DESTROY
    // ========================================================================

    /// Tear down a live container and return its resources to the pools.
    pub async fn destroy(&self, container: &Container) -> BurrowResult<()> {
        self.destroy_id(container.id()).await;

        let resources = container.resources();
        for port in resources.ports {
            self.port_pool.release(port);
        }
        self.uid_pool.release(resources.uid);
        self.subnet_pool.release(resources.subnet);

        tracing::info!(handle = container.handle(), container = container.id(), "destroyed container");
        Ok(())
    }

    /// Host-side teardown for a container id, with or without an in-memory
    /// container. Script and provider failures are logged: bounded
    /// reclamation wins over perfect cleanup.
    async fn destroy_id(&self, id: &str) {
        let tag_path = self.depot_dir.join(id).join(PROVIDER_TAG_FILE);
        let tag = tokio::fs::read_to_string(&tag_path)
            .await
            .unwrap_or_default();

        if let Err(e) = self
            .shell
            .run(
                "destroy.sh",
                &[self.depot_dir.join(id).display().to_string()],
                &[("id".to_string(), id.to_string())],
            )
            .await
        {
            tracing::warn!(container = id, error = %e, "destroy script failed");
        }

        match self.providers.get(tag.trim()) {
            Ok(provider) => {
                if let Err(e) = provider.cleanup(id).await {
                    tracing::warn!(container = id, error = %e, "rootfs cleanup failed");
                }
            }
            Err(e) => tracing::warn!(container = id, error = %e, "rootfs cleanup skipped"),
        }
    }

    // ========================================================================
    // RESTORE & PRUNE
    // ========================================================================

    /// Rebuild a container from its snapshot, reserving its exact resources.
    pub async fn restore(&self, snapshot: ContainerSnapshot) -> BurrowResult<Arc<Container>> {
        tracing::info!(container = %snapshot.id, handle = %snapshot.handle, "restoring container");

        let resources = snapshot.resources.clone();

        self.uid_pool.remove(resources.uid)?;

        if let Err(e) = self.subnet_pool.remove(resources.subnet) {
            self.uid_pool.release(resources.uid);
            return Err(e);
        }

        let mut reserved_ports = Vec::new();
        for &port in &resources.ports {
            if let Err(e) = self.port_pool.remove(port) {
                self.uid_pool.release(resources.uid);
                self.subnet_pool.release(resources.subnet);
                for &reserved in &reserved_ports {
                    self.port_pool.release(reserved);
                }
                return Err(e);
            }
            reserved_ports.push(port);
        }

        let container = Container::new(
            ContainerInit {
                id: snapshot.id.clone(),
                handle: snapshot.handle.clone(),
                path: self.depot_dir.join(&snapshot.id),
                cgroup_root: self.cgroup_root.clone(),
                created_at: snapshot.created_at,
                grace_time: snapshot.grace_time,
                properties: snapshot.properties.clone(),
                resources,
                rootfs_provider: snapshot.rootfs_provider.clone(),
            },
            Arc::clone(&self.shell),
            Arc::clone(&self.port_pool),
        );
        container.rebind(&snapshot);
        Ok(Arc::new(container))
    }

    /// Clean the depot of container dirs that were not restored.
    pub async fn prune(&self, keep: &HashSet<String>) -> BurrowResult<()> {
        let mut entries = match tokio::fs::read_dir(&self.depot_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let id = entry.file_name().to_string_lossy().into_owned();
            if id == "tmp" || keep.contains(&id) {
                continue;
            }
            tracing::info!(container = %id, "pruning stale depot entry");
            self.destroy_id(&id).await;
        }
        Ok(())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// 11-character base-32 id from a monotonic counter seeded at startup
    /// nanoseconds. Never decrements within a process, so ids are unique for
    /// the lifetime of the depot.
    fn next_container_id(&self) -> String {
        let n = self.container_num.fetch_add(1, Ordering::Relaxed);
        encode_id(n)
    }

    async fn save_provider_tag(&self, id: &str, scheme: &str) -> BurrowResult<()> {
        let dir = self.depot_dir.join(id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(PROVIDER_TAG_FILE), scheme).await?;
        Ok(())
    }

    /// Append the bind-mount commands to the container's pre-pivot hook. The
    /// `mkdir -p` is unconditional; a colliding destination surfaces later as
    /// a failure of the script that sources the hook.
    async fn write_bind_mounts(
        &self,
        container_path: &std::path::Path,
        spec: &ContainerSpec,
    ) -> BurrowResult<()> {
        use burrow_shared::protocol::{BindMountMode, BindMountOrigin};

        if spec.bind_mounts.is_empty() {
            return Ok(());
        }

        let hook = container_path.join(PRE_PIVOT_HOOK);
        if let Some(parent) = hook.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut script = String::new();
        for mount in &spec.bind_mounts {
            let dst = container_path
                .join("mnt")
                .join(mount.dst_path.trim_start_matches('/'));
            let src = match mount.origin {
                BindMountOrigin::Host => PathBuf::from(&mount.src_path),
                BindMountOrigin::Container => container_path
                    .join("tmp/rootfs")
                    .join(mount.src_path.trim_start_matches('/')),
            };
            let mode = match mount.mode {
                BindMountMode::Ro => "ro",
                BindMountMode::Rw => "rw",
            };

            script.push('\n');
            script.push_str(&format!("mkdir -p {}\n", dst.display()));
            script.push_str(&format!(
                "mount -n --bind {} {}\n",
                src.display(),
                dst.display()
            ));
            script.push_str(&format!(
                "mount -n --bind -o remount,{} {} {}\n",
                mode,
                src.display(),
                dst.display()
            ));
        }

        let mut options = tokio::fs::OpenOptions::new();
        options.create(true).append(true);
        let mut file = options.open(&hook).await?;
        tokio::io::AsyncWriteExt::write_all(&mut file, script.as_bytes()).await?;
        Ok(())
    }
}

fn encode_id(n: u64) -> String {
    const DIGITS: &[u8; 32] = b"0123456789abcdefghijklmnopqrstuv";
    (0..11)
        .map(|i| DIGITS[((n >> (55 - (i + 1) * 5)) & 31) as usize] as char)
        .collect()
}
