//! State and operations bound to one live container.

mod archive;
mod snapshot;
mod stats;

pub use snapshot::{ContainerSnapshot, Resources};

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use burrow_shared::protocol::{
    BandwidthLimits, BandwidthStat, ContainerInfo, ContainerState, CpuLimits, DiskLimits,
    LimitsSummary, MemoryLimits, PortMapping, ProcessSpec, TtySpec,
};
use burrow_shared::{BurrowError, BurrowResult};
use chrono::{DateTime, Utc};
use nix::sys::signal::Signal;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::pools::PortPool;
use crate::process::{Process, ProcessTracker};
use crate::shell::HostShell;

/// Construction parameters, filled in by the container pool on create and
/// restore.
pub struct ContainerInit {
    pub id: String,
    pub handle: String,
    pub path: PathBuf,
    pub cgroup_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub grace_time: Duration,
    pub properties: HashMap<String, String>,
    pub resources: Resources,
    pub rootfs_provider: String,
}

/// A live container.
///
/// Mutable pieces sit behind their own short-lived locks; no lock is held
/// across script invocations or other I/O.
pub struct Container {
    id: String,
    handle: String,
    path: PathBuf,
    created_at: DateTime<Utc>,
    grace_time: Duration,
    rootfs_provider: String,

    shell: Arc<dyn HostShell>,
    port_pool: Arc<PortPool>,
    tracker: ProcessTracker,
    stats: stats::StatsReader,

    state: Mutex<ContainerState>,
    events: Mutex<Vec<String>>,
    properties: Mutex<HashMap<String, String>>,
    resources: Mutex<Resources>,
    limits: Mutex<LimitsSummary>,
    mapped_ports: Mutex<Vec<PortMapping>>,
}

impl std::fmt::Debug for Container {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Container")
            .field("id", &self.id)
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl Container {
    pub(crate) fn new(
        init: ContainerInit,
        shell: Arc<dyn HostShell>,
        port_pool: Arc<PortPool>,
    ) -> Self {
        let tracker = ProcessTracker::new(&init.path, Arc::clone(&shell));
        let stats = stats::StatsReader::new(init.cgroup_root, init.id.clone());
        let mapped_ports = init
            .resources
            .ports
            .iter()
            .map(|&port| PortMapping {
                host_port: port,
                container_port: port,
            })
            .collect();
        Self {
            id: init.id,
            handle: init.handle,
            path: init.path,
            created_at: init.created_at,
            grace_time: init.grace_time,
            rootfs_provider: init.rootfs_provider,
            shell,
            port_pool,
            tracker,
            stats,
            state: Mutex::new(ContainerState::Active),
            events: Mutex::new(Vec::new()),
            properties: Mutex::new(init.properties),
            resources: Mutex::new(init.resources),
            limits: Mutex::new(LimitsSummary::default()),
            mapped_ports: Mutex::new(mapped_ports),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> &str {
        &self.handle
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn grace_time(&self) -> Duration {
        self.grace_time
    }

    pub fn state(&self) -> ContainerState {
        *self.state.lock()
    }

    pub fn resources(&self) -> Resources {
        self.resources.lock().clone()
    }

    pub fn properties(&self) -> HashMap<String, String> {
        self.properties.lock().clone()
    }

    /// True when this container's property map is a superset of `filter`.
    pub fn matches_properties(&self, filter: &HashMap<String, String>) -> bool {
        let properties = self.properties.lock();
        filter
            .iter()
            .all(|(key, value)| properties.get(key) == Some(value))
    }

    // ========================================================================
    // LIFECYCLE
    // ========================================================================

    /// Request a stop: graceful TERM by default, immediate KILL when `kill`
    /// is set. Stopping a stopped container is a no-op.
    pub async fn stop(&self, kill: bool) -> BurrowResult<()> {
        {
            let state = self.state.lock();
            if *state == ContainerState::Stopped {
                return Ok(());
            }
        }

        self.shell
            .run(
                "stop.sh",
                &[self.path.display().to_string()],
                &[("KILL".to_string(), kill.to_string())],
            )
            .await?;

        // Supervisor children on the host follow the container's fate.
        let signal = if kill { Signal::SIGKILL } else { Signal::SIGTERM };
        self.tracker.signal_all(signal);

        *self.state.lock() = ContainerState::Stopped;
        self.events.lock().push("stopped".to_string());
        Ok(())
    }

    pub fn info(&self) -> ContainerInfo {
        let resources = self.resources.lock();
        // The qdisc carries the same rate both directions; reporting the
        // installed rates matches what a tc read-back would say.
        let bandwidth = self.limits.lock().bandwidth;
        ContainerInfo {
            state: *self.state.lock(),
            events: self.events.lock().clone(),
            host_ip: resources.subnet.host_ip().to_string(),
            container_ip: resources.subnet.container_ip().to_string(),
            container_path: self.path.display().to_string(),
            process_ids: self.tracker.process_ids(),
            properties: self.properties.lock().clone(),
            memory_stat: self.stats.memory_stat(),
            cpu_stat: self.stats.cpu_stat(),
            disk_stat: self.stats.disk_stat(&self.path),
            bandwidth_stat: BandwidthStat {
                in_rate: bandwidth.rate_bytes_per_sec,
                in_burst: bandwidth.burst_bytes,
                out_rate: bandwidth.rate_bytes_per_sec,
                out_burst: bandwidth.burst_bytes,
            },
            mapped_ports: self.mapped_ports.lock().clone(),
        }
    }

    // ========================================================================
    // FILE STREAMING
    // ========================================================================

    /// Unpack a tar stream under `dst_path` in the container's filesystem.
    /// Blocks until the stream ends.
    pub async fn stream_in(
        &self,
        dst_path: &str,
        chunks: mpsc::Receiver<Vec<u8>>,
    ) -> BurrowResult<()> {
        let dest = self.rootfs_subpath(dst_path)?;
        tokio::task::spawn_blocking(move || -> BurrowResult<()> {
            std::fs::create_dir_all(&dest)?;
            let mut archive = tar::Archive::new(archive::ChunkReader::new(chunks));
            archive.unpack(&dest)?;
            Ok(())
        })
        .await
        .map_err(|e| BurrowError::Internal(format!("stream-in task failed: {}", e)))?
    }

    /// Package `src_path` as a lazy tar byte stream. Dropping the receiver
    /// cancels the stream.
    pub fn stream_out(&self, src_path: &str) -> BurrowResult<mpsc::Receiver<BurrowResult<Vec<u8>>>> {
        let src = self.rootfs_subpath(src_path)?;
        let name = Path::new(src_path.trim_end_matches('/'))
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| ".".to_string());

        let (tx, rx) = mpsc::channel(16);
        tokio::task::spawn_blocking(move || {
            let result = pack(&src, &name, archive::ChunkWriter::new(tx.clone()));
            if let Err(e) = result {
                let _ = tx.blocking_send(Err(e));
            }
        });
        Ok(rx)
    }

    fn rootfs_subpath(&self, sub: &str) -> BurrowResult<PathBuf> {
        let relative = Path::new(sub.trim_start_matches('/'));
        if relative
            .components()
            .any(|c| matches!(c, Component::ParentDir))
        {
            return Err(BurrowError::InvalidArgument(format!(
                "path {:?} cannot traverse parent directories",
                sub
            )));
        }
        Ok(self.path.join("mnt").join(relative))
    }

    // ========================================================================
    // LIMITS
    // ========================================================================

    pub async fn limit_bandwidth(&self, limits: BandwidthLimits) -> BurrowResult<()> {
        self.apply_limit(
            "bandwidth",
            &[
                ("RATE".to_string(), limits.rate_bytes_per_sec.to_string()),
                ("BURST".to_string(), limits.burst_bytes.to_string()),
            ],
        )
        .await?;
        self.limits.lock().bandwidth = limits;
        Ok(())
    }

    pub fn current_bandwidth_limits(&self) -> BandwidthLimits {
        self.limits.lock().bandwidth
    }

    pub async fn limit_memory(&self, limits: MemoryLimits) -> BurrowResult<()> {
        self.apply_limit(
            "memory",
            &[(
                "LIMIT_IN_BYTES".to_string(),
                limits.limit_in_bytes.to_string(),
            )],
        )
        .await?;
        self.limits.lock().memory = limits;
        Ok(())
    }

    pub fn current_memory_limits(&self) -> MemoryLimits {
        self.limits.lock().memory
    }

    pub async fn limit_disk(&self, limits: DiskLimits) -> BurrowResult<()> {
        let uid = self.resources.lock().uid;
        self.apply_limit(
            "disk",
            &[
                ("BYTE_LIMIT".to_string(), limits.byte_limit.to_string()),
                ("INODE_LIMIT".to_string(), limits.inode_limit.to_string()),
                ("USER_UID".to_string(), uid.to_string()),
            ],
        )
        .await?;
        self.limits.lock().disk = limits;
        Ok(())
    }

    pub fn current_disk_limits(&self) -> DiskLimits {
        self.limits.lock().disk
    }

    pub async fn limit_cpu(&self, limits: CpuLimits) -> BurrowResult<()> {
        self.apply_limit(
            "cpu",
            &[("SHARES".to_string(), limits.limit_in_shares.to_string())],
        )
        .await?;
        self.limits.lock().cpu = limits;
        Ok(())
    }

    pub fn current_cpu_limits(&self) -> CpuLimits {
        self.limits.lock().cpu
    }

    async fn apply_limit(&self, which: &str, env: &[(String, String)]) -> BurrowResult<()> {
        let mut full_env = vec![("LIMIT".to_string(), which.to_string())];
        full_env.extend_from_slice(env);
        self.shell
            .run("limits.sh", &[self.path.display().to_string()], &full_env)
            .await
    }

    // ========================================================================
    // NETWORKING
    // ========================================================================

    /// Map a host port to a container port. Port 0 on either side picks: the
    /// host side draws from the port pool, the container side mirrors the
    /// host port.
    pub async fn net_in(&self, host_port: u32, container_port: u32) -> BurrowResult<(u32, u32)> {
        let (host_port, from_pool) = if host_port == 0 {
            (self.port_pool.acquire()?, true)
        } else {
            (host_port, false)
        };
        let container_port = if container_port == 0 {
            host_port
        } else {
            container_port
        };

        let result = self
            .shell
            .run(
                "net.sh",
                &[self.path.display().to_string()],
                &[
                    ("ACTION".to_string(), "in".to_string()),
                    ("HOST_PORT".to_string(), host_port.to_string()),
                    ("CONTAINER_PORT".to_string(), container_port.to_string()),
                ],
            )
            .await;

        if let Err(e) = result {
            if from_pool {
                self.port_pool.release(host_port);
            }
            return Err(e);
        }

        self.resources.lock().ports.push(host_port);
        self.mapped_ports.lock().push(PortMapping {
            host_port,
            container_port,
        });
        Ok((host_port, container_port))
    }

    /// Allow outbound traffic to `network` (CIDR), optionally restricted to
    /// one port.
    pub async fn net_out(&self, network: &str, port: u32) -> BurrowResult<()> {
        crate::pools::split_cidr(network)?;
        self.shell
            .run(
                "net.sh",
                &[self.path.display().to_string()],
                &[
                    ("ACTION".to_string(), "out".to_string()),
                    ("NETWORK".to_string(), network.to_string()),
                    ("PORT".to_string(), port.to_string()),
                ],
            )
            .await
    }

    // ========================================================================
    // PROCESSES
    // ========================================================================

    pub fn run(&self, spec: &ProcessSpec) -> BurrowResult<Process> {
        let uid = if spec.privileged {
            0
        } else {
            self.resources.lock().uid
        };
        self.tracker.run(spec, uid)
    }

    pub fn attach(&self, process_id: u32) -> BurrowResult<Process> {
        self.tracker.attach(process_id)
    }

    pub fn set_tty(&self, process_id: u32, tty: &TtySpec) -> BurrowResult<()> {
        self.tracker.set_tty(process_id, tty)
    }

    // ========================================================================
    // PERSISTENCE
    // ========================================================================

    pub fn snapshot(&self) -> ContainerSnapshot {
        ContainerSnapshot {
            id: self.id.clone(),
            handle: self.handle.clone(),
            created_at: self.created_at,
            grace_time: self.grace_time,
            properties: self.properties.lock().clone(),
            resources: self.resources.lock().clone(),
            processes: self.tracker.process_ids(),
            rootfs_provider: self.rootfs_provider.clone(),
            limits: *self.limits.lock(),
        }
    }

    /// Rebind to on-disk state after a restore.
    pub(crate) fn rebind(&self, snapshot: &ContainerSnapshot) {
        self.tracker.restore(&snapshot.processes);
        *self.limits.lock() = snapshot.limits;
        self.events.lock().push("restored".to_string());
    }
}

fn pack(src: &Path, name: &str, writer: archive::ChunkWriter) -> BurrowResult<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);
    if src.is_dir() {
        builder.append_dir_all(name, src)?;
    } else {
        builder.append_path_with_name(src, name)?;
    }
    builder.finish()?;
    Ok(())
}
