//! Wire protocol for the burrow daemon.
//!
//! # Protocol Format
//!
//! - **Transport**: unix socket or TCP (see [`crate::transport`])
//! - **Encoding**: JSON
//! - **Framing**: Newline-delimited (each message ends with `\n`)
//!
//! One request is in flight per connection at a time; independent connections
//! execute in parallel on the daemon.
//!
//! # Request/Response Flow
//!
//! ```text
//! Client                                Daemon
//!   |                                     |
//!   |  {"type":"create",...}\n            |
//!   |------------------------------------>|
//!   |                                     |
//!   |  {"type":"handle",...}\n            |
//!   |<------------------------------------|
//! ```
//!
//! # Streaming
//!
//! `run` and `attach` turn the connection into a process stream: the daemon
//! writes `process_started`, then interleaved `stdout`/`stderr` chunks, then a
//! final `exit_status`. Concurrently the client may send [`StreamChunk`]
//! lines that are funneled to the process stdin; `eof: true` closes stdin.
//!
//! `stream_in` consumes client [`StreamChunk`] lines until `eof`;
//! `stream_out` produces `chunk` responses ending with an `eof` chunk. After
//! a streaming operation completes the daemon closes the connection.
//!
//! Chunk payloads are base64; everything else is plain JSON.

use std::collections::HashMap;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::errors::BurrowError;

/// Encode a binary chunk for the wire.
pub fn encode_chunk(data: &[u8]) -> String {
    BASE64.encode(data)
}

/// Decode a binary chunk from the wire.
pub fn decode_chunk(data: &str) -> Result<Vec<u8>, BurrowError> {
    BASE64
        .decode(data)
        .map_err(|e| BurrowError::InvalidArgument(format!("bad chunk encoding: {}", e)))
}

// =============================================================================
// Requests
// =============================================================================

/// Request from a client to the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    Ping,
    Capacity,
    Create {
        spec: ContainerSpec,
    },
    Destroy {
        handle: String,
    },
    List {
        #[serde(default)]
        properties: HashMap<String, String>,
    },
    Stop {
        handle: String,
        #[serde(default)]
        kill: bool,
    },
    Info {
        handle: String,
    },
    StreamIn {
        handle: String,
        dst_path: String,
    },
    StreamOut {
        handle: String,
        src_path: String,
    },
    LimitBandwidth {
        handle: String,
        limits: BandwidthLimits,
    },
    CurrentBandwidthLimits {
        handle: String,
    },
    LimitMemory {
        handle: String,
        limits: MemoryLimits,
    },
    CurrentMemoryLimits {
        handle: String,
    },
    LimitDisk {
        handle: String,
        limits: DiskLimits,
    },
    CurrentDiskLimits {
        handle: String,
    },
    LimitCpu {
        handle: String,
        limits: CpuLimits,
    },
    CurrentCpuLimits {
        handle: String,
    },
    NetIn {
        handle: String,
        host_port: u32,
        container_port: u32,
    },
    NetOut {
        handle: String,
        network: String,
        #[serde(default)]
        port: u32,
    },
    Run {
        handle: String,
        spec: ProcessSpec,
    },
    Attach {
        handle: String,
        process_id: u32,
    },
}

impl Request {
    /// Serialize to a JSON line (with trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

// =============================================================================
// Responses
// =============================================================================

/// Response from the daemon to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    Ok,
    Error {
        kind: String,
        message: String,
    },
    Handle {
        handle: String,
    },
    Capacity {
        memory_bytes: u64,
        disk_bytes: u64,
        max_containers: u64,
    },
    Handles {
        handles: Vec<String>,
    },
    Info {
        info: ContainerInfo,
    },
    BandwidthLimits {
        limits: BandwidthLimits,
    },
    MemoryLimits {
        limits: MemoryLimits,
    },
    DiskLimits {
        limits: DiskLimits,
    },
    CpuLimits {
        limits: CpuLimits,
    },
    NetIn {
        host_port: u32,
        container_port: u32,
    },
    ProcessStarted {
        process_id: u32,
    },
    Stdout {
        data: String,
    },
    Stderr {
        data: String,
    },
    ExitStatus {
        status: i32,
    },
    Chunk {
        #[serde(default)]
        data: String,
        #[serde(default)]
        eof: bool,
    },
}

impl Response {
    /// Build the error response for a daemon-side failure.
    pub fn error(err: &BurrowError) -> Self {
        Self::Error {
            kind: err.kind().to_string(),
            message: err.to_string(),
        }
    }

    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

/// Client-to-daemon data frame used while a streaming operation owns the
/// connection (stdin chunks for `run`/`attach`, payload for `stream_in`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub data: String,
    #[serde(default)]
    pub eof: bool,
}

impl StreamChunk {
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }

    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}

// =============================================================================
// Container types
// =============================================================================

/// Input to `create`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// User-visible identifier; defaults to the container id.
    #[serde(default)]
    pub handle: Option<String>,

    /// Idle duration after which the container is reclaimed. `None` takes the
    /// daemon default; a zero duration disables the timer.
    #[serde(default)]
    pub grace_time: Option<Duration>,

    #[serde(default)]
    pub network: Option<String>,

    /// Rootfs URI; the scheme selects the provider, empty scheme is the
    /// default provider.
    #[serde(default)]
    pub rootfs: Option<String>,

    #[serde(default)]
    pub bind_mounts: Vec<BindMount>,

    #[serde(default)]
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindMount {
    pub src_path: String,
    pub dst_path: String,
    #[serde(default)]
    pub mode: BindMountMode,
    #[serde(default)]
    pub origin: BindMountOrigin,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMountMode {
    #[default]
    Ro,
    Rw,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BindMountOrigin {
    #[default]
    Host,
    Container,
}

/// Lifecycle state of a live container. Destroyed containers are removed from
/// the registry and have no state to report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Active,
    Stopped,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Active => write!(f, "active"),
            ContainerState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Snapshot of a container's externally visible state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerInfo {
    pub state: ContainerState,
    pub events: Vec<String>,
    pub host_ip: String,
    pub container_ip: String,
    pub container_path: String,
    pub process_ids: Vec<u32>,
    pub properties: HashMap<String, String>,
    pub memory_stat: MemoryStat,
    pub cpu_stat: CpuStat,
    pub disk_stat: DiskStat,
    pub bandwidth_stat: BandwidthStat,
    pub mapped_ports: Vec<PortMapping>,
}

// =============================================================================
// Usage counters
// =============================================================================

/// Memory counters from the container's memory cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryStat {
    pub cache: u64,
    pub rss: u64,
    pub mapped_file: u64,
    pub swap: u64,
    pub pgfault: u64,
    pub pgmajfault: u64,
    pub usage_in_bytes: u64,
}

/// CPU counters from the container's cpuacct cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuStat {
    /// Total consumed, in nanoseconds.
    pub usage: u64,
    /// Time in user mode, in USER_HZ ticks.
    pub user: u64,
    /// Time in kernel mode, in USER_HZ ticks.
    pub system: u64,
}

/// Disk counters for the container's writable footprint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskStat {
    pub bytes_used: u64,
    pub inodes_used: u64,
}

/// Rates currently installed on the container's traffic qdisc.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthStat {
    pub in_rate: u64,
    pub in_burst: u64,
    pub out_rate: u64,
    pub out_burst: u64,
}

/// Currently effective limits, one record per subsystem.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitsSummary {
    pub bandwidth: BandwidthLimits,
    pub memory: MemoryLimits,
    pub disk: DiskLimits,
    pub cpu: CpuLimits,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host_port: u32,
    pub container_port: u32,
}

// =============================================================================
// Limit records
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthLimits {
    pub rate_bytes_per_sec: u64,
    pub burst_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryLimits {
    pub limit_in_bytes: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskLimits {
    pub byte_limit: u64,
    pub inode_limit: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuLimits {
    pub limit_in_shares: u64,
}

// =============================================================================
// Process types
// =============================================================================

/// What to run inside a container.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tty: Option<TtySpec>,
    #[serde(default)]
    pub limits: ResourceLimits,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TtySpec {
    #[serde(default)]
    pub window_size: Option<WindowSize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowSize {
    pub columns: u32,
    pub rows: u32,
}

/// rlimits applied to a spawned process. `None` leaves the inherited value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceLimits {
    #[serde(default, rename = "as")]
    pub address_space: Option<u64>,
    #[serde(default)]
    pub core: Option<u64>,
    #[serde(default)]
    pub cpu: Option<u64>,
    #[serde(default)]
    pub data: Option<u64>,
    #[serde(default)]
    pub fsize: Option<u64>,
    #[serde(default)]
    pub memlock: Option<u64>,
    #[serde(default)]
    pub nofile: Option<u64>,
    #[serde(default)]
    pub nproc: Option<u64>,
    #[serde(default)]
    pub stack: Option<u64>,
}

impl ResourceLimits {
    /// Render as `RLIMIT_*` environment pairs for the process helper.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        let mut push = |name: &str, value: Option<u64>| {
            if let Some(v) = value {
                env.push((format!("RLIMIT_{}", name), v.to_string()));
            }
        };
        push("AS", self.address_space);
        push("CORE", self.core);
        push("CPU", self.cpu);
        push("DATA", self.data);
        push("FSIZE", self.fsize);
        push("MEMLOCK", self.memlock);
        push("NOFILE", self.nofile);
        push("NPROC", self.nproc);
        push("STACK", self.stack);
        env
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_request_round_trips() {
        let req = Request::Ping;
        let json = req.to_json_line().unwrap();
        assert!(json.contains("\"type\":\"ping\""));
        assert!(matches!(Request::from_json(&json).unwrap(), Request::Ping));
    }

    #[test]
    fn create_request_carries_spec() {
        let mut properties = HashMap::new();
        properties.insert("owner".to_string(), "tests".to_string());
        let req = Request::Create {
            spec: ContainerSpec {
                handle: Some("web".into()),
                grace_time: Some(Duration::from_secs(300)),
                rootfs: Some("docker:///busybox".into()),
                properties,
                ..Default::default()
            },
        };
        let json = req.to_json_line().unwrap();
        assert!(json.contains("\"type\":\"create\""));
        assert!(json.contains("\"handle\":\"web\""));

        match Request::from_json(&json).unwrap() {
            Request::Create { spec } => {
                assert_eq!(spec.handle.as_deref(), Some("web"));
                assert_eq!(spec.grace_time, Some(Duration::from_secs(300)));
                assert_eq!(spec.properties["owner"], "tests");
            }
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn list_request_defaults_to_empty_filter() {
        let req = Request::from_json("{\"type\":\"list\"}").unwrap();
        match req {
            Request::List { properties } => assert!(properties.is_empty()),
            other => panic!("unexpected request: {:?}", other),
        }
    }

    #[test]
    fn error_response_carries_kind() {
        let resp = Response::error(&BurrowError::ContainerNotFound("gone".into()));
        let json = resp.to_json_line().unwrap();
        assert!(json.contains("\"kind\":\"container_not_found\""));
        assert!(json.contains("gone"));
    }

    #[test]
    fn chunks_round_trip_binary_data() {
        let payload = [0u8, 1, 2, 255, 254];
        let encoded = encode_chunk(&payload);
        assert_eq!(decode_chunk(&encoded).unwrap(), payload);
        assert!(decode_chunk("%%%").is_err());
    }

    #[test]
    fn stream_chunk_defaults() {
        let chunk = StreamChunk::from_json("{}").unwrap();
        assert!(chunk.data.is_empty());
        assert!(!chunk.eof);
    }

    #[test]
    fn resource_limits_render_env() {
        let limits = ResourceLimits {
            nofile: Some(1024),
            cpu: Some(30),
            ..Default::default()
        };
        let env = limits.to_env();
        assert!(env.contains(&("RLIMIT_NOFILE".to_string(), "1024".to_string())));
        assert!(env.contains(&("RLIMIT_CPU".to_string(), "30".to_string())));
        assert_eq!(env.len(), 2);
    }

    #[test]
    fn bind_mount_mode_serializes_lowercase() {
        let mount = BindMount {
            src_path: "/host/cache".into(),
            dst_path: "/cache".into(),
            mode: BindMountMode::Rw,
            origin: BindMountOrigin::Container,
        };
        let json = serde_json::to_string(&mount).unwrap();
        assert!(json.contains("\"mode\":\"rw\""));
        assert!(json.contains("\"origin\":\"container\""));
    }
}
