//! Daemon configuration.

use std::path::PathBuf;
use std::time::Duration;

use burrow_shared::{BurrowError, BurrowResult, Transport};

/// Validated configuration for one daemon instance.
#[derive(Clone, Debug)]
pub struct DaemonConfig {
    pub listen: Transport,

    /// Directory containing the host scripts (create.sh, destroy.sh, ...).
    pub bin_dir: PathBuf,
    /// Directory holding per-container state directories.
    pub depot_dir: PathBuf,
    /// Directory for rootfs overlays.
    pub overlays_dir: PathBuf,
    /// Default base rootfs for the default provider.
    pub rootfs_path: PathBuf,
    /// Snapshot directory; `None` disables persistence across restarts.
    pub snapshots_dir: Option<PathBuf>,
    /// Root of the cgroup hierarchy holding the per-container groups;
    /// derived from the uniqueness tag when unset.
    pub cgroup_root: Option<PathBuf>,

    /// Default idle timeout for new containers; zero disables the timer.
    pub default_grace_time: Duration,

    pub network_pool: String,
    pub port_pool_start: u32,
    pub port_pool_size: u32,
    pub uid_pool_start: u32,
    pub uid_pool_size: u32,

    pub deny_networks: Vec<String>,
    pub allow_networks: Vec<String>,

    pub disable_quotas: bool,
    pub debug: bool,
    pub uniqueness_tag: String,
}

impl DaemonConfig {
    /// Check invariants and create the state directories. Called once before
    /// the daemon starts serving; failures here terminate the process.
    pub fn validate(&self) -> BurrowResult<()> {
        if self.bin_dir.as_os_str().is_empty() {
            return Err(BurrowError::InvalidArgument(
                "a script bin directory must be configured".into(),
            ));
        }
        if self.depot_dir.as_os_str().is_empty() {
            return Err(BurrowError::InvalidArgument(
                "a depot directory must be configured".into(),
            ));
        }
        if self.uid_pool_size == 0 || self.port_pool_size == 0 {
            return Err(BurrowError::InvalidArgument(
                "uid and port pools must not be empty".into(),
            ));
        }
        crate::pools::split_cidr(&self.network_pool)?;
        for network in self.deny_networks.iter().chain(&self.allow_networks) {
            crate::pools::split_cidr(network)?;
        }

        std::fs::create_dir_all(&self.depot_dir)
            .map_err(|e| BurrowError::Storage(format!("cannot create depot: {}", e)))?;
        std::fs::create_dir_all(&self.overlays_dir)
            .map_err(|e| BurrowError::Storage(format!("cannot create overlays dir: {}", e)))?;
        if let Some(snapshots) = &self.snapshots_dir {
            std::fs::create_dir_all(snapshots)
                .map_err(|e| BurrowError::Storage(format!("cannot create snapshots dir: {}", e)))?;
        }
        Ok(())
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: Transport::unix("/tmp/burrow.sock"),
            bin_dir: PathBuf::new(),
            depot_dir: PathBuf::new(),
            overlays_dir: PathBuf::new(),
            rootfs_path: PathBuf::new(),
            snapshots_dir: None,
            cgroup_root: None,
            default_grace_time: Duration::ZERO,
            network_pool: "10.254.0.0/22".to_string(),
            port_pool_start: 61001,
            port_pool_size: 5000,
            uid_pool_start: 10000,
            uid_pool_size: 256,
            deny_networks: Vec::new(),
            allow_networks: Vec::new(),
            disable_quotas: false,
            debug: false,
            uniqueness_tag: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config(root: &std::path::Path) -> DaemonConfig {
        DaemonConfig {
            bin_dir: root.join("bin"),
            depot_dir: root.join("depot"),
            overlays_dir: root.join("overlays"),
            rootfs_path: root.join("rootfs"),
            ..Default::default()
        }
    }

    #[test]
    fn validate_creates_state_directories() {
        let root = std::env::temp_dir().join(format!("burrow-config-{}", std::process::id()));
        let config = DaemonConfig {
            snapshots_dir: Some(root.join("snapshots")),
            ..valid_config(&root)
        };
        config.validate().unwrap();
        assert!(config.depot_dir.is_dir());
        assert!(config.overlays_dir.is_dir());
        assert!(root.join("snapshots").is_dir());
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn validate_rejects_missing_bin_dir() {
        let root = std::env::temp_dir().join("burrow-config-nobin");
        let config = DaemonConfig {
            bin_dir: PathBuf::new(),
            ..valid_config(&root)
        };
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_argument");
    }

    #[test]
    fn validate_rejects_bad_network_pool() {
        let root = std::env::temp_dir().join("burrow-config-badnet");
        let config = DaemonConfig {
            network_pool: "not-a-cidr".to_string(),
            ..valid_config(&root)
        };
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_argument");
        std::fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn validate_rejects_bad_deny_network() {
        let root = std::env::temp_dir().join(format!("burrow-config-deny-{}", std::process::id()));
        let config = DaemonConfig {
            deny_networks: vec!["10.0.0.1".to_string()],
            ..valid_config(&root)
        };
        assert_eq!(config.validate().unwrap_err().kind(), "invalid_argument");
        std::fs::remove_dir_all(&root).ok();
    }
}
