//! Usage counters for a live container.
//!
//! Memory and cpu counters come from direct reads of the container's cgroup
//! files; the host scripts park each container in an `instance-<id>` group
//! under the configured cgroup root. Disk counters are the container's
//! writable footprint under its depot directory, excluding the `mnt` union
//! mountpoint. A missing group (the container has not started any work, or
//! the subsystem is not mounted) reads as zero counters.

use std::path::{Path, PathBuf};

use burrow_shared::protocol::{CpuStat, DiskStat, MemoryStat};

#[derive(Debug)]
pub(super) struct StatsReader {
    cgroup_root: PathBuf,
    id: String,
}

impl StatsReader {
    pub(super) fn new(cgroup_root: PathBuf, id: impl Into<String>) -> Self {
        Self {
            cgroup_root,
            id: id.into(),
        }
    }

    fn subsystem_file(&self, subsystem: &str, file: &str) -> PathBuf {
        self.cgroup_root
            .join(subsystem)
            .join(format!("instance-{}", self.id))
            .join(file)
    }

    pub(super) fn memory_stat(&self) -> MemoryStat {
        let mut stat = MemoryStat {
            usage_in_bytes: read_counter(&self.subsystem_file("memory", "memory.usage_in_bytes")),
            ..Default::default()
        };

        for (key, value) in read_pairs(&self.subsystem_file("memory", "memory.stat")) {
            match key.as_str() {
                "cache" => stat.cache = value,
                "rss" => stat.rss = value,
                "mapped_file" => stat.mapped_file = value,
                "swap" => stat.swap = value,
                "pgfault" => stat.pgfault = value,
                "pgmajfault" => stat.pgmajfault = value,
                _ => {}
            }
        }
        stat
    }

    pub(super) fn cpu_stat(&self) -> CpuStat {
        let mut stat = CpuStat {
            usage: read_counter(&self.subsystem_file("cpuacct", "cpuacct.usage")),
            ..Default::default()
        };

        for (key, value) in read_pairs(&self.subsystem_file("cpuacct", "cpuacct.stat")) {
            match key.as_str() {
                "user" => stat.user = value,
                "system" => stat.system = value,
                _ => {}
            }
        }
        stat
    }

    pub(super) fn disk_stat(&self, container_path: &Path) -> DiskStat {
        let mut stat = DiskStat::default();
        walk(container_path, true, &mut stat);
        stat
    }
}

/// Single-value cgroup counter file; absent or malformed reads as zero.
fn read_counter(path: &Path) -> u64 {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse().ok())
        .unwrap_or(0)
}

/// `key value` lines of a cgroup stat file; absent file yields nothing.
fn read_pairs(path: &Path) -> Vec<(String, u64)> {
    let Ok(raw) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    raw.lines()
        .filter_map(|line| {
            let mut parts = line.split_whitespace();
            let key = parts.next()?;
            let value = parts.next()?.parse().ok()?;
            Some((key.to_string(), value))
        })
        .collect()
}

fn walk(dir: &Path, top: bool, stat: &mut DiskStat) {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        // The union filesystem is mounted at mnt; counting through it would
        // attribute the whole base rootfs to this container.
        if top && entry.file_name() == "mnt" {
            continue;
        }
        stat.inodes_used += 1;
        let Ok(metadata) = entry.metadata() else {
            continue;
        };
        if metadata.is_dir() {
            walk(&entry.path(), false, stat);
        } else {
            stat.bytes_used += metadata.len();
        }
    }
}
