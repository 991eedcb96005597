//! Container operation tests: stop, limits, port mapping, egress rules, and
//! file streaming.

mod common;

use burrow_shared::protocol::{
    BandwidthLimits, ContainerState, CpuLimits, DiskLimits, MemoryLimits,
};
use tokio::sync::mpsc;

use common::{spec_with_handle, TestContext};

// ============================================================================
// STOP
// ============================================================================

#[tokio::test]
async fn stop_runs_the_stop_script_and_marks_the_container() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("stoppable")).await.unwrap();

    container.stop(false).await.unwrap();

    let calls = ctx.shell.calls_for("stop.sh");
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].env_value("KILL"), Some("false"));

    let info = container.info();
    assert_eq!(info.state, ContainerState::Stopped);
    assert_eq!(info.events, vec!["stopped".to_string()]);
}

#[tokio::test]
async fn stop_with_kill_requests_an_immediate_kill() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("killed")).await.unwrap();

    container.stop(true).await.unwrap();
    let calls = ctx.shell.calls_for("stop.sh");
    assert_eq!(calls[0].env_value("KILL"), Some("true"));
}

#[tokio::test]
async fn stopping_a_stopped_container_is_a_no_op() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("idempotent")).await.unwrap();

    container.stop(false).await.unwrap();
    container.stop(false).await.unwrap();

    assert_eq!(ctx.shell.calls_for("stop.sh").len(), 1);
    assert_eq!(container.info().events, vec!["stopped".to_string()]);
}

#[tokio::test]
async fn stopped_containers_remain_listable() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("lingering")).await.unwrap();
    container.stop(false).await.unwrap();

    let handles = ctx.backend.handles(&Default::default());
    assert_eq!(handles, vec!["lingering".to_string()]);
    ctx.backend.lookup("lingering").unwrap();
}

// ============================================================================
// LIMITS
// ============================================================================

#[tokio::test]
async fn limits_apply_through_the_limits_script_and_persist() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("limited")).await.unwrap();

    let memory = MemoryLimits {
        limit_in_bytes: 512 << 20,
    };
    container.limit_memory(memory).await.unwrap();
    assert_eq!(container.current_memory_limits(), memory);

    let cpu = CpuLimits {
        limit_in_shares: 128,
    };
    container.limit_cpu(cpu).await.unwrap();
    assert_eq!(container.current_cpu_limits(), cpu);

    let disk = DiskLimits {
        byte_limit: 1 << 30,
        inode_limit: 100_000,
    };
    container.limit_disk(disk).await.unwrap();
    assert_eq!(container.current_disk_limits(), disk);

    let bandwidth = BandwidthLimits {
        rate_bytes_per_sec: 1 << 20,
        burst_bytes: 64 << 10,
    };
    container.limit_bandwidth(bandwidth).await.unwrap();
    assert_eq!(container.current_bandwidth_limits(), bandwidth);

    let calls = ctx.shell.calls_for("limits.sh");
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0].env_value("LIMIT"), Some("memory"));
    assert_eq!(calls[0].env_value("LIMIT_IN_BYTES"), Some("536870912"));
    assert_eq!(calls[1].env_value("LIMIT"), Some("cpu"));
    assert_eq!(calls[1].env_value("SHARES"), Some("128"));
    assert_eq!(calls[2].env_value("LIMIT"), Some("disk"));
    assert_eq!(calls[2].env_value("USER_UID"), Some("10000"));
    assert_eq!(calls[3].env_value("LIMIT"), Some("bandwidth"));

    // The bandwidth counters mirror the rates installed on the qdisc.
    let info = container.info();
    assert_eq!(info.bandwidth_stat.in_rate, bandwidth.rate_bytes_per_sec);
    assert_eq!(info.bandwidth_stat.in_burst, bandwidth.burst_bytes);
    assert_eq!(info.bandwidth_stat.out_rate, bandwidth.rate_bytes_per_sec);
}

#[tokio::test]
async fn current_limits_default_to_zero() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("untouched")).await.unwrap();
    assert_eq!(container.current_memory_limits(), MemoryLimits::default());
    assert_eq!(container.current_cpu_limits(), CpuLimits::default());
}

#[tokio::test]
async fn failed_limit_application_does_not_update_current_limits() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("unlimited")).await.unwrap();
    ctx.shell.fail("limits.sh", 1);

    let err = container
        .limit_memory(MemoryLimits { limit_in_bytes: 1 })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "host_script_failed");
    assert_eq!(container.current_memory_limits(), MemoryLimits::default());
}

// ============================================================================
// NETWORKING
// ============================================================================

#[tokio::test]
async fn net_in_allocates_a_host_port_when_asked_for_zero() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("mapped")).await.unwrap();

    let (host_port, container_port) = container.net_in(0, 0).await.unwrap();
    assert_eq!(host_port, 61001);
    assert_eq!(container_port, 61001);

    let calls = ctx.shell.calls_for("net.sh");
    assert_eq!(calls[0].env_value("ACTION"), Some("in"));
    assert_eq!(calls[0].env_value("HOST_PORT"), Some("61001"));

    let info = container.info();
    assert_eq!(info.mapped_ports.len(), 1);
    assert_eq!(info.mapped_ports[0].host_port, 61001);
    assert_eq!(container.resources().ports, vec![61001]);
}

#[tokio::test]
async fn net_in_honors_explicit_ports() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("explicit")).await.unwrap();

    let (host_port, container_port) = container.net_in(8443, 443).await.unwrap();
    assert_eq!((host_port, container_port), (8443, 443));

    // Explicit host ports do not come from the pool.
    assert_eq!(
        ctx.backend.pool().port_pool().free_count(),
        ctx.backend.pool().port_pool().initial_size()
    );
}

#[tokio::test]
async fn failed_net_in_returns_the_pooled_port() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("unmapped")).await.unwrap();
    ctx.shell.fail("net.sh", 1);

    let err = container.net_in(0, 0).await.unwrap_err();
    assert_eq!(err.kind(), "host_script_failed");
    assert_eq!(
        ctx.backend.pool().port_pool().free_count(),
        ctx.backend.pool().port_pool().initial_size()
    );
    assert!(container.resources().ports.is_empty());
}

#[tokio::test]
async fn net_out_installs_an_egress_allow_rule() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("egress")).await.unwrap();

    container.net_out("93.184.216.0/24", 443).await.unwrap();

    let calls = ctx.shell.calls_for("net.sh");
    assert_eq!(calls[0].env_value("ACTION"), Some("out"));
    assert_eq!(calls[0].env_value("NETWORK"), Some("93.184.216.0/24"));
    assert_eq!(calls[0].env_value("PORT"), Some("443"));
}

#[tokio::test]
async fn net_out_rejects_malformed_cidrs() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("picky")).await.unwrap();

    let err = container.net_out("not-a-network", 0).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
    assert!(ctx.shell.calls_for("net.sh").is_empty());
}

#[tokio::test]
async fn info_reports_the_subnet_addresses() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("addressed")).await.unwrap();

    let info = container.info();
    assert_eq!(info.host_ip, "10.254.0.1");
    assert_eq!(info.container_ip, "10.254.0.2");
    assert!(info.container_path.ends_with(container.id()));
}

// ============================================================================
// USAGE COUNTERS
// ============================================================================

#[tokio::test]
async fn info_reads_usage_counters_from_the_cgroup() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("measured")).await.unwrap();

    // Counter files as the create script leaves them.
    let cgroup = ctx.config.cgroup_root.clone().unwrap();
    let memory = cgroup.join(format!("memory/instance-{}", container.id()));
    std::fs::create_dir_all(&memory).unwrap();
    std::fs::write(
        memory.join("memory.stat"),
        "cache 1024\nrss 4096\nmapped_file 512\nswap 0\npgfault 7\npgmajfault 1\n",
    )
    .unwrap();
    std::fs::write(memory.join("memory.usage_in_bytes"), "5120\n").unwrap();

    let cpuacct = cgroup.join(format!("cpuacct/instance-{}", container.id()));
    std::fs::create_dir_all(&cpuacct).unwrap();
    std::fs::write(cpuacct.join("cpuacct.usage"), "123456789\n").unwrap();
    std::fs::write(cpuacct.join("cpuacct.stat"), "user 37\nsystem 11\n").unwrap();

    let info = container.info();
    assert_eq!(info.memory_stat.cache, 1024);
    assert_eq!(info.memory_stat.rss, 4096);
    assert_eq!(info.memory_stat.usage_in_bytes, 5120);
    assert_eq!(info.cpu_stat.usage, 123_456_789);
    assert_eq!(info.cpu_stat.user, 37);
    assert_eq!(info.cpu_stat.system, 11);
}

#[tokio::test]
async fn usage_counters_read_zero_before_the_cgroup_exists() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("fresh")).await.unwrap();

    let info = container.info();
    assert_eq!(info.memory_stat, Default::default());
    assert_eq!(info.cpu_stat, Default::default());
    assert_eq!(info.bandwidth_stat, Default::default());
}

#[tokio::test]
async fn disk_counters_cover_the_depot_footprint() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("weighed")).await.unwrap();

    std::fs::create_dir_all(container.path().join("etc")).unwrap();
    std::fs::write(container.path().join("etc/config"), vec![0u8; 100]).unwrap();
    // Contents under the union mountpoint belong to the base rootfs.
    std::fs::create_dir_all(container.path().join("mnt/data")).unwrap();
    std::fs::write(container.path().join("mnt/data/payload"), vec![0u8; 1000]).unwrap();

    let info = container.info();
    // etc/config plus the zero-byte rootfs-provider tag.
    assert_eq!(info.disk_stat.bytes_used, 100);
    // rootfs-provider, etc, etc/config; nothing under mnt.
    assert_eq!(info.disk_stat.inodes_used, 3);
}

// ============================================================================
// FILE STREAMING
// ============================================================================

fn tar_with_file(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, name, contents).unwrap();
    builder.into_inner().unwrap()
}

#[tokio::test]
async fn stream_in_unpacks_under_the_destination() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("sink")).await.unwrap();

    let archive = tar_with_file("hello.txt", b"from the outside");
    let (tx, rx) = mpsc::channel(4);
    for chunk in archive.chunks(512) {
        tx.send(chunk.to_vec()).await.unwrap();
    }
    drop(tx);

    container.stream_in("/data", rx).await.unwrap();

    let path = container.path().join("mnt/data/hello.txt");
    assert_eq!(std::fs::read(&path).unwrap(), b"from the outside");
}

#[tokio::test]
async fn stream_out_packages_the_source_path() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("source")).await.unwrap();

    let dir = container.path().join("mnt/logs");
    std::fs::create_dir_all(&dir).unwrap();
    std::fs::write(dir.join("app.log"), b"log line\n").unwrap();

    let mut chunks = container.stream_out("/logs").unwrap();
    let mut archive = Vec::new();
    while let Some(item) = chunks.recv().await {
        archive.extend(item.unwrap());
    }

    let mut entries = Vec::new();
    let mut reader = tar::Archive::new(archive.as_slice());
    for entry in reader.entries().unwrap() {
        let mut entry = entry.unwrap();
        let path = entry.path().unwrap().display().to_string();
        let mut contents = Vec::new();
        std::io::Read::read_to_end(&mut entry, &mut contents).unwrap();
        entries.push((path, contents));
    }

    assert!(entries.iter().any(|(path, _)| path == "logs/app.log"));
    let (_, contents) = entries
        .iter()
        .find(|(path, _)| path == "logs/app.log")
        .unwrap();
    assert_eq!(contents, b"log line\n");
}

#[tokio::test]
async fn stream_round_trip_preserves_contents() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("loop")).await.unwrap();

    let archive = tar_with_file("nested/file.bin", &[7u8; 2048]);
    let (tx, rx) = mpsc::channel(4);
    tx.send(archive).await.unwrap();
    drop(tx);
    container.stream_in("/work", rx).await.unwrap();

    let mut chunks = container.stream_out("/work/nested").unwrap();
    let mut packaged = Vec::new();
    while let Some(item) = chunks.recv().await {
        packaged.extend(item.unwrap());
    }

    let mut reader = tar::Archive::new(packaged.as_slice());
    let mut found = false;
    for entry in reader.entries().unwrap() {
        let mut entry = entry.unwrap();
        if entry.path().unwrap().display().to_string() == "nested/file.bin" {
            let mut contents = Vec::new();
            std::io::Read::read_to_end(&mut entry, &mut contents).unwrap();
            assert_eq!(contents, vec![7u8; 2048]);
            found = true;
        }
    }
    assert!(found);
}

#[tokio::test]
async fn stream_paths_cannot_escape_the_container() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("jailed")).await.unwrap();

    let (_tx, rx) = mpsc::channel::<Vec<u8>>(1);
    let err = container.stream_in("../outside", rx).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");

    let err = container.stream_out("/../../etc").unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
}

#[tokio::test]
async fn stream_out_of_a_missing_path_reports_the_error() {
    let ctx = TestContext::new();
    let container = ctx.backend.create(spec_with_handle("empty")).await.unwrap();

    let mut chunks = container.stream_out("/nothing-here").unwrap();
    let mut saw_error = false;
    while let Some(item) = chunks.recv().await {
        if item.is_err() {
            saw_error = true;
        }
    }
    assert!(saw_error);
}
