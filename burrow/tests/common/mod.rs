//! Shared fixtures: an isolated daemon backend over a temp directory, with
//! recording doubles for the host shell and the rootfs provider.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tempfile::TempDir;
use tokio::process::Child;

use burrow::config::DaemonConfig;
use burrow::rootfs::{ProviderRegistry, RootfsProvider, RootfsUri};
use burrow::shell::HostShell;
use burrow::{Backend, ContainerPool};
use burrow_shared::protocol::ContainerSpec;
use burrow_shared::{BurrowError, BurrowResult};

/// One recorded host-script invocation.
#[derive(Debug, Clone)]
pub struct ShellCall {
    pub script: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

impl ShellCall {
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Host shell double. `run` records and returns scripted results; `spawn`
/// executes the requested program directly on the host so stdio plumbing is
/// exercised for real.
pub struct FakeShell {
    calls: Mutex<Vec<ShellCall>>,
    failures: Mutex<HashMap<String, i32>>,
}

impl FakeShell {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    /// Script the named host script to exit with `status`.
    pub fn fail(&self, script: &str, status: i32) {
        self.failures.lock().insert(script.to_string(), status);
    }

    pub fn pass(&self, script: &str) {
        self.failures.lock().remove(script);
    }

    pub fn calls(&self) -> Vec<ShellCall> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, script: &str) -> Vec<ShellCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.script == script)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl HostShell for FakeShell {
    async fn run(
        &self,
        script: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> BurrowResult<()> {
        self.calls.lock().push(ShellCall {
            script: script.to_string(),
            args: args.to_vec(),
            env: env.to_vec(),
        });
        if let Some(&status) = self.failures.lock().get(script) {
            return Err(BurrowError::HostScriptFailed {
                script: script.to_string(),
                status,
            });
        }
        Ok(())
    }

    fn spawn(
        &self,
        program: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> BurrowResult<Child> {
        self.calls.lock().push(ShellCall {
            script: program.display().to_string(),
            args: args.to_vec(),
            env: env.to_vec(),
        });

        // The helper argv carries the real program after "--".
        let sep = args
            .iter()
            .position(|a| a == "--")
            .ok_or_else(|| BurrowError::InvalidArgument("helper argv has no --".into()))?;
        let mut cmd = tokio::process::Command::new(&args[sep + 1]);
        cmd.args(&args[sep + 2..]);
        for (key, value) in env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.spawn().map_err(BurrowError::from)
    }

    fn uniqueness_tag(&self) -> &str {
        "fake-tag"
    }
}

/// Rootfs provider double recording provide/cleanup calls.
pub struct FakeRootfs {
    root: PathBuf,
    pub provided: Mutex<Vec<String>>,
    pub cleaned: Mutex<Vec<String>>,
    fail_provide: Mutex<bool>,
}

impl FakeRootfs {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            provided: Mutex::new(Vec::new()),
            cleaned: Mutex::new(Vec::new()),
            fail_provide: Mutex::new(false),
        }
    }

    pub fn fail_provide(&self) {
        *self.fail_provide.lock() = true;
    }

    pub fn provided_ids(&self) -> Vec<String> {
        self.provided.lock().clone()
    }

    pub fn cleaned_ids(&self) -> Vec<String> {
        self.cleaned.lock().clone()
    }
}

#[async_trait]
impl RootfsProvider for FakeRootfs {
    async fn provide(&self, container_id: &str, _uri: &RootfsUri) -> BurrowResult<PathBuf> {
        self.provided.lock().push(container_id.to_string());
        if *self.fail_provide.lock() {
            return Err(BurrowError::Storage("scripted provide failure".into()));
        }
        let dir = self.root.join(container_id);
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    async fn cleanup(&self, container_id: &str) -> BurrowResult<()> {
        self.cleaned.lock().push(container_id.to_string());
        Ok(())
    }
}

/// Isolated backend over a temp dir, with small pools so exhaustion is easy
/// to provoke.
pub struct TestContext {
    pub backend: Backend,
    pub shell: Arc<FakeShell>,
    pub rootfs: Arc<FakeRootfs>,
    pub config: DaemonConfig,
    _temp_dir: TempDir,
}

impl TestContext {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(adjust: impl FnOnce(&mut DaemonConfig)) -> Self {
        let temp_dir = TempDir::new().expect("create temp dir");
        let root = temp_dir.path();

        let mut config = DaemonConfig {
            bin_dir: root.join("bin"),
            depot_dir: root.join("depot"),
            overlays_dir: root.join("overlays"),
            rootfs_path: root.join("rootfs"),
            cgroup_root: Some(root.join("cgroup")),
            network_pool: "10.254.0.0/26".to_string(),
            uid_pool_start: 10000,
            uid_pool_size: 8,
            port_pool_start: 61001,
            port_pool_size: 8,
            ..Default::default()
        };
        adjust(&mut config);
        config.validate().expect("valid test config");

        let shell = Arc::new(FakeShell::new());
        let rootfs = Arc::new(FakeRootfs::new(root.join("fake-rootfs")));
        let providers = ProviderRegistry::new()
            .register("", Arc::clone(&rootfs) as Arc<dyn RootfsProvider>);

        let pool = ContainerPool::new(&config, shell.clone() as Arc<dyn HostShell>, providers)
            .expect("create container pool");
        let backend = Backend::new(&config, pool, shell.clone() as Arc<dyn HostShell>);

        Self {
            backend,
            shell,
            rootfs,
            config,
            _temp_dir: temp_dir,
        }
    }

    pub fn temp_path(&self) -> &Path {
        self._temp_dir.path()
    }

    /// A second backend over the same directories, as after a daemon
    /// restart. Comes with its own recording doubles.
    pub fn fresh_backend(&self) -> (Backend, Arc<FakeShell>, Arc<FakeRootfs>) {
        let shell = Arc::new(FakeShell::new());
        let rootfs = Arc::new(FakeRootfs::new(self._temp_dir.path().join("fake-rootfs")));
        let providers = ProviderRegistry::new()
            .register("", Arc::clone(&rootfs) as Arc<dyn RootfsProvider>);
        let pool = ContainerPool::new(&self.config, shell.clone() as Arc<dyn HostShell>, providers)
            .expect("create container pool");
        let backend = Backend::new(&self.config, pool, shell.clone() as Arc<dyn HostShell>);
        (backend, shell, rootfs)
    }

    /// Sum of free pool elements, for conservation checks.
    pub fn free_counts(&self) -> (u32, u32, u32) {
        let pool = self.backend.pool();
        (
            pool.uid_pool().free_count(),
            pool.subnet_pool().free_count(),
            pool.port_pool().free_count(),
        )
    }

    pub fn initial_counts(&self) -> (u32, u32, u32) {
        let pool = self.backend.pool();
        (
            pool.uid_pool().initial_size(),
            pool.subnet_pool().initial_size(),
            pool.port_pool().initial_size(),
        )
    }
}

/// Spec with a handle, for the common case.
pub fn spec_with_handle(handle: &str) -> ContainerSpec {
    ContainerSpec {
        handle: Some(handle.to_string()),
        ..Default::default()
    }
}
