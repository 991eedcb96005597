//! Host script execution.
//!
//! The daemon cannot express kernel work (namespaces, mounts, cgroup writes,
//! NAT rules) directly; it delegates to privileged shell scripts in the
//! configured bin directory. This module is the only place subprocesses are
//! launched, which is also where the per-daemon uniqueness tag is stamped
//! into every child environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use burrow_shared::{BurrowError, BurrowResult};
use tokio::process::{Child, Command};

/// Capability for invoking host-side scripts.
///
/// `run` drives a named script from the bin directory to completion; `spawn`
/// launches a long-lived helper (the in-container process supervisor) with
/// piped stdio for the process tracker.
#[async_trait]
pub trait HostShell: Send + Sync {
    async fn run(&self, script: &str, args: &[String], env: &[(String, String)])
        -> BurrowResult<()>;

    fn spawn(&self, program: &Path, args: &[String], env: &[(String, String)])
        -> BurrowResult<Child>;

    fn uniqueness_tag(&self) -> &str;
}

/// Production implementation running scripts from `--bin`.
pub struct ScriptShell {
    bin_dir: PathBuf,
    uniqueness_tag: String,
    debug: bool,
}

impl ScriptShell {
    pub fn new(bin_dir: impl Into<PathBuf>, uniqueness_tag: impl Into<String>, debug: bool) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            uniqueness_tag: uniqueness_tag.into(),
            debug,
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    fn base_command(&self, program: &Path, args: &[String], env: &[(String, String)]) -> Command {
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.env("PATH", std::env::var("PATH").unwrap_or_default());
        cmd.env("UNIQUENESS_TAG", &self.uniqueness_tag);
        for (key, value) in env {
            cmd.env(key, value);
        }
        if self.debug {
            tracing::debug!(program = %program.display(), ?args, "invoking host script");
        }
        cmd
    }
}

#[async_trait]
impl HostShell for ScriptShell {
    async fn run(
        &self,
        script: &str,
        args: &[String],
        env: &[(String, String)],
    ) -> BurrowResult<()> {
        let program = self.bin_dir.join(script);
        let output = self
            .base_command(&program, args, env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::warn!(
            script,
            status = output.status.code().unwrap_or(-1),
            stderr = %stderr.trim_end(),
            "host script failed"
        );
        Err(BurrowError::HostScriptFailed {
            script: script.to_string(),
            status: output.status.code().unwrap_or(-1),
        })
    }

    fn spawn(
        &self,
        program: &Path,
        args: &[String],
        env: &[(String, String)],
    ) -> BurrowResult<Child> {
        self.base_command(program, args, env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(false)
            .spawn()
            .map_err(BurrowError::from)
    }

    fn uniqueness_tag(&self) -> &str {
        &self.uniqueness_tag
    }
}
