//! In-container process tracking and stdio multiplexing.
//!
//! Each container owns one tracker. A tracked process is spawned through the
//! host shell as `<container>/bin/spawn.sh [flags] -- PROG ARGS...` and wired
//! into three channels:
//!
//! - a stdin funnel (mpsc): chunks from the currently attached client are
//!   forwarded to the child; an empty chunk closes stdin.
//! - a stdout/stderr fanout (broadcast): one reader task per stream pushes
//!   chunks to every attached consumer. A lagged consumer loses bytes rather
//!   than stalling the child; an empty chunk marks end of stream.
//! - an exit watch: set once when the child is reaped, after both stream
//!   readers have drained. Every wait observes the same value.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burrow_shared::protocol::{ProcessSpec, TtySpec};
use burrow_shared::{BurrowError, BurrowResult};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, watch};

use crate::shell::HostShell;

/// Chunks buffered per stdio stream before a slow consumer starts losing
/// bytes.
const STDIO_CHANNEL_CAPACITY: usize = 256;

/// Chunks buffered on the stdin funnel.
const STDIN_CHANNEL_CAPACITY: usize = 32;

const READ_BUF_SIZE: usize = 4096;

/// Handle to one tracked process.
///
/// The stdout/stderr receivers are pre-subscribed so no output emitted
/// between spawn and the first read is lost; `attach` hands out receivers
/// subscribed at attach time, so earlier output is not replayed.
#[derive(Debug)]
pub struct Process {
    id: u32,
    stdin: mpsc::Sender<Vec<u8>>,
    stdout: Option<broadcast::Receiver<Vec<u8>>>,
    stderr: Option<broadcast::Receiver<Vec<u8>>>,
    exit: watch::Receiver<Option<i32>>,
}

impl Process {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Sender half of the stdin funnel. An empty chunk closes the child's
    /// stdin.
    pub fn stdin(&self) -> mpsc::Sender<Vec<u8>> {
        self.stdin.clone()
    }

    /// Take the stdout subscription. An empty chunk marks end of stream.
    pub fn stdout(&mut self) -> Option<broadcast::Receiver<Vec<u8>>> {
        self.stdout.take()
    }

    /// Take the stderr subscription.
    pub fn stderr(&mut self) -> Option<broadcast::Receiver<Vec<u8>>> {
        self.stderr.take()
    }

    /// Final status if the process already terminated.
    pub fn exited(&self) -> Option<i32> {
        *self.exit.borrow()
    }

    /// An independent subscription to the exit signal, for callers that need
    /// to select on termination while also consuming stdio.
    pub fn exit_watch(&self) -> watch::Receiver<Option<i32>> {
        self.exit.clone()
    }

    /// Block until the child reports termination. Repeated waits return the
    /// same status.
    pub async fn wait(&mut self) -> BurrowResult<i32> {
        loop {
            if let Some(status) = *self.exit.borrow() {
                return Ok(status);
            }
            if self.exit.changed().await.is_err() {
                // Publisher gone without a status; the daemon lost the child.
                return match *self.exit.borrow() {
                    Some(status) => Ok(status),
                    None => Err(BurrowError::Internal(
                        "process reaper terminated without reporting an exit status".into(),
                    )),
                };
            }
        }
    }
}

#[derive(Clone)]
struct ProcessEntry {
    pid: Option<u32>,
    stdin: mpsc::Sender<Vec<u8>>,
    stdout: broadcast::Sender<Vec<u8>>,
    stderr: broadcast::Sender<Vec<u8>>,
    exit: watch::Receiver<Option<i32>>,
}

struct TrackerInner {
    next_id: u32,
    processes: HashMap<u32, ProcessEntry>,
    /// Ids carried over from a snapshot. Listed but no longer attachable:
    /// supervisor children do not survive a daemon restart.
    restored: BTreeSet<u32>,
}

/// Spawns and tracks the processes of one container.
pub struct ProcessTracker {
    container_path: PathBuf,
    shell: Arc<dyn HostShell>,
    inner: Mutex<TrackerInner>,
}

impl fmt::Debug for ProcessTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessTracker")
            .field("container_path", &self.container_path)
            .finish_non_exhaustive()
    }
}

impl ProcessTracker {
    pub fn new(container_path: impl Into<PathBuf>, shell: Arc<dyn HostShell>) -> Self {
        Self {
            container_path: container_path.into(),
            shell,
            inner: Mutex::new(TrackerInner {
                next_id: 1,
                processes: HashMap::new(),
                restored: BTreeSet::new(),
            }),
        }
    }

    /// Spawn a process matching `spec`, running as `user_uid` inside the
    /// container.
    pub fn run(&self, spec: &ProcessSpec, user_uid: u32) -> BurrowResult<Process> {
        if spec.path.is_empty() {
            return Err(BurrowError::InvalidArgument(
                "process spec has no path".into(),
            ));
        }

        let program = self.container_path.join("bin").join("spawn.sh");
        let (args, env) = helper_invocation(spec, user_uid);

        let mut child = self.shell.spawn(&program, &args, &env)?;
        let pid = child.id();

        let (stdin_tx, mut stdin_rx) = mpsc::channel::<Vec<u8>>(STDIN_CHANNEL_CAPACITY);
        let (stdout_tx, _) = broadcast::channel(STDIO_CHANNEL_CAPACITY);
        let (stderr_tx, _) = broadcast::channel(STDIO_CHANNEL_CAPACITY);
        let (exit_tx, exit_rx) = watch::channel(None);

        let mut stdin = child.stdin.take();
        tokio::spawn(async move {
            while let Some(chunk) = stdin_rx.recv().await {
                if chunk.is_empty() {
                    // Close marker: drop the pipe so the child sees EOF.
                    stdin = None;
                    continue;
                }
                let Some(pipe) = stdin.as_mut() else { break };
                if pipe.write_all(&chunk).await.is_err() {
                    break;
                }
                let _ = pipe.flush().await;
            }
        });

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let id = {
            let mut inner = self.inner.lock();
            let id = inner.next_id;
            inner.next_id += 1;
            inner.processes.insert(
                id,
                ProcessEntry {
                    pid,
                    stdin: stdin_tx.clone(),
                    stdout: stdout_tx.clone(),
                    stderr: stderr_tx.clone(),
                    exit: exit_rx.clone(),
                },
            );
            id
        };

        let process = Process {
            id,
            stdin: stdin_tx,
            stdout: Some(stdout_tx.subscribe()),
            stderr: Some(stderr_tx.subscribe()),
            exit: exit_rx,
        };

        tokio::spawn(async move {
            let out_task = stdout_pipe.map(|pipe| tokio::spawn(pump(pipe, stdout_tx)));
            let err_task = stderr_pipe.map(|pipe| tokio::spawn(pump(pipe, stderr_tx)));

            let status = child.wait().await;

            // Streams drain before the exit status becomes visible, so a
            // reader that saw the status will not find bytes trickling in.
            if let Some(task) = out_task {
                let _ = task.await;
            }
            if let Some(task) = err_task {
                let _ = task.await;
            }

            let code = match status {
                Ok(status) => exit_code(status),
                Err(e) => {
                    tracing::warn!(process = id, error = %e, "failed to reap process");
                    -1
                }
            };
            let _ = exit_tx.send(Some(code));
        });

        Ok(process)
    }

    /// Attach to a tracked process by id.
    pub fn attach(&self, process_id: u32) -> BurrowResult<Process> {
        let inner = self.inner.lock();
        let entry = inner
            .processes
            .get(&process_id)
            .ok_or(BurrowError::ProcessNotFound(process_id))?;
        Ok(Process {
            id: process_id,
            stdin: entry.stdin.clone(),
            stdout: Some(entry.stdout.subscribe()),
            stderr: Some(entry.stderr.subscribe()),
            exit: entry.exit.clone(),
        })
    }

    /// Forward a window-size change to the supervisor. Failures are logged,
    /// never fatal.
    pub fn set_tty(&self, process_id: u32, tty: &TtySpec) -> BurrowResult<()> {
        let pid = {
            let inner = self.inner.lock();
            inner
                .processes
                .get(&process_id)
                .ok_or(BurrowError::ProcessNotFound(process_id))?
                .pid
        };

        let Some(window) = tty.window_size else {
            return Ok(());
        };

        let shell = Arc::clone(&self.shell);
        let mut env = vec![
            ("COLUMNS".to_string(), window.columns.to_string()),
            ("ROWS".to_string(), window.rows.to_string()),
        ];
        if let Some(pid) = pid {
            env.push(("PROCESS_PID".to_string(), pid.to_string()));
        }
        tokio::spawn(async move {
            if let Err(e) = shell.run("tty.sh", &[], &env).await {
                tracing::warn!(process = process_id, error = %e, "tty update failed");
            }
        });
        Ok(())
    }

    /// Signal every live supervisor child, used by container stop.
    pub fn signal_all(&self, signal: Signal) {
        let pids: Vec<u32> = {
            let inner = self.inner.lock();
            inner.processes.values().filter_map(|p| p.pid).collect()
        };
        for pid in pids {
            if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
                tracing::debug!(pid, error = %e, "signal skipped");
            }
        }
    }

    /// Every id this tracker knows, including ids restored from a snapshot.
    pub fn process_ids(&self) -> Vec<u32> {
        let inner = self.inner.lock();
        let mut ids: Vec<u32> = inner.processes.keys().copied().collect();
        ids.extend(inner.restored.iter().copied());
        ids.sort_unstable();
        ids.dedup();
        ids
    }

    /// Re-register process ids from a snapshot so the id sequence never
    /// repeats within a depot.
    pub fn restore(&self, ids: &[u32]) {
        let mut inner = self.inner.lock();
        for &id in ids {
            inner.restored.insert(id);
            if id >= inner.next_id {
                inner.next_id = id + 1;
            }
        }
    }

    pub fn container_path(&self) -> &Path {
        &self.container_path
    }
}

/// Forward one stdio pipe into its broadcast fanout. A send error means no
/// consumer is currently attached; the fanout drops those bytes. An empty
/// chunk is the end-of-stream marker.
async fn pump<R>(mut pipe: R, tx: broadcast::Sender<Vec<u8>>)
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut buf = [0u8; READ_BUF_SIZE];
    loop {
        match pipe.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let _ = tx.send(buf[..n].to_vec());
            }
        }
    }
    let _ = tx.send(Vec::new());
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    match status.code() {
        Some(code) => code,
        // Killed by signal: report 128+n, the shell convention.
        None => 128 + status.signal().unwrap_or(0),
    }
}

fn helper_invocation(spec: &ProcessSpec, user_uid: u32) -> (Vec<String>, Vec<(String, String)>) {
    let mut args = vec!["--user".to_string(), user_uid.to_string()];
    if let Some(dir) = &spec.dir {
        args.push("--dir".to_string());
        args.push(dir.clone());
    }
    if spec.tty.is_some() {
        args.push("--tty".to_string());
    }
    if spec.privileged {
        args.push("--privileged".to_string());
    }
    args.push("--".to_string());
    args.push(spec.path.clone());
    args.extend(spec.args.iter().cloned());

    let mut env = spec.env.clone();
    env.extend(spec.limits.to_env());
    if let Some(window) = spec.tty.as_ref().and_then(|t| t.window_size) {
        env.push(("COLUMNS".to_string(), window.columns.to_string()));
        env.push(("ROWS".to_string(), window.rows.to_string()));
    }
    (args, env)
}
