//! Bounded subprocess execution.
//!
//! Every step of a cycle is an external command. The runner:
//! - spawns the command in its own process group with stdin closed
//! - captures stdout/stderr concurrently while waiting
//! - enforces the caller's wall-clock timeout
//! - on timeout sends SIGTERM to the whole group, waits a grace period, then SIGKILL
//!
//! The child handle lives in a [`ChildGuard`]; dropping the guard before the
//! child is reaped kills the process group, so no exit path leaves work behind.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default time a timed-out process group gets between SIGTERM and SIGKILL.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// How long to wait for output pipes to drain after the child is gone.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// One external command invocation.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    /// Report a non-zero exit as success (informational steps).
    pub allow_failure: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            working_dir: working_dir.into(),
            env: Vec::new(),
            timeout: Duration::from_secs(300),
            allow_failure: false,
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn allow_failure(mut self, allow: bool) -> Self {
        self.allow_failure = allow;
        self
    }

    /// Human-readable command line for logs.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Structured result of one command.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    /// False only for a hard command that exited non-zero or timed out.
    pub succeeded: bool,
    /// `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl ProcessOutput {
    /// True when the process itself exited zero, regardless of `allow_failure`.
    pub fn exited_cleanly(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

/// Seam between the orchestrator and process execution.
///
/// `Err` is reserved for faults such as a missing binary; an ordinary non-zero
/// exit or timeout is reported through [`ProcessOutput`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput>;
}

/// Runs commands as real child processes.
#[derive(Debug, Clone)]
pub struct SubprocessRunner {
    grace_period: Duration,
}

impl Default for SubprocessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl SubprocessRunner {
    pub fn new() -> Self {
        Self {
            grace_period: DEFAULT_GRACE_PERIOD,
        }
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }
}

#[async_trait]
impl CommandRunner for SubprocessRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<ProcessOutput> {
        let start = Instant::now();

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .current_dir(&spec.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        for (key, value) in &spec.env {
            cmd.env(key, value);
        }

        let mut guard = ChildGuard::spawn(&mut cmd)
            .with_context(|| format!("Failed to spawn command: {}", spec.display()))?;

        tracing::debug!(
            component = "subprocess",
            pid = guard.pid(),
            command = %spec.display(),
            timeout_secs = spec.timeout.as_secs(),
            "Process spawned"
        );

        let stdout_task = guard.take_stdout();
        let stderr_task = guard.take_stderr();

        let (status, timed_out) = match timeout(spec.timeout, guard.wait()).await {
            Ok(status) => (Some(status.context("Failed to wait for command")?), false),
            Err(_) => {
                tracing::warn!(
                    component = "subprocess",
                    pid = guard.pid(),
                    command = %spec.display(),
                    timeout_secs = spec.timeout.as_secs(),
                    "Command timed out, terminating process group"
                );
                let status = guard
                    .terminate(self.grace_period)
                    .await
                    .context("Failed to terminate timed-out command")?;
                (status, true)
            }
        };

        let stdout = drain(stdout_task).await;
        let stderr = drain(stderr_task).await;

        let exit_code = status.and_then(|s| s.code());
        let exited_zero = !timed_out && exit_code == Some(0);
        let succeeded = exited_zero || (spec.allow_failure && !timed_out);
        let duration = start.elapsed();

        tracing::debug!(
            component = "subprocess",
            command = %spec.display(),
            exit_code = ?exit_code,
            timed_out,
            duration_ms = duration.as_millis() as u64,
            "Process finished"
        );

        Ok(ProcessOutput {
            succeeded,
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out,
        })
    }
}

/// Owns a spawned child and its process group.
///
/// Dropping the guard before the child has been reaped kills the group.
pub struct ChildGuard {
    child: Child,
    pid: Option<u32>,
    reaped: bool,
}

impl ChildGuard {
    /// Spawn `cmd` as the leader of a fresh process group.
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        #[cfg(unix)]
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        let child = cmd.spawn()?;
        let pid = child.id();
        Ok(Self {
            child,
            pid,
            reaped: false,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid.unwrap_or(0)
    }

    fn take_stdout(&mut self) -> Option<JoinHandle<Vec<u8>>> {
        self.child.stdout.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        })
    }

    fn take_stderr(&mut self) -> Option<JoinHandle<Vec<u8>>> {
        self.child.stderr.take().map(|mut pipe| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf).await;
                buf
            })
        })
    }

    /// Wait for the child to exit.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        // Grandchildren left in the group would keep the pipes open.
        self.signal_group(Signal::Kill);
        Ok(status)
    }

    /// Graceful terminate: SIGTERM the group, wait `grace`, then SIGKILL.
    pub async fn terminate(&mut self, grace: Duration) -> std::io::Result<Option<ExitStatus>> {
        self.signal_group(Signal::Term);
        let status = match timeout(grace, self.child.wait()).await {
            Ok(status) => Some(status?),
            Err(_) => {
                self.signal_group(Signal::Kill);
                let _ = self.child.start_kill();
                Some(self.child.wait().await?)
            }
        };
        self.reaped = true;
        self.signal_group(Signal::Kill);
        Ok(status)
    }

    #[cfg(unix)]
    fn signal_group(&mut self, signal: Signal) {
        let Some(pid) = self.pid else { return };
        let signo = match signal {
            Signal::Term => libc::SIGTERM,
            Signal::Kill => libc::SIGKILL,
        };
        // SAFETY: kill(2) on a negative pid only delivers a signal to that
        // process group; ESRCH for an already-empty group is ignored.
        unsafe {
            libc::kill(-(pid as libc::pid_t), signo);
        }
    }

    #[cfg(not(unix))]
    fn signal_group(&mut self, _signal: Signal) {
        if !self.reaped {
            let _ = self.child.start_kill();
        }
    }
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.signal_group(Signal::Kill);
            let _ = self.child.start_kill();
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

async fn drain(task: Option<JoinHandle<Vec<u8>>>) -> String {
    let Some(mut task) = task else {
        return String::new();
    };
    match timeout(PIPE_DRAIN_TIMEOUT, &mut task).await {
        Ok(Ok(bytes)) => String::from_utf8_lossy(&bytes).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            task.abort();
            String::new()
        }
    }
}
