//! Supervised execution of external plugin binaries
//!
//! [`ProcessRunner`] verifies the binary, spawns it without a shell and
//! drains stderr into a bounded tail used in failure messages. The only
//! retried failure is a "text file busy" spawn error, which happens when the
//! binary is still being written by a concurrent extract or deploy.

mod retry;

pub use retry::SpawnRetryPolicy;

use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;

/// Default number of stderr lines kept for failure messages
pub const DEFAULT_STDERR_TAIL_LINES: usize = 50;

/// Default time a terminated process gets before it is killed
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Result type for process operations
pub type ProcessResult<T> = Result<T, ExecutionError>;

/// Errors that can occur while running an external binary
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The binary is missing, not a file, or not executable
    #[error("Binary not accessible at {path}: {reason}")]
    BinaryNotAccessible {
        /// Resolved binary path
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// The OS refused to start the process
    #[error("Failed to spawn {binary}: {source}")]
    SpawnFailed {
        /// Resolved binary path
        binary: PathBuf,
        /// Spawn error reported by the OS
        #[source]
        source: io::Error,
    },

    /// The process ran and exited with a nonzero code
    #[error("Process exited with code {code}: {stderr}")]
    ProcessExitedNonZero {
        /// Exit code
        code: i32,
        /// Tail of the captured stderr
        stderr: String,
    },

    /// The process was ended by a signal and has no exit code
    #[error("Process terminated by signal {}", .signal.map(|s| s.to_string()).unwrap_or_else(|| "unknown".to_string()))]
    Terminated {
        /// Terminating signal, when the platform reports one
        signal: Option<i32>,
        /// Tail of the captured stderr
        stderr: String,
    },

    /// Waiting on or signalling the process failed
    #[error("I/O error while supervising process: {0}")]
    Io(#[from] io::Error),
}

impl ExecutionError {
    /// Captured stderr tail, for failures that have one
    pub fn stderr(&self) -> Option<&str> {
        match self {
            ExecutionError::ProcessExitedNonZero { stderr, .. }
            | ExecutionError::Terminated { stderr, .. } => Some(stderr),
            _ => None,
        }
    }
}

/// A process that exited successfully
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stderr: String,
}

/// Spawns and supervises external binaries
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    retry: SpawnRetryPolicy,
    stderr_tail_lines: usize,
    termination_grace: Duration,
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessRunner {
    /// Runner with the default retry policy, stderr tail and grace period
    pub fn new() -> Self {
        Self {
            retry: SpawnRetryPolicy::default(),
            stderr_tail_lines: DEFAULT_STDERR_TAIL_LINES,
            termination_grace: DEFAULT_TERMINATION_GRACE,
        }
    }

    pub fn with_retry_policy(mut self, retry: SpawnRetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stderr_tail_lines(mut self, lines: usize) -> Self {
        self.stderr_tail_lines = lines.max(1);
        self
    }

    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// Verify that `path` is an executable regular file
    pub async fn check_binary(path: &Path) -> ProcessResult<()> {
        let not_accessible = |reason: String| ExecutionError::BinaryNotAccessible {
            path: path.to_path_buf(),
            reason,
        };

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| not_accessible(e.to_string()))?;
        if !metadata.is_file() {
            return Err(not_accessible("not a regular file".to_string()));
        }

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if metadata.permissions().mode() & 0o111 == 0 {
                return Err(not_accessible("file is not executable".to_string()));
            }
        }

        Ok(())
    }

    /// Start the binary and hand back its live handle
    ///
    /// Stdout is left for the caller to consume; stderr is drained in the
    /// background into a bounded tail.
    pub async fn spawn(&self, binary: &Path, argv: &[String]) -> ProcessResult<RunningProcess> {
        Self::check_binary(binary).await?;

        let mut attempt = 0;
        let mut child = loop {
            let mut cmd = Command::new(binary);
            cmd.args(argv)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);

            match cmd.spawn() {
                Ok(child) => break child,
                Err(error) if self.retry.is_retryable_error(&error) && attempt < self.retry.max_retries => {
                    attempt += 1;
                    let wait_time = self.retry.calculate_wait_time(attempt);
                    tracing::warn!(
                        "Spawning {} failed (attempt {}/{}): {}. Waiting {:?} before retry...",
                        binary.display(),
                        attempt,
                        self.retry.max_retries + 1,
                        error,
                        wait_time
                    );
                    tokio::time::sleep(wait_time).await;
                }
                Err(source) => {
                    return Err(ExecutionError::SpawnFailed {
                        binary: binary.to_path_buf(),
                        source,
                    })
                }
            }
        };

        let name = binary
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| binary.display().to_string());
        tracing::debug!("Spawned {} (pid {:?})", name, child.id());

        let stdout = child.stdout.take();
        let stderr_tail = StderrTail::new(self.stderr_tail_lines);
        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(drain_stderr(stderr, name.clone(), stderr_tail.clone()))
        });

        Ok(RunningProcess {
            child,
            name,
            stdout,
            stderr_tail,
            stderr_task,
            terminated: false,
            grace: self.termination_grace,
        })
    }

    /// Run the binary to completion, logging its output line by line
    pub async fn run(&self, binary: &Path, argv: &[String]) -> ProcessResult<ProcessOutput> {
        let mut process = self.spawn(binary, argv).await?;

        let stdout_task = process.take_stdout().map(|stdout| {
            let name = process.name.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("[{}] {}", name, line);
                }
            })
        });

        let result = process.wait().await;
        if let Some(task) = stdout_task {
            join_within(task, process.grace, &process.name, "stdout").await;
        }
        result
    }
}

/// A spawned binary
pub struct RunningProcess {
    child: Child,
    name: String,
    stdout: Option<ChildStdout>,
    stderr_tail: StderrTail,
    stderr_task: Option<JoinHandle<()>>,
    terminated: bool,
    grace: Duration,
}

impl std::fmt::Debug for RunningProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningProcess")
            .field("name", &self.name)
            .field("pid", &self.child.id())
            .field("terminated", &self.terminated)
            .finish()
    }
}

impl RunningProcess {
    /// OS process ID while the process is running
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Take the stdout pipe; returns None after the first call
    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Whether [`terminate`](Self::terminate) has been called
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Ask the process to stop
    ///
    /// Sends SIGTERM on unix. Only the first call signals; later calls return
    /// false without touching the process.
    pub fn terminate(&mut self) -> bool {
        if self.terminated {
            return false;
        }
        self.terminated = true;

        let Some(pid) = self.child.id() else {
            return false;
        };
        tracing::info!("Terminating {} (pid {})", self.name, pid);

        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(errno) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!("Failed to signal {} (pid {}): {}", self.name, pid, errno);
            }
        }
        #[cfg(not(unix))]
        {
            if let Err(e) = self.child.start_kill() {
                tracing::warn!("Failed to kill {} (pid {}): {}", self.name, pid, e);
            }
        }

        true
    }

    /// Kill the process immediately with SIGKILL and reap it
    pub async fn kill(&mut self) -> ProcessResult<()> {
        self.terminated = true;
        self.child.kill().await?;
        Ok(())
    }

    /// Wait for the process to exit and classify the outcome
    ///
    /// A terminated process that outlives the grace period is killed. Stderr
    /// is drained for at most one more grace period after exit, since a
    /// descendant that inherited the pipe can hold it open indefinitely.
    pub async fn wait(&mut self) -> ProcessResult<ProcessOutput> {
        let status = if self.terminated {
            match tokio::time::timeout(self.grace, self.child.wait()).await {
                Ok(status) => status?,
                Err(_) => {
                    tracing::warn!(
                        "{} ignored termination for {:?}, killing it",
                        self.name,
                        self.grace
                    );
                    self.kill().await?;
                    self.child.wait().await?
                }
            }
        } else {
            self.child.wait().await?
        };

        if let Some(task) = self.stderr_task.take() {
            join_within(task, self.grace, &self.name, "stderr").await;
        }

        classify(status, self.stderr_tail.joined())
    }
}

/// Await a pipe-draining task, aborting it when the pipe outlives `grace`
async fn join_within(mut task: JoinHandle<()>, grace: Duration, name: &str, pipe: &str) {
    if tokio::time::timeout(grace, &mut task).await.is_err() {
        tracing::warn!(
            "{} {} still open {:?} after exit, abandoning it",
            name,
            pipe,
            grace
        );
        task.abort();
    }
}

/// Last lines written to stderr, shared with the task draining it
#[derive(Debug, Clone)]
struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    limit: usize,
}

impl StderrTail {
    fn new(limit: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(limit))),
            limit,
        }
    }

    fn lines(&self) -> MutexGuard<'_, VecDeque<String>> {
        self.lines.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn push(&self, line: String) {
        let mut lines = self.lines();
        if lines.len() == self.limit {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn joined(&self) -> String {
        self.lines().iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

fn classify(status: ExitStatus, stderr: String) -> ProcessResult<ProcessOutput> {
    match status.code() {
        Some(0) => Ok(ProcessOutput {
            exit_code: 0,
            stderr,
        }),
        Some(code) => Err(ExecutionError::ProcessExitedNonZero { code, stderr }),
        None => Err(ExecutionError::Terminated {
            signal: exit_signal(&status),
            stderr,
        }),
    }
}

#[cfg(unix)]
fn exit_signal(status: &ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: &ExitStatus) -> Option<i32> {
    None
}

async fn drain_stderr(stderr: ChildStderr, name: String, tail: StderrTail) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tracing::debug!("[{} stderr] {}", name, line);
        tail.push(line);
    }
}
