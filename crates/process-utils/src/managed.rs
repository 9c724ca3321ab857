//! Supervised child process with piped endpoints and guaranteed teardown.

use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::tail::DiagnosticTail;
use crate::tokio_command;

/// Default stderr tail budget in bytes.
const DEFAULT_TAIL_BUDGET: usize = 8 * 1024;

/// Default time allowed for a killed child to be reaped.
const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(5);

/// How long to wait for the stderr reader to drain after the child exited.
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// Longest stderr line handed to the observer before it is force-split.
const MAX_LINE_BYTES: usize = 4096;

/// Callback invoked for every stderr line (split on `\n` or `\r`).
pub type LineObserver = Box<dyn FnMut(&str) + Send + 'static>;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} failed ({status}): {diagnostics}")]
    Exited {
        program: String,
        status: ExitStatus,
        diagnostics: String,
    },

    #[error("{program} was terminated before it finished")]
    Killed { program: String },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// Captured stderr tail, when the failure carries one.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            Self::Exited { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// Exit code of the child, when it exited on its own.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exited { status, .. } => status.code(),
            _ => None,
        }
    }
}

/// Description of the command to spawn.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    program: String,
    args: Vec<String>,
    stdin: bool,
    stdout: bool,
    tail_budget: usize,
    kill_grace: Duration,
}

impl ProcessSpec {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            stdin: false,
            stdout: false,
            tail_budget: DEFAULT_TAIL_BUDGET,
            kill_grace: DEFAULT_KILL_GRACE,
        }
    }

    /// Pipe the child's stdin so it can be fed through [`ManagedProcess::take_stdin`].
    pub fn with_stdin(mut self) -> Self {
        self.stdin = true;
        self
    }

    /// Pipe the child's stdout so it can be read through [`ManagedProcess::take_stdout`].
    pub fn with_stdout(mut self) -> Self {
        self.stdout = true;
        self
    }

    pub fn with_tail_budget(mut self, bytes: usize) -> Self {
        self.tail_budget = bytes;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

/// A running (or finished) external tool.
///
/// The handle is "live" until the child has been reaped, either by
/// [`wait_for_exit`](Self::wait_for_exit) or by [`kill`](Self::kill).
/// Dropping a live handle kills the child.
pub struct ManagedProcess {
    program: String,
    pid: Option<u32>,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_task: Option<JoinHandle<()>>,
    tail: Arc<Mutex<DiagnosticTail>>,
    kill_grace: Duration,
    exit: Option<ExitStatus>,
    killed: bool,
}

impl ManagedProcess {
    /// Spawn the command, keeping stderr only as a diagnostic tail.
    pub fn spawn(spec: ProcessSpec) -> Result<Self, ProcessError> {
        Self::spawn_inner(spec, None)
    }

    /// Spawn the command and feed every stderr line to `observer`.
    pub fn spawn_observed(
        spec: ProcessSpec,
        observer: impl FnMut(&str) + Send + 'static,
    ) -> Result<Self, ProcessError> {
        Self::spawn_inner(spec, Some(Box::new(observer)))
    }

    fn spawn_inner(spec: ProcessSpec, observer: Option<LineObserver>) -> Result<Self, ProcessError> {
        let mut command = tokio_command(&spec.program);
        command
            .args(&spec.args)
            .env("LC_ALL", "C")
            .stdin(if spec.stdin { Stdio::piped() } else { Stdio::null() })
            .stdout(if spec.stdout { Stdio::piped() } else { Stdio::null() })
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|source| ProcessError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let pid = child.id();
        debug!(program = %spec.program, pid = ?pid, args = ?spec.args, "Spawned external process");

        let tail = Arc::new(Mutex::new(DiagnosticTail::new(spec.tail_budget)));
        let stderr_task = child.stderr.take().map(|stderr| {
            let tail = Arc::clone(&tail);
            let program = spec.program.clone();
            tokio::spawn(read_stderr(stderr, tail, observer, program))
        });

        Ok(Self {
            program: spec.program,
            pid,
            stdin: child.stdin.take(),
            stdout: child.stdout.take(),
            child: Some(child),
            stderr_task,
            tail,
            kill_grace: spec.kill_grace,
            exit: None,
            killed: false,
        })
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Whether the child has not been reaped yet.
    pub fn is_alive(&self) -> bool {
        self.child.is_some()
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    /// Current stderr tail.
    pub fn diagnostics(&self) -> String {
        match self.tail.lock() {
            Ok(tail) => tail.render(),
            Err(poisoned) => poisoned.into_inner().render(),
        }
    }

    /// Wait for the child to exit.
    ///
    /// A non-zero exit becomes [`ProcessError::Exited`] carrying the stderr
    /// tail. Cancel-safe: dropping the future leaves the handle live.
    pub async fn wait_for_exit(&mut self) -> Result<ExitStatus, ProcessError> {
        if let Some(child) = self.child.as_mut() {
            let status = child.wait().await.map_err(|source| ProcessError::Wait {
                program: self.program.clone(),
                source,
            })?;
            self.child = None;
            self.exit = Some(status);
            self.drain_stderr().await;
            debug!(program = %self.program, pid = ?self.pid, %status, "External process exited");
        }

        if self.killed {
            return Err(ProcessError::Killed {
                program: self.program.clone(),
            });
        }

        match self.exit {
            Some(status) if status.success() => Ok(status),
            Some(status) => Err(ProcessError::Exited {
                program: self.program.clone(),
                status,
                diagnostics: self.diagnostics(),
            }),
            None => Err(ProcessError::Killed {
                program: self.program.clone(),
            }),
        }
    }

    /// Terminate the child and reap it within the kill grace period.
    ///
    /// No-op when the child was already reaped or killed.
    pub async fn kill(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        self.killed = true;
        self.stdin = None;
        self.stdout = None;

        if let Err(err) = child.start_kill() {
            debug!(program = %self.program, error = %err, "Kill signal not delivered");
        }

        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(program = %self.program, pid = ?self.pid, %status, "External process killed");
                self.exit = Some(status);
            }
            Ok(Err(err)) => {
                warn!(program = %self.program, error = %err, "Failed to reap killed process");
            }
            Err(_) => {
                warn!(
                    program = %self.program,
                    pid = ?self.pid,
                    grace_ms = self.kill_grace.as_millis() as u64,
                    "Killed process was not reaped within the grace period"
                );
            }
        }

        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }

    async fn drain_stderr(&mut self) {
        if let Some(mut task) = self.stderr_task.take()
            && tokio::time::timeout(STDERR_DRAIN_TIMEOUT, &mut task).await.is_err()
        {
            trace!(program = %self.program, "stderr still open after exit");
            task.abort();
        }
    }
}

impl Drop for ManagedProcess {
    fn drop(&mut self) {
        if let Some(child) = self.child.as_mut() {
            warn!(program = %self.program, pid = ?self.pid, "Dropping live process handle; killing it");
            let _ = child.start_kill();
        }
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ManagedProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedProcess")
            .field("program", &self.program)
            .field("pid", &self.pid)
            .field("alive", &self.is_alive())
            .field("exit", &self.exit)
            .finish()
    }
}

/// Read stderr, splitting on both `\n` and `\r` (ffmpeg redraws its stats line with `\r`).
async fn read_stderr(
    mut stderr: impl AsyncRead + Unpin,
    tail: Arc<Mutex<DiagnosticTail>>,
    mut observer: Option<LineObserver>,
    program: String,
) {
    let mut buf = [0u8; 4096];
    let mut line: Vec<u8> = Vec::with_capacity(256);

    let mut flush = |line: &mut Vec<u8>| {
        if line.is_empty() {
            return;
        }
        let text = String::from_utf8_lossy(line);
        trace!(program = %program, "stderr: {}", text);
        if let Some(observer) = observer.as_mut() {
            observer(&text);
        }
        if let Ok(mut tail) = tail.lock() {
            tail.push(&text);
        }
        line.clear();
    };

    loop {
        let read = match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                debug!(error = %err, "stderr read failed");
                break;
            }
        };

        for &byte in &buf[..read] {
            if byte == b'\n' || byte == b'\r' {
                flush(&mut line);
            } else {
                line.push(byte);
                if line.len() >= MAX_LINE_BYTES {
                    flush(&mut line);
                }
            }
        }
    }

    flush(&mut line);
}
