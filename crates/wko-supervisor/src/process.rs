// ABOUTME: Spawns worker child processes with captured output and stops them gracefully.
// ABOUTME: Keeps a bounded tail of stdout/stderr per worker for failure diagnostics.

use crate::error::SupervisorError;
use std::collections::VecDeque;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use wko_supervisor_core::WorkerConfig;

/// Lines of output retained per worker.
pub const OUTPUT_CAPACITY: usize = 200;

const KILL_WAIT: Duration = Duration::from_secs(2);
const DRAIN_WAIT: Duration = Duration::from_millis(500);
const STDERR_TAIL: usize = 20;

/// Placeholder in worker arguments replaced by the assigned port.
pub const PORT_PLACEHOLDER: &str = "{port}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: Stream,
    pub text: String,
}

/// Ring buffer of a worker's most recent output lines, shared with reader tasks.
#[derive(Debug, Clone, Default)]
pub struct OutputLog {
    lines: Arc<Mutex<VecDeque<OutputLine>>>,
}

impl OutputLog {
    pub fn push(&self, stream: Stream, text: String) {
        let mut lines = self.lines();
        if lines.len() == OUTPUT_CAPACITY {
            lines.pop_front();
        }
        lines.push_back(OutputLine { stream, text });
    }

    pub fn snapshot(&self) -> Vec<OutputLine> {
        self.lines().iter().cloned().collect()
    }

    /// The last `n` stderr lines, oldest first.
    pub fn stderr_tail(&self, n: usize) -> Vec<String> {
        let lines = self.lines();
        let mut tail: Vec<String> = lines
            .iter()
            .rev()
            .filter(|line| line.stream == Stream::Stderr)
            .take(n)
            .map(|line| line.text.clone())
            .collect();
        tail.reverse();
        tail
    }

    fn lines(&self) -> MutexGuard<'_, VecDeque<OutputLine>> {
        self.lines.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A launched worker process.
pub struct WorkerProcess {
    id: String,
    child: Child,
    pid: Option<u32>,
    readers: Vec<JoinHandle<()>>,
    output: OutputLog,
}

impl WorkerProcess {
    /// Launch `config.command` for worker `id` listening on `port`.
    ///
    /// The supervisor's environment is inherited and overlaid with the
    /// worker's overrides. Output is captured into `output`, never inherited.
    pub fn spawn(
        id: &str,
        config: &WorkerConfig,
        port: u16,
        output: OutputLog,
    ) -> Result<Self, SupervisorError> {
        let port_text = port.to_string();
        let args = config
            .args
            .iter()
            .map(|arg| arg.replace(PORT_PLACEHOLDER, &port_text));

        let mut cmd = Command::new(&config.command);
        cmd.args(args)
            .envs(&config.environment)
            .env("WKO_WORKER_PORT", &port_text)
            .env("WKO_WORKER_HOST", &config.connection.host)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| SupervisorError::Launch {
            id: id.to_string(),
            message: format!("Failed to launch '{}': {}", config.command, e),
        })?;

        let pid = child.id();
        tracing::info!(worker = %id, pid = ?pid, port, command = %config.command, "Spawned worker");

        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(id, stdout, Stream::Stdout, output.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(id, stderr, Stream::Stderr, output.clone()));
        }

        Ok(Self {
            id: id.to_string(),
            child,
            pid,
            readers,
            output,
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Exit status if the process has already exited.
    pub fn try_exit(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Describe an early exit, including the tail of captured stderr.
    pub async fn exit_message(&mut self, status: ExitStatus) -> String {
        for reader in self.readers.drain(..) {
            let _ = tokio::time::timeout(DRAIN_WAIT, reader).await;
        }

        let code = status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "none (terminated by signal)".to_string());
        let stderr = self.output.stderr_tail(STDERR_TAIL).join("\n");
        format!("Process exited with code {}. stderr: {}", code, stderr)
    }

    /// Ask the process to exit, force-killing it after `grace`.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if let Ok(Some(status)) = self.child.try_wait() {
            return Some(status);
        }

        self.signal_terminate();

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(worker = %self.id, "Worker exited");
                Some(status)
            }
            Ok(Err(e)) => {
                tracing::warn!(worker = %self.id, error = %e, "Failed waiting for worker");
                None
            }
            Err(_) => {
                tracing::warn!(worker = %self.id, "Worker ignored terminate, killing");
                if let Err(e) = self.child.start_kill() {
                    tracing::warn!(worker = %self.id, error = %e, "Failed to kill worker");
                }
                tokio::time::timeout(KILL_WAIT, self.child.wait())
                    .await
                    .ok()
                    .and_then(Result::ok)
            }
        }
    }

    #[cfg(unix)]
    fn signal_terminate(&mut self) {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.pid.and_then(|p| i32::try_from(p).ok()) else {
            return;
        };
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
            tracing::debug!(worker = %self.id, pid, error = %e, "SIGTERM failed");
        }
    }

    #[cfg(not(unix))]
    fn signal_terminate(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(worker = %self.id, error = %e, "Terminate failed");
        }
    }
}

fn forward_lines<R>(id: &str, source: R, stream: Stream, output: OutputLog) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let id = id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(source).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(worker = %id, stream = ?stream, "{}", line);
            output.push(stream, line);
        }
    })
}
