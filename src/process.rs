/// Tunnel subprocess lifecycle: spawn with merged output, bounded-wait line
/// reads, best-effort stdin writes, and graceful-then-forceful termination.
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc;

/// Outcome of one bounded wait for the next output line.
#[derive(Debug, PartialEq, Eq)]
pub enum ReadEvent {
    /// A complete line arrived (without its trailing newline).
    Line(String),
    /// Nothing arrived within the wait bound.
    Idle,
    /// Both output pipes are closed; the process has exited or is exiting.
    Closed,
}

/// Errors spawning the tunnel subprocess. Everything after a successful
/// spawn is absorbed internally (logged, never raised).
#[derive(Debug)]
pub enum SpawnError {
    Spawn {
        command: String,
        source: std::io::Error,
    },
    MissingPipe {
        pipe: &'static str,
    },
}

impl std::fmt::Display for SpawnError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpawnError::Spawn { command, source } => {
                write!(f, "failed to spawn {command}: {source}")
            }
            SpawnError::MissingPipe { pipe } => {
                write!(f, "child process is missing a {pipe} pipe")
            }
        }
    }
}

impl std::error::Error for SpawnError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpawnError::Spawn { source, .. } => Some(source),
            SpawnError::MissingPipe { .. } => None,
        }
    }
}

/// Bounds in-flight lines so a stalled consumer backpressures the child's
/// pipes instead of growing memory.
const LINE_CHANNEL_CAPACITY: usize = 256;

/// A supervised tunnel subprocess.
///
/// stderr is merged into the same line stream as stdout, and stdin is kept
/// open for the optional control-key injection. The session owns the child
/// exclusively; nothing else may signal it.
#[derive(Debug)]
pub struct TunnelProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: mpsc::Receiver<String>,
}

impl TunnelProcess {
    /// Launch the child in `working_dir` with piped stdio.
    pub fn spawn(command: &Path, args: &[String], working_dir: &Path) -> Result<Self, SpawnError> {
        let mut child = Command::new(command)
            .args(args)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SpawnError::Spawn {
                command: command.display().to_string(),
                source: e,
            })?;

        let stdout = child
            .stdout
            .take()
            .ok_or(SpawnError::MissingPipe { pipe: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(SpawnError::MissingPipe { pipe: "stderr" })?;
        let stdin = child.stdin.take();
        if stdin.is_none() {
            tracing::warn!("tunnel process has no stdin pipe, key injection disabled");
        }

        // One channel merges both pipes; when both reader tasks finish, all
        // senders are dropped and the receiver reports Closed.
        let (tx, rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
        tokio::spawn(forward_lines(BufReader::new(stdout), tx.clone()));
        tokio::spawn(forward_lines(BufReader::new(stderr), tx));

        tracing::info!(pid = ?child.id(), "tunnel subprocess started");
        Ok(Self { child, stdin, lines: rx })
    }

    /// Child PID (for logging/diagnostics).
    #[allow(dead_code)]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait up to `wait` for the next complete output line.
    pub async fn next_line(&mut self, wait: Duration) -> ReadEvent {
        match tokio::time::timeout(wait, self.lines.recv()).await {
            Ok(Some(line)) => ReadEvent::Line(line),
            Ok(None) => ReadEvent::Closed,
            Err(_) => ReadEvent::Idle,
        }
    }

    /// Non-blocking liveness poll.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Best-effort write to the child's stdin.
    ///
    /// A closed pipe is an expected terminal condition (the tunnel shutting
    /// down), so failures are logged and swallowed, never raised.
    pub async fn write_input(&mut self, payload: &[u8]) {
        let Some(stdin) = self.stdin.as_mut() else {
            tracing::warn!("stdin is not available for the tunnel process");
            return;
        };
        let result = async {
            stdin.write_all(payload).await?;
            stdin.flush().await
        }
        .await;
        match result {
            Ok(()) => tracing::debug!(bytes = payload.len(), "wrote to tunnel stdin"),
            Err(e) => tracing::warn!(error = %e, "tunnel stdin write failed"),
        }
    }

    /// Request graceful shutdown, escalating to SIGKILL after `grace`.
    ///
    /// Idempotent: calling this on an already-exited child is a no-op, and
    /// secondary errors during cleanup are swallowed so resource release is
    /// guaranteed.
    pub async fn terminate(&mut self, grace: Duration) {
        // Dropping stdin gives the child an EOF alongside the signal.
        self.stdin.take();

        match self.child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(?status, "tunnel process already exited");
                return;
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!(error = %e, "could not poll tunnel process state");
            }
        }

        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(pid, error = %e, "SIGTERM delivery failed");
            }
        }

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(?status, "tunnel process exited after SIGTERM");
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "error waiting for tunnel process");
            }
            Err(_) => {
                tracing::warn!(grace_secs = grace.as_secs(), "grace period expired, killing");
                if let Err(e) = self.child.start_kill() {
                    tracing::warn!(error = %e, "kill failed");
                }
                let _ = self.child.wait().await;
            }
        }
    }
}

async fn forward_lines<R>(reader: BufReader<R>, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = reader.lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).await.is_err() {
                    // Receiver dropped; the session is over.
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, "error reading tunnel output pipe");
                break;
            }
        }
    }
}
