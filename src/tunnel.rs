/// Tunnel session orchestration: spawn the tunnel login process, poll its
/// merged output, persist every line, and flush batches to the configured
/// sink; then rename and start the tunnel.
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::batcher::{BatchRequest, Batcher, FlushReason};
use crate::config::{MailConfig, RetryConfig, TunnelConfig};
use crate::fetch::{self, FetchError};
use crate::logfile::{LogOpenError, OutputLog};
use crate::mailer::Mailer;
use crate::process::{ReadEvent, SpawnError, TunnelProcess};

const CODE_EXECUTABLE: &str = "code";
const RUNTIME_LOG_FILE: &str = "vscode_tunnel_runtime.log";
/// Pause between the login session ending and the rename/start phase, so
/// the tunnel service can settle.
const STABILIZE_DELAY: Duration = Duration::from_secs(3);

/// Fatal setup and orchestration errors. Everything transient (failed
/// sends, log writes, broken pipes) is absorbed inside the session loop.
#[derive(Debug)]
pub enum TunnelError {
    WorkingDir {
        path: PathBuf,
        source: std::io::Error,
    },
    NotADirectory {
        path: PathBuf,
    },
    MissingExecutable {
        path: PathBuf,
    },
    Fetch {
        source: FetchError,
    },
    Log {
        source: LogOpenError,
    },
    Spawn {
        source: SpawnError,
    },
    Command {
        action: &'static str,
        source: std::io::Error,
    },
    CommandFailed {
        action: &'static str,
        stderr: String,
    },
}

impl std::fmt::Display for TunnelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TunnelError::WorkingDir { path, source } => {
                write!(
                    f,
                    "failed to create working directory {}: {}",
                    path.display(),
                    source
                )
            }
            TunnelError::NotADirectory { path } => {
                write!(f, "invalid working directory: {}", path.display())
            }
            TunnelError::MissingExecutable { path } => {
                write!(f, "tunnel CLI executable not found: {}", path.display())
            }
            TunnelError::Fetch { source } => write!(f, "failed to fetch tunnel CLI: {source}"),
            TunnelError::Log { source } => write!(f, "failed to open runtime log: {source}"),
            TunnelError::Spawn { source } => write!(f, "failed to start tunnel: {source}"),
            TunnelError::Command { action, source } => {
                write!(f, "failed to run tunnel {action}: {source}")
            }
            TunnelError::CommandFailed { action, stderr } => {
                write!(f, "tunnel {action} failed: {stderr}")
            }
        }
    }
}

impl std::error::Error for TunnelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TunnelError::WorkingDir { source, .. } => Some(source),
            TunnelError::NotADirectory { .. } => None,
            TunnelError::MissingExecutable { .. } => None,
            TunnelError::Fetch { source } => Some(source),
            TunnelError::Log { source } => Some(source),
            TunnelError::Spawn { source } => Some(source),
            TunnelError::Command { source, .. } => Some(source),
            TunnelError::CommandFailed { .. } => None,
        }
    }
}

/// Where flushed batches go. A failed delivery returns false; the batch is
/// dropped either way, never re-queued.
#[allow(async_fn_in_trait)]
pub trait BatchSink {
    async fn deliver(&mut self, batch: &BatchRequest) -> bool;
}

/// Email-backed sink.
pub struct MailSink<'a> {
    mailer: &'a Mailer,
    tunnel_name: &'a str,
}

impl BatchSink for MailSink<'_> {
    async fn deliver(&mut self, batch: &BatchRequest) -> bool {
        let subject = batch.subject(self.tunnel_name);
        let ok = self.mailer.send_text(&subject, &batch.body(), None).await;
        if ok {
            tracing::info!(subject = %subject, "batch email sent");
        } else {
            tracing::error!(subject = %subject, "failed to send batch email");
        }
        ok
    }
}

/// Local fallback when no mail channel is configured: print the batch body.
pub struct StdoutSink;

impl BatchSink for StdoutSink {
    async fn deliver(&mut self, batch: &BatchRequest) -> bool {
        println!("{}", batch.body());
        true
    }
}

enum SessionSink<'a> {
    Mail(MailSink<'a>),
    Stdout(StdoutSink),
}

impl BatchSink for SessionSink<'_> {
    async fn deliver(&mut self, batch: &BatchRequest) -> bool {
        match self {
            SessionSink::Mail(sink) => sink.deliver(batch).await,
            SessionSink::Stdout(sink) => sink.deliver(batch).await,
        }
    }
}

#[derive(Debug)]
pub struct TunnelManager {
    config: TunnelConfig,
    mailer: Option<Mailer>,
    working_dir: PathBuf,
}

impl TunnelManager {
    /// Construct a manager: resolve and create the working directory, and
    /// bring up the optional mail channel with an initialization email.
    ///
    /// A mail channel that cannot deliver the initialization email is
    /// dropped for the whole session (output falls back to stdout); only an
    /// invalid working directory is fatal here.
    pub async fn new(
        mail: Option<MailConfig>,
        retry: RetryConfig,
        config: TunnelConfig,
    ) -> Result<Self, TunnelError> {
        std::fs::create_dir_all(&config.working_dir).map_err(|e| TunnelError::WorkingDir {
            path: config.working_dir.clone(),
            source: e,
        })?;
        let working_dir =
            config
                .working_dir
                .canonicalize()
                .map_err(|e| TunnelError::WorkingDir {
                    path: config.working_dir.clone(),
                    source: e,
                })?;
        if !working_dir.is_dir() {
            return Err(TunnelError::NotADirectory { path: working_dir });
        }

        let mailer = match mail {
            None => None,
            Some(mail_cfg) => match Mailer::new(mail_cfg, retry) {
                Err(e) => {
                    tracing::error!(error = %e, "mail transport setup failed, using stdout instead");
                    None
                }
                Ok(mailer) => {
                    let ok = mailer
                        .send_text(
                            &format!(
                                "VS Code Tunnel Manager {} Initialized",
                                config.tunnel_name
                            ),
                            &format!(
                                "Tunnel manager initialized with working directory: {}",
                                working_dir.display()
                            ),
                            None,
                        )
                        .await;
                    if ok {
                        Some(mailer)
                    } else {
                        tracing::error!("failed to send initialization email, using stdout instead");
                        None
                    }
                }
            },
        };

        tracing::info!(working_dir = %working_dir.display(), "initialized tunnel manager");
        Ok(Self {
            config,
            mailer,
            working_dir,
        })
    }

    pub fn working_dir(&self) -> &Path {
        &self.working_dir
    }

    /// Full lifecycle: fetch the CLI if needed, run the supervised login
    /// session, then rename and start the tunnel.
    pub async fn run(&mut self) -> Result<(), TunnelError> {
        let executable = self.ensure_cli().await?;
        self.login(&executable).await?;
        tokio::time::sleep(STABILIZE_DELAY).await;
        self.rename(&executable).await?;
        self.start(&executable).await?;
        Ok(())
    }

    /// Make sure the tunnel CLI executable exists in the working directory,
    /// downloading and extracting it when missing.
    pub async fn ensure_cli(&self) -> Result<PathBuf, TunnelError> {
        let executable = self.working_dir.join(CODE_EXECUTABLE);
        if executable.is_file() {
            tracing::debug!("tunnel CLI already extracted");
            return Ok(executable);
        }

        let archive = self.working_dir.join(fetch::DEFAULT_CLI_ARCHIVE);
        if archive.is_file() {
            tracing::info!(archive = %archive.display(), "tunnel CLI already downloaded");
        } else {
            fetch::download(fetch::DEFAULT_CLI_URL, &archive)
                .await
                .map_err(|e| TunnelError::Fetch { source: e })?;
        }
        fetch::extract_tar_gz(&archive, &self.working_dir)
            .map_err(|e| TunnelError::Fetch { source: e })?;

        if !executable.is_file() {
            return Err(TunnelError::MissingExecutable { path: executable });
        }
        Ok(executable)
    }

    /// Run `code tunnel user login` under supervision: every output line is
    /// logged and batched; batches are flushed to email (or stdout when no
    /// mail channel survived construction).
    pub async fn login(&mut self, executable: &Path) -> Result<(), TunnelError> {
        if !executable.is_file() {
            return Err(TunnelError::MissingExecutable {
                path: executable.to_path_buf(),
            });
        }

        let log_path = self.resolve_log_path();
        let mut log =
            OutputLog::open(&log_path, self.config.log_append).map_err(|e| TunnelError::Log {
                source: e,
            })?;

        let mut args: Vec<String> = ["tunnel", "user", "login", "--provider"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        args.push(self.config.provider.as_str().to_string());
        args.extend(self.config.extra_args.iter().cloned());

        tracing::info!(
            command = %format!("{} {}", executable.display(), args.join(" ")),
            log = %log_path.display(),
            "starting tunnel login session"
        );
        let mut process = TunnelProcess::spawn(executable, &args, &self.working_dir)
            .map_err(|e| TunnelError::Spawn { source: e })?;

        let mut sink = match &self.mailer {
            Some(mailer) => SessionSink::Mail(MailSink {
                mailer,
                tunnel_name: &self.config.tunnel_name,
            }),
            None => SessionSink::Stdout(StdoutSink),
        };

        supervise(&mut process, &mut log, &mut sink, &self.config).await;
        process.terminate(self.config.grace()).await;
        Ok(())
    }

    /// Rename the tunnel; a non-zero exit is fatal.
    pub async fn rename(&self, executable: &Path) -> Result<(), TunnelError> {
        self.run_cli(
            executable,
            &["tunnel", "rename", &self.config.tunnel_name],
            "rename",
        )
        .await
    }

    /// Start the tunnel service; runs to completion.
    pub async fn start(&self, executable: &Path) -> Result<(), TunnelError> {
        self.run_cli(executable, &["tunnel"], "start").await
    }

    async fn run_cli(
        &self,
        executable: &Path,
        args: &[&str],
        action: &'static str,
    ) -> Result<(), TunnelError> {
        tracing::info!(
            command = %format!("{} {}", executable.display(), args.join(" ")),
            "running tunnel command"
        );
        let output = tokio::process::Command::new(executable)
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .await
            .map_err(|e| TunnelError::Command { action, source: e })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
            tracing::error!(action, stderr = %stderr, stdout = %stdout, "tunnel command failed");
            return Err(TunnelError::CommandFailed { action, stderr });
        }
        Ok(())
    }

    fn resolve_log_path(&self) -> PathBuf {
        match &self.config.log_file {
            None => self.working_dir.join(RUNTIME_LOG_FILE),
            Some(path) if path.is_absolute() => path.clone(),
            Some(path) => self.working_dir.join(path),
        }
    }
}

/// The polling loop: one tick per `poll_interval`, flushing on the line
/// threshold (checked right after each append, before any idle check), on
/// the idle window, and once more, forced, when the process exits.
pub(crate) async fn supervise<S: BatchSink>(
    process: &mut TunnelProcess,
    log: &mut OutputLog,
    sink: &mut S,
    config: &TunnelConfig,
) {
    let mut batcher = Batcher::new(config.batch_lines, config.idle_after());
    if config.keys_on_start {
        send_control_keys(process, config).await;
    }

    loop {
        match process.next_line(config.poll_wait()).await {
            ReadEvent::Line(line) => {
                log.append_line(&line);
                if batcher.push(line) {
                    flush(process, sink, &mut batcher, FlushReason::BatchLines, false, config)
                        .await;
                }
            }
            ReadEvent::Idle => {
                if batcher.idle_exceeded() {
                    flush(process, sink, &mut batcher, FlushReason::IdleTimeout, false, config)
                        .await;
                }
            }
            ReadEvent::Closed => break,
        }
    }

    tracing::info!("tunnel output stream closed, sending final batch");
    flush(process, sink, &mut batcher, FlushReason::ProcessExit, true, config).await;
}

/// Hand the current buffer to the sink. The buffer is cleared and the index
/// advanced whether or not delivery succeeds; lines live in the runtime log
/// regardless, and stale notifications outlast their relevance.
async fn flush<S: BatchSink>(
    process: &mut TunnelProcess,
    sink: &mut S,
    batcher: &mut Batcher,
    reason: FlushReason,
    force: bool,
    config: &TunnelConfig,
) {
    if let Some(batch) = batcher.take(reason, force) {
        let delivered = sink.deliver(&batch).await;
        if !delivered {
            tracing::error!(
                index = batch.index,
                lines = batch.lines.len(),
                reason = %batch.reason,
                "batch delivery failed, dropping lines (they remain in the runtime log)"
            );
        }
    }
    if config.keys_on_flush {
        send_control_keys(process, config).await;
    }
}

/// Fire-and-forget injection of N down-arrows plus a carriage return into
/// the child's stdin.
async fn send_control_keys(process: &mut TunnelProcess, config: &TunnelConfig) {
    let mut payload = "\x1b[B".repeat(config.down_presses as usize);
    payload.push('\r');
    process.write_input(payload.as_bytes()).await;
}
