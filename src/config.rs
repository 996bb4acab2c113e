use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level configuration loaded from tunnelpost.toml.
///
/// The `[mail]` section is optional; without it, batches fall back to the
/// local stdout sink instead of email.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub tunnel: TunnelConfig,
    pub mail: Option<MailConfig>,
    pub retry: RetryConfig,
}

/// Authentication provider for the tunnel login flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Github,
    Microsoft,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Github => "github",
            Provider::Microsoft => "microsoft",
        }
    }
}

impl Default for Provider {
    fn default() -> Self {
        Provider::Github
    }
}

/// SMTP connection security mode.
///
/// This is a configuration switch, not a runtime decision: `Ssl` is
/// implicit TLS (port 465 style), `Starttls` is plaintext-then-upgrade
/// (port 587 style), `None` is plaintext only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    None,
    Starttls,
    Ssl,
}

impl Default for Security {
    fn default() -> Self {
        Security::Starttls
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TunnelConfig {
    pub tunnel_name: String,
    pub provider: Provider,
    pub working_dir: PathBuf,
    /// Flush when the buffer reaches this many lines.
    pub batch_lines: usize,
    /// Flush when no new line arrived for this long.
    pub idle_seconds: f64,
    /// Bounded wait per polling tick.
    pub poll_interval: f64,
    /// Extra arguments appended to the tunnel login command.
    pub extra_args: Vec<String>,
    /// Runtime log path; relative paths resolve against the working dir.
    pub log_file: Option<PathBuf>,
    pub log_append: bool,
    /// Grace period before a SIGTERM escalates to SIGKILL.
    pub grace_seconds: u64,
    /// Down-arrow presses injected per control sequence.
    pub down_presses: u32,
    /// Inject the control sequence once after the process starts.
    pub keys_on_start: bool,
    /// Inject the control sequence after every flush.
    pub keys_on_flush: bool,
}

impl TunnelConfig {
    pub fn idle_after(&self) -> Duration {
        Duration::from_secs_f64(self.idle_seconds)
    }

    pub fn poll_wait(&self) -> Duration {
        Duration::from_secs_f64(self.poll_interval)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.grace_seconds)
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            tunnel_name: "vscode-tunnel".to_string(),
            provider: Provider::default(),
            working_dir: PathBuf::from("."),
            batch_lines: 20,
            idle_seconds: 5.0,
            poll_interval: 1.0,
            extra_args: Vec::new(),
            log_file: None,
            log_append: true,
            grace_seconds: 5,
            down_presses: 0,
            keys_on_start: false,
            keys_on_flush: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MailConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// Resolved once at startup (flag or SMTP_PASSWORD env), never read
    /// lazily from the environment inside the send path.
    pub password: String,
    pub security: Security,
    /// Defaults to `username` when empty.
    pub from_addr: String,
    pub to_addrs: Vec<String>,
    /// Prepended to every subject, applied exactly once by the mailer.
    pub subject_prefix: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            host: "smtp.gmail.com".to_string(),
            port: 587,
            username: String::new(),
            password: String::new(),
            security: Security::default(),
            from_addr: String::new(),
            to_addrs: Vec::new(),
            subject_prefix: "[VS Code Tunnel] ".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Total delivery attempts per send, including the first.
    pub max_attempts: u32,
    /// Base for the exponential inter-attempt backoff, in seconds.
    pub base_backoff_secs: f64,
}

impl RetryConfig {
    pub fn base_backoff(&self) -> Duration {
        Duration::from_secs_f64(self.base_backoff_secs)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff_secs: 1.0,
        }
    }
}

/// Errors loading the config file.
#[derive(Debug)]
pub enum ConfigError {
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Read { path, source } => {
                write!(f, "failed to read config {}: {}", path.display(), source)
            }
            ConfigError::Parse { path, source } => {
                write!(f, "failed to parse config {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Read { source, .. } => Some(source),
            ConfigError::Parse { source, .. } => Some(source),
        }
    }
}

impl AppConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: e,
        })?;
        toml::from_str(&raw).map_err(|e| ConfigError::Parse {
            path: path.to_path_buf(),
            source: e,
        })
    }
}
