mod batcher;
mod config;
mod fetch;
mod logfile;
mod mailer;
mod process;
mod tunnel;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use config::{AppConfig, MailConfig, Provider, Security};
use tunnel::TunnelManager;

/// A Rust CLI tool that supervises a VS Code tunnel agent: download the CLI,
/// run the login flow, stream its output to a log file, and email batched
/// output chunks to the operator.
#[derive(Parser, Debug)]
#[command(name = "tunnelpost", version, about)]
pub struct Cli {
    /// Config file path
    #[arg(short, long, default_value = "tunnelpost.toml")]
    config: PathBuf,

    /// SMTP host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// SMTP port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// SMTP username; providing one enables the mail channel
    #[arg(long)]
    username: Option<String>,

    /// SMTP password (falls back to the SMTP_PASSWORD environment variable)
    #[arg(long)]
    password: Option<String>,

    /// SMTP security mode
    #[arg(long, value_enum)]
    security: Option<Security>,

    /// Sender address (defaults to the username)
    #[arg(long)]
    from_addr: Option<String>,

    /// Recipient addresses
    #[arg(long, num_args = 1..)]
    to_addrs: Vec<String>,

    /// Subject prefix for all emails
    #[arg(long)]
    subject_prefix: Option<String>,

    /// Tunnel name
    #[arg(long)]
    tunnel_name: Option<String>,

    /// Authentication provider
    #[arg(long, value_enum)]
    provider: Option<Provider>,

    /// Working directory (created if missing)
    #[arg(short, long)]
    working_dir: Option<PathBuf>,

    /// Number of lines to buffer before flushing a batch
    #[arg(long)]
    batch_lines: Option<usize>,

    /// Idle threshold in seconds
    #[arg(long)]
    idle_seconds: Option<f64>,

    /// Polling interval in seconds
    #[arg(long)]
    poll_interval: Option<f64>,

    /// Extra args passed to the tunnel login command
    #[arg(long, num_args = 0..)]
    extra_args: Option<Vec<String>>,

    /// Runtime log file path
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Truncate the runtime log instead of appending
    #[arg(long)]
    log_truncate: bool,

    /// Delivery attempts per email (overrides config)
    #[arg(long)]
    retries: Option<u32>,

    /// Backoff base in seconds (overrides config)
    #[arg(long)]
    backoff_base: Option<f64>,

    /// Extra logging (poll ticks, retry decisions)
    #[arg(short, long)]
    verbose: bool,
}

/// Merge CLI overrides into the file config. Mail settings on the command
/// line bring the mail section into existence when the file had none.
fn apply_cli_overrides(cfg: &mut AppConfig, cli: &Cli) {
    let t = &mut cfg.tunnel;
    if let Some(name) = &cli.tunnel_name {
        t.tunnel_name = name.clone();
    }
    if let Some(provider) = cli.provider {
        t.provider = provider;
    }
    if let Some(dir) = &cli.working_dir {
        t.working_dir = dir.clone();
    }
    if let Some(n) = cli.batch_lines {
        t.batch_lines = n;
    }
    if let Some(s) = cli.idle_seconds {
        t.idle_seconds = s;
    }
    if let Some(s) = cli.poll_interval {
        t.poll_interval = s;
    }
    if let Some(args) = &cli.extra_args {
        t.extra_args = args.clone();
    }
    if let Some(path) = &cli.log_file {
        t.log_file = Some(path.clone());
    }
    if cli.log_truncate {
        t.log_append = false;
    }

    if let Some(n) = cli.retries {
        cfg.retry.max_attempts = n;
    }
    if let Some(b) = cli.backoff_base {
        cfg.retry.base_backoff_secs = b;
    }

    let mail_flags_given = cli.username.is_some()
        || !cli.to_addrs.is_empty()
        || cli.host.is_some()
        || cli.from_addr.is_some();
    if cfg.mail.is_none() && mail_flags_given {
        cfg.mail = Some(MailConfig::default());
    }
    if let Some(mail) = cfg.mail.as_mut() {
        if let Some(host) = &cli.host {
            mail.host = host.clone();
        }
        if let Some(port) = cli.port {
            mail.port = port;
        }
        if let Some(username) = &cli.username {
            mail.username = username.clone();
        }
        if let Some(password) = &cli.password {
            mail.password = password.clone();
        }
        if let Some(security) = cli.security {
            mail.security = security;
        }
        if let Some(from) = &cli.from_addr {
            mail.from_addr = from.clone();
        }
        if !cli.to_addrs.is_empty() {
            mail.to_addrs = cli.to_addrs.clone();
        }
        if let Some(prefix) = &cli.subject_prefix {
            mail.subject_prefix = prefix.clone();
        }
    }
}

/// Resolve the SMTP password exactly once, at startup. Business logic never
/// touches the environment.
fn resolve_password(cfg: &mut AppConfig) {
    if let Some(mail) = cfg.mail.as_mut() {
        if mail.password.is_empty() {
            if let Ok(password) = std::env::var("SMTP_PASSWORD") {
                mail.password = password;
            }
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(false)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    tracing::info!("tunnelpost v{} starting", env!("CARGO_PKG_VERSION"));

    let mut cfg = if cli.config.is_file() {
        match AppConfig::load(&cli.config) {
            Ok(cfg) => cfg,
            Err(e) => {
                tracing::error!(error = %e, "could not load config");
                std::process::exit(2);
            }
        }
    } else {
        AppConfig::default()
    };
    apply_cli_overrides(&mut cfg, &cli);
    resolve_password(&mut cfg);

    let AppConfig { tunnel, mail, retry } = cfg;
    let mut manager = match TunnelManager::new(mail, retry, tunnel).await {
        Ok(manager) => manager,
        Err(e) => {
            tracing::error!(error = %e, "tunnel manager setup failed");
            std::process::exit(1);
        }
    };

    if let Err(e) = manager.run().await {
        tracing::error!(error = %e, "tunnel session failed");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(std::iter::once("tunnelpost").chain(args.iter().copied()))
    }

    #[test]
    fn test_overrides_apply_to_tunnel_section() {
        let mut cfg = AppConfig::default();
        let cli = parse(&[
            "--tunnel-name",
            "lab",
            "--batch-lines",
            "7",
            "--idle-seconds",
            "2.5",
            "--provider",
            "microsoft",
            "--log-truncate",
        ]);
        apply_cli_overrides(&mut cfg, &cli);
        assert_eq!(cfg.tunnel.tunnel_name, "lab");
        assert_eq!(cfg.tunnel.batch_lines, 7);
        assert_eq!(cfg.tunnel.idle_seconds, 2.5);
        assert_eq!(cfg.tunnel.provider, Provider::Microsoft);
        assert!(!cfg.tunnel.log_append);
    }

    #[test]
    fn test_mail_flags_create_mail_section() {
        let mut cfg = AppConfig::default();
        assert!(cfg.mail.is_none());
        let cli = parse(&[
            "--username",
            "ops@example.com",
            "--to-addrs",
            "a@example.com",
            "b@example.com",
            "--security",
            "ssl",
            "--port",
            "465",
        ]);
        apply_cli_overrides(&mut cfg, &cli);
        let mail = cfg.mail.unwrap();
        assert_eq!(mail.username, "ops@example.com");
        assert_eq!(
            mail.to_addrs,
            vec!["a@example.com".to_string(), "b@example.com".to_string()]
        );
        assert_eq!(mail.security, Security::Ssl);
        assert_eq!(mail.port, 465);
    }

    #[test]
    fn test_no_mail_flags_leave_mail_disabled() {
        let mut cfg = AppConfig::default();
        let cli = parse(&["--batch-lines", "5"]);
        apply_cli_overrides(&mut cfg, &cli);
        assert!(cfg.mail.is_none());
    }

    #[test]
    fn test_retry_overrides() {
        let mut cfg = AppConfig::default();
        let cli = parse(&["--retries", "5", "--backoff-base", "0.5"]);
        apply_cli_overrides(&mut cfg, &cli);
        assert_eq!(cfg.retry.max_attempts, 5);
        assert_eq!(cfg.retry.base_backoff_secs, 0.5);
    }
}
