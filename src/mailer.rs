/// Resilient SMTP delivery channel.
///
/// One `Mailer` serializes all sends through an internal gate (at most one
/// in-flight SMTP connection, even with concurrent callers) and retries each
/// send with exponential backoff plus jitter. A send that exhausts its
/// attempts is reported as `false` and logged; it is never a hard failure of
/// the session.
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, Message, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Tokio1Executor};
use rand::Rng;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::{MailConfig, RetryConfig, Security};

/// Errors building or delivering a message.
#[derive(Debug)]
pub enum MailError {
    /// No recipient resolved (neither explicit nor configured).
    NoRecipients,
    /// An address failed to parse.
    Address {
        addr: String,
        source: lettre::address::AddressError,
    },
    /// Message assembly failed.
    Build { source: lettre::error::Error },
    /// Could not read an attachment from disk.
    Attachment {
        path: PathBuf,
        source: std::io::Error,
    },
    /// SMTP transport setup or wire failure.
    Transport {
        source: lettre::transport::smtp::Error,
    },
}

impl std::fmt::Display for MailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailError::NoRecipients => write!(f, "no recipient specified"),
            MailError::Address { addr, source } => {
                write!(f, "invalid address {addr}: {source}")
            }
            MailError::Build { source } => write!(f, "failed to build message: {source}"),
            MailError::Attachment { path, source } => {
                write!(f, "failed to read attachment {}: {}", path.display(), source)
            }
            MailError::Transport { source } => write!(f, "smtp transport error: {source}"),
        }
    }
}

impl std::error::Error for MailError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            MailError::NoRecipients => None,
            MailError::Address { source, .. } => Some(source),
            MailError::Build { source } => Some(source),
            MailError::Attachment { source, .. } => Some(source),
            MailError::Transport { source } => Some(source),
        }
    }
}

/// The SMTP wire, abstracted so retry behavior is testable with stubs.
#[allow(async_fn_in_trait)]
pub trait MailTransport {
    async fn deliver(&self, message: &Message) -> Result<(), MailError>;
}

/// Production transport backed by lettre's async SMTP client.
#[derive(Debug)]
pub struct SmtpSender {
    inner: AsyncSmtpTransport<Tokio1Executor>,
}

impl SmtpSender {
    /// Build the transport for the configured security mode. Credentials
    /// are presented after any TLS negotiation completes.
    pub fn from_config(cfg: &MailConfig) -> Result<Self, MailError> {
        let builder = match cfg.security {
            Security::Ssl => AsyncSmtpTransport::<Tokio1Executor>::relay(&cfg.host)
                .map_err(|e| MailError::Transport { source: e })?,
            Security::Starttls => AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)
                .map_err(|e| MailError::Transport { source: e })?,
            Security::None => AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&cfg.host),
        };
        let mut builder = builder.port(cfg.port);
        if !cfg.username.is_empty() {
            builder = builder.credentials(Credentials::new(
                cfg.username.clone(),
                cfg.password.clone(),
            ));
        }
        Ok(Self {
            inner: builder.build(),
        })
    }
}

impl MailTransport for SmtpSender {
    async fn deliver(&self, message: &Message) -> Result<(), MailError> {
        let raw = message.formatted();
        self.inner
            .send_raw(message.envelope(), &raw)
            .await
            .map(|_| ())
            .map_err(|e| MailError::Transport { source: e })
    }
}

/// Inter-attempt wait: `base * 2^(attempt-1)` plus up to one second of
/// uniform jitter. Evaluated only between attempts, never before the first.
fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16) as i32;
    let backoff = base.as_secs_f64() * 2f64.powi(exponent);
    let jitter: f64 = rand::thread_rng().gen_range(0.0..1.0);
    Duration::from_secs_f64(backoff + jitter)
}

/// Minimal HTML to plain text conversion for the alternative part.
#[allow(dead_code)]
fn html_to_text(html: &str) -> String {
    let br = Regex::new(r"(?i)<br\s*/?>").unwrap();
    let tags = Regex::new(r"<[^>]+>").unwrap();
    let text = br.replace_all(html, "\n");
    tags.replace_all(&text, "").trim().to_string()
}

fn attachment_content_type(path: &Path) -> ContentType {
    let mime = mime_guess::from_path(path).first_or_octet_stream();
    // A guessed mime essence is always a valid content-type string.
    ContentType::parse(mime.essence_str()).unwrap_or(ContentType::TEXT_PLAIN)
}

#[derive(Debug)]
pub struct Mailer<T = SmtpSender> {
    cfg: MailConfig,
    retry: RetryConfig,
    transport: T,
    gate: Mutex<()>,
}

impl Mailer<SmtpSender> {
    pub fn new(cfg: MailConfig, retry: RetryConfig) -> Result<Self, MailError> {
        let transport = SmtpSender::from_config(&cfg)?;
        Ok(Self::with_transport(cfg, retry, transport))
    }
}

impl<T: MailTransport> Mailer<T> {
    pub fn with_transport(mut cfg: MailConfig, retry: RetryConfig, transport: T) -> Self {
        if cfg.from_addr.is_empty() {
            cfg.from_addr = cfg.username.clone();
        }
        Self {
            cfg,
            retry,
            transport,
            gate: Mutex::new(()),
        }
    }

    /// Send a plain-text message. Returns true on success.
    pub async fn send_text(&self, subject: &str, body: &str, to: Option<&[String]>) -> bool {
        self.send(subject, body, None, &[], to).await
    }

    /// Send an HTML message with a plain-text fallback (derived from the
    /// HTML when not supplied).
    #[allow(dead_code)]
    pub async fn send_html(
        &self,
        subject: &str,
        html: &str,
        text_fallback: Option<&str>,
        to: Option<&[String]>,
    ) -> bool {
        let fallback = match text_fallback {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => html_to_text(html),
        };
        self.send(subject, &fallback, Some(html), &[], to).await
    }

    /// Send a message with file attachments. Content types are inferred
    /// from filename extensions, defaulting to an opaque binary type.
    #[allow(dead_code)]
    pub async fn send_with_attachments(
        &self,
        subject: &str,
        body: &str,
        attachments: &[PathBuf],
        to: Option<&[String]>,
    ) -> bool {
        self.send(subject, body, None, attachments, to).await
    }

    async fn send(
        &self,
        subject: &str,
        text: &str,
        html: Option<&str>,
        attachments: &[PathBuf],
        to: Option<&[String]>,
    ) -> bool {
        // Validation failures happen before any network attempt.
        let message = match self.build_message(subject, text, html, attachments, to) {
            Ok(m) => m,
            Err(e) => {
                tracing::error!(subject, error = %e, "refusing to send invalid message");
                return false;
            }
        };

        let _gate = self.gate.lock().await;
        for attempt in 1..=self.retry.max_attempts.max(1) {
            match self.transport.deliver(&message).await {
                Ok(()) => {
                    tracing::debug!(subject, attempt, "message delivered");
                    return true;
                }
                Err(e) if attempt == self.retry.max_attempts.max(1) => {
                    tracing::error!(
                        subject,
                        attempts = attempt,
                        error = %e,
                        "send failed after final attempt"
                    );
                    return false;
                }
                Err(e) => {
                    let delay = backoff_delay(self.retry.base_backoff(), attempt);
                    tracing::warn!(
                        subject,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "send failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
        false
    }

    fn build_message(
        &self,
        subject: &str,
        text: &str,
        html: Option<&str>,
        attachments: &[PathBuf],
        to: Option<&[String]>,
    ) -> Result<Message, MailError> {
        let to_list: &[String] = match to {
            Some(explicit) if !explicit.is_empty() => explicit,
            _ => &self.cfg.to_addrs,
        };
        if to_list.is_empty() {
            return Err(MailError::NoRecipients);
        }

        let from: Mailbox = self.cfg.from_addr.parse().map_err(|e| MailError::Address {
            addr: self.cfg.from_addr.clone(),
            source: e,
        })?;
        let mut builder = Message::builder()
            .from(from)
            .subject(format!("{}{}", self.cfg.subject_prefix, subject));
        for addr in to_list {
            builder = builder.to(addr.parse().map_err(|e| MailError::Address {
                addr: addr.clone(),
                source: e,
            })?);
        }

        let body_part = match html {
            Some(h) => BodyPart::Alternative(MultiPart::alternative_plain_html(
                text.to_string(),
                h.to_string(),
            )),
            None => BodyPart::Plain(SinglePart::plain(text.to_string())),
        };

        if attachments.is_empty() {
            return match body_part {
                BodyPart::Plain(part) => builder.singlepart(part),
                BodyPart::Alternative(part) => builder.multipart(part),
            }
            .map_err(|e| MailError::Build { source: e });
        }

        let mut mixed = match body_part {
            BodyPart::Plain(part) => MultiPart::mixed().singlepart(part),
            BodyPart::Alternative(part) => MultiPart::mixed().multipart(part),
        };
        for path in attachments {
            let content = std::fs::read(path).map_err(|e| MailError::Attachment {
                path: path.clone(),
                source: e,
            })?;
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "attachment".to_string());
            let content_type = attachment_content_type(path);
            mixed = mixed.singlepart(Attachment::new(filename).body(content, content_type));
        }
        builder
            .multipart(mixed)
            .map_err(|e| MailError::Build { source: e })
    }
}

enum BodyPart {
    Plain(SinglePart),
    Alternative(MultiPart),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn test_config() -> MailConfig {
        MailConfig {
            host: "smtp.example.com".to_string(),
            port: 587,
            username: "user@example.com".to_string(),
            password: "secret".to_string(),
            from_addr: "sender@example.com".to_string(),
            to_addrs: vec!["receiver@example.com".to_string()],
            subject_prefix: "[Test] ".to_string(),
            ..Default::default()
        }
    }

    fn retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_backoff_secs: 0.01,
        }
    }

    /// Fails the first `failures` deliveries, then succeeds.
    struct FlakyTransport {
        failures: u32,
        attempts: Arc<AtomicU32>,
    }

    impl MailTransport for FlakyTransport {
        async fn deliver(&self, _message: &Message) -> Result<(), MailError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                Err(MailError::NoRecipients) // any error will do
            } else {
                Ok(())
            }
        }
    }

    /// Records the formatted bytes of every delivered message.
    struct RecordingTransport {
        sent: std::sync::Mutex<Vec<String>>,
    }

    impl RecordingTransport {
        fn new() -> Self {
            Self {
                sent: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    impl MailTransport for RecordingTransport {
        async fn deliver(&self, message: &Message) -> Result<(), MailError> {
            let raw = String::from_utf8_lossy(&message.formatted()).into_owned();
            self.sent.lock().unwrap().push(raw);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_two_failures() {
        let attempts = Arc::new(AtomicU32::new(0));
        let transport = FlakyTransport {
            failures: 2,
            attempts: attempts.clone(),
        };
        let mailer = Mailer::with_transport(test_config(), retry(3), transport);
        let ok = mailer.send_text("Hello", "body", None).await;
        assert!(ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_reports_false() {
        let attempts = Arc::new(AtomicU32::new(0));
        let transport = FlakyTransport {
            failures: u32::MAX,
            attempts: attempts.clone(),
        };
        let mailer = Mailer::with_transport(test_config(), retry(3), transport);
        let ok = mailer.send_text("Hello", "body", None).await;
        assert!(!ok);
        // Exactly max_attempts attempts, no more.
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_no_recipients_fails_before_any_attempt() {
        let attempts = Arc::new(AtomicU32::new(0));
        let transport = FlakyTransport {
            failures: 0,
            attempts: attempts.clone(),
        };
        let cfg = MailConfig {
            to_addrs: Vec::new(),
            ..test_config()
        };
        let mailer = Mailer::with_transport(cfg, retry(3), transport);
        let ok = mailer.send_text("Hello", "body", None).await;
        assert!(!ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_explicit_recipients_override_configured() {
        let transport = RecordingTransport::new();
        let mailer = Mailer::with_transport(test_config(), retry(1), transport);
        let to = vec!["other@example.com".to_string()];
        assert!(mailer.send_text("Hi", "body", Some(&to)).await);
        let sent = mailer.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("To: other@example.com"));
        assert!(!sent[0].contains("receiver@example.com"));
    }

    #[tokio::test]
    async fn test_subject_prefix_applied_once() {
        let transport = RecordingTransport::new();
        let mailer = Mailer::with_transport(test_config(), retry(1), transport);
        assert!(mailer.send_text("Batch #1 (2 lines) - batch_lines", "a\nb", None).await);
        let sent = mailer.transport.sent.lock().unwrap();
        assert!(sent[0].contains("Subject: [Test] Batch #1 (2 lines) - batch_lines"));
    }

    #[tokio::test]
    async fn test_from_defaults_to_username() {
        let transport = RecordingTransport::new();
        let cfg = MailConfig {
            from_addr: String::new(),
            ..test_config()
        };
        let mailer = Mailer::with_transport(cfg, retry(1), transport);
        assert!(mailer.send_text("Hi", "body", None).await);
        let sent = mailer.transport.sent.lock().unwrap();
        assert!(sent[0].contains("From: user@example.com"));
    }

    #[tokio::test]
    async fn test_send_html_includes_both_parts() {
        let transport = RecordingTransport::new();
        let mailer = Mailer::with_transport(test_config(), retry(1), transport);
        assert!(
            mailer
                .send_html("Hi", "line one<br>line two", None, None)
                .await
        );
        let sent = mailer.transport.sent.lock().unwrap();
        assert!(sent[0].contains("multipart/alternative"));
        assert!(sent[0].contains("text/html"));
    }

    #[tokio::test]
    async fn test_send_with_attachments() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.txt");
        std::fs::write(&path, "attached content").unwrap();

        let transport = RecordingTransport::new();
        let mailer = Mailer::with_transport(test_config(), retry(1), transport);
        assert!(
            mailer
                .send_with_attachments("Hi", "see attached", &[path], None)
                .await
        );
        let sent = mailer.transport.sent.lock().unwrap();
        assert!(sent[0].contains("multipart/mixed"));
        assert!(sent[0].contains("report.txt"));
    }

    #[tokio::test]
    async fn test_missing_attachment_is_validation_failure() {
        let attempts = Arc::new(AtomicU32::new(0));
        let transport = FlakyTransport {
            failures: 0,
            attempts: attempts.clone(),
        };
        let mailer = Mailer::with_transport(test_config(), retry(3), transport);
        let missing = vec![PathBuf::from("/nonexistent/file.bin")];
        let ok = mailer.send_with_attachments("Hi", "body", &missing, None).await;
        assert!(!ok);
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gate_serializes_concurrent_sends() {
        struct GaugeTransport {
            active: AtomicU32,
            max_seen: AtomicU32,
        }
        impl MailTransport for GaugeTransport {
            async fn deliver(&self, _message: &Message) -> Result<(), MailError> {
                let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
                self.max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
                self.active.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            }
        }

        let mailer = Arc::new(Mailer::with_transport(
            test_config(),
            retry(1),
            GaugeTransport {
                active: AtomicU32::new(0),
                max_seen: AtomicU32::new(0),
            },
        ));
        let a = {
            let m = mailer.clone();
            async move { m.send_text("a", "body", None).await }
        };
        let b = {
            let m = mailer.clone();
            async move { m.send_text("b", "body", None).await }
        };
        let (ra, rb) = tokio::join!(a, b);
        assert!(ra && rb);
        assert_eq!(mailer.transport.max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_backoff_delay_is_exponential_with_bounded_jitter() {
        let base = Duration::from_secs(1);
        for (attempt, low, high) in [(1u32, 1.0, 2.0), (2, 2.0, 3.0), (3, 4.0, 5.0)] {
            for _ in 0..20 {
                let d = backoff_delay(base, attempt).as_secs_f64();
                assert!(d >= low && d < high, "attempt {attempt}: {d}");
            }
        }
    }

    #[test]
    fn test_html_to_text() {
        assert_eq!(
            html_to_text("<p>one<br>two</p><BR/>three"),
            "one\ntwo\nthree"
        );
        assert_eq!(html_to_text("  <b>bold</b>  "), "bold");
    }

    #[tokio::test]
    async fn test_attachment_content_type_inference() {
        let dir = tempfile::tempdir().unwrap();
        let png = dir.path().join("photo.png");
        let blob = dir.path().join("blob.weird-ext");
        std::fs::write(&png, [137u8, 80, 78, 71]).unwrap();
        std::fs::write(&blob, "opaque").unwrap();

        let transport = RecordingTransport::new();
        let mailer = Mailer::with_transport(test_config(), retry(1), transport);
        assert!(
            mailer
                .send_with_attachments("Hi", "body", &[png, blob], None)
                .await
        );
        let sent = mailer.transport.sent.lock().unwrap();
        assert!(sent[0].contains("image/png"));
        assert!(sent[0].contains("application/octet-stream"));
    }
}
