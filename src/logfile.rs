/// Durable line log for raw tunnel output.
///
/// Every line the supervisor reads is appended here with a timestamp so the
/// full session is reconstructable even when notifications fail. Write
/// failures are logged and swallowed: losing the debug trail must never
/// interrupt the notification path.
use chrono::Local;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Errors opening the output log. Only opening can fail the session;
/// writes after a successful open are best-effort.
#[derive(Debug)]
pub enum LogOpenError {
    CreateDir {
        path: PathBuf,
        source: std::io::Error,
    },
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LogOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogOpenError::CreateDir { path, source } => {
                write!(
                    f,
                    "failed to create log directory {}: {}",
                    path.display(),
                    source
                )
            }
            LogOpenError::Open { path, source } => {
                write!(f, "failed to open log file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for LogOpenError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogOpenError::CreateDir { source, .. } => Some(source),
            LogOpenError::Open { source, .. } => Some(source),
        }
    }
}

#[derive(Debug)]
pub struct OutputLog {
    file: File,
    path: PathBuf,
}

impl OutputLog {
    /// Open the log file, creating parent directories as needed.
    /// `append = false` truncates any existing content.
    pub fn open(path: &Path, append: bool) -> Result<Self, LogOpenError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| LogOpenError::CreateDir {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
            }
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(path)
            .map_err(|e| LogOpenError::Open {
                path: path.to_path_buf(),
                source: e,
            })?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Append one raw output line, prefixed with a second-resolution
    /// timestamp: `[YYYY-MM-DD HH:MM:SS] <line>`.
    ///
    /// Never propagates a write failure to the caller.
    pub fn append_line(&mut self, raw: &str) {
        let ts = Local::now().format("%Y-%m-%d %H:%M:%S");
        if let Err(e) = writeln!(self.file, "[{ts}] {raw}") {
            tracing::error!(
                path = %self.path.display(),
                error = %e,
                "failed to write line to output log"
            );
        }
    }

    #[allow(dead_code)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/deeper/tunnel.log");
        let log = OutputLog::open(&path, true).unwrap();
        assert!(path.is_file());
        assert_eq!(log.path(), path);
    }

    #[test]
    fn test_append_line_format() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.log");
        let mut log = OutputLog::open(&path, true).unwrap();
        log.append_line("hello world");
        log.append_line("second");
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        let re = Regex::new(r"^\[\d{4}-\d{2}-\d{2} \d{2}:\d{2}:\d{2}\] hello world$").unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(re.is_match(lines[0]), "unexpected line: {}", lines[0]);
        assert!(lines[1].ends_with("] second"));
    }

    #[test]
    fn test_append_mode_keeps_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut log = OutputLog::open(&path, true).unwrap();
        log.append_line("new line");
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("old line\n"));
        assert!(contents.contains("new line"));
    }

    #[test]
    fn test_truncate_mode_discards_existing_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tunnel.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut log = OutputLog::open(&path, false).unwrap();
        log.append_line("new line");
        drop(log);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("old line"));
        assert!(contents.contains("new line"));
    }

    #[test]
    fn test_open_bad_path_fails() {
        let dir = tempfile::tempdir().unwrap();
        // Parent path exists as a file, so create_dir_all must fail.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "x").unwrap();
        let err = OutputLog::open(&blocker.join("tunnel.log"), true).unwrap_err();
        assert!(matches!(err, LogOpenError::CreateDir { .. }));
    }
}
