/// Output batching: accumulate tunnel output lines and decide when a batch
/// is due, either because the buffer hit the line threshold or because no
/// new output arrived for the idle window.
use std::time::{Duration, Instant};

/// Why a batch was flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// Buffer reached the configured line threshold.
    BatchLines,
    /// No new output for at least the idle window.
    IdleTimeout,
    /// The tunnel process exited; final forced flush.
    ProcessExit,
}

impl FlushReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushReason::BatchLines => "batch_lines",
            FlushReason::IdleTimeout => "idle_timeout",
            FlushReason::ProcessExit => "process_exit",
        }
    }
}

impl std::fmt::Display for FlushReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable snapshot of one flush: the buffered lines, the reason the
/// flush fired, and the 1-based batch index at the time it was taken.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub lines: Vec<String>,
    pub reason: FlushReason,
    pub index: u64,
}

impl BatchRequest {
    /// Notification subject: `[<name>] Batch #<index> (<n> lines) - <reason>`.
    ///
    /// The configured subject prefix is applied by the mailer, not here.
    pub fn subject(&self, tunnel_name: &str) -> String {
        format!(
            "[{}] Batch #{} ({} lines) - {}",
            tunnel_name,
            self.index,
            self.lines.len(),
            self.reason
        )
    }

    /// Notification body: buffered lines joined by newline, or a placeholder
    /// when the flush was forced with an empty buffer.
    pub fn body(&self) -> String {
        if self.lines.is_empty() {
            "(no new output)".to_string()
        } else {
            self.lines.join("\n")
        }
    }
}

/// Buffer plus the state needed to evaluate both flush triggers.
///
/// Single-owner: the supervisory loop is the only mutator, so no locking.
pub struct Batcher {
    buffer: Vec<String>,
    last_activity: Instant,
    next_index: u64,
    batch_lines: usize,
    idle_after: Duration,
}

impl Batcher {
    pub fn new(batch_lines: usize, idle_after: Duration) -> Self {
        Self {
            buffer: Vec::new(),
            last_activity: Instant::now(),
            next_index: 1,
            batch_lines,
            idle_after,
        }
    }

    /// Append a line and refresh the activity timestamp.
    ///
    /// Returns true when the buffer has reached the line threshold; the
    /// caller is expected to flush immediately, before any idle check.
    pub fn push(&mut self, line: String) -> bool {
        self.buffer.push(line);
        self.last_activity = Instant::now();
        self.buffer.len() >= self.batch_lines
    }

    /// Whether the idle window has elapsed since the last observed line.
    pub fn idle_exceeded(&self) -> bool {
        self.last_activity.elapsed() >= self.idle_after
    }

    /// Take the current buffer as a batch and reset it.
    ///
    /// Returns `None` (and leaves the index untouched) when the buffer is
    /// empty and the flush is not forced. Otherwise the buffer is cleared
    /// and the index advances regardless of what the caller later does with
    /// the batch: delivery is at-most-once per buffer window, failed sends
    /// are never re-queued.
    pub fn take(&mut self, reason: FlushReason, force: bool) -> Option<BatchRequest> {
        if self.buffer.is_empty() && !force {
            return None;
        }
        let batch = BatchRequest {
            lines: std::mem::take(&mut self.buffer),
            reason,
            index: self.next_index,
        };
        self.next_index += 1;
        Some(batch)
    }

    /// Buffered line count (diagnostics and tests).
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}
