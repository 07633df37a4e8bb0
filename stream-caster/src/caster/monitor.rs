//! Diagnostic stream monitors.
//!
//! A single task drains each process's stderr. Every record is scanned for a
//! `bitrate=` marker, and the last [`ERROR_WINDOW_LINES`] records are kept in
//! a ring buffer that is checked for failure keywords once the stream closes.

use std::collections::VecDeque;
use std::sync::LazyLock;

use regex::Regex;
use tokio::io::AsyncRead;
use tracing::{debug, error, trace, warn};

use super::job::StreamId;
use super::record_reader::RecordReader;
use super::store::StreamRepository;

/// Number of trailing diagnostic lines inspected for failures.
pub const ERROR_WINDOW_LINES: usize = 5;

/// Substrings that mark a diagnostic line as a genuine failure.
pub const ERROR_KEYWORDS: &[&str] = &["Error", "failed", "cannot", "Invalid", "unable", "not found"];

static BITRATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"bitrate=\s*(\d+(?:\.\d+)?)").unwrap_or_else(|e| panic!("invalid bitrate regex: {e}"))
});

/// Parse `bitrate=<kbits/s>` and return megabits per second rounded to 2 decimals.
pub fn parse_bitrate_mbps(line: &str) -> Option<f64> {
    let captures = BITRATE_RE.captures(line)?;
    let kbps: f64 = captures.get(1)?.as_str().parse().ok()?;
    Some((kbps / 1000.0 * 100.0).round() / 100.0)
}

/// Whether a line contains any failure keyword.
pub fn is_failure_line(line: &str) -> bool {
    ERROR_KEYWORDS.iter().any(|keyword| line.contains(keyword))
}

/// Fixed-size window over the most recent diagnostic lines.
#[derive(Debug, Clone)]
pub struct ErrorWindow {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for ErrorWindow {
    fn default() -> Self {
        Self::new(ERROR_WINDOW_LINES)
    }
}

impl ErrorWindow {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.into());
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Matching lines joined by newlines, or `None` when the tail looks healthy.
    pub fn failure_message(&self) -> Option<String> {
        let matches: Vec<&str> = self
            .lines
            .iter()
            .map(String::as_str)
            .filter(|line| is_failure_line(line))
            .collect();
        (!matches.is_empty()).then(|| matches.join("\n"))
    }
}

/// What a monitor does with the records it drains.
#[derive(Debug, Clone)]
pub struct MonitorRole {
    /// Escalate a failing tail into a stream error.
    pub detect_errors: bool,
    /// Destinations credited with the bandwidth this process reports.
    pub destinations: Vec<String>,
}

impl MonitorRole {
    /// Role for processes that transmit to `destinations`.
    pub fn transmit(destinations: Vec<String>) -> Self {
        Self {
            detect_errors: true,
            destinations,
        }
    }

    /// Role for relay legs: drained and logged, never escalated.
    pub fn relay() -> Self {
        Self {
            detect_errors: false,
            destinations: Vec::new(),
        }
    }
}

/// Drain `reader` until it closes.
///
/// Returns the failure message when the role escalates errors and the final
/// window contains a failure keyword.
pub async fn watch<R>(
    reader: R,
    stream_id: &StreamId,
    label: &str,
    role: &MonitorRole,
    repository: &dyn StreamRepository,
) -> Option<String>
where
    R: AsyncRead + Unpin,
{
    let mut records = RecordReader::new(reader);
    let mut window = ErrorWindow::default();

    loop {
        match records.next_record().await {
            Ok(Some(line)) => {
                trace!(stream_id = %stream_id, process = %label, "{}", line);

                if !role.destinations.is_empty()
                    && let Some(mbps) = parse_bitrate_mbps(&line)
                {
                    repository.record_bandwidth(stream_id, &role.destinations, mbps);
                    debug!(
                        stream_id = %stream_id,
                        destinations = ?role.destinations,
                        mbps,
                        "Updated bandwidth"
                    );
                }

                window.push(line);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stream_id = %stream_id, process = %label, error = %e, "Error reading diagnostic stream");
                break;
            }
        }
    }

    let failure = window.failure_message()?;
    if role.detect_errors {
        error!(stream_id = %stream_id, process = %label, "Process reported failure: {}", failure);
        Some(failure)
    } else {
        warn!(stream_id = %stream_id, process = %label, "Relay leg exited with: {}", failure);
        None
    }
}
