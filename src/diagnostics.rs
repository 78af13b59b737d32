//! Interpreter diagnostic stream handling
//!
//! The built-in server writes everything to stderr, one line per event:
//!
//! ```text
//! [Sat Oct 17 12:00:00 2026] 127.0.0.1:51234 [200]: GET /index.php
//! [Sat Oct 17 12:00:00 2026] PHP Notice:  Undefined variable: abc in /x.php on line 1
//! ```
//!
//! Lines are split into access records (the request completed) and error
//! records (anything else). The server guarantees that the error lines of a
//! request are written before its access line, which is what lets the
//! handler treat an access record as proof that no error occurred.

use std::net::IpAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Text that marks a diagnostic as fatal; fatal lines are never ignorable
pub const FATAL_MARKER: &str = "Fatal error";

/// A classified diagnostic line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiagnosticRecord {
    /// Access log entry for a completed request; text starts at the client address
    Access(String),
    /// Connection bookkeeping (`Accepted` / `Closing`) from newer interpreters
    Connection(String),
    /// Notice, warning or fatal error; text follows the timestamp
    Error(String),
}

/// Splits raw diagnostic lines by looking for the access marker after the timestamp
#[derive(Debug, Clone)]
pub struct Classifier {
    marker: String,
}

impl Classifier {
    /// Classifier for a backend bound to `ip`
    pub fn new(ip: IpAddr) -> Self {
        Self {
            marker: format!("] {}:", ip),
        }
    }

    pub fn classify(&self, line: &str) -> DiagnosticRecord {
        if !line.starts_with('[') {
            return DiagnosticRecord::Error(line.to_string());
        }
        let Some(close) = line.find(']') else {
            return DiagnosticRecord::Error(line.to_string());
        };

        let tail = &line[close..];
        if tail.starts_with(&self.marker) {
            // Skip "] " so the remainder begins with the client address
            let remainder = &line[close + 2..];
            if is_connection_event(remainder) {
                DiagnosticRecord::Connection(remainder.to_string())
            } else {
                DiagnosticRecord::Access(remainder.to_string())
            }
        } else {
            DiagnosticRecord::Error(line[close + 1..].trim_start().to_string())
        }
    }
}

fn is_connection_event(remainder: &str) -> bool {
    let mut words = remainder.split_whitespace();
    let _client = words.next();
    matches!(
        (words.next(), words.next()),
        (Some("Accepted"), None) | (Some("Closing"), None)
    )
}

/// Configured substrings whose non-fatal diagnostics are suppressed
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    patterns: Arc<[String]>,
}

impl IgnoreList {
    pub fn new(patterns: Vec<String>) -> Self {
        Self {
            patterns: patterns.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// True if `text` should not be surfaced as an error
    pub fn suppresses(&self, text: &str) -> bool {
        if text.contains(FATAL_MARKER) {
            return false;
        }
        self.patterns.iter().any(|pattern| text.contains(pattern.as_str()))
    }
}

/// Consumer side of one backend's classified diagnostics
#[derive(Debug)]
pub struct Diagnostics {
    pub(crate) access: mpsc::UnboundedReceiver<String>,
    pub(crate) errors: mpsc::UnboundedReceiver<String>,
}

/// Producer side, owned by the stderr reader task
#[derive(Debug, Clone)]
pub(crate) struct DiagnosticSenders {
    pub(crate) access: mpsc::UnboundedSender<String>,
    pub(crate) errors: mpsc::UnboundedSender<String>,
}

pub(crate) fn channels() -> (DiagnosticSenders, Diagnostics) {
    let (access_tx, access_rx) = mpsc::unbounded_channel();
    let (errors_tx, errors_rx) = mpsc::unbounded_channel();
    (
        DiagnosticSenders {
            access: access_tx,
            errors: errors_tx,
        },
        Diagnostics {
            access: access_rx,
            errors: errors_rx,
        },
    )
}

impl Diagnostics {
    /// Drop everything queued so far, returning how many lines were discarded
    pub fn discard_pending(&mut self, port: u16) -> usize {
        let mut discarded = 0;
        while let Ok(line) = self.errors.try_recv() {
            debug!(port, line = %line, "Discarding startup diagnostic");
            discarded += 1;
        }
        while let Ok(line) = self.access.try_recv() {
            debug!(port, line = %line, "Discarding startup access record");
            discarded += 1;
        }
        discarded
    }
}

/// Read the interpreter's stderr, classify each line and fan it out.
///
/// The task ends at end-of-stream; dropping the senders is what tells the
/// handler the stream is gone.
pub(crate) fn spawn_diagnostic_reader(
    stream: impl AsyncRead + Unpin + Send + 'static,
    port: u16,
    classifier: Classifier,
    senders: DiagnosticSenders,
) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(1024);

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    if line.is_empty() {
                        continue;
                    }
                    match classifier.classify(&line) {
                        DiagnosticRecord::Access(text) => {
                            debug!(port, "access: {}", text);
                            let _ = senders.access.send(text);
                        }
                        DiagnosticRecord::Error(text) => {
                            debug!(port, "diagnostic: {}", text);
                            let _ = senders.errors.send(text);
                        }
                        DiagnosticRecord::Connection(text) => {
                            trace!(port, "connection: {}", text);
                        }
                    }
                }
                Err(e) => {
                    debug!(port, error = %e, "diagnostic reader exiting due to read error");
                    break;
                }
            }
        }

        debug!(port, "diagnostic reader task exiting");
    });
}

/// Log the interpreter's stdout; nothing on it affects request handling
pub(crate) fn spawn_output_logger(stream: impl AsyncRead + Unpin + Send + 'static, port: u16) {
    tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        let mut buf: Vec<u8> = Vec::with_capacity(256);

        while let Ok(n) = reader.read_until(b'\n', &mut buf).await {
            if n == 0 {
                break;
            }
            let line = decode_line(&buf);
            if !line.is_empty() {
                debug!(target: "backend", port, stream = "stdout", "{}", line);
            }
            buf.clear();
        }
    });
}

/// Lossy decode with trailing CR/LF removed
fn decode_line(buf: &[u8]) -> String {
    let mut end = buf.len();
    while end > 0 && matches!(buf[end - 1], b'\n' | b'\r') {
        end -= 1;
    }
    String::from_utf8_lossy(&buf[..end]).into_owned()
}
