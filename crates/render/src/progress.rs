//! Progress parsing for the stabilizer's stdout.
//!
//! The tool prints progress as `elapsed done/total ETA` on one line and
//! redraws it with carriage returns. [`LineSplitter`] turns raw stdout chunks
//! into complete lines (`\r` and `\n` both terminate a line) and
//! [`parse_progress_line`] recognizes the progress shape among unrelated log
//! output.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?P<h>\d{1,3}):(?P<m>\d{2}):(?P<s>\d{2})\D.*?\b(?P<done>\d+)\s*/\s*(?P<total>\d+)\b.*?\bETA:?\s*(?P<eta>\d+(?:\.\d+)?)\s*s\b",
    )
    .expect("progress pattern is valid")
});

/// One parsed progress update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub elapsed_secs: u64,
    pub completed: u64,
    pub total: u64,
    /// ETA exactly as printed, without the unit
    pub eta: String,
}

impl ProgressUpdate {
    /// Fraction complete in [0, 1]; zero when the total is unknown.
    pub fn fraction(&self) -> f32 {
        if self.total == 0 {
            0.0
        } else {
            (self.completed as f32 / self.total as f32).min(1.0)
        }
    }
}

impl std::fmt::Display for ProgressUpdate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let h = self.elapsed_secs / 3600;
        let m = (self.elapsed_secs % 3600) / 60;
        let s = self.elapsed_secs % 60;
        write!(
            f,
            "Elapsed: {:02}:{:02}:{:02} {}/{} ETA {}s",
            h, m, s, self.completed, self.total, self.eta
        )
    }
}

/// Parse one complete output line.
///
/// Returns `None` for anything that is not a progress line.
pub fn parse_progress_line(line: &str) -> Option<ProgressUpdate> {
    let caps = PROGRESS_RE.captures(line)?;
    let field = |name: &str| caps.name(name).map(|m| m.as_str());

    let h: u64 = field("h")?.parse().ok()?;
    let m: u64 = field("m")?.parse().ok()?;
    let s: u64 = field("s")?.parse().ok()?;
    if m >= 60 || s >= 60 {
        return None;
    }

    Some(ProgressUpdate {
        elapsed_secs: h * 3600 + m * 60 + s,
        completed: field("done")?.parse().ok()?,
        total: field("total")?.parse().ok()?,
        eta: field("eta")?.to_string(),
    })
}

/// Normalized progress text for a line, e.g.
/// `Elapsed: 00:01:23 45/100 ETA 12.3s`.
pub fn progress_text(line: &str) -> Option<String> {
    parse_progress_line(line).map(|update| update.to_string())
}

/// Splits a byte stream into lines on `\r` or `\n`.
///
/// A trailing partial line is kept until more bytes arrive or the stream
/// ends.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed. Empty lines are
    /// dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                if !self.pending.is_empty() {
                    lines.push(String::from_utf8_lossy(&self.pending).into_owned());
                    self.pending.clear();
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Flush what is left when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        Some(line)
    }
}
