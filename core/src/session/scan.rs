//! Failure scan over the tail of a finished job's log.
//!
//! The job's exit code is not tracked, so a finished session is judged by
//! its output: any line in the trailing window containing one of the
//! failure tokens (case-insensitive) is collected into a short excerpt.

use serde::{Deserialize, Serialize};

/// Tokens that mark a line as failure-indicating.
pub const FAILURE_TOKENS: &[&str] = &["error", "failed", "fatal", "exception"];

/// Lines of trailing log examined by default.
pub const DEFAULT_SCAN_WINDOW: usize = 50;

/// Most lines kept in an excerpt.
pub const MAX_EXCERPT_LINES: usize = 10;

/// Failure-indicating lines found in a finished job's log. An annotation on
/// the watch result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFailure {
    pub lines: Vec<String>,
}

/// Whether a line contains any failure token.
pub fn is_failure_line(line: &str) -> bool {
    let lower = line.to_lowercase();
    FAILURE_TOKENS.iter().any(|t| lower.contains(t))
}

/// Scan the last `window` lines of `tail`. Returns the first
/// `MAX_EXCERPT_LINES` matching lines, or `None` when nothing matched.
pub fn scan_for_failure(tail: &[String], window: usize) -> Option<BuildFailure> {
    let start = tail.len().saturating_sub(window);
    let lines: Vec<String> = tail[start..]
        .iter()
        .filter(|l| is_failure_line(l))
        .take(MAX_EXCERPT_LINES)
        .map(|l| l.trim_end().to_string())
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(BuildFailure { lines })
    }
}
