//! Budgeted DIGEST extraction from JSONL transcripts.
//!
//! A transcript is a JSON-lines file of structured messages. Subagents end
//! their work by emitting a fenced block (```` ```json DIGEST ````) inside
//! a message's text fields. The scanner finds the latest such block under
//! explicit byte and time budgets: a tail pass over the last window first,
//! then a full pass only when allowed and needed.

use crate::config::ScannerConfig;
use crate::error::Result;
use crate::io::TailWindow;
use regex::Regex;
use std::path::Path;
use std::time::Instant;

/// Fence grammar: tolerates `json DIGEST`, `DIGEST json`, and bare
/// `DIGEST` language tags, CRLF line endings, and multi-line JSON bodies.
const FENCE_PATTERN: &str =
    r"(?s)```[ \t]*(?:json[ \t]+DIGEST|DIGEST[ \t]+json|DIGEST)[ \t]*\r?\n(.*?)```";

/// Scans a transcript for the latest valid DIGEST payload.
///
/// Returns the raw JSON text of the fenced block, or `None` when no valid
/// block exists within the configured budgets. Fenced blocks whose body is
/// not valid JSON are logged and skipped.
///
/// # Errors
///
/// Returns an error if the transcript cannot be opened or mapped. A
/// missing DIGEST is not an error.
pub fn latest_digest(path: &Path, config: &ScannerConfig) -> Result<Option<String>> {
    let started = Instant::now();
    let fence = Regex::new(FENCE_PATTERN)?;
    let window = TailWindow::open(path, config.tail_bytes)?;

    // Tail pass: the common case; recent DIGESTs live at the end.
    if let Some(found) = scan_lines(&window.text(), &fence, config, started) {
        return Ok(Some(found));
    }

    if config.fast_only || window.file_len() > config.max_bytes {
        tracing::debug!(
            file_len = window.file_len(),
            fast_only = config.fast_only,
            "tail scan found no DIGEST; full pass skipped"
        );
        return Ok(None);
    }

    if budget_exhausted(config, started) {
        return Ok(None);
    }

    Ok(scan_lines(&window.full_text(), &fence, config, started))
}

/// Extracts the last valid fenced DIGEST from a plain text blob (e.g. a
/// subagent tool result), without any transcript framing.
#[must_use]
pub fn extract_fenced_digest(text: &str) -> Option<String> {
    let fence = Regex::new(FENCE_PATTERN).ok()?;
    last_fence_payload(text, &fence)
}

/// Scans lines in order and returns the last valid DIGEST payload.
fn scan_lines(
    text: &str,
    fence: &Regex,
    config: &ScannerConfig,
    started: Instant,
) -> Option<String> {
    let mut latest: Option<String> = None;
    for line in text.lines() {
        if budget_exhausted(config, started) {
            return latest;
        }
        let Ok(message) = serde_json::from_str::<serde_json::Value>(line) else {
            continue;
        };
        let mut fields = Vec::new();
        collect_strings(&message, &mut fields);
        for field in fields {
            if let Some(payload) = last_fence_payload(field, fence) {
                latest = Some(payload);
            }
        }
    }
    latest
}

/// Extracts the last fenced DIGEST payload in a text field, skipping
/// bodies that are not valid JSON.
fn last_fence_payload(text: &str, fence: &Regex) -> Option<String> {
    let mut latest = None;
    for caps in fence.captures_iter(text) {
        let body = caps.get(1).map_or("", |m| m.as_str()).trim();
        if serde_json::from_str::<serde_json::Value>(body).is_ok() {
            latest = Some(body.to_string());
        } else {
            tracing::warn!(bytes = body.len(), "skipping fenced DIGEST with invalid JSON");
        }
    }
    latest
}

/// Depth-first collection of every string value in a JSON message.
fn collect_strings<'a>(value: &'a serde_json::Value, out: &mut Vec<&'a str>) {
    match value {
        serde_json::Value::String(s) => out.push(s),
        serde_json::Value::Array(items) => {
            for item in items {
                collect_strings(item, out);
            }
        }
        serde_json::Value::Object(map) => {
            for item in map.values() {
                collect_strings(item, out);
            }
        }
        _ => {}
    }
}

/// True when the wall-clock budget has been spent.
fn budget_exhausted(config: &ScannerConfig, started: Instant) -> bool {
    config
        .time_budget_ms
        .is_some_and(|ms| started.elapsed().as_millis() >= u128::from(ms))
}
