//! DIGEST parsing, validation, and the NOTES.md appender.
//!
//! A DIGEST is the structured summary a subagent emits at the end of a
//! task. This module turns the fenced JSON payload into a typed value,
//! renders the human-readable NOTES block, derives WSI touches, and builds
//! the ingest-job metadata.

use crate::error::{Result, ValidationError};
use crate::io::append_line;
use crate::project::ProjectPaths;
use crate::wsi::WsiStore;
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Banner written when NOTES.md is created.
const NOTES_BANNER: &str = "# NOTES\n\nAppend-only digest log. Newest entries last.\n";

/// A location anchor inside a touched file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum Anchor {
    /// Line span.
    Span {
        /// First line of the span.
        start: i64,
        /// Last line of the span.
        end: i64,
    },
    /// Named symbol.
    Symbol {
        /// Symbol name.
        symbol: String,
    },
}

/// One file touched during the task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DigestFile {
    /// Path relative to the project root.
    pub path: String,
    /// Why the file was touched.
    #[serde(default)]
    pub reason: String,
    /// Optional location anchors.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub anchors: Vec<Anchor>,
}

/// A validated DIGEST.
///
/// Absent list fields are treated as empty; fields beyond the required
/// shape are preserved verbatim and flow into ingest metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Digest {
    /// Emitting agent role.
    pub agent: String,
    /// Task identifier.
    pub task_id: String,
    /// Decisions taken.
    #[serde(default)]
    pub decisions: Vec<String>,
    /// Files touched.
    #[serde(default)]
    pub files: Vec<DigestFile>,
    /// Contracts honored (may be `["n/a"]`).
    #[serde(default)]
    pub contracts: Vec<String>,
    /// Follow-up work.
    #[serde(default)]
    pub next: Vec<String>,
    /// Evidence map (check name to result).
    #[serde(default)]
    pub evidence: BTreeMap<String, serde_json::Value>,
    /// Extra fields preserved verbatim.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Digest {
    /// Parses and validates a DIGEST payload.
    ///
    /// # Errors
    ///
    /// Returns a validation error for invalid JSON or an empty `agent` or
    /// `task_id`.
    pub fn parse(payload: &str) -> Result<Self> {
        let digest: Self = serde_json::from_str(payload).map_err(ValidationError::from)?;
        if digest.agent.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "agent".to_string(),
            }
            .into());
        }
        if digest.task_id.trim().is_empty() {
            return Err(ValidationError::MissingField {
                field: "task_id".to_string(),
            }
            .into());
        }
        Ok(digest)
    }

    /// Infers the normalized outcome from evidence values.
    ///
    /// Closed set: `success`, `failure`, `unknown`. Failure tokens win
    /// over success tokens when both appear.
    #[must_use]
    pub fn outcome_status(&self) -> &'static str {
        let mut saw_success = false;
        for value in self.evidence.values() {
            let text = match value {
                serde_json::Value::String(s) => s.to_ascii_lowercase(),
                other => other.to_string().to_ascii_lowercase(),
            };
            if ["fail", "error", "broken", "red"]
                .iter()
                .any(|t| text.contains(t))
            {
                return "failure";
            }
            if ["ok", "pass", "green", "success", "clean"]
                .iter()
                .any(|t| text.contains(t))
            {
                saw_success = true;
            }
        }
        if saw_success { "success" } else { "unknown" }
    }

    /// Renders the canonical Markdown block appended to NOTES.md.
    #[must_use]
    pub fn to_markdown(&self, timestamp: &str) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "## DIGEST — {timestamp} — agent={} — task={}\n",
            self.agent, self.task_id
        ));
        push_list(&mut out, "Decisions", self.decisions.iter());
        out.push_str("### Files\n");
        if self.files.is_empty() {
            out.push_str("- (none)\n");
        } else {
            for file in &self.files {
                if file.reason.is_empty() {
                    out.push_str(&format!("- {}\n", file.path));
                } else {
                    out.push_str(&format!("- {} — {}\n", file.path, file.reason));
                }
            }
        }
        push_list(&mut out, "Contracts", self.contracts.iter());
        push_list(&mut out, "Next", self.next.iter());
        out.push_str("### Evidence\n");
        if self.evidence.is_empty() {
            out.push_str("- (none)\n");
        } else {
            for (key, value) in &self.evidence {
                let rendered = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                out.push_str(&format!("- {key}: {rendered}\n"));
            }
        }
        out
    }

    /// Appends this digest to NOTES.md, creating it with a banner first.
    ///
    /// # Errors
    ///
    /// Returns an error if the append fails.
    pub fn append_to_notes(&self, paths: &ProjectPaths) -> Result<()> {
        if !paths.notes_path.exists() {
            append_line(&paths.notes_path, NOTES_BANNER)?;
        }
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        append_line(&paths.notes_path, &self.to_markdown(&timestamp))
    }

    /// Upserts WSI entries for every file named by the digest.
    pub fn apply_to_wsi(&self, wsi: &mut WsiStore, turn: u64) {
        for file in &self.files {
            wsi.touch(&file.path, &file.reason, turn);
        }
    }

    /// Builds the metadata object for the ingest job.
    ///
    /// Extra DIGEST fields are carried through verbatim; the well-known
    /// keys win on collision.
    #[must_use]
    pub fn ingest_meta(&self) -> serde_json::Value {
        let mut meta = serde_json::Map::new();
        for (key, value) in &self.extra {
            meta.insert(key.clone(), value.clone());
        }
        meta.insert("agent".to_string(), self.agent.clone().into());
        meta.insert("task_id".to_string(), self.task_id.clone().into());
        meta.insert("decisions_count".to_string(), self.decisions.len().into());
        meta.insert("files_count".to_string(), self.files.len().into());
        meta.insert(
            "contracts".to_string(),
            serde_json::Value::Array(
                self.contracts.iter().cloned().map(Into::into).collect(),
            ),
        );
        meta.insert(
            "outcome_status".to_string(),
            self.outcome_status().to_string().into(),
        );
        serde_json::Value::Object(meta)
    }

    /// Queue path for this digest's ingest job.
    #[must_use]
    pub fn ingest_path(&self, now_ms: i64) -> String {
        format!("logs/digests/{}-{now_ms}", self.task_id)
    }
}

/// Appends a `### <heading>` list section.
fn push_list<'a>(out: &mut String, heading: &str, items: impl Iterator<Item = &'a String>) {
    out.push_str(&format!("### {heading}\n"));
    let mut any = false;
    for item in items {
        out.push_str(&format!("- {item}\n"));
        any = true;
    }
    if !any {
        out.push_str("- (none)\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WsiConfig;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"{
        "agent": "IE",
        "task_id": "t1",
        "decisions": ["Use rename-based claims"],
        "files": [{"path": "a.ts", "reason": "new", "anchors": [{"start": 1, "end": 9}]}],
        "contracts": ["n/a"],
        "next": ["wire processor"],
        "evidence": {"lint": "ok", "tests": "12 passed"}
    }"#;

    #[test]
    fn test_parse_valid() {
        let digest = Digest::parse(SAMPLE).unwrap();
        assert_eq!(digest.agent, "IE");
        assert_eq!(digest.task_id, "t1");
        assert_eq!(digest.files.len(), 1);
        assert_eq!(
            digest.files[0].anchors,
            vec![Anchor::Span { start: 1, end: 9 }]
        );
    }

    #[test]
    fn test_parse_symbol_anchor() {
        let digest = Digest::parse(
            r#"{"agent":"a","task_id":"t","files":[{"path":"x.rs","reason":"r","anchors":[{"symbol":"main"}]}]}"#,
        )
        .unwrap();
        assert_eq!(
            digest.files[0].anchors,
            vec![Anchor::Symbol {
                symbol: "main".to_string()
            }]
        );
    }

    #[test]
    fn test_missing_lists_default_empty() {
        let digest = Digest::parse(r#"{"agent":"a","task_id":"t"}"#).unwrap();
        assert!(digest.decisions.is_empty());
        assert!(digest.files.is_empty());
        assert!(digest.contracts.is_empty());
        assert!(digest.next.is_empty());
        assert!(digest.evidence.is_empty());
    }

    #[test]
    fn test_required_fields() {
        let err = Digest::parse(r#"{"agent":"", "task_id":"t"}"#).unwrap_err();
        assert!(err.to_string().contains("agent"));

        let err = Digest::parse(r#"{"agent":"a", "task_id":"  "}"#).unwrap_err();
        assert!(err.to_string().contains("task_id"));

        let err = Digest::parse("not json").unwrap_err();
        assert!(err.to_string().contains("invalid DIGEST JSON"));
    }

    #[test]
    fn test_extra_fields_preserved() {
        let digest =
            Digest::parse(r#"{"agent":"a","task_id":"t","confidence":0.9,"branch":"main"}"#)
                .unwrap();
        let meta = digest.ingest_meta();
        assert_eq!(meta["confidence"], 0.9);
        assert_eq!(meta["branch"], "main");
        assert_eq!(meta["agent"], "a");
        assert_eq!(meta["outcome_status"], "unknown");
    }

    #[test]
    fn test_outcome_inference() {
        let success = Digest::parse(SAMPLE).unwrap();
        assert_eq!(success.outcome_status(), "success");

        let failure = Digest::parse(
            r#"{"agent":"a","task_id":"t","evidence":{"tests":"3 failed, 9 passed"}}"#,
        )
        .unwrap();
        assert_eq!(failure.outcome_status(), "failure");

        let unknown = Digest::parse(r#"{"agent":"a","task_id":"t"}"#).unwrap();
        assert_eq!(unknown.outcome_status(), "unknown");
    }

    #[test]
    fn test_markdown_block() {
        let digest = Digest::parse(SAMPLE).unwrap();
        let md = digest.to_markdown("2026-08-01T12:00:00Z");
        assert!(md.starts_with("## DIGEST — 2026-08-01T12:00:00Z — agent=IE — task=t1"));
        assert!(md.contains("### Decisions\n- Use rename-based claims"));
        assert!(md.contains("- a.ts — new"));
        assert!(md.contains("### Evidence\n- lint: ok"));
    }

    #[test]
    fn test_append_to_notes_creates_banner() {
        let dir = TempDir::new().unwrap();
        let paths = ProjectPaths::resolve(Some(dir.path())).unwrap();
        let digest = Digest::parse(SAMPLE).unwrap();

        digest.append_to_notes(&paths).unwrap();
        digest.append_to_notes(&paths).unwrap();

        let notes = std::fs::read_to_string(&paths.notes_path).unwrap();
        assert!(notes.starts_with("# NOTES"));
        assert_eq!(notes.matches("## DIGEST —").count(), 2);
    }

    #[test]
    fn test_apply_to_wsi() {
        let dir = TempDir::new().unwrap();
        let mut wsi = WsiStore::load(
            &dir.path().join("wsi.json"),
            &WsiConfig {
                max: 10,
                ttl_turns: 20,
            },
        );
        let digest = Digest::parse(SAMPLE).unwrap();
        digest.apply_to_wsi(&mut wsi, 7);

        let snap = wsi.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].path, "a.ts");
        assert_eq!(snap[0].reason, "new");
        assert_eq!(snap[0].last_turn, 7);
    }

    #[test]
    fn test_ingest_path() {
        let digest = Digest::parse(SAMPLE).unwrap();
        assert_eq!(digest.ingest_path(123), "logs/digests/t1-123");
    }
}
