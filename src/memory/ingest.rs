//! Document ingest pipeline.
//!
//! One ingest is: resolve project, infer component/category, chunk,
//! dedupe (48 h cache), batch-embed the survivors, and upsert on
//! `(project_id, path, content_sha256)`, which makes retries and
//! re-ingests of identical content no-ops.

use crate::error::{Result, StorageError};
use crate::hash::sha256_hex_str;
use crate::memory::chunking::chunk_text;
use crate::memory::embedding::vector_to_bytes;
use crate::memory::{DEDUPE_TTL_MS, IngestReceipt, SqliteMemory};
use crate::project::now_ms;
use rusqlite::{OptionalExtension, params};
use std::path::Path;

impl SqliteMemory {
    /// Ingests a document into the store.
    ///
    /// Empty (or whitespace-only) text returns `{chunks: 0}` without
    /// touching the chunk table.
    ///
    /// # Errors
    ///
    /// Returns a fatal dimension mismatch when the configured embedder
    /// disagrees with the store's pinned dimension; other failures are
    /// transient from the queue processor's point of view.
    pub fn ingest_document(
        &mut self,
        project_root: &Path,
        path_in_project: &str,
        text: &str,
        meta: &serde_json::Value,
    ) -> Result<IngestReceipt> {
        if self.embedder.dimensions() != self.store_dim {
            return Err(StorageError::DimensionMismatch {
                expected: self.store_dim,
                actual: self.embedder.dimensions(),
            }
            .into());
        }

        let label = project_root
            .file_name()
            .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned());
        let project_id = self.get_or_create_project(project_root, &label)?;

        if text.trim().is_empty() {
            return Ok(IngestReceipt {
                chunks: 0,
                project_id,
            });
        }

        // Caller-supplied values override inference
        let component = meta
            .get("component")
            .and_then(|v| v.as_str())
            .map_or_else(|| infer_component(path_in_project), ToString::to_string);
        let category = meta
            .get("category")
            .and_then(|v| v.as_str())
            .map_or_else(|| infer_category(path_in_project, text, meta), ToString::to_string);
        let tags = match meta.get("tags") {
            Some(value) if value.is_array() => value.to_string(),
            _ => "[]".to_string(),
        };
        let repo_name = meta
            .get("repo_name")
            .and_then(|v| v.as_str())
            .unwrap_or(&label)
            .to_string();
        let meta_json = serde_json::to_string(meta).map_err(StorageError::from)?;

        let (chunks, _stats) = chunk_text(text);
        let now = now_ms();

        // Dedupe: skip chunks whose content was seen for this project
        // inside the TTL window
        let mut surviving = Vec::new();
        for chunk in chunks {
            let sha = sha256_hex_str(&chunk.text);
            let seen: Option<i64> = self
                .conn
                .query_row(
                    r"
                SELECT seen_at FROM dedupe_cache
                WHERE project_id = ? AND content_sha256 = ? AND seen_at >= ?
            ",
                    params![project_id, sha, now - DEDUPE_TTL_MS],
                    |row| row.get(0),
                )
                .optional()
                .map_err(StorageError::from)?;
            if seen.is_none() {
                surviving.push((chunk, sha));
            }
        }

        if surviving.is_empty() {
            return Ok(IngestReceipt {
                chunks: 0,
                project_id,
            });
        }

        let texts: Vec<&str> = surviving.iter().map(|(c, _)| c.text.as_str()).collect();
        let vectors = self.embed_cached(&texts, project_id)?;

        let inserted = surviving.len();
        let tx = self.conn.transaction().map_err(StorageError::from)?;
        for ((chunk, sha), vector) in surviving.iter().zip(vectors) {
            tx.execute(
                r"
                INSERT INTO chunks (
                    project_id, repo_name, path, chunk_text, embedding, dimensions,
                    component, category, tags, meta, content_sha256, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (project_id, path, content_sha256) DO UPDATE SET
                    chunk_text = excluded.chunk_text,
                    embedding = excluded.embedding,
                    dimensions = excluded.dimensions,
                    component = excluded.component,
                    category = excluded.category,
                    tags = excluded.tags,
                    meta = excluded.meta,
                    updated_at = excluded.updated_at
            ",
                params![
                    project_id,
                    repo_name,
                    path_in_project,
                    chunk.text,
                    vector_to_bytes(&vector),
                    vector.len() as i64,
                    component,
                    category,
                    tags,
                    meta_json,
                    sha,
                    now
                ],
            )
            .map_err(StorageError::from)?;

            tx.execute(
                r"
                INSERT INTO dedupe_cache (project_id, content_sha256, seen_at)
                VALUES (?, ?, ?)
                ON CONFLICT (project_id, content_sha256) DO UPDATE SET seen_at = excluded.seen_at
            ",
                params![project_id, sha, now],
            )
            .map_err(StorageError::from)?;
        }
        tx.commit().map_err(StorageError::from)?;

        Ok(IngestReceipt {
            chunks: inserted,
            project_id,
        })
    }
}

/// Maps a path prefix to a component name.
fn infer_component(path: &str) -> String {
    let first = path
        .trim_start_matches("./")
        .split(['/', '\\'])
        .next()
        .unwrap_or("");
    match first {
        "src" | "lib" | "crates" | "packages" | "apps" => "code".to_string(),
        "docs" | "doc" => "docs".to_string(),
        "tests" | "test" | "spec" | "__tests__" => "tests".to_string(),
        "logs" => "session".to_string(),
        ".claude" => "meta".to_string(),
        "scripts" | "bin" | "tools" => "tooling".to_string(),
        "" => "root".to_string(),
        other if other.contains('.') => "root".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

/// Infers a category from the source marker, extension, and content.
fn infer_category(path: &str, text: &str, meta: &serde_json::Value) -> String {
    let source = meta.get("source").and_then(|v| v.as_str()).unwrap_or("");
    if source == "digest" || text.contains("## DIGEST") {
        return "decision".to_string();
    }
    if source == "conversation_summary" {
        return "summary".to_string();
    }
    if source == "fixpack" {
        return "fixpack".to_string();
    }

    let extension = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "md" | "mdx" | "rst" | "txt" => "doc".to_string(),
        "rs" | "ts" | "tsx" | "js" | "jsx" | "py" | "go" | "java" | "rb" | "c" | "cc" | "cpp"
        | "h" => "code".to_string(),
        "json" | "yaml" | "yml" | "toml" => "config".to_string(),
        _ => "note".to_string(),
    }
}
