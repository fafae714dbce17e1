//! Memory provider: chunking, cached embedding, ingest, hybrid search,
//! feedback, and the store trait seam.
//!
//! The provider is written against the [`MemoryStore`] trait so a
//! server-side vector store can satisfy the same contract; the shipped
//! implementation is [`SqliteMemory`] (`SQLite` + FTS5, embeddings as
//! BLOB vectors).

// SQLite stores all integers as i64. These casts are intentional and safe
// because we only store non-negative values that fit in usize.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_possible_wrap)]

pub mod chunking;
pub mod embedding;
pub mod ingest;
pub mod schema;
pub mod search;

pub use chunking::{CHUNK_OVERLAP_CHARS, ChunkStats, TARGET_CHUNK_CHARS, TextChunk, chunk_text};
pub use embedding::{EMBEDDING_DIM, Embedder, HashEmbedder, cosine_similarity};
pub use search::{SearchHit, SearchQuery, SearchResponse};

use crate::config::Config;
use crate::error::{Result, StorageError};
use crate::hash::sha256_hex_str;
use crate::project::now_ms;
use chrono::Utc;
use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Dedupe cache TTL: 48 hours in milliseconds.
pub const DEDUPE_TTL_MS: i64 = 48 * 60 * 60 * 1000;

/// Query cache TTL: 5 minutes in milliseconds.
pub const QUERY_CACHE_TTL_MS: i64 = 5 * 60 * 1000;

/// Hard cap on search result count.
pub const MAX_K: usize = 20;

/// Default search result count.
pub const DEFAULT_K: usize = 8;

/// Minimum feedback count for the top-helpful listing.
pub const DEFAULT_MIN_FEEDBACK: i64 = 3;

/// A registered project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectRecord {
    /// Stable numeric id.
    pub id: i64,
    /// Absolute root path (tenancy key).
    pub root_path: String,
    /// Human label (basename of the root).
    pub label: String,
    /// Distinct document paths indexed.
    pub doc_count: i64,
}

/// Receipt returned by an ingest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IngestReceipt {
    /// Chunks inserted or refreshed (deduped chunks excluded).
    pub chunks: usize,
    /// Project the document was ingested into.
    pub project_id: i64,
}

/// A chunk with a high helpful ratio.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpfulChunk {
    /// Chunk id.
    pub chunk_id: i64,
    /// Owning project.
    pub project_id: i64,
    /// Document path.
    pub path: String,
    /// Helpful feedback count.
    pub helpful_count: i64,
    /// Total feedback count.
    pub total_feedback: i64,
    /// `helpful_count / total_feedback`.
    pub ratio: f64,
}

/// Contract every memory backend satisfies.
///
/// The queue processor and the RPC surface only speak this trait.
pub trait MemoryStore {
    /// Ingests a document: chunk, dedupe, embed, upsert.
    ///
    /// # Errors
    ///
    /// Returns a transient error for retryable failures and a fatal one
    /// for dimension/schema problems.
    fn ingest(
        &mut self,
        project_root: &Path,
        path_in_project: &str,
        text: &str,
        meta: &serde_json::Value,
    ) -> Result<IngestReceipt>;

    /// Hybrid search over indexed chunks.
    ///
    /// # Errors
    ///
    /// Returns an error on store or embedding failure.
    fn search(&mut self, query: &SearchQuery) -> Result<SearchResponse>;

    /// Removes every chunk stored under a document path.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    fn delete_by_path(&mut self, project_root: &Path, path: &str) -> Result<usize>;

    /// Re-embeds every chunk of a project with the current embedder.
    ///
    /// # Errors
    ///
    /// Returns an error on store or embedding failure.
    fn reindex(&mut self, project_root: &Path) -> Result<usize>;

    /// Lists registered projects with document counts.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    fn list_projects(&self) -> Result<Vec<ProjectRecord>>;

    /// Records helpfulness feedback for a chunk.
    ///
    /// # Errors
    ///
    /// Returns an error when the chunk does not exist.
    fn record_feedback(&mut self, chunk_id: i64, helpful: bool, context: Option<&str>)
    -> Result<()>;

    /// Chunks with the best helpful ratio and at least `min_feedback`
    /// ratings.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    fn top_helpful(&self, limit: usize, min_feedback: i64) -> Result<Vec<HelpfulChunk>>;
}

/// `SQLite`-backed memory store.
pub struct SqliteMemory {
    pub(crate) conn: Connection,
    pub(crate) embedder: Box<dyn Embedder>,
    pub(crate) tuning: crate::config::SearchTuning,
    /// Dimension the store's existing vectors use; fixed at init.
    pub(crate) store_dim: usize,
    path: Option<PathBuf>,
}

impl SqliteMemory {
    /// Opens or creates the store at `path` with the configured embedder.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened.
    pub fn open<P: AsRef<Path>>(path: P, config: &Config) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Database(e.to_string()))?;
        }

        let conn = Connection::open(&path).map_err(StorageError::from)?;
        Self::from_connection(conn, Some(path), config)
    }

    /// Creates an in-memory store (tests and ephemeral use).
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be created.
    pub fn in_memory(config: &Config) -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(StorageError::from)?;
        Self::from_connection(conn, None, config)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>, config: &Config) -> Result<Self> {
        conn.execute("PRAGMA foreign_keys = ON;", [])
            .map_err(StorageError::from)?;
        if path.is_some() {
            let _: String = conn
                .query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))
                .map_err(StorageError::from)?;
        }

        let embedder: Box<dyn Embedder> = Box::new(HashEmbedder::new(
            config.embedding.model.clone(),
            config.embedding.dim,
        ));

        let mut store = Self {
            conn,
            embedder,
            tuning: config.search,
            store_dim: config.embedding.dim,
            path,
        };
        if store.is_initialized()? {
            store.store_dim = store.persisted_dimension()?.unwrap_or(config.embedding.dim);
        }
        Ok(store)
    }

    /// Replaces the embedder (pluggable remote client).
    pub fn set_embedder(&mut self, embedder: Box<dyn Embedder>) {
        self.embedder = embedder;
    }

    /// Store file path (None in memory).
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// The dimension this store's vectors are fixed to.
    #[must_use]
    pub const fn dimension(&self) -> usize {
        self.store_dim
    }

    /// Creates the schema and pins the embedding dimension. Idempotent.
    ///
    /// # Errors
    ///
    /// Returns an error on schema creation or migration failure.
    pub fn init(&mut self) -> Result<()> {
        let is_init: i64 = self
            .conn
            .query_row(schema::CHECK_SCHEMA_SQL, [], |row| row.get(0))
            .map_err(StorageError::from)?;

        if is_init == 0 {
            self.conn
                .execute_batch(schema::SCHEMA_SQL)
                .map_err(StorageError::from)?;
            self.set_version(schema::CURRENT_SCHEMA_VERSION)?;
            self.conn
                .execute(schema::SET_DIMENSION_SQL, params![self.store_dim.to_string()])
                .map_err(StorageError::from)?;
        } else if let Some(current) = self.version()? {
            if current < schema::CURRENT_SCHEMA_VERSION {
                for migration in schema::get_migrations_from(current) {
                    self.conn
                        .execute_batch(migration.sql)
                        .map_err(|e| StorageError::Migration(e.to_string()))?;
                }
                self.set_version(schema::CURRENT_SCHEMA_VERSION)?;
            }
            self.store_dim = self.persisted_dimension()?.unwrap_or(self.store_dim);
        }
        Ok(())
    }

    /// Whether the schema exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the check query fails.
    pub fn is_initialized(&self) -> Result<bool> {
        let count: i64 = self
            .conn
            .query_row(schema::CHECK_SCHEMA_SQL, [], |row| row.get(0))
            .map_err(StorageError::from)?;
        Ok(count > 0)
    }

    fn version(&self) -> Result<Option<u32>> {
        let version: Option<String> = self
            .conn
            .query_row(schema::GET_VERSION_SQL, [], |row| row.get(0))
            .optional()
            .map_err(StorageError::from)?;
        Ok(version.and_then(|v| v.parse().ok()))
    }

    fn set_version(&self, version: u32) -> Result<()> {
        self.conn
            .execute(schema::SET_VERSION_SQL, params![version.to_string()])
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn persisted_dimension(&self) -> Result<Option<usize>> {
        let dim: Option<String> = self
            .conn
            .query_row(schema::GET_DIMENSION_SQL, [], |row| row.get(0))
            .optional()
            .map_err(StorageError::from)?;
        Ok(dim.and_then(|v| v.parse().ok()))
    }

    /// Looks up or registers the project for a root path.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn get_or_create_project(&mut self, root: &Path, label: &str) -> Result<i64> {
        let root_str = root.display().to_string();
        let now = now_ms();
        self.conn
            .execute(
                r"
            INSERT INTO projects (root_path, label, created_at, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(root_path) DO UPDATE SET updated_at = excluded.updated_at
        ",
                params![root_str, label, now, now],
            )
            .map_err(StorageError::from)?;
        let id: i64 = self
            .conn
            .query_row(
                "SELECT id FROM projects WHERE root_path = ?",
                params![root_str],
                |row| row.get(0),
            )
            .map_err(StorageError::from)?;
        Ok(id)
    }

    /// Project id for a root path, if registered.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn project_id(&self, root: &Path) -> Result<Option<i64>> {
        self.conn
            .query_row(
                "SELECT id FROM projects WHERE root_path = ?",
                params![root.display().to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Embeds texts through the cache, charging cache misses against the
    /// project's daily token budget.
    ///
    /// Cache keys are `sha256(model:text)`; entries with a stale dimension
    /// (model swap reusing a name) are recomputed.
    ///
    /// # Errors
    ///
    /// Returns an error on embedding or store failure.
    pub fn embed_cached(&mut self, texts: &[&str], project_id: i64) -> Result<Vec<Vec<f32>>> {
        let model = self.embedder.model().to_string();
        let dim = self.embedder.dimensions();
        let mut out: Vec<Option<Vec<f32>>> = vec![None; texts.len()];
        let mut misses: Vec<usize> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            let key = sha256_hex_str(&format!("{model}:{text}"));
            let cached: Option<(Vec<u8>, i64)> = self
                .conn
                .query_row(
                    "SELECT embedding, dimensions FROM embedding_cache WHERE cache_key = ?",
                    params![key],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()
                .map_err(StorageError::from)?;
            match cached {
                Some((bytes, d)) if d as usize == dim => {
                    out[i] = Some(embedding::bytes_to_vector(&bytes, dim)?);
                }
                _ => misses.push(i),
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<&str> = misses.iter().map(|&i| texts[i]).collect();
            let vectors = self.embedder.embed_batch(&miss_texts)?;
            let now = now_ms();
            let mut tokens = 0usize;
            for (&i, vector) in misses.iter().zip(vectors) {
                if vector.len() != dim {
                    return Err(StorageError::DimensionMismatch {
                        expected: dim,
                        actual: vector.len(),
                    }
                    .into());
                }
                let key = sha256_hex_str(&format!("{model}:{}", texts[i]));
                self.conn
                    .execute(
                        r"
                    INSERT OR REPLACE INTO embedding_cache
                        (cache_key, embedding, dimensions, created_at)
                    VALUES (?, ?, ?, ?)
                ",
                        params![
                            key,
                            embedding::vector_to_bytes(&vector),
                            dim as i64,
                            now
                        ],
                    )
                    .map_err(StorageError::from)?;
                tokens += embedding::estimate_tokens(texts[i]);
                out[i] = Some(vector);
            }
            self.charge_tokens(project_id, tokens)?;
        }

        Ok(out.into_iter().flatten().collect())
    }

    /// Adds to the project's token counter for the current UTC day. The
    /// day key rolls over at midnight UTC; prior days stop being read.
    fn charge_tokens(&self, project_id: i64, tokens: usize) -> Result<()> {
        if tokens == 0 {
            return Ok(());
        }
        let day = Utc::now().format("%Y-%m-%d").to_string();
        self.conn
            .execute(
                r"
            INSERT INTO token_budget (project_id, day, tokens)
            VALUES (?, ?, ?)
            ON CONFLICT(project_id, day) DO UPDATE SET tokens = tokens + excluded.tokens
        ",
                params![project_id, day, tokens as i64],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Tokens spent today for a project.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn tokens_today(&self, project_id: i64) -> Result<i64> {
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let tokens: Option<i64> = self
            .conn
            .query_row(
                "SELECT tokens FROM token_budget WHERE project_id = ? AND day = ?",
                params![project_id, day],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?;
        Ok(tokens.unwrap_or(0))
    }

    /// Total chunk count (status output).
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn chunk_count(&self) -> Result<i64> {
        self.conn
            .query_row("SELECT COUNT(*) FROM chunks", [], |row| row.get(0))
            .map_err(|e| StorageError::from(e).into())
    }
}

impl MemoryStore for SqliteMemory {
    fn ingest(
        &mut self,
        project_root: &Path,
        path_in_project: &str,
        text: &str,
        meta: &serde_json::Value,
    ) -> Result<IngestReceipt> {
        self.ingest_document(project_root, path_in_project, text, meta)
    }

    fn search(&mut self, query: &SearchQuery) -> Result<SearchResponse> {
        self.search_documents(query)
    }

    fn delete_by_path(&mut self, project_root: &Path, path: &str) -> Result<usize> {
        let Some(project_id) = self.project_id(project_root)? else {
            return Ok(0);
        };
        let deleted = self
            .conn
            .execute(
                "DELETE FROM chunks WHERE project_id = ? AND path = ?",
                params![project_id, path],
            )
            .map_err(StorageError::from)?;
        Ok(deleted)
    }

    fn reindex(&mut self, project_root: &Path) -> Result<usize> {
        let Some(project_id) = self.project_id(project_root)? else {
            return Ok(0);
        };
        let rows: Vec<(i64, String)> = {
            let mut stmt = self
                .conn
                .prepare("SELECT id, chunk_text FROM chunks WHERE project_id = ?")
                .map_err(StorageError::from)?;
            let mapped = stmt
                .query_map(params![project_id], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })
                .map_err(StorageError::from)?;
            mapped
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(StorageError::from)?
        };

        let texts: Vec<&str> = rows.iter().map(|(_, t)| t.as_str()).collect();
        let vectors = self.embed_cached(&texts, project_id)?;
        let now = now_ms();
        for ((id, _), vector) in rows.iter().zip(vectors) {
            self.conn
                .execute(
                    "UPDATE chunks SET embedding = ?, dimensions = ?, updated_at = ? WHERE id = ?",
                    params![
                        embedding::vector_to_bytes(&vector),
                        vector.len() as i64,
                        now,
                        id
                    ],
                )
                .map_err(StorageError::from)?;
        }
        Ok(rows.len())
    }

    fn list_projects(&self) -> Result<Vec<ProjectRecord>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT p.id, p.root_path, p.label,
                   (SELECT COUNT(DISTINCT path) FROM chunks c WHERE c.project_id = p.id)
            FROM projects p
            ORDER BY p.id
        ",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok(ProjectRecord {
                    id: row.get(0)?,
                    root_path: row.get(1)?,
                    label: row.get(2)?,
                    doc_count: row.get(3)?,
                })
            })
            .map_err(StorageError::from)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StorageError::from(e).into())
    }

    fn record_feedback(
        &mut self,
        chunk_id: i64,
        helpful: bool,
        context: Option<&str>,
    ) -> Result<()> {
        let exists: Option<i64> = self
            .conn
            .query_row(
                "SELECT id FROM chunks WHERE id = ?",
                params![chunk_id],
                |row| row.get(0),
            )
            .optional()
            .map_err(StorageError::from)?;
        if exists.is_none() {
            return Err(StorageError::ChunkNotFound { id: chunk_id }.into());
        }
        self.conn
            .execute(
                "INSERT INTO feedback (chunk_id, helpful, context, created_at) VALUES (?, ?, ?, ?)",
                params![chunk_id, i64::from(helpful), context, now_ms()],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    fn top_helpful(&self, limit: usize, min_feedback: i64) -> Result<Vec<HelpfulChunk>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT c.id, c.project_id, c.path,
                   SUM(f.helpful) AS helpful_count,
                   COUNT(f.id) AS total
            FROM chunks c
            JOIN feedback f ON f.chunk_id = c.id
            GROUP BY c.id
            HAVING total >= ?
            ORDER BY CAST(helpful_count AS REAL) / total DESC, total DESC, c.id ASC
            LIMIT ?
        ",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![min_feedback, limit as i64], |row| {
                let helpful_count: i64 = row.get(3)?;
                let total: i64 = row.get(4)?;
                #[allow(clippy::cast_precision_loss)]
                let ratio = if total == 0 {
                    0.0
                } else {
                    helpful_count as f64 / total as f64
                };
                Ok(HelpfulChunk {
                    chunk_id: row.get(0)?,
                    project_id: row.get(1)?,
                    path: row.get(2)?,
                    helpful_count,
                    total_feedback: total,
                    ratio,
                })
            })
            .map_err(StorageError::from)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StorageError::from(e).into())
    }
}
