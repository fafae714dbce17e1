//! Hybrid search with feedback-weighted ranking.
//!
//! The combined score is
//! `0.60·vector + 0.30·bm25 + 0.10·time_decay + 0.15·feedback` (weights
//! configurable), computed over `2k` candidates; the outcome bonus from
//! `meta.outcome_status` is applied in application code before the final
//! re-sort. Rankings are deterministic for a fixed store state: ties break
//! by vector score, then recency, then chunk id.

use crate::config::{OutcomeBonus, SearchWeights};
use crate::error::{Result, StorageError};
use crate::hash::sha256_hex_str;
use crate::memory::embedding::{bytes_to_vector, cosine_similarity};
use crate::memory::{DEFAULT_K, MAX_K, QUERY_CACHE_TTL_MS, SqliteMemory};
use crate::project::now_ms;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Half-life of the time-decay term, in days.
const DECAY_HALF_LIFE_DAYS: f64 = 30.0;

/// A search request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchQuery {
    /// Project scope; `None` means global.
    pub project_root: Option<PathBuf>,
    /// Query text.
    pub query: String,
    /// Result count (0 = default, clamped to 20).
    pub k: usize,
    /// Search across all projects even when a root is given.
    pub global: bool,
    /// Component filter.
    pub component: Option<String>,
    /// Category filter.
    pub category: Option<String>,
    /// Tag-overlap filter (≥ 1 shared tag required when non-empty).
    pub tags: Vec<String>,
}

impl SearchQuery {
    /// Creates a query with defaults.
    #[must_use]
    pub fn new(query: &str) -> Self {
        Self {
            project_root: None,
            query: query.to_string(),
            k: DEFAULT_K,
            global: false,
            component: None,
            category: None,
            tags: Vec::new(),
        }
    }

    /// Scopes the query to a project.
    #[must_use]
    pub fn with_project(mut self, root: PathBuf) -> Self {
        self.project_root = Some(root);
        self
    }

    /// Sets the result count.
    #[must_use]
    pub const fn with_k(mut self, k: usize) -> Self {
        self.k = k;
        self
    }

    /// Enables global scope.
    #[must_use]
    pub const fn global(mut self) -> Self {
        self.global = true;
        self
    }

    /// Effective result count after defaulting and clamping.
    #[must_use]
    pub const fn effective_k(&self) -> usize {
        if self.k == 0 {
            DEFAULT_K
        } else if self.k > MAX_K {
            MAX_K
        } else {
            self.k
        }
    }
}

/// One ranked result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    /// Chunk id (required by the feedback tool).
    pub chunk_id: i64,
    /// Document path; prefixed with the project root in global scope.
    pub path: String,
    /// Chunk text.
    pub chunk: String,
    /// Final score.
    pub score: f64,
    /// Chunk metadata merged with the component scores.
    pub meta: serde_json::Value,
}

/// A complete search response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Ranked hits, best first.
    pub results: Vec<SearchHit>,
    /// Number of hits returned.
    pub total: usize,
    /// Project scope, when project-scoped.
    pub project_id: Option<i64>,
}

/// Weighted combination of the four ranking signals.
#[must_use]
pub fn combined_score(
    weights: &SearchWeights,
    vector: f64,
    bm25: f64,
    time_decay: f64,
    feedback: f64,
) -> f64 {
    weights
        .vector
        .mul_add(vector, weights.bm25.mul_add(bm25, weights.time.mul_add(time_decay, weights.feedback * feedback)))
}

/// Outcome bonus for a normalized `outcome_status` value.
#[must_use]
pub fn outcome_bonus(bonus: &OutcomeBonus, status: Option<&str>) -> f64 {
    match status {
        Some("success") => bonus.success,
        Some("failure") => bonus.failure,
        _ => 0.0,
    }
}

/// Exponential time decay with a 30-day half-life.
#[must_use]
pub fn time_decay(age_days: f64) -> f64 {
    (-(std::f64::consts::LN_2 / DECAY_HALF_LIFE_DAYS) * age_days.max(0.0)).exp()
}

/// Candidate row pulled from the store before scoring.
struct Candidate {
    chunk_id: i64,
    path: String,
    root_path: String,
    chunk_text: String,
    vector: Vec<f32>,
    tags: Vec<String>,
    meta: serde_json::Value,
    updated_at: i64,
    helpful: i64,
    total_feedback: i64,
}

impl SqliteMemory {
    /// Executes a hybrid search.
    ///
    /// # Errors
    ///
    /// Returns an error on store or embedding failure; an unregistered
    /// project scope yields an empty response instead.
    pub fn search_documents(&mut self, query: &SearchQuery) -> Result<SearchResponse> {
        let k = query.effective_k();
        let global = query.global || query.project_root.is_none();
        let project_id = if global {
            None
        } else {
            match query
                .project_root
                .as_ref()
                .map(|root| self.project_id(root))
                .transpose()?
                .flatten()
            {
                Some(id) => Some(id),
                None => {
                    return Ok(SearchResponse {
                        results: Vec::new(),
                        total: 0,
                        project_id: None,
                    });
                }
            }
        };

        let cache_key = self.query_cache_key(query, project_id, global, k);
        if let Some(cached) = self.cached_response(&cache_key)? {
            return Ok(cached);
        }

        let query_vec = self
            .embed_cached(&[query.query.as_str()], project_id.unwrap_or(0))?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::Database("empty embedding batch".to_string()))?;

        let candidates = self.fetch_candidates(query, project_id)?;
        let bm25 = self.bm25_scores(&query.query)?;

        let now = now_ms();
        let mut scored: Vec<(f64, f64, SearchHit)> = candidates
            .into_iter()
            .map(|c| self.score_candidate(c, &query_vec, &bm25, now, global))
            .collect();

        // Rank by combined score, keep 2k, then apply the outcome bonus
        scored.sort_by(|a, b| b.0.total_cmp(&a.0));
        scored.truncate(2 * k);
        let bonus = self.tuning.outcome_bonus;
        let mut finalists: Vec<(f64, i64, SearchHit)> = scored
            .into_iter()
            .map(|(combined, vector_score, mut hit)| {
                let status = hit.meta.get("outcome_status").and_then(|v| v.as_str());
                let applied = outcome_bonus(&bonus, status);
                let final_score = combined + applied;
                hit.score = final_score;
                if let Some(meta) = hit.meta.as_object_mut() {
                    meta.insert("outcome_bonus".to_string(), applied.into());
                }
                let updated_at = hit
                    .meta
                    .get("updated_at")
                    .and_then(serde_json::Value::as_i64)
                    .unwrap_or(0);
                (vector_score, updated_at, hit)
            })
            .collect();

        finalists.sort_by(|a, b| {
            b.2.score
                .total_cmp(&a.2.score)
                .then_with(|| b.0.total_cmp(&a.0))
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.chunk_id.cmp(&b.2.chunk_id))
        });
        finalists.truncate(k);

        let response = SearchResponse {
            total: finalists.len(),
            results: finalists.into_iter().map(|(_, _, hit)| hit).collect(),
            project_id,
        };
        self.cache_response(&cache_key, &response)?;
        Ok(response)
    }

    /// Builds a deterministic cache key for the query and scope.
    fn query_cache_key(
        &self,
        query: &SearchQuery,
        project_id: Option<i64>,
        global: bool,
        k: usize,
    ) -> String {
        let params = serde_json::json!({
            "q": query.query,
            "k": k,
            "global": global,
            "project": project_id,
            "component": query.component,
            "category": query.category,
            "tags": query.tags,
        });
        sha256_hex_str(&params.to_string())
    }

    fn cached_response(&self, key: &str) -> Result<Option<SearchResponse>> {
        let row: Option<(String, i64)> = self
            .conn
            .query_row(
                "SELECT result, created_at FROM query_cache WHERE cache_key = ?",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StorageError::from)?;
        match row {
            Some((raw, created_at)) if now_ms() - created_at < QUERY_CACHE_TTL_MS => {
                Ok(serde_json::from_str(&raw).ok())
            }
            _ => Ok(None),
        }
    }

    fn cache_response(&self, key: &str, response: &SearchResponse) -> Result<()> {
        let raw = serde_json::to_string(response).map_err(StorageError::from)?;
        let now = now_ms();
        self.conn
            .execute(
                "INSERT OR REPLACE INTO query_cache (cache_key, result, created_at) VALUES (?, ?, ?)",
                params![key, raw, now],
            )
            .map_err(StorageError::from)?;
        // Opportunistic purge of expired entries
        self.conn
            .execute(
                "DELETE FROM query_cache WHERE created_at < ?",
                params![now - QUERY_CACHE_TTL_MS],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Fetches scoped, filtered candidate rows with feedback aggregates.
    fn fetch_candidates(
        &self,
        query: &SearchQuery,
        project_id: Option<i64>,
    ) -> Result<Vec<Candidate>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT c.id, c.path, p.root_path, c.chunk_text, c.embedding, c.dimensions,
                   c.tags, c.meta, c.updated_at,
                   (SELECT COALESCE(SUM(f.helpful), 0) FROM feedback f WHERE f.chunk_id = c.id),
                   (SELECT COUNT(*) FROM feedback f WHERE f.chunk_id = c.id)
            FROM chunks c
            JOIN projects p ON p.id = c.project_id
            WHERE (?1 IS NULL OR c.project_id = ?1)
              AND (?2 IS NULL OR c.component = ?2)
              AND (?3 IS NULL OR c.category = ?3)
        ",
            )
            .map_err(StorageError::from)?;

        let rows = stmt
            .query_map(
                params![project_id, query.component, query.category],
                |row| {
                    let embedding: Vec<u8> = row.get(4)?;
                    let dimensions: i64 = row.get(5)?;
                    let tags_raw: String = row.get(6)?;
                    let meta_raw: String = row.get(7)?;
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        embedding,
                        dimensions,
                        tags_raw,
                        meta_raw,
                        row.get::<_, i64>(8)?,
                        row.get::<_, i64>(9)?,
                        row.get::<_, i64>(10)?,
                    ))
                },
            )
            .map_err(StorageError::from)?;

        let mut candidates = Vec::new();
        for row in rows {
            let (id, path, root_path, chunk_text, embedding, dimensions, tags_raw, meta_raw, updated_at, helpful, total) =
                row.map_err(StorageError::from)?;
            let vector = bytes_to_vector(&embedding, usize::try_from(dimensions).unwrap_or(0))?;
            let tags: Vec<String> = serde_json::from_str(&tags_raw).unwrap_or_default();
            if !query.tags.is_empty() && !query.tags.iter().any(|t| tags.contains(t)) {
                continue;
            }
            candidates.push(Candidate {
                chunk_id: id,
                path,
                root_path,
                chunk_text,
                vector,
                tags,
                meta: serde_json::from_str(&meta_raw).unwrap_or(serde_json::Value::Null),
                updated_at,
                helpful,
                total_feedback: total,
            });
        }
        Ok(candidates)
    }

    /// BM25 ranks from FTS5, min-max normalized to [0, 1] (best match 1).
    fn bm25_scores(&self, query_text: &str) -> Result<HashMap<i64, f64>> {
        let fts_query = fts_match_expression(query_text);
        if fts_query.is_empty() {
            return Ok(HashMap::new());
        }

        let mut stmt = self
            .conn
            .prepare("SELECT rowid, bm25(chunks_fts) FROM chunks_fts WHERE chunks_fts MATCH ?")
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![fts_query], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, f64>(1)?))
            })
            .map_err(StorageError::from)?;

        let raw: Vec<(i64, f64)> = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        if raw.is_empty() {
            return Ok(HashMap::new());
        }

        // bm25() is smaller-is-better; map best→1.0, worst→0.0
        let best = raw.iter().map(|(_, v)| *v).fold(f64::INFINITY, f64::min);
        let worst = raw.iter().map(|(_, v)| *v).fold(f64::NEG_INFINITY, f64::max);
        let span = worst - best;
        Ok(raw
            .into_iter()
            .map(|(id, v)| {
                let norm = if span > f64::EPSILON {
                    (worst - v) / span
                } else {
                    1.0
                };
                (id, norm)
            })
            .collect())
    }

    /// Computes the component scores for a candidate and builds its hit.
    fn score_candidate(
        &self,
        candidate: Candidate,
        query_vec: &[f32],
        bm25: &HashMap<i64, f64>,
        now: i64,
        global: bool,
    ) -> (f64, f64, SearchHit) {
        let vector_score =
            f64::from(cosine_similarity(query_vec, &candidate.vector)).clamp(0.0, 1.0);
        let bm25_score = bm25.get(&candidate.chunk_id).copied().unwrap_or(0.0);
        #[allow(clippy::cast_precision_loss)]
        let age_days = (now - candidate.updated_at).max(0) as f64 / 86_400_000.0;
        let time_score = time_decay(age_days);
        #[allow(clippy::cast_precision_loss)]
        let feedback_score = if candidate.total_feedback == 0 {
            0.0
        } else {
            candidate.helpful as f64 / candidate.total_feedback as f64
        };
        let combined = combined_score(
            &self.tuning.weights,
            vector_score,
            bm25_score,
            time_score,
            feedback_score,
        );

        let mut meta = match candidate.meta {
            serde_json::Value::Object(map) => map,
            _ => serde_json::Map::new(),
        };
        meta.insert("vector_score".to_string(), vector_score.into());
        meta.insert("bm25_score".to_string(), bm25_score.into());
        meta.insert("time_score".to_string(), time_score.into());
        meta.insert("feedback_score".to_string(), feedback_score.into());
        meta.insert("chunk_id".to_string(), candidate.chunk_id.into());
        meta.insert("updated_at".to_string(), candidate.updated_at.into());
        if !candidate.tags.is_empty() {
            meta.entry("tags".to_string()).or_insert_with(|| {
                serde_json::Value::Array(
                    candidate.tags.iter().cloned().map(Into::into).collect(),
                )
            });
        }

        let path = if global {
            format!("{}/{}", candidate.root_path, candidate.path)
        } else {
            candidate.path
        };

        (
            combined,
            vector_score,
            SearchHit {
                chunk_id: candidate.chunk_id,
                path,
                chunk: candidate.chunk_text,
                score: combined,
                meta: serde_json::Value::Object(meta),
            },
        )
    }
}

/// Builds an FTS5 MATCH expression: quoted tokens joined with OR.
fn fts_match_expression(query_text: &str) -> String {
    let tokens: Vec<String> = query_text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect();
    tokens.join(" OR ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::memory::MemoryStore;
    use std::path::Path;

    fn store() -> SqliteMemory {
        let mut store = SqliteMemory::in_memory(&Config::default()).unwrap();
        store.init().unwrap();
        store
    }

    fn ingest(s: &mut SqliteMemory, root: &str, path: &str, text: &str, meta: serde_json::Value) {
        s.ingest_document(Path::new(root), path, text, &meta).unwrap();
    }

    #[test]
    fn test_combined_score_formula() {
        let w = SearchWeights::default();
        // vector 0.80, bm25 0, time 1.0, feedback 0
        let base = combined_score(&w, 0.80, 0.0, 1.0, 0.0);
        assert!((base - 0.58).abs() < 1e-9);

        let bonus = OutcomeBonus::default();
        let success = base + outcome_bonus(&bonus, Some("success"));
        let failure = base + outcome_bonus(&bonus, Some("failure"));
        assert!((success - 0.68).abs() < 1e-9);
        assert!((failure - 0.53).abs() < 1e-9);
        assert!(success > failure);
    }

    #[test]
    fn test_outcome_bonus_unknown_is_zero() {
        let bonus = OutcomeBonus::default();
        assert!(outcome_bonus(&bonus, None).abs() < f64::EPSILON);
        assert!(outcome_bonus(&bonus, Some("unknown")).abs() < f64::EPSILON);
        assert!(outcome_bonus(&bonus, Some("weird")).abs() < f64::EPSILON);
    }

    #[test]
    fn test_time_decay_half_life() {
        assert!((time_decay(0.0) - 1.0).abs() < 1e-9);
        assert!((time_decay(30.0) - 0.5).abs() < 1e-9);
        assert!((time_decay(60.0) - 0.25).abs() < 1e-9);
        assert!((time_decay(-5.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_search_finds_ingested_text() {
        let mut s = store();
        ingest(
            &mut s,
            "/work/acme",
            "logs/digests/t1-1",
            "Chose rename-based queue claims over lock files.",
            serde_json::json!({"task_id": "t1", "outcome_status": "success"}),
        );

        let query = SearchQuery::new("rename queue claims")
            .with_project(PathBuf::from("/work/acme"))
            .with_k(5);
        let response = s.search(&query).unwrap();

        assert_eq!(response.total, 1);
        let hit = &response.results[0];
        assert!(hit.chunk.contains("rename-based"));
        assert_eq!(hit.meta["task_id"], "t1");
        assert!(hit.meta["vector_score"].is_number());
        assert!(hit.meta["bm25_score"].is_number());
        assert!(hit.meta["chunk_id"].is_number());
        assert!(hit.score > 0.0);
    }

    #[test]
    fn test_outcome_bonus_reorders_equal_candidates() {
        let mut s = store();
        let text = "Identical decision text about connection pooling strategy.";
        ingest(
            &mut s,
            "/p",
            "a.md",
            text,
            serde_json::json!({"outcome_status": "failure"}),
        );
        ingest(
            &mut s,
            "/p",
            "b.md",
            text,
            serde_json::json!({"outcome_status": "success"}),
        );

        let query = SearchQuery::new("connection pooling strategy")
            .with_project(PathBuf::from("/p"))
            .with_k(5);
        let response = s.search(&query).unwrap();

        assert_eq!(response.total, 2);
        assert_eq!(response.results[0].path, "b.md");
        assert_eq!(response.results[0].meta["outcome_status"], "success");
        assert!(response.results[0].score > response.results[1].score);
        // Scores are monotonically non-increasing
        assert!(response.results[0].score >= response.results[1].score);
    }

    #[test]
    fn test_k_clamping() {
        assert_eq!(SearchQuery::new("q").with_k(0).effective_k(), DEFAULT_K);
        assert_eq!(SearchQuery::new("q").with_k(50).effective_k(), MAX_K);
        assert_eq!(SearchQuery::new("q").with_k(3).effective_k(), 3);
    }

    #[test]
    fn test_unknown_project_scope_returns_empty() {
        let mut s = store();
        let query = SearchQuery::new("anything").with_project(PathBuf::from("/missing"));
        let response = s.search(&query).unwrap();
        assert_eq!(response.total, 0);
        assert!(response.project_id.is_none());
    }

    #[test]
    fn test_global_scope_prefixes_paths() {
        let mut s = store();
        ingest(
            &mut s,
            "/work/acme",
            "notes/a.md",
            "Global retrieval sanity content.",
            serde_json::Value::Null,
        );

        let query = SearchQuery::new("global retrieval sanity").global();
        let response = s.search(&query).unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].path, "/work/acme/notes/a.md");
        assert!(response.project_id.is_none());
    }

    #[test]
    fn test_component_and_tag_filters() {
        let mut s = store();
        ingest(
            &mut s,
            "/p",
            "src/api.rs",
            "Retry with exponential backoff in the API client.",
            serde_json::json!({"component": "api", "tags": ["retry", "http"]}),
        );
        ingest(
            &mut s,
            "/p",
            "src/db.rs",
            "Retry with exponential backoff in the DB pool.",
            serde_json::json!({"component": "db", "tags": ["retry", "postgres"]}),
        );

        let mut query = SearchQuery::new("exponential backoff retry")
            .with_project(PathBuf::from("/p"))
            .with_k(5);
        query.component = Some("api".to_string());
        let response = s.search(&query).unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].path, "src/api.rs");

        let mut query = SearchQuery::new("exponential backoff retry")
            .with_project(PathBuf::from("/p"))
            .with_k(5);
        query.tags = vec!["postgres".to_string()];
        let response = s.search(&query).unwrap();
        assert_eq!(response.total, 1);
        assert_eq!(response.results[0].path, "src/db.rs");

        query.tags = vec!["nomatch".to_string()];
        // Different tags → different cache key → fresh evaluation
        let response = s.search(&query).unwrap();
        assert_eq!(response.total, 0);
    }

    #[test]
    fn test_cache_transparency() {
        let mut s = store();
        ingest(
            &mut s,
            "/p",
            "a.md",
            "Cache transparency check content.",
            serde_json::Value::Null,
        );

        let query = SearchQuery::new("cache transparency check")
            .with_project(PathBuf::from("/p"))
            .with_k(5);
        let cold = s.search(&query).unwrap();
        let warm = s.search(&query).unwrap();

        assert_eq!(cold.total, warm.total);
        for (a, b) in cold.results.iter().zip(&warm.results) {
            assert_eq!(a.chunk_id, b.chunk_id);
            assert!((a.score - b.score).abs() < 1e-12);
            assert_eq!(a.path, b.path);
        }
    }

    #[test]
    fn test_feedback_lifts_ranking() {
        let mut s = store();
        let text = "Shared wording for the feedback ranking check.";
        ingest(&mut s, "/p", "a.md", text, serde_json::Value::Null);
        ingest(&mut s, "/p", "b.md", text, serde_json::Value::Null);
        // Equalize timestamps so the only differences are feedback and the
        // chunk-id tie-break
        s.conn
            .execute("UPDATE chunks SET updated_at = 1000", [])
            .unwrap();

        let query = SearchQuery::new("feedback ranking check")
            .with_project(PathBuf::from("/p"))
            .with_k(5);
        let before = s.search(&query).unwrap();
        assert_eq!(before.total, 2);
        // Baseline: a.md wins on the chunk-id tie-break
        assert_eq!(before.results[0].path, "a.md");

        let b_id = before
            .results
            .iter()
            .find(|h| h.path == "b.md")
            .map(|h| h.chunk_id)
            .unwrap();
        s.record_feedback(b_id, true, Some("solved it")).unwrap();

        // Same query would hit the cache; expire it manually
        s.conn
            .execute("DELETE FROM query_cache", [])
            .unwrap();
        let after = s.search(&query).unwrap();
        assert_eq!(after.results[0].path, "b.md");
    }

    #[test]
    fn test_fts_match_expression() {
        assert_eq!(fts_match_expression("hello world"), "\"hello\" OR \"world\"");
        assert_eq!(
            fts_match_expression("getaddrinfo ENOTFOUND!"),
            "\"getaddrinfo\" OR \"ENOTFOUND\""
        );
        assert_eq!(fts_match_expression("!!!"), "");
    }

    #[test]
    fn test_results_bounded_by_k() {
        let mut s = store();
        for i in 0..6 {
            ingest(
                &mut s,
                "/p",
                &format!("n{i}.md"),
                &format!("Bounded results probe number {i}."),
                serde_json::Value::Null,
            );
        }
        let query = SearchQuery::new("bounded results probe")
            .with_project(PathBuf::from("/p"))
            .with_k(3);
        let response = s.search(&query).unwrap();
        assert_eq!(response.total, 3);
        // Monotone non-increasing scores
        for pair in response.results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }
}
