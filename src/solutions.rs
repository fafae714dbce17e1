//! Solution (fixpack) registry and pattern linkage.
//!
//! A solution is a reusable remediation template: error signatures
//! (embedded for similarity matching), ordered steps, and validation
//! checks. Patterns derived from chunk tags link to solutions with
//! success counters; links with enough applications and a high success
//! rate are "golden paths". The registry never executes anything;
//! `preview` is a dry-run expansion for the host.

// SQLite stores all integers as i64; casts here are non-negative counts.
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_precision_loss)]

use crate::error::{Result, StorageError, ValidationError};
use crate::memory::SqliteMemory;
use crate::memory::embedding::{bytes_to_vector, cosine_similarity, vector_to_bytes};
use crate::project::now_ms;
use rusqlite::{OptionalExtension, params};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Closed category set for solutions and pattern categories.
pub const SOLUTION_CATEGORIES: &[&str] = &[
    "build",
    "runtime",
    "deploy",
    "workspace",
    "tsconfig",
    "migration",
    "test",
    "security",
    "performance",
    "devops",
];

/// Closed kind set for remediation steps.
pub const STEP_KINDS: &[&str] = &["cmd", "patch", "copy", "script", "env"];

/// Ranking weight on the pattern success rate.
const PATTERN_WEIGHT_SUCCESS: f64 = 0.60;
/// Ranking weight on the application count (saturating at 10).
const PATTERN_WEIGHT_APPLICATIONS: f64 = 0.30;
/// Ranking weight on the average helpful ratio.
const PATTERN_WEIGHT_HELPFUL: f64 = 0.10;

/// Minimum chunks carrying a tag before it counts as a pattern.
const PATTERN_MIN_DOCUMENTS: i64 = 3;

/// Minimum normalized overlap between a pattern tag and the query tokens.
const PATTERN_MIN_OVERLAP: f64 = 0.10;

/// A stored solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Solution {
    /// Solution id.
    pub id: i64,
    /// Short title.
    pub title: String,
    /// What the solution does and when to use it.
    pub description: String,
    /// One of [`SOLUTION_CATEGORIES`].
    pub category: String,
    /// Component the solution applies to.
    pub component: Option<String>,
    /// Free-form tags.
    pub tags: Vec<String>,
    /// Origin project, when project-specific.
    pub project_root: Option<String>,
    /// Origin repository name.
    pub repo_name: Option<String>,
    /// Package manager the steps assume.
    pub package_manager: Option<String>,
    /// Monorepo tool the steps assume.
    pub monorepo_tool: Option<String>,
    /// Successful applications.
    pub success_count: i64,
    /// Failed applications.
    pub failure_count: i64,
    /// Epoch ms of the last application.
    pub last_applied_at: Option<i64>,
    /// Version/date stamp of the last manual verification.
    pub verified_on: Option<String>,
    /// Creation time (epoch ms).
    pub created_at: i64,
    /// Last update time (epoch ms).
    pub updated_at: i64,
}

/// An ordered remediation step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    /// Position within the solution.
    pub order: i64,
    /// One of [`STEP_KINDS`].
    pub kind: String,
    /// Command line, patch body, file pair, script, or env assignment.
    pub payload: String,
    /// Optional human description.
    pub description: Option<String>,
    /// Execution timeout in milliseconds.
    pub timeout_ms: Option<i64>,
}

/// A post-application validation check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckSpec {
    /// Position within the solution.
    pub order: i64,
    /// Command to run.
    pub cmd: String,
    /// Substring expected in the output.
    pub expect_substring: Option<String>,
    /// Expected exit code (default 0).
    #[serde(default)]
    pub expect_exit_code: i64,
    /// Execution timeout in milliseconds.
    pub timeout_ms: Option<i64>,
}

/// An error signature supplied at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureInput {
    /// Representative error text (embedded).
    pub text: String,
    /// Optional confirming regexes.
    #[serde(default)]
    pub regexes: Vec<String>,
}

/// Input shape for `create_solution` / `solution_upsert`.
#[derive(Debug, Clone, Deserialize)]
pub struct SolutionInput {
    /// Short title.
    pub title: String,
    /// Description.
    pub description: String,
    /// One of [`SOLUTION_CATEGORIES`].
    pub category: String,
    /// Component.
    #[serde(default)]
    pub component: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Origin project root.
    #[serde(default)]
    pub project_root: Option<String>,
    /// Origin repository name.
    #[serde(default)]
    pub repo_name: Option<String>,
    /// Package manager.
    #[serde(default)]
    pub package_manager: Option<String>,
    /// Monorepo tool.
    #[serde(default)]
    pub monorepo_tool: Option<String>,
    /// Verification stamp.
    #[serde(default)]
    pub verified_on: Option<String>,
    /// Error signatures.
    #[serde(default)]
    pub signatures: Vec<SignatureInput>,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Ordered checks.
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

/// A solution with similarity and optional expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionMatch {
    /// The solution.
    #[serde(flatten)]
    pub solution: Solution,
    /// Query similarity, when produced by a search.
    pub similarity: Option<f64>,
    /// Ordered steps (when requested).
    #[serde(default)]
    pub steps: Vec<Step>,
    /// Ordered checks (when requested).
    #[serde(default)]
    pub checks: Vec<CheckSpec>,
}

/// Filters for `find_solutions`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SolutionFilters {
    /// Keep global solutions plus this project's.
    pub project_root: Option<String>,
    /// Category filter.
    pub category: Option<String>,
    /// Component filter.
    pub component: Option<String>,
    /// Package manager filter.
    pub package_manager: Option<String>,
    /// Monorepo tool filter.
    pub monorepo_tool: Option<String>,
}

/// A detected pattern with its best solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternMatch {
    /// Pattern tag (first tag on the contributing chunks).
    pub pattern_tag: String,
    /// Pattern category (aligned with solution categories).
    pub pattern_category: String,
    /// Normalized overlap with the query's token set.
    pub match_score: f64,
    /// Linked solutions.
    pub solution_count: i64,
    /// Best linked solution, if any.
    pub top_solution_id: Option<i64>,
    /// Its title.
    pub top_solution_title: Option<String>,
    /// Its pattern success rate.
    pub top_solution_success_rate: Option<f64>,
}

/// A pattern↔solution link with a proven track record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GoldenPath {
    /// Pattern tag.
    pub pattern_tag: String,
    /// Pattern category.
    pub pattern_category: String,
    /// Linked solution.
    pub solution_id: i64,
    /// Its title.
    pub solution_title: String,
    /// `success / (success + failure)` on the link.
    pub success_rate: f64,
    /// Total applications on the link.
    pub applications: i64,
    /// Average helpful ratio of the pattern's chunks.
    pub avg_helpful_ratio: f64,
    /// Distinct project roots across the pattern's linked solutions.
    pub projects_count: i64,
}

/// Dry-run expansion of a solution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolutionPreview {
    /// Steps with placeholders substituted.
    pub steps: Vec<Step>,
    /// Checks with placeholders substituted.
    pub checks: Vec<CheckSpec>,
}

impl SqliteMemory {
    /// Atomically inserts a solution with its signatures, steps, and
    /// checks. Signatures are embedded at creation.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an unknown category or step kind.
    pub fn create_solution(&mut self, input: &SolutionInput) -> Result<i64> {
        if !SOLUTION_CATEGORIES.contains(&input.category.as_str()) {
            return Err(ValidationError::Invalid {
                message: format!("unknown solution category: {}", input.category),
            }
            .into());
        }
        for step in &input.steps {
            if !STEP_KINDS.contains(&step.kind.as_str()) {
                return Err(ValidationError::Invalid {
                    message: format!("unknown step kind: {}", step.kind),
                }
                .into());
            }
        }

        let signature_texts: Vec<&str> =
            input.signatures.iter().map(|s| s.text.as_str()).collect();
        let embeddings = self.embed_cached(&signature_texts, 0)?;

        let now = now_ms();
        let tags = serde_json::to_string(&input.tags).map_err(StorageError::from)?;
        let tx = self.conn.transaction().map_err(StorageError::from)?;
        tx.execute(
            r"
            INSERT INTO solutions (
                title, description, category, component, tags, project_root,
                repo_name, package_manager, monorepo_tool, verified_on,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ",
            params![
                input.title,
                input.description,
                input.category,
                input.component,
                tags,
                input.project_root,
                input.repo_name,
                input.package_manager,
                input.monorepo_tool,
                input.verified_on,
                now,
                now
            ],
        )
        .map_err(StorageError::from)?;
        let solution_id = tx.last_insert_rowid();

        for (signature, embedding) in input.signatures.iter().zip(embeddings) {
            let regexes = serde_json::to_string(&signature.regexes).map_err(StorageError::from)?;
            tx.execute(
                "INSERT INTO signatures (solution_id, text, regexes, embedding) VALUES (?, ?, ?, ?)",
                params![
                    solution_id,
                    signature.text,
                    regexes,
                    vector_to_bytes(&embedding)
                ],
            )
            .map_err(StorageError::from)?;
        }
        for (i, step) in input.steps.iter().enumerate() {
            tx.execute(
                r"
                INSERT INTO steps (solution_id, ord, kind, payload, description, timeout_ms)
                VALUES (?, ?, ?, ?, ?, ?)
            ",
                params![
                    solution_id,
                    i as i64,
                    step.kind,
                    step.payload,
                    step.description,
                    step.timeout_ms
                ],
            )
            .map_err(StorageError::from)?;
        }
        for (i, check) in input.checks.iter().enumerate() {
            tx.execute(
                r"
                INSERT INTO checks (solution_id, ord, cmd, expect_substring, expect_exit_code, timeout_ms)
                VALUES (?, ?, ?, ?, ?, ?)
            ",
                params![
                    solution_id,
                    i as i64,
                    check.cmd,
                    check.expect_substring,
                    check.expect_exit_code,
                    check.timeout_ms
                ],
            )
            .map_err(StorageError::from)?;
        }
        tx.commit().map_err(StorageError::from)?;
        Ok(solution_id)
    }

    /// Fetches a solution, optionally with its ordered steps and checks.
    ///
    /// # Errors
    ///
    /// Returns `SolutionNotFound` for an unknown id.
    pub fn get_solution(&self, id: i64, include_steps: bool) -> Result<SolutionMatch> {
        let solution = self
            .solution_row(id)?
            .ok_or(StorageError::SolutionNotFound { id })?;
        let (steps, checks) = if include_steps {
            (self.solution_steps(id)?, self.solution_checks(id)?)
        } else {
            (Vec::new(), Vec::new())
        };
        Ok(SolutionMatch {
            solution,
            similarity: None,
            steps,
            checks,
        })
    }

    /// Finds solutions whose error signatures are similar to the given
    /// error text.
    ///
    /// Ordered by similarity, then `success_count`, then `verified_on`.
    ///
    /// # Errors
    ///
    /// Returns an error on store or embedding failure.
    pub fn find_solutions(
        &mut self,
        error_text: &str,
        filters: &SolutionFilters,
        limit: usize,
    ) -> Result<Vec<SolutionMatch>> {
        let query_vec = self
            .embed_cached(&[error_text], 0)?
            .into_iter()
            .next()
            .ok_or_else(|| StorageError::Database("empty embedding batch".to_string()))?;

        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT s.id, g.embedding, g.dimensions_hint
            FROM solutions s
            JOIN (SELECT solution_id, embedding, length(embedding) / 4 AS dimensions_hint
                  FROM signatures) g ON g.solution_id = s.id
            WHERE (?1 IS NULL OR s.project_root IS NULL OR s.project_root = ?1)
              AND (?2 IS NULL OR s.category = ?2)
              AND (?3 IS NULL OR s.component = ?3)
              AND (?4 IS NULL OR s.package_manager = ?4)
              AND (?5 IS NULL OR s.monorepo_tool = ?5)
        ",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(
                params![
                    filters.project_root,
                    filters.category,
                    filters.component,
                    filters.package_manager,
                    filters.monorepo_tool
                ],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Vec<u8>>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .map_err(StorageError::from)?;

        // Best signature similarity per solution
        let mut best: std::collections::HashMap<i64, f64> = std::collections::HashMap::new();
        for row in rows {
            let (solution_id, embedding, dim) = row.map_err(StorageError::from)?;
            let vector = bytes_to_vector(&embedding, dim as usize)?;
            let similarity = f64::from(cosine_similarity(&query_vec, &vector)).clamp(0.0, 1.0);
            let entry = best.entry(solution_id).or_insert(0.0);
            if similarity > *entry {
                *entry = similarity;
            }
        }
        drop(stmt);

        let mut matches = Vec::new();
        for (solution_id, similarity) in best {
            if let Some(solution) = self.solution_row(solution_id)? {
                matches.push(SolutionMatch {
                    solution,
                    similarity: Some(similarity),
                    steps: Vec::new(),
                    checks: Vec::new(),
                });
            }
        }
        matches.sort_by(|a, b| {
            b.similarity
                .unwrap_or(0.0)
                .total_cmp(&a.similarity.unwrap_or(0.0))
                .then_with(|| b.solution.success_count.cmp(&a.solution.success_count))
                .then_with(|| b.solution.verified_on.cmp(&a.solution.verified_on))
                .then_with(|| a.solution.id.cmp(&b.solution.id))
        });
        matches.truncate(limit);
        Ok(matches)
    }

    /// Records an application outcome and stamps `last_applied_at`.
    ///
    /// # Errors
    ///
    /// Returns `SolutionNotFound` for an unknown id.
    pub fn record_application(&mut self, id: i64, success: bool) -> Result<()> {
        let column = if success {
            "success_count"
        } else {
            "failure_count"
        };
        let changed = self
            .conn
            .execute(
                &format!(
                    "UPDATE solutions SET {column} = {column} + 1, last_applied_at = ?, updated_at = ? WHERE id = ?"
                ),
                params![now_ms(), now_ms(), id],
            )
            .map_err(StorageError::from)?;
        if changed == 0 {
            return Err(StorageError::SolutionNotFound { id }.into());
        }
        Ok(())
    }

    /// Expands a solution's steps and checks with placeholders
    /// substituted. Dry run only; nothing is executed.
    ///
    /// # Errors
    ///
    /// Returns `SolutionNotFound` for an unknown id.
    pub fn preview_solution(
        &self,
        id: i64,
        project_root: Option<&Path>,
    ) -> Result<SolutionPreview> {
        let matched = self.get_solution(id, true)?;
        let root = project_root.map_or_else(
            || {
                matched
                    .solution
                    .project_root
                    .clone()
                    .unwrap_or_else(|| ".".to_string())
            },
            |p| p.display().to_string(),
        );
        let package_manager = matched
            .solution
            .package_manager
            .clone()
            .unwrap_or_else(|| "npm".to_string());
        let monorepo_tool = matched
            .solution
            .monorepo_tool
            .clone()
            .unwrap_or_else(|| "none".to_string());

        let substitute = |text: &str| {
            text.replace("${PROJECT_ROOT}", &root)
                .replace("${PACKAGE_MANAGER}", &package_manager)
                .replace("${MONOREPO_TOOL}", &monorepo_tool)
        };

        Ok(SolutionPreview {
            steps: matched
                .steps
                .into_iter()
                .map(|mut step| {
                    step.payload = substitute(&step.payload);
                    step
                })
                .collect(),
            checks: matched
                .checks
                .into_iter()
                .map(|mut check| {
                    check.cmd = substitute(&check.cmd);
                    check
                })
                .collect(),
        })
    }

    /// Upserts a pattern↔solution link, incrementing the outcome counter
    /// and refreshing the pattern's average helpful ratio.
    ///
    /// # Errors
    ///
    /// Returns `SolutionNotFound` for an unknown solution.
    pub fn link_pattern_to_solution(
        &mut self,
        pattern_tag: &str,
        pattern_category: &str,
        solution_id: i64,
        success: bool,
    ) -> Result<()> {
        if self.solution_row(solution_id)?.is_none() {
            return Err(StorageError::SolutionNotFound { id: solution_id }.into());
        }
        let helpful_ratio = self.tag_helpful_ratio(pattern_tag)?;
        let (success_inc, failure_inc) = if success { (1, 0) } else { (0, 1) };
        self.conn
            .execute(
                r"
            INSERT INTO pattern_links
                (pattern_tag, pattern_category, solution_id, success_count, failure_count, avg_helpful_ratio)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (pattern_tag, pattern_category, solution_id) DO UPDATE SET
                success_count = success_count + excluded.success_count,
                failure_count = failure_count + excluded.failure_count,
                avg_helpful_ratio = excluded.avg_helpful_ratio
        ",
                params![
                    pattern_tag,
                    pattern_category,
                    solution_id,
                    success_inc,
                    failure_inc,
                    helpful_ratio
                ],
            )
            .map_err(StorageError::from)?;
        Ok(())
    }

    /// Solutions linked to a pattern, ranked by
    /// `0.60·success_rate + 0.30·min(1, applications/10) + 0.10·avg_helpful_ratio`,
    /// ties broken by more applications.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn get_solutions_for_pattern(
        &self,
        pattern_tag: &str,
        pattern_category: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SolutionMatch>> {
        let links = self.pattern_links(pattern_tag, pattern_category)?;
        let mut ranked: Vec<(f64, i64, i64)> = links
            .iter()
            .map(|link| {
                (
                    pattern_rank_score(
                        link.success_count,
                        link.failure_count,
                        link.avg_helpful_ratio,
                    ),
                    link.success_count + link.failure_count,
                    link.solution_id,
                )
            })
            .collect();
        ranked.sort_by(|a, b| {
            b.0.total_cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });

        let mut matches = Vec::new();
        for (_, _, solution_id) in ranked.into_iter().take(limit) {
            if let Some(solution) = self.solution_row(solution_id)? {
                matches.push(SolutionMatch {
                    solution,
                    similarity: None,
                    steps: Vec::new(),
                    checks: Vec::new(),
                });
            }
        }
        Ok(matches)
    }

    /// Links with at least `min_applications`, ordered by success rate
    /// then applications.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn get_golden_paths(
        &self,
        min_applications: i64,
        limit: usize,
    ) -> Result<Vec<GoldenPath>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT l.pattern_tag, l.pattern_category, l.solution_id, s.title,
                   l.success_count, l.failure_count, l.avg_helpful_ratio,
                   (SELECT COUNT(DISTINCT s2.project_root)
                    FROM pattern_links l2
                    JOIN solutions s2 ON s2.id = l2.solution_id
                    WHERE l2.pattern_tag = l.pattern_tag
                      AND s2.project_root IS NOT NULL)
            FROM pattern_links l
            JOIN solutions s ON s.id = l.solution_id
            WHERE l.success_count + l.failure_count >= ?
        ",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![min_applications], |row| {
                let success: i64 = row.get(4)?;
                let failure: i64 = row.get(5)?;
                let applications = success + failure;
                Ok(GoldenPath {
                    pattern_tag: row.get(0)?,
                    pattern_category: row.get(1)?,
                    solution_id: row.get(2)?,
                    solution_title: row.get(3)?,
                    success_rate: if applications == 0 {
                        0.0
                    } else {
                        success as f64 / applications as f64
                    },
                    applications,
                    avg_helpful_ratio: row.get(6)?,
                    projects_count: row.get(7)?,
                })
            })
            .map_err(StorageError::from)?;

        let mut paths: Vec<GoldenPath> = rows
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(StorageError::from)?;
        paths.sort_by(|a, b| {
            b.success_rate
                .total_cmp(&a.success_rate)
                .then_with(|| b.applications.cmp(&a.applications))
                .then_with(|| a.solution_id.cmp(&b.solution_id))
        });
        paths.truncate(limit);
        Ok(paths)
    }

    /// Detects patterns relevant to a query: tags carried by at least
    /// three chunks whose token overlap with the query is ≥ 0.10.
    ///
    /// # Errors
    ///
    /// Returns an error on store failure.
    pub fn pattern_detect(&mut self, query_text: &str, limit: usize) -> Result<Vec<PatternMatch>> {
        let query_tokens: std::collections::HashSet<String> = tokenize(query_text);

        // First tag on each chunk names its pattern; category aligns with
        // the solution categories
        let mut stmt = self
            .conn
            .prepare("SELECT tags, category FROM chunks WHERE tags != '[]'")
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
            })
            .map_err(StorageError::from)?;

        let mut counts: std::collections::HashMap<(String, String), i64> =
            std::collections::HashMap::new();
        for row in rows {
            let (tags_raw, category) = row.map_err(StorageError::from)?;
            let tags: Vec<String> = serde_json::from_str(&tags_raw).unwrap_or_default();
            let Some(first) = tags.first() else { continue };
            let category = category
                .filter(|c| SOLUTION_CATEGORIES.contains(&c.as_str()))
                .unwrap_or_else(|| "runtime".to_string());
            *counts.entry((first.clone(), category)).or_insert(0) += 1;
        }
        drop(stmt);

        let mut detected = Vec::new();
        for ((tag, category), count) in counts {
            if count < PATTERN_MIN_DOCUMENTS {
                continue;
            }
            let tag_tokens = tokenize(&tag);
            if tag_tokens.is_empty() {
                continue;
            }
            let overlap = tag_tokens.intersection(&query_tokens).count() as f64
                / tag_tokens.len() as f64;
            if overlap < PATTERN_MIN_OVERLAP {
                continue;
            }

            let top = self.get_solutions_for_pattern(&tag, Some(&category), 1)?;
            let links = self.pattern_links(&tag, Some(&category))?;
            let top_rate = top.first().and_then(|m| {
                links
                    .iter()
                    .find(|l| l.solution_id == m.solution.id)
                    .map(|l| success_rate(l.success_count, l.failure_count))
            });
            detected.push(PatternMatch {
                pattern_tag: tag,
                pattern_category: category,
                match_score: overlap,
                solution_count: links.len() as i64,
                top_solution_id: top.first().map(|m| m.solution.id),
                top_solution_title: top.first().map(|m| m.solution.title.clone()),
                top_solution_success_rate: top_rate,
            });
        }

        detected.sort_by(|a, b| {
            b.match_score
                .total_cmp(&a.match_score)
                .then_with(|| b.solution_count.cmp(&a.solution_count))
                .then_with(|| a.pattern_tag.cmp(&b.pattern_tag))
        });
        detected.truncate(limit);
        Ok(detected)
    }

    // ==================== internal ====================

    fn solution_row(&self, id: i64) -> Result<Option<Solution>> {
        self.conn
            .query_row(
                r"
            SELECT id, title, description, category, component, tags, project_root,
                   repo_name, package_manager, monorepo_tool, success_count,
                   failure_count, last_applied_at, verified_on, created_at, updated_at
            FROM solutions WHERE id = ?
        ",
                params![id],
                |row| {
                    let tags_raw: String = row.get(5)?;
                    Ok(Solution {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        description: row.get(2)?,
                        category: row.get(3)?,
                        component: row.get(4)?,
                        tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
                        project_root: row.get(6)?,
                        repo_name: row.get(7)?,
                        package_manager: row.get(8)?,
                        monorepo_tool: row.get(9)?,
                        success_count: row.get(10)?,
                        failure_count: row.get(11)?,
                        last_applied_at: row.get(12)?,
                        verified_on: row.get(13)?,
                        created_at: row.get(14)?,
                        updated_at: row.get(15)?,
                    })
                },
            )
            .optional()
            .map_err(|e| StorageError::from(e).into())
    }

    fn solution_steps(&self, id: i64) -> Result<Vec<Step>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ord, kind, payload, description, timeout_ms FROM steps WHERE solution_id = ? ORDER BY ord",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(Step {
                    order: row.get(0)?,
                    kind: row.get(1)?,
                    payload: row.get(2)?,
                    description: row.get(3)?,
                    timeout_ms: row.get(4)?,
                })
            })
            .map_err(StorageError::from)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StorageError::from(e).into())
    }

    fn solution_checks(&self, id: i64) -> Result<Vec<CheckSpec>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT ord, cmd, expect_substring, expect_exit_code, timeout_ms FROM checks WHERE solution_id = ? ORDER BY ord",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![id], |row| {
                Ok(CheckSpec {
                    order: row.get(0)?,
                    cmd: row.get(1)?,
                    expect_substring: row.get(2)?,
                    expect_exit_code: row.get(3)?,
                    timeout_ms: row.get(4)?,
                })
            })
            .map_err(StorageError::from)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StorageError::from(e).into())
    }

    fn pattern_links(
        &self,
        pattern_tag: &str,
        pattern_category: Option<&str>,
    ) -> Result<Vec<PatternLinkRow>> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT solution_id, success_count, failure_count, avg_helpful_ratio
            FROM pattern_links
            WHERE pattern_tag = ?1 AND (?2 IS NULL OR pattern_category = ?2)
        ",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![pattern_tag, pattern_category], |row| {
                Ok(PatternLinkRow {
                    solution_id: row.get(0)?,
                    success_count: row.get(1)?,
                    failure_count: row.get(2)?,
                    avg_helpful_ratio: row.get(3)?,
                })
            })
            .map_err(StorageError::from)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| StorageError::from(e).into())
    }

    /// Mean feedback ratio across chunks carrying a tag (0 when none).
    fn tag_helpful_ratio(&self, tag: &str) -> Result<f64> {
        let mut stmt = self
            .conn
            .prepare(
                r"
            SELECT (SELECT COALESCE(SUM(f.helpful), 0) FROM feedback f WHERE f.chunk_id = c.id),
                   (SELECT COUNT(*) FROM feedback f WHERE f.chunk_id = c.id)
            FROM chunks c
            WHERE c.tags LIKE '%' || ? || '%'
        ",
            )
            .map_err(StorageError::from)?;
        let rows = stmt
            .query_map(params![format!("\"{tag}\"")], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(StorageError::from)?;

        let mut ratios = Vec::new();
        for row in rows {
            let (helpful, total) = row.map_err(StorageError::from)?;
            if total > 0 {
                ratios.push(helpful as f64 / total as f64);
            }
        }
        if ratios.is_empty() {
            Ok(0.0)
        } else {
            Ok(ratios.iter().sum::<f64>() / ratios.len() as f64)
        }
    }
}

/// One pattern link row.
struct PatternLinkRow {
    solution_id: i64,
    success_count: i64,
    failure_count: i64,
    avg_helpful_ratio: f64,
}

/// `success / (success + failure)`, 0 when unapplied.
fn success_rate(success: i64, failure: i64) -> f64 {
    let total = success + failure;
    if total == 0 {
        0.0
    } else {
        success as f64 / total as f64
    }
}

/// Pattern ranking score per the calibrated weights.
fn pattern_rank_score(success: i64, failure: i64, avg_helpful_ratio: f64) -> f64 {
    let applications = (success + failure) as f64;
    PATTERN_WEIGHT_SUCCESS.mul_add(
        success_rate(success, failure),
        PATTERN_WEIGHT_APPLICATIONS.mul_add(
            (applications / 10.0).min(1.0),
            PATTERN_WEIGHT_HELPFUL * avg_helpful_ratio,
        ),
    )
}

/// Lowercase alphanumeric token set (hyphens and underscores split).
fn tokenize(text: &str) -> std::collections::HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}
