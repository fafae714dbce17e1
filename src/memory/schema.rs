//! Database schema for the embedded memory store.
//!
//! Contains SQL schema and migration plumbing for the mnemon `SQLite`
//! database: projects, chunks with an FTS5 lexical index, feedback,
//! solutions with signatures/steps/checks, pattern links, and the cache
//! tables (embedding, dedupe, query, token budget).

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

/// SQL schema for initial database setup.
pub const SCHEMA_SQL: &str = r"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Projects: tenancy keyed by absolute root path
CREATE TABLE IF NOT EXISTS projects (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    root_path TEXT NOT NULL UNIQUE,
    label TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Document chunks with embeddings
CREATE TABLE IF NOT EXISTS chunks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    project_id INTEGER NOT NULL,
    repo_name TEXT,
    path TEXT NOT NULL,
    chunk_text TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    component TEXT,
    category TEXT,
    tags TEXT NOT NULL DEFAULT '[]',       -- JSON array
    meta TEXT NOT NULL DEFAULT '{}',       -- JSON object
    content_sha256 TEXT NOT NULL,
    updated_at INTEGER NOT NULL,
    FOREIGN KEY (project_id) REFERENCES projects(id) ON DELETE CASCADE,
    UNIQUE (project_id, path, content_sha256)
);

CREATE INDEX IF NOT EXISTS idx_chunks_project ON chunks(project_id);
CREATE INDEX IF NOT EXISTS idx_chunks_path ON chunks(project_id, path);

-- FTS5 virtual table for BM25 lexical search
CREATE VIRTUAL TABLE IF NOT EXISTS chunks_fts USING fts5(
    chunk_text,
    content='chunks',
    content_rowid='id',
    tokenize='porter unicode61'
);

-- Triggers keep the FTS5 index in sync with the chunks table
CREATE TRIGGER IF NOT EXISTS chunks_ai AFTER INSERT ON chunks BEGIN
    INSERT INTO chunks_fts(rowid, chunk_text) VALUES (new.id, new.chunk_text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_ad AFTER DELETE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, chunk_text)
        VALUES('delete', old.id, old.chunk_text);
END;

CREATE TRIGGER IF NOT EXISTS chunks_au AFTER UPDATE ON chunks BEGIN
    INSERT INTO chunks_fts(chunks_fts, rowid, chunk_text)
        VALUES('delete', old.id, old.chunk_text);
    INSERT INTO chunks_fts(rowid, chunk_text) VALUES (new.id, new.chunk_text);
END;

-- Feedback records, many-to-one on chunks
CREATE TABLE IF NOT EXISTS feedback (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chunk_id INTEGER NOT NULL,
    helpful INTEGER NOT NULL,
    context TEXT,
    created_at INTEGER NOT NULL,
    FOREIGN KEY (chunk_id) REFERENCES chunks(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_feedback_chunk ON feedback(chunk_id);

-- Solutions (fixpacks)
CREATE TABLE IF NOT EXISTS solutions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    title TEXT NOT NULL,
    description TEXT NOT NULL,
    category TEXT NOT NULL,
    component TEXT,
    tags TEXT NOT NULL DEFAULT '[]',
    project_root TEXT,
    repo_name TEXT,
    package_manager TEXT,
    monorepo_tool TEXT,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    last_applied_at INTEGER,
    verified_on TEXT,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

-- Error signatures matched against solutions
CREATE TABLE IF NOT EXISTS signatures (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    solution_id INTEGER NOT NULL,
    text TEXT NOT NULL,
    regexes TEXT NOT NULL DEFAULT '[]',
    embedding BLOB NOT NULL,
    meta TEXT NOT NULL DEFAULT '{}',
    FOREIGN KEY (solution_id) REFERENCES solutions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_signatures_solution ON signatures(solution_id);

-- Ordered remediation steps
CREATE TABLE IF NOT EXISTS steps (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    solution_id INTEGER NOT NULL,
    ord INTEGER NOT NULL,
    kind TEXT NOT NULL,
    payload TEXT NOT NULL,
    description TEXT,
    timeout_ms INTEGER,
    FOREIGN KEY (solution_id) REFERENCES solutions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_steps_solution ON steps(solution_id, ord);

-- Validation checks run after applying a solution
CREATE TABLE IF NOT EXISTS checks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    solution_id INTEGER NOT NULL,
    ord INTEGER NOT NULL,
    cmd TEXT NOT NULL,
    expect_substring TEXT,
    expect_exit_code INTEGER NOT NULL DEFAULT 0,
    timeout_ms INTEGER,
    FOREIGN KEY (solution_id) REFERENCES solutions(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_checks_solution ON checks(solution_id, ord);

-- Pattern to solution links with outcome counters
CREATE TABLE IF NOT EXISTS pattern_links (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    pattern_tag TEXT NOT NULL,
    pattern_category TEXT NOT NULL,
    solution_id INTEGER NOT NULL,
    success_count INTEGER NOT NULL DEFAULT 0,
    failure_count INTEGER NOT NULL DEFAULT 0,
    avg_helpful_ratio REAL NOT NULL DEFAULT 0,
    FOREIGN KEY (solution_id) REFERENCES solutions(id) ON DELETE CASCADE,
    UNIQUE (pattern_tag, pattern_category, solution_id)
);

-- Embedding cache keyed by sha256(text) + model
CREATE TABLE IF NOT EXISTS embedding_cache (
    cache_key TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    created_at INTEGER NOT NULL
);

-- Ingest dedupe cache (48h TTL, enforced on read)
CREATE TABLE IF NOT EXISTS dedupe_cache (
    project_id INTEGER NOT NULL,
    content_sha256 TEXT NOT NULL,
    seen_at INTEGER NOT NULL,
    PRIMARY KEY (project_id, content_sha256)
);

-- Search result cache (5 min TTL, enforced on read)
CREATE TABLE IF NOT EXISTS query_cache (
    cache_key TEXT PRIMARY KEY,
    result TEXT NOT NULL,
    created_at INTEGER NOT NULL
);

-- Per-project daily embedding token budget
CREATE TABLE IF NOT EXISTS token_budget (
    project_id INTEGER NOT NULL,
    day TEXT NOT NULL,
    tokens INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (project_id, day)
);
";

/// SQL to check if schema is initialized.
pub const CHECK_SCHEMA_SQL: &str = r"
SELECT COUNT(*) FROM sqlite_master
WHERE type='table' AND name='schema_info';
";

/// SQL to get schema version.
pub const GET_VERSION_SQL: &str = r"
SELECT value FROM schema_info WHERE key = 'version';
";

/// SQL to set schema version.
pub const SET_VERSION_SQL: &str = r"
INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?);
";

/// SQL to get the store's fixed embedding dimension.
pub const GET_DIMENSION_SQL: &str = r"
SELECT value FROM schema_info WHERE key = 'embedding_dim';
";

/// SQL to set the store's fixed embedding dimension.
pub const SET_DIMENSION_SQL: &str = r"
INSERT OR REPLACE INTO schema_info (key, value) VALUES ('embedding_dim', ?);
";

/// Migrations from older schema versions.
pub struct Migration {
    /// Version this migration upgrades from.
    pub from_version: u32,
    /// Version this migration upgrades to.
    pub to_version: u32,
    /// SQL statements to execute.
    pub sql: &'static str,
}

/// Available migrations (none yet at schema v1).
pub const MIGRATIONS: &[Migration] = &[];

/// Gets migrations needed to upgrade from a version.
#[must_use]
pub fn get_migrations_from(current_version: u32) -> Vec<&'static Migration> {
    MIGRATIONS
        .iter()
        .filter(|m| m.from_version >= current_version && m.to_version <= CURRENT_SCHEMA_VERSION)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_version() {
        const _: () = assert!(CURRENT_SCHEMA_VERSION >= 1);
    }

    #[test]
    fn test_schema_sql_covers_all_tables() {
        for table in [
            "projects",
            "chunks",
            "chunks_fts",
            "feedback",
            "solutions",
            "signatures",
            "steps",
            "checks",
            "pattern_links",
            "embedding_cache",
            "dedupe_cache",
            "query_cache",
            "token_budget",
        ] {
            assert!(SCHEMA_SQL.contains(table), "schema missing table: {table}");
        }
    }

    #[test]
    fn test_migrations_ordered() {
        for migration in MIGRATIONS {
            assert!(migration.to_version > migration.from_version);
        }
    }

    #[test]
    fn test_get_migrations_from() {
        assert!(get_migrations_from(0).len() <= MIGRATIONS.len());
    }
}
