//! Project path resolution and clock.
//!
//! Every hook invocation is a fresh process; all state lives on disk under
//! the project root. This module is the single place that decides where.

use crate::error::{Error, IoError, Result};
use std::path::{Component, Path, PathBuf};

/// Resolved filesystem layout for one project.
///
/// ```text
/// <root>/.claude/logs/NOTES.md
/// <root>/.claude/logs/wsi.json
/// <root>/.claude/logs/file_hashes.json
/// <root>/.claude/logs/turn_counter.json
/// <root>/.claude/logs/checkpoints/
/// <root>/.claude/logs/auto_setup_errors.log
/// <root>/.claude/ingest-queue/
/// ```
#[derive(Debug, Clone)]
pub struct ProjectPaths {
    /// Absolute project root; the tenancy key everywhere.
    pub root: PathBuf,
    /// Basename of the root, used as the project label.
    pub label: String,
    /// Log directory (`LOGS_DIR` override honored).
    pub logs_dir: PathBuf,
    /// WSI snapshot path (`WSI_PATH` override honored).
    pub wsi_path: PathBuf,
    /// Duplicate-read hash cache.
    pub hashes_path: PathBuf,
    /// Turn counter file.
    pub turn_path: PathBuf,
    /// Append-only human digest log.
    pub notes_path: PathBuf,
    /// Checkpoint metadata directory.
    pub checkpoints_dir: PathBuf,
    /// Pending ingest jobs directory.
    pub queue_dir: PathBuf,
    /// Typecheck gate state.
    pub gate_path: PathBuf,
    /// Fail-open error log for the dispatcher.
    pub error_log_path: PathBuf,
    /// Embedded memory store location.
    pub db_path: PathBuf,
}

impl ProjectPaths {
    /// Resolves the layout for a project root.
    ///
    /// `project_dir` wins over the `PROJECT_DIR` environment variable,
    /// which wins over the current directory. `WSI_PATH` and `LOGS_DIR`
    /// override their derived locations; `VECTOR_STORE_URL` overrides the
    /// store path (a `file:` prefix is stripped).
    ///
    /// # Errors
    ///
    /// Returns a config error when no project root can be determined.
    pub fn resolve(project_dir: Option<&Path>) -> Result<Self> {
        let root = match project_dir {
            Some(dir) => dir.to_path_buf(),
            None => match std::env::var_os("PROJECT_DIR") {
                Some(dir) => PathBuf::from(dir),
                None => std::env::current_dir().map_err(|e| Error::Config {
                    message: format!("cannot determine project root: {e}"),
                })?,
            },
        };
        let root = normalize(&root);
        let label = root
            .file_name()
            .map_or_else(|| "project".to_string(), |n| n.to_string_lossy().into_owned());

        let claude_dir = root.join(".claude");
        let logs_dir = std::env::var_os("LOGS_DIR")
            .map_or_else(|| claude_dir.join("logs"), PathBuf::from);
        let wsi_path = std::env::var_os("WSI_PATH")
            .map_or_else(|| logs_dir.join("wsi.json"), PathBuf::from);

        let db_path = std::env::var("VECTOR_STORE_URL").ok().filter(|v| !v.is_empty()).map_or_else(
            default_db_path,
            |url| PathBuf::from(url.strip_prefix("file:").unwrap_or(&url)),
        );

        Ok(Self {
            label,
            hashes_path: logs_dir.join("file_hashes.json"),
            turn_path: logs_dir.join("turn_counter.json"),
            notes_path: logs_dir.join("NOTES.md"),
            checkpoints_dir: logs_dir.join("checkpoints"),
            queue_dir: claude_dir.join("ingest-queue"),
            gate_path: logs_dir.join("typecheck_gate.json"),
            error_log_path: logs_dir.join("auto_setup_errors.log"),
            logs_dir,
            wsi_path,
            db_path,
            root,
        })
    }

    /// Ensures the directories this layout writes into exist.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.logs_dir, &self.checkpoints_dir, &self.queue_dir] {
            std::fs::create_dir_all(dir).map_err(|e| IoError::DirectoryFailed {
                path: dir.display().to_string(),
                reason: e.to_string(),
            })?;
        }
        Ok(())
    }

    /// Makes `path` relative to the project root when it is inside it.
    ///
    /// Absolute paths outside the root and relative paths are returned as
    /// given (normalized); WSI keys must stay stable either way.
    #[must_use]
    pub fn relativize(&self, path: &Path) -> PathBuf {
        let normalized = normalize(path);
        normalized
            .strip_prefix(&self.root)
            .map_or(normalized.clone(), Path::to_path_buf)
    }
}

/// Lexically normalizes a path: resolves `.` and non-escaping `..`.
///
/// No filesystem access; symlinks are left alone on purpose (the host may
/// hand us paths into not-yet-created files).
#[must_use]
pub fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(Component::ParentDir);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Default location of the shared memory store.
fn default_db_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".mnemon")
        .join("memory.db")
}

/// Current wall-clock time as epoch milliseconds.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
