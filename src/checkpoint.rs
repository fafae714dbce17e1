//! Working-tree checkpoints before risky operations.
//!
//! Snapshotting is delegated to a [`VersionControl`] collaborator; the
//! shipped implementation shells out to `git stash create`/`store`, which
//! snapshots without disturbing the working tree. Metadata lives as one
//! JSON file per checkpoint; the newest 20 are retained. Snapshot failure
//! is non-fatal; callers degrade to a warning.

use crate::error::{IoError, Result};
use crate::io::atomic_write_json;
use crate::project::now_ms;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;

/// Checkpoints retained per project.
const RETENTION: usize = 20;

/// Snapshot/restore seam to the external version-control collaborator.
pub trait VersionControl {
    /// Snapshots the working tree, returning an opaque ref.
    ///
    /// # Errors
    ///
    /// Returns an error when no snapshot could be taken.
    fn snapshot(&self, root: &Path, message: &str) -> Result<String>;

    /// Re-applies a previously taken snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot cannot be applied.
    fn restore(&self, root: &Path, stash_ref: &str) -> Result<()>;
}

/// Git-backed implementation using stash-create semantics.
pub struct GitStash;

impl GitStash {
    fn git(root: &Path, args: &[&str]) -> Result<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(root)
            .output()
            .map_err(|e| IoError::Generic(format!("git {}: {e}", args.join(" "))))?;
        if !output.status.success() {
            return Err(IoError::Generic(format!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            ))
            .into());
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

impl VersionControl for GitStash {
    fn snapshot(&self, root: &Path, message: &str) -> Result<String> {
        let commit = Self::git(root, &["stash", "create", message])?;
        if commit.is_empty() {
            // Clean tree: nothing to snapshot; HEAD is the checkpoint
            return Self::git(root, &["rev-parse", "HEAD"]);
        }
        // Anchor the dangling commit so gc cannot collect it
        Self::git(root, &["stash", "store", "-m", message, &commit])?;
        Ok(commit)
    }

    fn restore(&self, root: &Path, stash_ref: &str) -> Result<()> {
        Self::git(root, &["stash", "apply", stash_ref]).map(|_| ())
    }
}

/// Metadata for one checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    /// Checkpoint id (also the metadata file stem).
    pub checkpoint_id: String,
    /// Epoch milliseconds at creation.
    pub created_at: i64,
    /// What requested the snapshot (rule id or "periodic").
    pub trigger: String,
    /// Opaque ref from the version-control collaborator.
    pub stash_ref: String,
    /// Free-form metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Creates, lists, and restores checkpoints for one project.
pub struct CheckpointManager<'a> {
    dir: PathBuf,
    vcs: &'a dyn VersionControl,
}

impl<'a> CheckpointManager<'a> {
    /// Creates a manager over a metadata directory and VCS collaborator.
    #[must_use]
    pub fn new(dir: &Path, vcs: &'a dyn VersionControl) -> Self {
        Self {
            dir: dir.to_path_buf(),
            vcs,
        }
    }

    /// Takes a snapshot and records its metadata, pruning to retention.
    ///
    /// # Errors
    ///
    /// Returns an error when the snapshot or the metadata write fails;
    /// callers surface this as a warning, never a block.
    pub fn create(&self, root: &Path, trigger: &str) -> Result<CheckpointRecord> {
        let now = now_ms();
        let checkpoint_id = format!("ckpt-{now}");
        let stash_ref = self
            .vcs
            .snapshot(root, &format!("mnemon checkpoint: {trigger}"))?;

        let record = CheckpointRecord {
            checkpoint_id: checkpoint_id.clone(),
            created_at: now,
            trigger: trigger.to_string(),
            stash_ref,
            metadata: serde_json::Value::Null,
        };
        atomic_write_json(&self.dir.join(format!("{checkpoint_id}.json")), &record)?;
        self.prune();
        Ok(record)
    }

    /// Retained checkpoints, newest first.
    #[must_use]
    pub fn list(&self) -> Vec<CheckpointRecord> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut records: Vec<CheckpointRecord> = entries
            .flatten()
            .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
            .filter_map(|e| {
                let raw = std::fs::read_to_string(e.path()).ok()?;
                serde_json::from_str(&raw).ok()
            })
            .collect();
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.checkpoint_id.cmp(&a.checkpoint_id))
        });
        records
    }

    /// Looks up a checkpoint and asks the collaborator to re-apply it.
    ///
    /// # Errors
    ///
    /// Returns an error when the id is unknown or the restore fails.
    pub fn restore(&self, root: &Path, checkpoint_id: &str) -> Result<()> {
        let record = self
            .list()
            .into_iter()
            .find(|r| r.checkpoint_id == checkpoint_id)
            .ok_or_else(|| IoError::FileNotFound {
                path: format!("checkpoint {checkpoint_id}"),
            })?;
        self.vcs.restore(root, &record.stash_ref)
    }

    /// Deletes metadata beyond the retention window.
    fn prune(&self) {
        let records = self.list();
        for record in records.iter().skip(RETENTION) {
            let _ = std::fs::remove_file(
                self.dir.join(format!("{}.json", record.checkpoint_id)),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::TempDir;

    /// VCS stub recording calls.
    struct StubVcs {
        calls: RefCell<Vec<String>>,
        fail: bool,
    }

    impl StubVcs {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                fail: false,
            }
        }
    }

    impl VersionControl for StubVcs {
        fn snapshot(&self, _root: &Path, message: &str) -> Result<String> {
            if self.fail {
                return Err(IoError::Generic("not a git repository".to_string()).into());
            }
            self.calls.borrow_mut().push(format!("snapshot:{message}"));
            Ok(format!("ref-{}", self.calls.borrow().len()))
        }

        fn restore(&self, _root: &Path, stash_ref: &str) -> Result<()> {
            self.calls.borrow_mut().push(format!("restore:{stash_ref}"));
            Ok(())
        }
    }

    #[test]
    fn test_create_and_list() {
        let dir = TempDir::new().unwrap();
        let vcs = StubVcs::new();
        let manager = CheckpointManager::new(dir.path(), &vcs);

        let record = manager.create(dir.path(), "destructive-op").unwrap();
        assert!(record.checkpoint_id.starts_with("ckpt-"));
        assert_eq!(record.trigger, "destructive-op");

        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].stash_ref, record.stash_ref);
    }

    #[test]
    fn test_retention_keeps_latest_20() {
        let dir = TempDir::new().unwrap();
        let vcs = StubVcs::new();
        let manager = CheckpointManager::new(dir.path(), &vcs);

        // Write 25 records with distinct timestamps directly
        for i in 0..25i64 {
            let record = CheckpointRecord {
                checkpoint_id: format!("ckpt-{i:04}"),
                created_at: i,
                trigger: "periodic".to_string(),
                stash_ref: format!("ref-{i}"),
                metadata: serde_json::Value::Null,
            };
            atomic_write_json(
                &dir.path().join(format!("{}.json", record.checkpoint_id)),
                &record,
            )
            .unwrap();
        }
        manager.create(dir.path(), "periodic").unwrap();

        let listed = manager.list();
        assert_eq!(listed.len(), RETENTION);
        // Newest first; the oldest synthetic records were pruned
        assert!(listed.iter().all(|r| r.created_at >= 6));
    }

    #[test]
    fn test_restore_by_id() {
        let dir = TempDir::new().unwrap();
        let vcs = StubVcs::new();
        let manager = CheckpointManager::new(dir.path(), &vcs);

        let record = manager.create(dir.path(), "schema-edit").unwrap();
        manager.restore(dir.path(), &record.checkpoint_id).unwrap();

        let calls = vcs.calls.borrow();
        assert!(calls.iter().any(|c| c == &format!("restore:{}", record.stash_ref)));
    }

    #[test]
    fn test_restore_unknown_id() {
        let dir = TempDir::new().unwrap();
        let vcs = StubVcs::new();
        let manager = CheckpointManager::new(dir.path(), &vcs);
        let err = manager.restore(dir.path(), "ckpt-missing").unwrap_err();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_snapshot_failure_is_an_error_for_caller_to_degrade() {
        let dir = TempDir::new().unwrap();
        let vcs = StubVcs {
            calls: RefCell::new(Vec::new()),
            fail: true,
        };
        let manager = CheckpointManager::new(dir.path(), &vcs);
        assert!(manager.create(dir.path(), "destructive-op").is_err());
        assert!(manager.list().is_empty());
    }
}
