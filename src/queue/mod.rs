//! Durable on-disk ingest queue.
//!
//! One JSON file per pending job. Enqueue is temp-write + rename; claiming
//! is a rename into `inflight/`, which is the linearization point: on a
//! POSIX-like filesystem exactly one claimant wins and the loser sees
//! `NotFound`. Retry pushes the file back with its mtime bumped into the
//! future; the claim scan skips future mtimes, which is the whole backoff
//! mechanism.
//!
//! ```text
//! ingest-queue/
//!   <epoch_ms>-<rand>.json   pending
//!   inflight/<job_id>.json   claimed
//!   dead/<job_id>.json       permanent failure
//! ```

pub mod processor;

pub use processor::{DrainReport, QueueProcessor};

use crate::error::{IoError, Result};
use crate::hash::sha256_hex_str;
use crate::io::atomic_write;
use crate::project::now_ms;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// Base retry delay; doubled per attempt.
const BACKOFF_BASE_SECS: u64 = 30;

/// Backoff ceiling (10 minutes).
const BACKOFF_CAP_SECS: u64 = 600;

/// Age after which non-JSON garbage in the queue directory is swept.
const SWEEP_AGE: Duration = Duration::from_secs(3600);

/// Where a queued text came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobSource {
    /// Subagent DIGEST.
    Digest,
    /// Fixpack document.
    Fixpack,
    /// Plain document.
    Doc,
    /// Pre-compaction conversation summary.
    ConversationSummary,
}

/// One unit of pending ingest work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestJob {
    /// Unique id; also the file stem.
    pub job_id: String,
    /// Tenancy key for the memory store.
    pub project_root: PathBuf,
    /// Origin of the text.
    pub source: JobSource,
    /// Logical path recorded with the chunks.
    pub path_in_project: String,
    /// The text to ingest.
    pub text: String,
    /// Metadata carried onto every chunk.
    pub meta: serde_json::Value,
    /// Epoch milliseconds at enqueue time.
    pub enqueued_at: i64,
    /// Processing attempts so far.
    #[serde(default)]
    pub attempts: u32,
}

/// Per-process sequence disambiguating jobs created in the same
/// millisecond.
static JOB_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);

impl IngestJob {
    /// Creates a job with a fresh id.
    #[must_use]
    pub fn new(
        project_root: &Path,
        source: JobSource,
        path_in_project: &str,
        text: String,
        meta: serde_json::Value,
    ) -> Self {
        let now = now_ms();
        let seq = JOB_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Self {
            job_id: format!("{now}-{}", &sha256_hex_str(&format!(
                "{now}-{}-{seq}-{path_in_project}",
                std::process::id()
            ))[..8]),
            project_root: project_root.to_path_buf(),
            source,
            path_in_project: path_in_project.to_string(),
            text,
            meta,
            enqueued_at: now,
            attempts: 0,
        }
    }
}

/// A job moved to `inflight/`, exclusively owned by this processor.
#[derive(Debug)]
pub struct ClaimedJob {
    /// The parsed job.
    pub job: IngestJob,
    path: PathBuf,
}

/// Handle on a project's queue directory.
#[derive(Debug, Clone)]
pub struct IngestQueue {
    dir: PathBuf,
}

impl IngestQueue {
    /// Opens (and lazily creates) the queue at `dir`.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    /// Pending directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn inflight_dir(&self) -> PathBuf {
        self.dir.join("inflight")
    }

    fn dead_dir(&self) -> PathBuf {
        self.dir.join("dead")
    }

    /// Writes a job durably. Producers never block and never retry; a
    /// failed enqueue is the caller's to log and drop.
    ///
    /// Returns the number of pending jobs after the write so the caller
    /// can emit a backpressure warning past the high watermark.
    ///
    /// # Errors
    ///
    /// Returns an error if the job cannot be serialized or written.
    pub fn enqueue(&self, job: &IngestJob) -> Result<usize> {
        std::fs::create_dir_all(&self.dir).map_err(|e| IoError::DirectoryFailed {
            path: self.dir.display().to_string(),
            reason: e.to_string(),
        })?;
        let bytes = serde_json::to_vec_pretty(job).map_err(|e| IoError::WriteFailed {
            path: job.job_id.clone(),
            reason: e.to_string(),
        })?;
        atomic_write(&self.dir.join(format!("{}.json", job.job_id)), &bytes)?;
        Ok(self.pending_count())
    }

    /// Number of pending job files (including backoff-delayed ones).
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.list_pending().len()
    }

    /// Number of dead-lettered jobs.
    #[must_use]
    pub fn dead_count(&self) -> usize {
        std::fs::read_dir(self.dead_dir()).map_or(0, |rd| {
            rd.flatten()
                .filter(|e| e.path().extension().is_some_and(|x| x == "json"))
                .count()
        })
    }

    /// Claims the oldest eligible pending job.
    ///
    /// Jobs whose mtime lies in the future are in backoff and skipped. A
    /// pending file that no longer parses as a job is dead-lettered here
    /// rather than looping forever.
    ///
    /// # Errors
    ///
    /// Returns an error only on directory-level failures; losing a claim
    /// race is not an error.
    pub fn claim_next(&self) -> Result<Option<ClaimedJob>> {
        let inflight = self.inflight_dir();
        std::fs::create_dir_all(&inflight).map_err(|e| IoError::DirectoryFailed {
            path: inflight.display().to_string(),
            reason: e.to_string(),
        })?;

        let now = SystemTime::now();
        for (mtime, path) in self.list_pending() {
            if mtime > now {
                continue; // backoff not yet elapsed
            }
            let file_name = match path.file_name() {
                Some(name) => name.to_os_string(),
                None => continue,
            };
            let claimed_path = inflight.join(&file_name);
            match std::fs::rename(&path, &claimed_path) {
                Ok(()) => {}
                // Another processor won the race
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(IoError::WriteFailed {
                        path: path.display().to_string(),
                        reason: format!("claim rename failed: {e}"),
                    }
                    .into());
                }
            }

            let raw = std::fs::read_to_string(&claimed_path).unwrap_or_default();
            match serde_json::from_str::<IngestJob>(&raw) {
                Ok(job) => {
                    return Ok(Some(ClaimedJob {
                        job,
                        path: claimed_path,
                    }));
                }
                Err(e) => {
                    tracing::warn!(file = %claimed_path.display(), error = %e,
                        "dead-lettering unparsable queue file");
                    self.move_to_dead(&claimed_path)?;
                }
            }
        }
        Ok(None)
    }

    /// Marks a claimed job successfully processed.
    ///
    /// # Errors
    ///
    /// Returns an error if the inflight file cannot be removed.
    pub fn complete(&self, claimed: ClaimedJob) -> Result<()> {
        std::fs::remove_file(&claimed.path).map_err(|e| {
            IoError::WriteFailed {
                path: claimed.path.display().to_string(),
                reason: e.to_string(),
            }
            .into()
        })
    }

    /// Returns a claimed job to the pending directory with an incremented
    /// attempt count and an exponential-backoff mtime.
    ///
    /// # Errors
    ///
    /// Returns an error if the rewrite or rename fails.
    pub fn retry(&self, claimed: ClaimedJob) -> Result<()> {
        let mut job = claimed.job;
        job.attempts += 1;

        let pending_path = self.dir.join(format!("{}.json", job.job_id));
        let bytes = serde_json::to_vec_pretty(&job).map_err(|e| IoError::WriteFailed {
            path: pending_path.display().to_string(),
            reason: e.to_string(),
        })?;
        atomic_write(&pending_path, &bytes)?;
        std::fs::remove_file(&claimed.path).ok();

        let delay = backoff_delay(job.attempts);
        if let Ok(file) = std::fs::OpenOptions::new().write(true).open(&pending_path) {
            let _ = file.set_modified(SystemTime::now() + delay);
        }
        Ok(())
    }

    /// Moves a claimed job to the dead-letter directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the move fails.
    pub fn dead(&self, claimed: ClaimedJob) -> Result<()> {
        self.move_to_dead(&claimed.path)
    }

    /// Removes stale garbage: files in the pending directory older than an
    /// hour that are not valid job JSON (abandoned temp files from a
    /// killed producer). The sibling `pm-queue/` convention is never
    /// touched; this sweep stays inside `ingest-queue/`.
    ///
    /// Returns the number of files removed.
    pub fn sweep(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let old_enough = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|m| m.elapsed().ok())
                .is_some_and(|age| age > SWEEP_AGE);
            if !old_enough {
                continue;
            }
            let valid = std::fs::read_to_string(&path)
                .is_ok_and(|raw| serde_json::from_str::<IngestJob>(&raw).is_ok());
            if !valid && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Pending `*.json` files sorted by mtime ascending (oldest first).
    fn list_pending(&self) -> Vec<(SystemTime, PathBuf)> {
        let Ok(entries) = std::fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        let mut files: Vec<(SystemTime, PathBuf)> = entries
            .flatten()
            .filter_map(|entry| {
                let path = entry.path();
                if !path.is_file() || path.extension().is_none_or(|x| x != "json") {
                    return None;
                }
                let mtime = entry.metadata().and_then(|m| m.modified()).ok()?;
                Some((mtime, path))
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));
        files
    }

    fn move_to_dead(&self, from: &Path) -> Result<()> {
        let dead = self.dead_dir();
        std::fs::create_dir_all(&dead).map_err(|e| IoError::DirectoryFailed {
            path: dead.display().to_string(),
            reason: e.to_string(),
        })?;
        let name = from
            .file_name()
            .map_or_else(|| "job.json".into(), std::ffi::OsStr::to_os_string);
        std::fs::rename(from, dead.join(name)).map_err(|e| {
            IoError::WriteFailed {
                path: from.display().to_string(),
                reason: format!("dead-letter move failed: {e}"),
            }
            .into()
        })
    }
}

/// Exponential backoff, capped.
fn backoff_delay(attempts: u32) -> Duration {
    let secs = BACKOFF_BASE_SECS
        .saturating_mul(1_u64 << attempts.min(16))
        .min(BACKOFF_CAP_SECS);
    Duration::from_secs(secs)
}
