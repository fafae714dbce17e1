//! Working Set Index and session state files.
//!
//! Three small JSON-on-disk stores keyed by project: the bounded WSI of
//! recently touched files, the duplicate-read hash cache, and the per
//! project turn counter. Every mutation is persisted with temp + rename
//! under a best-effort advisory lock.

use crate::config::WsiConfig;
use crate::error::Result;
use crate::io::{FileLock, LOCK_TIMEOUT, atomic_write_json};
use crate::project::now_ms;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One touched artifact in the working set.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WsiEntry {
    /// Path relative to the project root; the unique key.
    pub path: String,
    /// Turn at which the entry first appeared.
    pub first_turn: u64,
    /// Turn of the most recent touch.
    pub last_turn: u64,
    /// Epoch milliseconds of the most recent touch.
    pub last_access: i64,
    /// Content hash, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_sha256: Option<String>,
    /// Why the artifact was touched (from DIGEST `files[].reason`).
    pub reason: String,
}

/// Bounded, recency-ordered index of touched files.
///
/// Size is capped at `max`; adding a new path at capacity evicts the entry
/// with the smallest `last_turn` (ties: oldest `last_access`, then
/// lexicographically smallest path).
#[derive(Debug)]
pub struct WsiStore {
    path: PathBuf,
    entries: Vec<WsiEntry>,
    max: usize,
    ttl_turns: u64,
}

impl WsiStore {
    /// Loads the WSI from disk, or starts empty when absent or unreadable.
    #[must_use]
    pub fn load(path: &Path, config: &WsiConfig) -> Self {
        let entries = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            entries,
            max: config.max.max(1),
            ttl_turns: config.ttl_turns,
        }
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when the index is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Upserts an entry for `path` at the given turn.
    pub fn touch(&mut self, path: &str, reason: &str, turn: u64) {
        let now = now_ms();
        if let Some(entry) = self.entries.iter_mut().find(|e| e.path == path) {
            entry.last_turn = turn;
            entry.last_access = now;
            if !reason.is_empty() {
                entry.reason = reason.to_string();
            }
            return;
        }

        if self.entries.len() >= self.max {
            self.evict_one();
        }
        self.entries.push(WsiEntry {
            path: path.to_string(),
            first_turn: turn,
            last_turn: turn,
            last_access: now,
            content_sha256: None,
            reason: reason.to_string(),
        });
    }

    /// Records a content hash on an existing entry (no-op when absent).
    pub fn update_hash(&mut self, path: &str, sha: &str) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.path == path) {
            entry.content_sha256 = Some(sha.to_string());
        }
    }

    /// Removes entries whose age in turns exceeds the TTL.
    pub fn prune(&mut self, turn_counter: u64) {
        let ttl = self.ttl_turns;
        self.entries
            .retain(|e| turn_counter.saturating_sub(e.last_turn) <= ttl);
    }

    /// Entries sorted by `last_turn` descending (stable across calls).
    #[must_use]
    pub fn snapshot(&self) -> Vec<&WsiEntry> {
        let mut entries: Vec<&WsiEntry> = self.entries.iter().collect();
        entries.sort_by(|a, b| {
            b.last_turn
                .cmp(&a.last_turn)
                .then(b.last_access.cmp(&a.last_access))
                .then(a.path.cmp(&b.path))
        });
        entries
    }

    /// Persists the index atomically. Returns true when the advisory lock
    /// could not be acquired and the write proceeded lock-free.
    ///
    /// # Errors
    ///
    /// Returns an error only if the atomic write itself fails.
    pub fn persist(&self) -> Result<bool> {
        let guard = FileLock::acquire(&self.path, LOCK_TIMEOUT);
        atomic_write_json(&self.path, &self.entries)?;
        Ok(guard.degraded())
    }

    /// Evicts the entry with the smallest `last_turn`
    /// (ties: oldest `last_access`, then smallest path).
    fn evict_one(&mut self) {
        let victim = self
            .entries
            .iter()
            .enumerate()
            .min_by(|(_, a), (_, b)| {
                a.last_turn
                    .cmp(&b.last_turn)
                    .then(a.last_access.cmp(&b.last_access))
                    .then(a.path.cmp(&b.path))
            })
            .map(|(i, _)| i);
        if let Some(i) = victim {
            self.entries.remove(i);
        }
    }
}

/// Duplicate-read cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileHashEntry {
    /// Content hash at the last read.
    pub sha256: String,
    /// Turn of the first read with this hash.
    pub first_seen_turn: u64,
    /// Turn of the most recent read.
    pub last_seen_turn: u64,
    /// Consecutive same-content reads inside the window.
    pub read_count: u32,
}

/// On-disk cache backing the progressive duplicate-read rule.
#[derive(Debug)]
pub struct FileHashCache {
    path: PathBuf,
    map: BTreeMap<String, FileHashEntry>,
}

impl FileHashCache {
    /// Loads the cache, or starts empty when absent or unreadable.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let map = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            map,
        }
    }

    /// Records a read of `path` with content hash `sha` at `turn` and
    /// returns the resulting consecutive read count.
    ///
    /// The count resets to 1 when the hash changed or the previous read
    /// is more than `window` turns old.
    pub fn record_read(&mut self, path: &str, sha: &str, turn: u64, window: u64) -> u32 {
        let entry = self.map.entry(path.to_string()).or_insert(FileHashEntry {
            sha256: sha.to_string(),
            first_seen_turn: turn,
            last_seen_turn: turn,
            read_count: 0,
        });

        if entry.sha256 == sha && turn.saturating_sub(entry.last_seen_turn) <= window {
            entry.read_count += 1;
        } else {
            entry.sha256 = sha.to_string();
            entry.first_seen_turn = turn;
            entry.read_count = 1;
        }
        entry.last_seen_turn = turn;
        entry.read_count
    }

    /// Current read count for a path, if cached.
    #[must_use]
    pub fn read_count(&self, path: &str) -> Option<u32> {
        self.map.get(path).map(|e| e.read_count)
    }

    /// Persists the cache atomically; returns true on a degraded (lock
    /// free) write.
    ///
    /// # Errors
    ///
    /// Returns an error if the atomic write fails.
    pub fn persist(&self) -> Result<bool> {
        let guard = FileLock::acquire(&self.path, LOCK_TIMEOUT);
        atomic_write_json(&self.path, &self.map)?;
        Ok(guard.degraded())
    }
}

/// Per-project monotonic turn counter, incremented at pre-tool events.
#[derive(Debug)]
pub struct TurnCounter {
    path: PathBuf,
    value: u64,
}

/// On-disk shape of the counter file.
#[derive(Serialize, Deserialize)]
struct TurnCounterFile {
    value: u64,
}

impl TurnCounter {
    /// Loads the counter, defaulting to zero.
    #[must_use]
    pub fn load(path: &Path) -> Self {
        let value = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<TurnCounterFile>(&raw).ok())
            .map_or(0, |f| f.value);
        Self {
            path: path.to_path_buf(),
            value,
        }
    }

    /// Current value.
    #[must_use]
    pub const fn value(&self) -> u64 {
        self.value
    }

    /// Increments and persists the counter, returning the new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the atomic write fails.
    pub fn increment(&mut self) -> Result<u64> {
        self.value += 1;
        atomic_write_json(&self.path, &TurnCounterFile { value: self.value })?;
        Ok(self.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir, max: usize, ttl: u64) -> WsiStore {
        WsiStore::load(
            &dir.path().join("wsi.json"),
            &WsiConfig { max, ttl_turns: ttl },
        )
    }

    #[test]
    fn test_touch_upserts() {
        let dir = TempDir::new().unwrap();
        let mut wsi = store(&dir, 10, 20);

        wsi.touch("src/a.rs", "edited", 1);
        wsi.touch("src/a.rs", "reviewed", 3);
        assert_eq!(wsi.len(), 1);

        let snap = wsi.snapshot();
        assert_eq!(snap[0].first_turn, 1);
        assert_eq!(snap[0].last_turn, 3);
        assert_eq!(snap[0].reason, "reviewed");
    }

    #[test]
    fn test_eviction_at_capacity() {
        let dir = TempDir::new().unwrap();
        let mut wsi = store(&dir, 3, 100);

        wsi.touch("a", "r", 1);
        wsi.touch("b", "r", 2);
        wsi.touch("c", "r", 3);
        wsi.touch("d", "r", 4);

        // Size stays at max; the smallest last_turn ("a") was evicted
        assert_eq!(wsi.len(), 3);
        let paths: Vec<&str> = wsi.snapshot().iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["d", "c", "b"]);
    }

    #[test]
    fn test_eviction_tie_break_by_path() {
        let dir = TempDir::new().unwrap();
        let mut wsi = store(&dir, 2, 100);

        wsi.touch("zebra", "r", 5);
        wsi.touch("apple", "r", 5);
        // Force equal last_access to exercise the path tie-break
        for e in &mut wsi.entries {
            e.last_access = 42;
        }
        wsi.touch("new", "r", 6);

        let paths: Vec<&str> = wsi.snapshot().iter().map(|e| e.path.as_str()).collect();
        assert!(paths.contains(&"new"));
        assert!(paths.contains(&"zebra"));
        assert!(!paths.contains(&"apple"));
    }

    #[test]
    fn test_prune_by_ttl() {
        let dir = TempDir::new().unwrap();
        let mut wsi = store(&dir, 10, 20);

        wsi.touch("old", "r", 1);
        wsi.touch("fresh", "r", 15);
        wsi.prune(22);

        // 22 - 1 > 20 prunes "old"; 22 - 15 <= 20 keeps "fresh"
        assert_eq!(wsi.len(), 1);
        assert_eq!(wsi.snapshot()[0].path, "fresh");
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wsi.json");
        let config = WsiConfig {
            max: 10,
            ttl_turns: 20,
        };

        let mut wsi = WsiStore::load(&path, &config);
        wsi.touch("src/x.rs", "edited", 7);
        wsi.update_hash("src/x.rs", "deadbeef");
        let degraded = wsi.persist().unwrap();
        assert!(!degraded);

        let reloaded = WsiStore::load(&path, &config);
        assert_eq!(reloaded.len(), 1);
        assert_eq!(
            reloaded.snapshot()[0].content_sha256.as_deref(),
            Some("deadbeef")
        );
    }

    #[test]
    fn test_hash_cache_progression_and_reset() {
        let dir = TempDir::new().unwrap();
        let mut cache = FileHashCache::load(&dir.path().join("file_hashes.json"));

        assert_eq!(cache.record_read("x.ts", "s1", 1, 10), 1);
        assert_eq!(cache.record_read("x.ts", "s1", 2, 10), 2);
        assert_eq!(cache.record_read("x.ts", "s1", 3, 10), 3);
        assert_eq!(cache.record_read("x.ts", "s1", 4, 10), 4);

        // Content change resets
        assert_eq!(cache.record_read("x.ts", "s2", 5, 10), 1);
        // Turn gap beyond the window resets
        assert_eq!(cache.record_read("x.ts", "s2", 20, 10), 1);
    }

    #[test]
    fn test_hash_cache_persist_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("file_hashes.json");

        let mut cache = FileHashCache::load(&path);
        cache.record_read("a.rs", "abc", 1, 10);
        cache.record_read("a.rs", "abc", 2, 10);
        cache.persist().unwrap();

        let reloaded = FileHashCache::load(&path);
        assert_eq!(reloaded.read_count("a.rs"), Some(2));
    }

    #[test]
    fn test_turn_counter() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("turn_counter.json");

        let mut counter = TurnCounter::load(&path);
        assert_eq!(counter.value(), 0);
        assert_eq!(counter.increment().unwrap(), 1);
        assert_eq!(counter.increment().unwrap(), 2);

        let reloaded = TurnCounter::load(&path);
        assert_eq!(reloaded.value(), 2);
    }

    #[test]
    fn test_corrupt_files_start_empty() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("wsi.json");
        std::fs::write(&path, b"{not json").unwrap();

        let wsi = WsiStore::load(
            &path,
            &WsiConfig {
                max: 10,
                ttl_turns: 20,
            },
        );
        assert!(wsi.is_empty());
    }
}
