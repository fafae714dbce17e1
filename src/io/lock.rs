//! Advisory file locking with a fail-open degrade path.
//!
//! WSI and its sibling state files are single-writer in practice (the host
//! serializes hook invocations), but a second dispatcher can race during
//! shutdown. Writers take a lock file next to the state; if acquisition
//! exceeds the timeout the write proceeds without the lock and the caller
//! logs a warning. Correctness is preserved by atomic rename either way.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

/// Default lock acquisition timeout.
pub const LOCK_TIMEOUT: Duration = Duration::from_millis(500);

/// A lock file considered abandoned after this age is broken.
const STALE_AFTER: Duration = Duration::from_secs(30);

/// Poll interval while waiting for the lock.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Held (or degraded) advisory lock.
///
/// Dropping the guard releases the lock file. In the degraded state there
/// is nothing to release.
#[derive(Debug)]
pub struct FileLock {
    path: Option<PathBuf>,
}

impl FileLock {
    /// Acquires the lock file `<target>.lock`, waiting up to `timeout`.
    ///
    /// On timeout the returned guard is degraded: [`Self::degraded`]
    /// reports true and the caller should log a `LockLost` warning before
    /// continuing with its (still atomic) write.
    #[must_use]
    pub fn acquire(target: &Path, timeout: Duration) -> Self {
        let lock_path = lock_path_for(target);
        let deadline = Instant::now() + timeout;

        loop {
            match std::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
            {
                Ok(_) => {
                    return Self {
                        path: Some(lock_path),
                    };
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    break_stale(&lock_path);
                    if Instant::now() >= deadline {
                        return Self { path: None };
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                // Unwritable directory etc.: degrade rather than block the host
                Err(_) => return Self { path: None },
            }
        }
    }

    /// True when the lock could not be acquired and the caller is in the
    /// degraded lock-free path.
    #[must_use]
    pub const fn degraded(&self) -> bool {
        self.path.is_none()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Some(path) = self.path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Lock file path for a state file.
fn lock_path_for(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map_or_else(|| "state".to_string(), |n| n.to_string_lossy().into_owned());
    name.push_str(".lock");
    target.with_file_name(name)
}

/// Removes a lock file whose holder evidently died.
fn break_stale(lock_path: &Path) {
    let Ok(meta) = std::fs::metadata(lock_path) else {
        return;
    };
    let Ok(modified) = meta.modified() else {
        return;
    };
    if modified.elapsed().is_ok_and(|age| age > STALE_AFTER) {
        let _ = std::fs::remove_file(lock_path);
    }
}
