//! I/O utilities: atomic file mutation, advisory locking, and bounded
//! tail reads over large files.
//!
//! Every on-disk mutation in this crate goes through [`atomic_write`]
//! (temp file + rename) so a crash at any point leaves either the old
//! content intact or the new content complete.

pub mod atomic;
pub mod lock;
pub mod tail;

pub use atomic::{append_line, atomic_write, atomic_write_json};
pub use lock::{FileLock, LOCK_TIMEOUT};
pub use tail::TailWindow;

use crate::error::{IoError, Result};
use std::path::Path;

/// Reads a file to a string with mapped error context.
///
/// # Errors
///
/// Returns an error if the file is missing or unreadable.
pub fn read_file<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(IoError::FileNotFound {
            path: path.display().to_string(),
        }
        .into());
    }
    std::fs::read_to_string(path).map_err(|e| {
        IoError::ReadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Finds a valid UTF-8 character boundary at or before the given position.
#[must_use]
pub fn find_char_boundary(s: &str, pos: usize) -> usize {
    if pos >= s.len() {
        return s.len();
    }
    let mut boundary = pos;
    while !s.is_char_boundary(boundary) && boundary > 0 {
        boundary -= 1;
    }
    boundary
}
