//! Atomic file mutation via temp file + rename.
//!
//! Rename within a directory is atomic on POSIX-like filesystems; readers
//! observe either the previous content or the complete new content, never
//! a partial write.

use crate::error::{IoError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::Path;

/// Writes `bytes` to `path` atomically.
///
/// The temp file lands in the same directory as the target so the final
/// rename never crosses a filesystem boundary. The parent directory is
/// created if missing.
///
/// # Errors
///
/// Returns an error if the temp file cannot be written or renamed.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| IoError::DirectoryFailed {
        path: parent.display().to_string(),
        reason: e.to_string(),
    })?;

    let temp = parent.join(temp_name(path));
    let write = |temp: &Path| -> std::io::Result<()> {
        let mut file = std::fs::File::create(temp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        Ok(())
    };
    write(&temp).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        IoError::WriteFailed {
            path: temp.display().to_string(),
            reason: e.to_string(),
        }
    })?;

    std::fs::rename(&temp, path).map_err(|e| {
        let _ = std::fs::remove_file(&temp);
        IoError::WriteFailed {
            path: path.display().to_string(),
            reason: format!("rename failed: {e}"),
        }
        .into()
    })
}

/// Serializes `value` as pretty JSON and writes it atomically.
///
/// # Errors
///
/// Returns an error on serialization or write failure.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_vec_pretty(value).map_err(|e| IoError::WriteFailed {
        path: path.display().to_string(),
        reason: format!("serialize failed: {e}"),
    })?;
    atomic_write(path, &json)
}

/// Appends `content` plus a trailing newline in a single write.
///
/// Single `write_all` calls on an append-mode descriptor do not interleave
/// with other appenders; this is the discipline NOTES.md and the error log
/// rely on.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or written.
pub fn append_line(path: &Path, content: &str) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| IoError::DirectoryFailed {
        path: parent.display().to_string(),
        reason: e.to_string(),
    })?;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| IoError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

    let mut buf = String::with_capacity(content.len() + 1);
    buf.push_str(content);
    buf.push('\n');
    file.write_all(buf.as_bytes()).map_err(|e| {
        IoError::WriteFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}

/// Builds a unique sibling temp-file name for a target path.
fn temp_name(path: &Path) -> String {
    let base = path
        .file_name()
        .map_or_else(|| "file".to_string(), |n| n.to_string_lossy().into_owned());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_or(0, |d| d.subsec_nanos());
    format!(".{base}.{}.{nanos}.tmp", std::process::id())
}
