//! Bounded tail reads over large files.
//!
//! The transcript scanner only ever needs the last window of a JSONL file;
//! memory-mapping avoids pulling a multi-hundred-megabyte transcript into
//! the dispatcher's heap.

// Memory mapping requires unsafe but is read-only here
#![allow(unsafe_code)]

use crate::error::{IoError, Result};
use memmap2::Mmap;
use std::fs::File;
use std::path::Path;

/// A read-only view over the tail of a file.
#[derive(Debug)]
pub struct TailWindow {
    map: Option<Mmap>,
    len: u64,
    start: usize,
}

impl TailWindow {
    /// Opens the last `window_bytes` of the file, aligned forward to the
    /// first line boundary inside the window.
    ///
    /// An empty file yields an empty window.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or mapped.
    pub fn open(path: &Path, window_bytes: u64) -> Result<Self> {
        let file = File::open(path).map_err(|e| IoError::ReadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let len = file
            .metadata()
            .map_err(|e| IoError::ReadFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
            .len();

        if len == 0 {
            return Ok(Self {
                map: None,
                len,
                start: 0,
            });
        }

        // SAFETY: mapping is read-only; concurrent truncation of a
        // transcript is not something the host does mid-event.
        let map = unsafe {
            Mmap::map(&file).map_err(|e| IoError::MmapFailed {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?
        };

        #[allow(clippy::cast_possible_truncation)]
        let window_start = len.saturating_sub(window_bytes) as usize;
        let start = if window_start == 0 {
            0
        } else {
            // Align to the first complete line inside the window
            map[window_start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(map.len(), |i| window_start + i + 1)
        };

        Ok(Self {
            map: Some(map),
            len,
            start,
        })
    }

    /// Total file length in bytes.
    #[must_use]
    pub const fn file_len(&self) -> u64 {
        self.len
    }

    /// The window contents, lossily decoded as UTF-8.
    #[must_use]
    pub fn text(&self) -> std::borrow::Cow<'_, str> {
        self.map.as_ref().map_or_else(
            || std::borrow::Cow::Borrowed(""),
            |m| String::from_utf8_lossy(&m[self.start..]),
        )
    }

    /// The full file contents, lossily decoded as UTF-8.
    #[must_use]
    pub fn full_text(&self) -> std::borrow::Cow<'_, str> {
        self.map.as_ref().map_or_else(
            || std::borrow::Cow::Borrowed(""),
            |m| String::from_utf8_lossy(m),
        )
    }
}
