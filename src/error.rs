//! Error types for mnemon operations.
//!
//! This module provides the error hierarchy using `thiserror` for all
//! subsystems: storage, transcript scanning, DIGEST validation, ingest,
//! hooks, and file I/O.

use thiserror::Error;

/// Result type alias for mnemon operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error for mnemon operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Storage-related errors (database operations).
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Transcript scanning errors.
    #[error("transcript error: {0}")]
    Transcript(#[from] TranscriptError),

    /// DIGEST validation errors.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Ingest pipeline errors (transient or fatal).
    #[error("ingest error: {0}")]
    Ingest(#[from] IngestError),

    /// Hook dispatch errors.
    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    /// I/O errors (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Configuration errors (missing env, malformed config file).
    #[error("configuration error: {message}")]
    Config {
        /// Description of the configuration error.
        message: String,
    },
}

/// Storage-specific errors for database operations.
#[derive(Error, Debug)]
pub enum StorageError {
    /// Database connection or query error.
    #[error("database error: {0}")]
    Database(String),

    /// Store not initialized (init command not run).
    #[error("memory store not initialized. Run: mnemon init")]
    NotInitialized,

    /// Project not found for a root path.
    #[error("project not found: {root}")]
    ProjectNotFound {
        /// Project root that was not found.
        root: String,
    },

    /// Chunk not found by ID.
    #[error("chunk not found: {id}")]
    ChunkNotFound {
        /// Chunk ID that was not found.
        id: i64,
    },

    /// Solution not found by ID.
    #[error("solution not found: {id}")]
    SolutionNotFound {
        /// Solution ID that was not found.
        id: i64,
    },

    /// Embedding dimension does not match the store's fixed dimension.
    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch {
        /// Dimension the store expects.
        expected: usize,
        /// Dimension that was supplied.
        actual: usize,
    },

    /// Uniqueness violation that should be impossible by construction.
    #[error("integrity error: {0}")]
    Integrity(String),

    /// Schema migration error.
    #[error("migration error: {0}")]
    Migration(String),

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Transcript-scanner errors.
#[derive(Error, Debug)]
pub enum TranscriptError {
    /// Transcript file missing or unreadable.
    #[error("unreadable transcript: {path}: {reason}")]
    Unreadable {
        /// Path to the transcript.
        path: String,
        /// Reason it could not be read.
        reason: String,
    },

    /// Transcript exceeds the configured byte cap for a full pass.
    #[error("transcript too large for full scan: {size} bytes (max {max})")]
    TooLarge {
        /// Actual transcript size.
        size: u64,
        /// Configured maximum.
        max: u64,
    },
}

/// DIGEST validation errors.
#[derive(Error, Debug)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("DIGEST missing required field: {field}")]
    MissingField {
        /// Name of the missing field.
        field: String,
    },

    /// The fenced block did not contain valid JSON.
    #[error("invalid DIGEST JSON: {0}")]
    InvalidJson(String),

    /// A value outside its closed set (category, kind, etc.).
    #[error("invalid value: {message}")]
    Invalid {
        /// What was wrong.
        message: String,
    },
}

/// Ingest pipeline errors, classified for the queue processor.
///
/// Transient errors are retried with backoff; fatal errors move the job to
/// the dead-letter directory on first sight.
#[derive(Error, Debug)]
pub enum IngestError {
    /// Retryable failure (timeouts, connection errors, rate limits).
    #[error("transient ingest failure: {0}")]
    Transient(String),

    /// Permanent failure (schema mismatch, auth failure, bad dimension).
    #[error("fatal ingest failure: {0}")]
    Fatal(String),
}

/// Hook dispatch errors.
#[derive(Error, Debug)]
pub enum HookError {
    /// A policy rule intentionally blocked the operation.
    #[error("blocked by {rule}: {reason}")]
    PolicyBlock {
        /// Identifier of the blocking rule.
        rule: String,
        /// Human-readable reason surfaced to the host.
        reason: String,
    },

    /// Unknown lifecycle event name.
    #[error("unknown hook event: {name}")]
    UnknownEvent {
        /// Event name that was not recognized.
        name: String,
    },

    /// Event payload on stdin was not a JSON object.
    #[error("malformed hook payload: {0}")]
    MalformedPayload(String),
}

/// I/O-specific errors for file operations.
#[derive(Error, Debug)]
pub enum IoError {
    /// File not found.
    #[error("file not found: {path}")]
    FileNotFound {
        /// Path to the file that was not found.
        path: String,
    },

    /// Failed to read file.
    #[error("failed to read file: {path}: {reason}")]
    ReadFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Failed to write file.
    #[error("failed to write file: {path}: {reason}")]
    WriteFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Memory mapping error.
    #[error("memory mapping failed: {path}: {reason}")]
    MmapFailed {
        /// Path to the file.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Directory creation error.
    #[error("failed to create directory: {path}: {reason}")]
    DirectoryFailed {
        /// Path to the directory.
        path: String,
        /// Reason for failure.
        reason: String,
    },

    /// Advisory lock could not be acquired within the timeout.
    ///
    /// Callers degrade to a lock-free write and log; this variant exists
    /// for observability, not control flow.
    #[error("lock acquisition timed out: {path}")]
    LockTimeout {
        /// Path to the lock file.
        path: String,
    },

    /// Generic I/O error wrapper.
    #[error("I/O error: {0}")]
    Generic(String),
}

impl Error {
    /// True when this error should be retried by the queue processor.
    ///
    /// Anything that is not explicitly fatal is considered retryable; jobs
    /// that keep failing are dead-lettered by the attempt cap instead.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::Ingest(IngestError::Fatal(_))
                | Self::Storage(StorageError::DimensionMismatch { .. })
                | Self::Storage(StorageError::Integrity(_))
                | Self::Validation(_)
        )
    }
}

// Implement From traits for standard library and dependency errors

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::Io(IoError::Generic(err.to_string()))
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Self::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for ValidationError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidJson(err.to_string())
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Self::Config {
            message: format!("invalid pattern: {err}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::Config {
            message: "missing PROJECT_DIR".to_string(),
        };
        assert_eq!(err.to_string(), "configuration error: missing PROJECT_DIR");
    }

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::NotInitialized;
        assert_eq!(
            err.to_string(),
            "memory store not initialized. Run: mnemon init"
        );

        let err = StorageError::DimensionMismatch {
            expected: 1536,
            actual: 1024,
        };
        assert_eq!(
            err.to_string(),
            "embedding dimension mismatch: expected 1536, got 1024"
        );
    }

    #[test]
    fn test_validation_error_display() {
        let err = ValidationError::MissingField {
            field: "task_id".to_string(),
        };
        assert_eq!(err.to_string(), "DIGEST missing required field: task_id");
    }

    #[test]
    fn test_hook_error_display() {
        let err = HookError::PolicyBlock {
            rule: "md_spam".to_string(),
            reason: "unauthorized .md creation".to_string(),
        };
        assert!(err.to_string().contains("md_spam"));
        assert!(err.to_string().contains("unauthorized .md creation"));
    }

    #[test]
    fn test_is_transient_classification() {
        let timeout: Error = IngestError::Transient("embedding timed out".to_string()).into();
        assert!(timeout.is_transient());

        let dim: Error = StorageError::DimensionMismatch {
            expected: 1536,
            actual: 1024,
        }
        .into();
        assert!(!dim.is_transient());

        let fatal: Error = IngestError::Fatal("bad auth".to_string()).into();
        assert!(!fatal.is_transient());

        let validation: Error = ValidationError::MissingField {
            field: "agent".to_string(),
        }
        .into();
        assert!(!validation.is_transient());

        let io: Error = IoError::Generic("connection refused".to_string()).into();
        assert!(io.is_transient());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_error_from_rusqlite() {
        let rusqlite_err = rusqlite::Error::InvalidQuery;
        let err: Error = rusqlite_err.into();
        assert!(matches!(err, Error::Storage(StorageError::Database(_))));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err: StorageError = json_err.into();
        assert!(matches!(err, StorageError::Serialization(_)));

        let json_err: serde_json::Error = serde_json::from_str::<i32>("invalid").unwrap_err();
        let err: ValidationError = json_err.into();
        assert!(matches!(err, ValidationError::InvalidJson(_)));
    }

    #[test]
    fn test_transcript_error_display() {
        let err = TranscriptError::TooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));
        assert!(err.to_string().contains("50"));
    }
}
