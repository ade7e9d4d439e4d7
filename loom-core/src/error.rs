//! Structured error types for the loom toolkit.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Unified error type for all loom operations.
#[derive(Debug, Error)]
pub enum LoomError {
    /// I/O error (file not found, permission denied, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The path is not a valid loom container, or its schema is unreadable.
    #[error("format error: {0}")]
    Format(String),

    /// Attribute set, attribute type or attribute length mismatch.
    #[error("schema error: {0}")]
    Schema(String),

    /// Row or column count mismatch.
    #[error("shape error: {0}")]
    Shape(String),

    /// Tile coordinates outside the valid zoom/x/y bounds.
    #[error("range error: {0}")]
    Range(String),

    /// Requested file, attribute, row or column does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The per-file lock could not be acquired in time. Retryable.
    #[error("{} is busy (lock not acquired within {:.1}s)", path.display(), timeout.as_secs_f64())]
    LockTimeout { path: PathBuf, timeout: Duration },

    /// Operation attempted on a closed connection.
    #[error("connection to {0} is closed")]
    Closed(String),

    /// Mutation attempted on a read-only connection.
    #[error("connection to {0} is read-only")]
    ReadOnly(String),

    /// Malformed predicate or other textual input.
    #[error("parse error: {0}")]
    Parse(String),

    /// Compression or decompression failure
    #[error("compression error: {0}")]
    Compression(String),

    /// Failure reported by the storage backend.
    #[error("storage error: {0}")]
    Storage(String),

    /// JSON (de)serialization failure.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Image encoding failure.
    #[error("image error: {0}")]
    Image(String),

    /// Catch-all for other errors
    #[error("{0}")]
    Other(String),
}

impl LoomError {
    /// Whether the caller should retry the operation (with backoff).
    ///
    /// Only lock contention qualifies; every other error reflects a defect
    /// in the request or the data.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LoomError::LockTimeout { .. })
    }

    /// Attach a path to an I/O error.
    pub fn io_at(path: &std::path::Path, e: std::io::Error) -> Self {
        LoomError::Io(std::io::Error::new(
            e.kind(),
            format!("{}: {}", path.display(), e),
        ))
    }
}

/// Convenience alias used throughout the loom crates.
pub type Result<T> = std::result::Result<T, LoomError>;
