//! Error types for tidestore

use thiserror::Error;

/// Result type alias for tidestore operations
pub type Result<T> = std::result::Result<T, Error>;

/// tidestore error types
#[derive(Error, Debug)]
pub enum Error {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Unknown table, file group or column
    #[error("not found: {0}")]
    NotFound(String),

    /// Write against a stale or incompatible schema.
    /// `accepted` is the number of rows applied before the mismatch.
    #[error("schema mismatch: {reason} ({accepted} rows accepted)")]
    SchemaMismatch { reason: String, accepted: usize },

    /// Table count, row size or buffer capacity exceeded
    #[error("limit exceeded: {0}")]
    LimitExceeded(String),

    /// Structural failure reading a block
    #[error("data corruption: {0}")]
    Corrupted(String),

    /// Checksum mismatch
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Referenced file group was removed by retention mid-scan
    #[error("data expired: file group {0} removed by retention")]
    Expired(i64),

    /// Compression/decompression error
    #[error("compression error: {0}")]
    Compression(String),

    /// Malformed configuration or query condition
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl Error {
    /// Check if error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Io(_))
    }

    /// Check if error indicates corruption
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corrupted(_) | Error::ChecksumMismatch { .. })
    }

    pub(crate) fn schema_mismatch(reason: impl Into<String>, accepted: usize) -> Self {
        Error::SchemaMismatch {
            reason: reason.into(),
            accepted,
        }
    }
}
