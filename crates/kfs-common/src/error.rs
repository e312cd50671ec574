//! Error types for KFS
//!
//! This module defines the common error types used throughout the system.

use crate::types::ContentHashError;
use thiserror::Error;

/// Common result type for KFS operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for KFS
#[derive(Debug, Error)]
pub enum Error {
    // Storage errors
    #[error("disk I/O error: {0}")]
    DiskIo(#[from] std::io::Error),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("disk not found: {0}")]
    DiskNotFound(String),

    #[error("insufficient space on {root}: required {required} bytes, available {available} bytes")]
    InsufficientSpace {
        root: String,
        required: u64,
        available: u64,
    },

    // Allocation errors
    #[error("not enough disks to meet redundancy requirements: have {available}, need {required}")]
    InsufficientRedundancy { available: usize, required: usize },

    #[error("persistence error: {0}")]
    Persistence(String),

    // Upload validation errors
    #[error("hashes do not match: claimed {expected}, computed {actual}")]
    Validation { expected: String, actual: String },

    #[error("size mismatch: declared {declared} bytes, received {received} bytes")]
    SizeMismatch { declared: u64, received: u64 },

    #[error("invalid content hash: {0}")]
    InvalidHash(#[from] ContentHashError),

    // Replication errors
    #[error(
        "replication of {hash} failed on {} of {total} targets: {}",
        .failed.len(),
        .failed.join(", ")
    )]
    ReplicationPartialFailure {
        hash: String,
        failed: Vec<String>,
        total: usize,
    },

    #[error("upload body stalled for {0:?}")]
    Timeout(std::time::Duration),

    // Request errors
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Internal errors
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Create a new internal error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::InvalidRequest(msg.into())
    }

    /// Create a storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Create a persistence error
    pub fn persistence(msg: impl Into<String>) -> Self {
        Self::Persistence(msg.into())
    }

    /// Check if retrying the same upload may succeed
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Persistence(_)
                | Self::ReplicationPartialFailure { .. }
                | Self::InsufficientRedundancy { .. }
        )
    }

    /// Get HTTP status code for the upload front end
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            // 400 Bad Request
            Self::InvalidRequest(_) | Self::InvalidHash(_) | Self::SizeMismatch { .. } => 400,

            // 404 Not Found
            Self::DiskNotFound(_) => 404,

            // 406 Not Acceptable
            Self::Validation { .. } => 406,

            // 408 Request Timeout
            Self::Timeout(_) => 408,

            // 500 Internal Server Error
            Self::DiskIo(_)
            | Self::Storage(_)
            | Self::Persistence(_)
            | Self::ReplicationPartialFailure { .. }
            | Self::Configuration(_)
            | Self::Internal(_) => 500,

            // 503 Service Unavailable
            Self::InsufficientRedundancy { .. }
            | Self::InsufficientSpace { .. } => 503,
        }
    }
}
