//! Typed errors for the vector-store lifecycle (download, extraction,
//! process supervision).
//!
//! The rest of the crate uses `anyhow`; these variants exist so callers can
//! tell integrity failures from transient ones.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LifecycleError {
    #[error("operation canceled")]
    Canceled,

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("file size mismatch: expected {expected} bytes, wrote {actual}")]
    FileSizeMismatch { expected: u64, actual: u64 },

    #[error("HTTP {status} fetching {url}")]
    HttpStatus { status: u16, url: String },

    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("archive entry escapes destination: {0}")]
    PathTraversal(String),

    #[error("unsupported archive format: {0}")]
    UnsupportedArchive(String),

    #[error("no supported release asset for {os}/{arch}")]
    UnsupportedPlatform { os: String, arch: String },

    #[error("vector store binary not found: {0}")]
    BinaryNotFound(PathBuf),

    #[error("vector store did not become ready within {0:?}")]
    NotReady(Duration),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
}

impl LifecycleError {
    /// Transient failures worth another attempt: network errors and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            LifecycleError::Network(_) => true,
            LifecycleError::HttpStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

pub type LifecycleResult<T> = std::result::Result<T, LifecycleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_follows_status_class() {
        let server = LifecycleError::HttpStatus {
            status: 503,
            url: "u".into(),
        };
        let client = LifecycleError::HttpStatus {
            status: 404,
            url: "u".into(),
        };
        assert!(server.is_retryable());
        assert!(!client.is_retryable());
        assert!(!LifecycleError::PathTraversal("../x".into()).is_retryable());
        assert!(!LifecycleError::Canceled.is_retryable());
    }
}
