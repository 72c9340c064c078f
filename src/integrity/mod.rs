//! Content integrity for state files
//!
//! Streaming SHA-256 checksums, crash-safe writes (temp file + rename) and a
//! corruption scanner that classifies problems by severity.

use std::path::PathBuf;
use thiserror::Error;

pub mod atomic;
pub mod checksum;
pub mod corruption;

pub use atomic::{write_bytes, AtomicWriter, AutoVersion, WriteOptions, WriteReceipt};
pub use checksum::{file_checksum, sha256_bytes, ChecksumRegistry, HashingReader, HashingWriter};
pub use corruption::{
    CorruptionDetector, CorruptionIssue, CorruptionKind, CorruptionReport, CorruptionScanner,
    IssueSeverity,
};

/// Errors raised while hashing, writing or verifying files
#[derive(Error, Debug)]
pub enum IntegrityError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Verification failed for {path}: expected {expected}, found {actual}")]
    VerificationFailed {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl IntegrityError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<tokio::task::JoinError> for IntegrityError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}
