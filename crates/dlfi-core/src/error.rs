//! Error types for DL-FI operations

use serde::Serialize;
use thiserror::Error;

/// Unified error type for DL-FI operations
#[derive(Error, Debug, Serialize)]
#[serde(tag = "type", content = "message")]
pub enum DlfiError {
    #[error("IO error: {0}")]
    #[serde(serialize_with = "serialize_io_error")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("crypto error: {0}")]
    Crypto(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path already taken: {0}")]
    PathTaken(String),

    #[error("type conflict: {0}")]
    TypeConflict(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("relationship already exists: {0}")]
    RelationExists(String),

    #[error("blob missing: {0}")]
    BlobMissing(String),

    #[error("integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("decryption failed: wrong passphrase or corrupted data")]
    DecryptionFailed,

    #[error("archive is already open in another process")]
    ArchiveBusy,

    #[error("operation cancelled")]
    Cancelled,

    #[error("query parse error at offset {offset}: {message}")]
    QueryParse { offset: usize, message: String },
}

fn serialize_io_error<S>(error: &std::io::Error, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&error.to_string())
}

/// Result type alias using DlfiError
pub type Result<T> = std::result::Result<T, DlfiError>;
