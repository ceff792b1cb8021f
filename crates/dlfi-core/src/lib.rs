//! DL-FI Core - Data models and shared types
//!
//! This crate defines the fundamental types used across all DL-FI components:
//! - Vault/Record nodes, relationships, tags
//! - Blob and file-binding models
//! - Virtual path handling
//! - The unified error type and cancellation token

pub mod cancel;
mod error;
mod node;
pub mod path;
mod settings;

pub use cancel::CancelToken;
pub use error::{DlfiError, Result};
pub use node::{
    BlobInfo, BlobLocation, FileBinding, Metadata, Node, NodeSummary, NodeType, Relationship,
};
pub use settings::{ArchiveSettings, EncryptionSettings, KdfParams};

/// Chunk size for streaming hash/encrypt/copy loops.
pub const IO_CHUNK_SIZE: usize = 64 * 1024;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        ArchiveSettings, BlobInfo, BlobLocation, CancelToken, DlfiError, FileBinding, Metadata,
        Node, NodeSummary, NodeType, Relationship, Result,
    };
}
