//! Persisted archive settings
//!
//! Stored as JSON rows inside the settings table of `db.sqlite`, so the
//! archive carries its own configuration.

use serde::{Deserialize, Serialize};

/// Argon2id cost parameters, recorded next to the salt in `keys.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KdfParams {
    /// Time cost (iterations)
    pub t_cost: u32,
    /// Memory cost in KiB
    pub m_cost: u32,
    /// Parallelism
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            t_cost: 3,
            m_cost: 65536,
            p_cost: 4,
        }
    }
}

/// At-rest encryption settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionSettings {
    pub enabled: bool,
    pub algo: String,
    pub kdf: KdfParams,
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            algo: "xchacha20-poly1305".to_string(),
            kdf: KdfParams::default(),
        }
    }
}

/// All persisted archive settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchiveSettings {
    /// Maximum partition file size in bytes; 0 disables partitioning and
    /// blobs are stored loose.
    pub partition_size: u64,
    pub encryption: EncryptionSettings,
    /// Upper bound for the thumbnail rendition cache, in MiB.
    pub thumbnail_cache_size_mb: u32,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            partition_size: 0,
            encryption: EncryptionSettings::default(),
            thumbnail_cache_size_mb: 256,
        }
    }
}
