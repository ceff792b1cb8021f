//! DL-FI Store - the archive: metadata, blobs, and crypto
//!
//! An [`Archive`] owns everything under `<root>/.dlfi/`: the SQLite
//! metadata store, the content-addressed blob storage (loose or
//! partitioned), the ingest staging area, and the optional key store.
//! All mutating operations are single transactions; a file lock on the
//! archive root keeps a second process out.

mod blob;
mod crypto;
mod index_impl;
mod keystore;
mod maintenance;
mod meta;
mod partition;
mod schema;

pub use blob::{BlobReader, PutOutcome};
pub use maintenance::VacuumReport;
pub use meta::NodeUpdate;

use dlfi_core::{ArchiveSettings, DlfiError, NodeSummary, Result};
use dlfi_query::Suggestion;
use fs2::FileExt;
use rusqlite::Connection;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};

const SETTINGS_KEY: &str = "archive";

/// A single DL-FI archive rooted at a directory on disk.
///
/// The archive is an explicit object owned by the caller; several archives
/// can be open in one process at once.
#[derive(Debug)]
pub struct Archive {
    root: PathBuf,
    system_dir: PathBuf,
    storage_dir: PathBuf,
    temp_dir: PathBuf,
    keys_path: PathBuf,
    conn: Mutex<Connection>,
    settings: Mutex<ArchiveSettings>,
    cipher: Mutex<Option<crypto::BlobCipher>>,
    /// Held for the lifetime of the archive; dropping releases the lock.
    _lock: File,
}

impl Archive {
    /// Open or create an archive. Fails with `DecryptionFailed` if the
    /// archive is encrypted (use [`Archive::open_with_passphrase`]).
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_inner(root.as_ref(), None)
    }

    /// Open an archive, unlocking the key store with `passphrase` when
    /// encryption is enabled.
    pub fn open_with_passphrase(root: impl AsRef<Path>, passphrase: &str) -> Result<Self> {
        Self::open_inner(root.as_ref(), Some(passphrase))
    }

    fn open_inner(root: &Path, passphrase: Option<&str>) -> Result<Self> {
        let system_dir = root.join(".dlfi");
        let storage_dir = system_dir.join("storage");
        let temp_dir = system_dir.join("temp");
        std::fs::create_dir_all(&storage_dir)?;
        std::fs::create_dir_all(&temp_dir)?;

        let lock = File::create(system_dir.join("lock"))?;
        lock.try_lock_exclusive().map_err(|_| DlfiError::ArchiveBusy)?;

        // Clean stale staging files from a previous run.
        for entry in std::fs::read_dir(&temp_dir)? {
            let entry = entry?;
            if let Err(e) = std::fs::remove_file(entry.path()) {
                warn!("could not remove stale temp file {:?}: {}", entry.path(), e);
            }
        }

        let conn = Connection::open(system_dir.join("db.sqlite"))
            .map_err(|e| DlfiError::Database(e.to_string()))?;
        schema::tune_connection(&conn)?;
        schema::init_schema(&conn)?;

        let settings = match load_settings(&conn)? {
            Some(s) => s,
            None => {
                let defaults = ArchiveSettings::default();
                save_settings(&conn, &defaults)?;
                defaults
            }
        };

        let keys_path = system_dir.join("keys.json");
        let cipher = if settings.encryption.enabled {
            match passphrase {
                Some(pass) => {
                    let master_key = keystore::unlock(&keys_path, pass)?;
                    Some(crypto::BlobCipher::new(master_key))
                }
                None => return Err(DlfiError::DecryptionFailed),
            }
        } else {
            None
        };

        info!("opened archive at {}", root.display());

        Ok(Self {
            root: root.to_path_buf(),
            system_dir,
            storage_dir,
            temp_dir,
            keys_path,
            conn: Mutex::new(conn),
            settings: Mutex::new(settings),
            cipher: Mutex::new(cipher),
            _lock: lock,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub(crate) fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub(crate) fn temp_dir(&self) -> &Path {
        &self.temp_dir
    }

    pub(crate) fn keys_path(&self) -> &Path {
        &self.keys_path
    }

    pub(crate) fn system_dir(&self) -> &Path {
        &self.system_dir
    }

    /// Snapshot of the persisted settings.
    pub fn settings(&self) -> ArchiveSettings {
        self.settings.lock().unwrap().clone()
    }

    pub(crate) fn replace_settings(&self, settings: ArchiveSettings) -> Result<()> {
        self.with_conn(|conn| save_settings(conn, &settings))?;
        *self.settings.lock().unwrap() = settings;
        Ok(())
    }

    pub(crate) fn cipher(&self) -> &Mutex<Option<crypto::BlobCipher>> {
        &self.cipher
    }

    /// Configure the argon2id cost parameters used the next time
    /// encryption is enabled. An existing key store keeps the parameters
    /// recorded next to its salt.
    pub fn set_kdf_params(&self, params: dlfi_core::KdfParams) -> Result<()> {
        let mut settings = self.settings();
        settings.encryption.kdf = params;
        self.replace_settings(settings)
    }

    /// Set the maximum partition file size in bytes; 0 disables
    /// partitioning. Applies to future ingests only; partition files are
    /// append-only and existing blobs stay where they are until `vacuum`.
    pub fn set_partition_size(&self, bytes: u64) -> Result<()> {
        let mut settings = self.settings();
        settings.partition_size = bytes;
        self.replace_settings(settings)?;
        info!("partition size set to {} bytes", bytes);
        Ok(())
    }

    /// Run `f` inside a single transaction; any error rolls back.
    pub(crate) fn with_tx<T>(
        &self,
        f: impl FnOnce(&rusqlite::Transaction) -> Result<T>,
    ) -> Result<T> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn
            .transaction()
            .map_err(|e| DlfiError::Database(e.to_string()))?;
        let out = f(&tx)?;
        tx.commit().map_err(|e| DlfiError::Database(e.to_string()))?;
        Ok(out)
    }

    /// Run `f` with the connection, without opening a transaction.
    pub(crate) fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock().unwrap();
        f(&conn)
    }

    /// Execute a query-language expression and return matching nodes,
    /// VAULTs first, then by path.
    pub fn query(&self, text: &str) -> Result<Vec<NodeSummary>> {
        dlfi_query::run_query(self, text)
    }

    /// Context-sensitive autocomplete for a query under edit.
    pub fn autocomplete(&self, text: &str, cursor: usize) -> Result<Vec<Suggestion>> {
        dlfi_query::autocomplete(self, text, cursor)
    }

    /// Counts for status displays.
    pub fn stats(&self) -> Result<ArchiveStats> {
        self.with_conn(|conn| {
            let count = |sql: &str| -> Result<u64> {
                conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                    .map(|n| n as u64)
                    .map_err(|e| DlfiError::Database(e.to_string()))
            };
            Ok(ArchiveStats {
                vaults: count("SELECT COUNT(*) FROM nodes WHERE node_type = 'VAULT'")?,
                records: count("SELECT COUNT(*) FROM nodes WHERE node_type = 'RECORD'")?,
                relationships: count("SELECT COUNT(*) FROM relationships")?,
                blobs: count("SELECT COUNT(*) FROM blobs")?,
                blob_bytes: count("SELECT COALESCE(SUM(size), 0) FROM blobs")?,
            })
        })
    }
}

/// Archive-wide counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveStats {
    pub vaults: u64,
    pub records: u64,
    pub relationships: u64,
    pub blobs: u64,
    pub blob_bytes: u64,
}

fn load_settings(conn: &Connection) -> Result<Option<ArchiveSettings>> {
    use rusqlite::OptionalExtension;
    let raw: Option<String> = conn
        .query_row(
            "SELECT value FROM settings WHERE key = ?1",
            [SETTINGS_KEY],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    match raw {
        Some(json) => {
            let settings =
                serde_json::from_str(&json).map_err(|e| DlfiError::Serialization(e.to_string()))?;
            Ok(Some(settings))
        }
        None => Ok(None),
    }
}

fn save_settings(conn: &Connection, settings: &ArchiveSettings) -> Result<()> {
    let json =
        serde_json::to_string(settings).map_err(|e| DlfiError::Serialization(e.to_string()))?;
    conn.execute(
        "INSERT OR REPLACE INTO settings (key, value) VALUES (?1, ?2)",
        rusqlite::params![SETTINGS_KEY, json],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(())
}

/// Current wall-clock time as unix seconds.
pub(crate) fn now_secs() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        assert!(dir.path().join(".dlfi/db.sqlite").exists());
        assert!(dir.path().join(".dlfi/storage").is_dir());
        assert!(dir.path().join(".dlfi/temp").is_dir());
        drop(archive);
    }

    #[test]
    fn second_process_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let first = Archive::open(dir.path()).unwrap();
        let err = Archive::open(dir.path()).unwrap_err();
        assert!(matches!(err, DlfiError::ArchiveBusy));
        drop(first);
        // Lock released with the archive.
        Archive::open(dir.path()).unwrap();
    }

    #[test]
    fn settings_persist_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let archive = Archive::open(dir.path()).unwrap();
            archive.set_partition_size(4096).unwrap();
        }
        let archive = Archive::open(dir.path()).unwrap();
        assert_eq!(archive.settings().partition_size, 4096);
    }
}
