//! Long-running archive maintenance: vacuum, encryption toggling, rekey
//!
//! These operations work in per-blob or per-partition transactions so a
//! cancellation bounds the rollback cost; the per-blob `encrypted` flag
//! keeps a partially converted store readable throughout.

use crate::crypto::{BlobCipher, HEADER_LEN};
use crate::partition::{self, Transform};
use crate::{keystore, Archive};
use dlfi_core::{BlobInfo, BlobLocation, CancelToken, DlfiError, Result};
use rusqlite::params;
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::{info, warn};

/// Compact a partition once this share of it is tombstoned.
const COMPACT_THRESHOLD: f64 = 0.25;

/// What a vacuum pass reclaimed
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct VacuumReport {
    pub loose_removed: u64,
    pub partitions_compacted: u64,
    pub bytes_reclaimed: u64,
}

impl Archive {
    /// Physically remove zero-ref loose blobs and compact partitions whose
    /// tombstoned share exceeds the threshold.
    pub fn vacuum(&self, cancel: &CancelToken) -> Result<VacuumReport> {
        self.vacuum_inner(cancel, COMPACT_THRESHOLD)
    }

    /// Vacuum, compacting every partition carrying any tombstoned bytes.
    pub fn vacuum_all(&self, cancel: &CancelToken) -> Result<VacuumReport> {
        self.vacuum_inner(cancel, 0.0)
    }

    fn vacuum_inner(&self, cancel: &CancelToken, threshold: f64) -> Result<VacuumReport> {
        let mut report = VacuumReport::default();

        let dead: Vec<BlobInfo> = self
            .all_blobs()?
            .into_iter()
            .filter(|b| b.ref_count == 0 && b.pins == 0)
            .filter(|b| matches!(b.location, BlobLocation::Loose { .. }))
            .collect();
        for info in dead {
            cancel.check()?;
            let BlobLocation::Loose { path } = &info.location else {
                continue;
            };
            let full = self.storage_dir().join(path);
            self.with_tx(|tx| {
                tx.execute("DELETE FROM blobs WHERE hash = ?1", params![info.hash])
                    .map_err(|e| DlfiError::Database(e.to_string()))?;
                if full.exists() {
                    std::fs::remove_file(&full)?;
                }
                Ok(())
            })?;
            report.loose_removed += 1;
            report.bytes_reclaimed += info.size;
        }

        let candidates = self.with_conn(partition::tombstoned_partitions)?;
        for (id, size, tombstone) in candidates {
            cancel.check()?;
            if size > 0 && (tombstone as f64) < (size as f64) * threshold {
                continue;
            }
            let reclaimed =
                self.with_tx(|tx| partition::rewrite_partition(self, tx, id, Transform::Copy))?;
            report.partitions_compacted += 1;
            report.bytes_reclaimed += reclaimed;
        }

        self.sweep_orphan_renditions()?;
        info!(
            "vacuum: {} loose removed, {} partitions compacted, {} bytes reclaimed",
            report.loose_removed, report.partitions_compacted, report.bytes_reclaimed
        );
        Ok(report)
    }

    fn sweep_orphan_renditions(&self) -> Result<()> {
        let orphans: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT rel_path FROM renditions
                     WHERE hash NOT IN (SELECT hash FROM blobs)",
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(rows)
        })?;
        if orphans.is_empty() {
            return Ok(());
        }
        let dir = self.system_dir().join("renditions");
        for rel in &orphans {
            let full = dir.join(rel);
            if full.exists() {
                if let Err(e) = std::fs::remove_file(&full) {
                    warn!("could not remove rendition {rel}: {e}");
                }
            }
        }
        self.with_conn(|conn| {
            conn.execute(
                "DELETE FROM renditions WHERE hash NOT IN (SELECT hash FROM blobs)",
                [],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(())
        })
    }

    /// Enable or disable at-rest encryption.
    ///
    /// `Some(passphrase)` converts every plaintext blob in place; calling
    /// it again with the same passphrase resumes an interrupted pass.
    /// `None` decrypts everything and removes the key store, failing
    /// closed on the first decryption error.
    pub fn set_encryption(&self, passphrase: Option<&str>, cancel: &CancelToken) -> Result<()> {
        match passphrase {
            Some(pass) => self.enable_encryption(pass, cancel),
            None => self.disable_encryption(cancel),
        }
    }

    fn enable_encryption(&self, passphrase: &str, cancel: &CancelToken) -> Result<()> {
        let mut settings = self.settings();
        let cipher = if settings.encryption.enabled {
            // Resume: the passphrase must match the existing key store.
            BlobCipher::new(keystore::unlock(self.keys_path(), passphrase)?)
        } else {
            let master_key =
                keystore::create(self.keys_path(), passphrase, &settings.encryption.kdf)?;
            settings.encryption.enabled = true;
            self.replace_settings(settings)?;
            BlobCipher::new(master_key)
        };
        *self.cipher().lock().unwrap() = Some(cipher.clone());

        let plain_loose: Vec<BlobInfo> = self
            .all_blobs()?
            .into_iter()
            .filter(|b| !b.encrypted && matches!(b.location, BlobLocation::Loose { .. }))
            .collect();
        let total = plain_loose.len();
        for (i, blob) in plain_loose.into_iter().enumerate() {
            cancel.check()?;
            self.convert_loose(&blob, &cipher, true)?;
            if (i + 1) % 100 == 0 || i + 1 == total {
                info!("encrypted {}/{} loose blobs", i + 1, total);
            }
        }

        for id in self.partitions_with(false)? {
            cancel.check()?;
            self.with_tx(|tx| {
                partition::rewrite_partition(self, tx, id, Transform::Encrypt(&cipher))
            })?;
        }

        info!("encryption enabled");
        Ok(())
    }

    fn disable_encryption(&self, cancel: &CancelToken) -> Result<()> {
        let settings = self.settings();
        if !settings.encryption.enabled {
            return Ok(());
        }
        let cipher = self
            .cipher()
            .lock()
            .unwrap()
            .clone()
            .ok_or(DlfiError::DecryptionFailed)?;

        let encrypted_loose: Vec<BlobInfo> = self
            .all_blobs()?
            .into_iter()
            .filter(|b| b.encrypted && matches!(b.location, BlobLocation::Loose { .. }))
            .collect();
        let total = encrypted_loose.len();
        for (i, blob) in encrypted_loose.into_iter().enumerate() {
            cancel.check()?;
            self.convert_loose(&blob, &cipher, false)?;
            if (i + 1) % 100 == 0 || i + 1 == total {
                info!("decrypted {}/{} loose blobs", i + 1, total);
            }
        }

        for id in self.partitions_with(true)? {
            cancel.check()?;
            self.with_tx(|tx| {
                partition::rewrite_partition(self, tx, id, Transform::Decrypt(&cipher))
            })?;
        }

        let mut settings = self.settings();
        settings.encryption.enabled = false;
        self.replace_settings(settings)?;
        keystore::remove(self.keys_path())?;
        *self.cipher().lock().unwrap() = None;
        info!("encryption disabled");
        Ok(())
    }

    /// Re-encrypt or decrypt one loose blob in place (temp + atomic rename).
    fn convert_loose(&self, blob: &BlobInfo, cipher: &BlobCipher, encrypt: bool) -> Result<()> {
        let BlobLocation::Loose { path } = &blob.location else {
            return Ok(());
        };
        let full = self.storage_dir().join(path);
        self.with_tx(|tx| {
            let src = std::fs::File::open(&full)
                .map_err(|_| DlfiError::BlobMissing(blob.hash.clone()))?;
            let mut temp = tempfile::NamedTempFile::new_in(self.temp_dir())?;
            if encrypt {
                cipher.encrypt_stream(src, temp.as_file_mut())?;
            } else {
                let stored_len = src.metadata()?.len();
                let mut plain = cipher.decrypt_reader(src, stored_len)?;
                let mut buf = vec![0u8; dlfi_core::IO_CHUNK_SIZE];
                loop {
                    let n = crate::crypto::read_chunk(&mut plain, &mut buf)?;
                    if n == 0 {
                        break;
                    }
                    temp.as_file_mut().write_all(&buf[..n])?;
                }
            }
            temp.as_file_mut().flush()?;
            temp.persist(&full).map_err(|e| DlfiError::Io(e.error))?;
            tx.execute(
                "UPDATE blobs SET encrypted = ?1 WHERE hash = ?2",
                params![encrypt as i64, blob.hash],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(())
        })
    }

    /// Partition ids holding at least one live blob in the given
    /// encryption state.
    fn partitions_with(&self, encrypted: bool) -> Result<Vec<u32>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT partition_id FROM blobs
                     WHERE partition_id IS NOT NULL AND encrypted = ?1
                       AND (ref_count > 0 OR pins > 0)
                     ORDER BY partition_id",
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![encrypted as i64], |row| {
                    let id: i64 = row.get(0)?;
                    Ok(id as u32)
                })
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(rows)
        })
    }

    /// Rotate the master passphrase. Every blob DEK is unwrapped under the
    /// old master key and rewrapped under the new one; ciphertext bodies
    /// are untouched. On cancellation the already-rewrapped headers are
    /// rolled back so the old passphrase stays valid.
    pub fn change_passphrase(&self, old: &str, new: &str, cancel: &CancelToken) -> Result<()> {
        let settings = self.settings();
        if !settings.encryption.enabled {
            return Err(DlfiError::Crypto("encryption is not enabled".into()));
        }
        let old_cipher = BlobCipher::new(keystore::unlock(self.keys_path(), old)?);

        let salt = keystore::fresh_salt();
        let new_master = keystore::derive_master_key(new, &salt, &settings.encryption.kdf)?;
        let new_cipher = BlobCipher::new(new_master);

        let encrypted: Vec<BlobInfo> = self
            .all_blobs()?
            .into_iter()
            .filter(|b| b.encrypted)
            .collect();

        let mut done: Vec<BlobInfo> = Vec::new();
        for blob in encrypted {
            if cancel.is_cancelled() {
                // Bounded rollback: restore old wrapping for processed blobs.
                for processed in &done {
                    self.rewrap_blob(processed, &new_cipher, &old_cipher)?;
                }
                return Err(DlfiError::Cancelled);
            }
            self.rewrap_blob(&blob, &old_cipher, &new_cipher)?;
            done.push(blob);
        }

        keystore::write(self.keys_path(), &salt, &settings.encryption.kdf, &new_master)?;
        *self.cipher().lock().unwrap() = Some(new_cipher);
        info!("passphrase rotated over {} blobs", done.len());
        Ok(())
    }

    /// Rewrap one blob's header in place.
    fn rewrap_blob(&self, blob: &BlobInfo, from: &BlobCipher, to: &BlobCipher) -> Result<()> {
        let (path, offset) = match &blob.location {
            BlobLocation::Loose { path } => (self.storage_dir().join(path), 0u64),
            BlobLocation::Partitioned {
                partition_id,
                offset,
                ..
            } => (
                partition::partition_path(self.storage_dir(), *partition_id),
                *offset,
            ),
        };
        let mut file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|_| DlfiError::BlobMissing(blob.hash.clone()))?;
        file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)?;
        from.rewrap_header(to, &mut header)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&header)?;
        file.sync_data()?;
        Ok(())
    }
}
