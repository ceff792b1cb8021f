//! Content-addressed blob storage
//!
//! Blobs are addressed by the SHA-256 of their plaintext. Ingest streams
//! into the staging area while hashing, then promotes the staged file with
//! an atomic rename (loose mode) or a partition append. Identical content
//! is deduplicated: the second ingest only bumps the ref-count.

use crate::{crypto, meta, now_secs, partition, Archive};
use dlfi_core::{
    path as dlfi_path, BlobInfo, BlobLocation, DlfiError, NodeType, Result, IO_CHUNK_SIZE,
};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tracing::debug;
use uuid::Uuid;

/// Result of a blob ingest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutOutcome {
    pub hash: String,
    /// Plaintext size in bytes
    pub size: u64,
    /// True when identical content was already stored
    pub deduped: bool,
}

/// Plaintext stream over a stored blob
pub struct BlobReader {
    inner: ReaderKind,
}

enum ReaderKind {
    Plain(Box<dyn Read + Send>),
    Encrypted(crypto::DecryptReader<Box<dyn Read + Send>>),
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match &mut self.inner {
            ReaderKind::Plain(r) => r.read(buf),
            ReaderKind::Encrypted(r) => r.read(buf),
        }
    }
}

/// Reader wrapper that hashes and counts everything passing through.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
    count: u64,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            count: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (hex::encode(self.hasher.finalize()), self.count)
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.count += n as u64;
        Ok(n)
    }
}

/// A blob staged into the temp area, hashed but not yet committed.
struct Staged {
    hash: String,
    size: u64,
    encrypted: bool,
    temp: tempfile::NamedTempFile,
}

impl Archive {
    fn stage(&self, reader: impl Read) -> Result<Staged> {
        let mut temp = tempfile::NamedTempFile::new_in(self.temp_dir())?;
        let cipher = self.cipher().lock().unwrap().clone();
        let mut hashing = HashingReader::new(reader);

        let encrypted = match &cipher {
            Some(cipher) => {
                cipher.encrypt_stream(&mut hashing, temp.as_file_mut())?;
                true
            }
            None => {
                let mut buf = vec![0u8; IO_CHUNK_SIZE];
                loop {
                    let n = crypto::read_chunk(&mut hashing, &mut buf)?;
                    if n == 0 {
                        break;
                    }
                    temp.as_file_mut().write_all(&buf[..n])?;
                }
                false
            }
        };
        temp.as_file_mut().flush()?;

        let (hash, size) = hashing.finish();
        Ok(Staged {
            hash,
            size,
            encrypted,
            temp,
        })
    }

    /// Promote a staged blob inside the caller's transaction. Returns true
    /// when the content was already present (the staged file is discarded).
    fn commit_staged(&self, conn: &Connection, staged: Staged, ext: Option<&str>) -> Result<bool> {
        if let Some(existing) = blob_row(conn, &staged.hash)? {
            // Dedup: identical plaintext, keep the stored copy.
            debug!("dedup hit for {}", existing.hash);
            return Ok(true);
        }

        let partition_size = self.settings().partition_size;
        if partition_size > 0 {
            let stored_len = staged.temp.as_file().metadata()?.len();
            let (partition_id, offset) =
                partition::append(self, conn, staged.temp.path(), stored_len, partition_size)?;
            conn.execute(
                "INSERT INTO blobs (hash, ext, size, ref_count, pins, encrypted,
                                    partition_id, part_offset, part_length)
                 VALUES (?1, ?2, ?3, 0, 0, ?4, ?5, ?6, ?7)",
                params![
                    staged.hash,
                    ext,
                    staged.size as i64,
                    staged.encrypted as i64,
                    partition_id as i64,
                    offset as i64,
                    stored_len as i64,
                ],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
        } else {
            let rel_path = format!(
                "{}/{}/{}",
                &staged.hash[0..2],
                &staged.hash[2..4],
                staged.hash
            );
            let final_path = self.storage_dir().join(&rel_path);
            if let Some(parent) = final_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let hash = staged.hash.clone();
            staged
                .temp
                .persist(&final_path)
                .map_err(|e| DlfiError::Io(e.error))?;
            conn.execute(
                "INSERT INTO blobs (hash, ext, size, ref_count, pins, encrypted, storage_path)
                 VALUES (?1, ?2, ?3, 0, 0, ?4, ?5)",
                params![hash, ext, staged.size as i64, staged.encrypted as i64, rel_path],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
        }
        Ok(false)
    }

    /// Ingest a byte stream. The blob row is committed with a zero
    /// ref-count; bind it with [`Archive::append_file`] or use
    /// [`Archive::append_stream`] for the atomic combination.
    pub fn put(&self, reader: impl Read) -> Result<PutOutcome> {
        let staged = self.stage(reader)?;
        let hash = staged.hash.clone();
        let size = staged.size;
        let deduped = self.with_tx(|tx| self.commit_staged(tx, staged, None))?;
        Ok(PutOutcome {
            hash,
            size,
            deduped,
        })
    }

    /// Bind an existing blob to a record at the next position and bump its
    /// ref-count. Fails `BlobMissing` for unknown hashes.
    pub fn append_file(&self, record: Uuid, display_name: &str, blob_hash: &str) -> Result<()> {
        self.with_tx(|tx| {
            bind_blob(tx, record, display_name, blob_hash)?;
            Ok(())
        })
    }

    /// Stream bytes into the store and bind the resulting blob to a record
    /// in one transaction.
    pub fn append_stream(
        &self,
        record: Uuid,
        display_name: &str,
        reader: impl Read,
    ) -> Result<PutOutcome> {
        let staged = self.stage(reader)?;
        let hash = staged.hash.clone();
        let size = staged.size;
        let ext = dlfi_path::file_extension(display_name);
        let deduped = self.with_tx(|tx| {
            let deduped = self.commit_staged(tx, staged, ext.as_deref())?;
            bind_blob(tx, record, display_name, &hash)?;
            Ok(deduped)
        })?;
        Ok(PutOutcome {
            hash,
            size,
            deduped,
        })
    }

    /// Drop the binding at `position`, closing the position gap and
    /// decrementing the blob's ref-count.
    pub fn remove_file(&self, record: Uuid, position: u32) -> Result<()> {
        self.with_tx(|tx| {
            let hash: Option<String> = tx
                .query_row(
                    "SELECT blob_hash FROM files WHERE record_uuid = ?1 AND position = ?2",
                    params![record.to_string(), position],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let hash = hash.ok_or_else(|| {
                DlfiError::NotFound(format!("no binding at position {position}"))
            })?;

            tx.execute(
                "DELETE FROM files WHERE record_uuid = ?1 AND position = ?2",
                params![record.to_string(), position],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
            decrement_ref(tx, &hash)?;

            // Close the gap one row at a time, ascending, so the
            // (record, position) key never collides.
            let mut stmt = tx
                .prepare(
                    "SELECT position FROM files WHERE record_uuid = ?1 AND position > ?2
                     ORDER BY position",
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let tail: Vec<u32> = stmt
                .query_map(params![record.to_string(), position], |row| row.get(0))
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            for p in tail {
                tx.execute(
                    "UPDATE files SET position = ?1 WHERE record_uuid = ?2 AND position = ?3",
                    params![p - 1, record.to_string(), p],
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            }
            Ok(())
        })
    }

    /// Stored attributes of a blob.
    pub fn blob_info(&self, hash: &str) -> Result<BlobInfo> {
        self.with_conn(|conn| {
            blob_row(conn, hash)?.ok_or_else(|| DlfiError::BlobMissing(hash.to_string()))
        })
    }

    /// Open a plaintext stream over a blob.
    pub fn open_blob(&self, hash: &str) -> Result<BlobReader> {
        let info = self.blob_info(hash)?;
        let (raw, stored_len) = self.open_raw(&info)?;
        if info.encrypted {
            let cipher = self.cipher().lock().unwrap().clone();
            let cipher = cipher.ok_or(DlfiError::DecryptionFailed)?;
            let reader = cipher.decrypt_reader(raw, stored_len)?;
            Ok(BlobReader {
                inner: ReaderKind::Encrypted(reader),
            })
        } else {
            Ok(BlobReader {
                inner: ReaderKind::Plain(raw),
            })
        }
    }

    /// Raw on-disk stream (ciphertext for encrypted blobs) and its length.
    pub(crate) fn open_raw(&self, info: &BlobInfo) -> Result<(Box<dyn Read + Send>, u64)> {
        match &info.location {
            BlobLocation::Loose { path } => {
                let full = self.storage_dir().join(path);
                let file = std::fs::File::open(&full)
                    .map_err(|_| DlfiError::BlobMissing(info.hash.clone()))?;
                let len = file.metadata()?.len();
                Ok((Box::new(file), len))
            }
            BlobLocation::Partitioned {
                partition_id,
                offset,
                length,
            } => {
                let full = partition::partition_path(self.storage_dir(), *partition_id);
                let mut file = std::fs::File::open(&full)
                    .map_err(|_| DlfiError::BlobMissing(info.hash.clone()))?;
                file.seek(SeekFrom::Start(*offset))?;
                Ok((Box::new(file.take(*length)), *length))
            }
        }
    }

    /// Re-hash a blob's plaintext and compare it to its address.
    pub fn verify_blob(&self, hash: &str) -> Result<()> {
        let mut reader = self.open_blob(hash)?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; IO_CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let actual = hex::encode(hasher.finalize());
        if actual != hash {
            return Err(DlfiError::IntegrityCheckFailed(format!(
                "{hash} stored bytes hash to {actual}"
            )));
        }
        Ok(())
    }

    /// Pin a blob so a zero binding count does not make it collectable.
    pub fn pin_blob(&self, hash: &str) -> Result<()> {
        self.with_tx(|tx| adjust_refs(tx, hash, 0, 1))
    }

    /// Release one explicit pin; releasing an unpinned blob is a no-op.
    pub fn unpin_blob(&self, hash: &str) -> Result<()> {
        self.with_tx(|tx| {
            let info = blob_row(tx, hash)?.ok_or_else(|| DlfiError::BlobMissing(hash.to_string()))?;
            if info.pins == 0 {
                return Ok(());
            }
            adjust_refs(tx, hash, 0, -1)
        })
    }

    /// Cached rendition (thumbnail) path for `(hash, rendition)`, if one
    /// has been stored.
    pub fn rendition_path(&self, hash: &str, rendition: &str) -> Result<Option<PathBuf>> {
        self.with_conn(|conn| {
            let rel: Option<String> = conn
                .query_row(
                    "SELECT rel_path FROM renditions WHERE hash = ?1 AND rendition = ?2",
                    params![hash, rendition],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(rel.map(|r| self.system_dir().join("renditions").join(r)))
        })
    }

    /// Store a derived rendition keyed by `(hash, rendition)`.
    pub fn store_rendition(
        &self,
        hash: &str,
        rendition: &str,
        mut reader: impl Read,
    ) -> Result<PathBuf> {
        self.blob_info(hash)?;
        let dir = self.system_dir().join("renditions");
        std::fs::create_dir_all(&dir)?;
        let rel = format!("{hash}_{rendition}");
        let mut temp = tempfile::NamedTempFile::new_in(&dir)?;
        std::io::copy(&mut reader, temp.as_file_mut())?;
        let full = dir.join(&rel);
        temp.persist(&full).map_err(|e| DlfiError::Io(e.error))?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR REPLACE INTO renditions (hash, rendition, rel_path) VALUES (?1, ?2, ?3)",
                params![hash, rendition, rel],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(())
        })?;
        Ok(full)
    }

    /// Snapshot of every blob row (maintenance passes).
    pub(crate) fn all_blobs(&self) -> Result<Vec<BlobInfo>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!("SELECT {BLOB_COLUMNS} FROM blobs ORDER BY hash"))
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let blobs = stmt
                .query_map([], row_to_blob)
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(blobs)
        })
    }
}

/// Insert a binding at the record's next position and bump the ref-count.
fn bind_blob(conn: &Connection, record: Uuid, display_name: &str, hash: &str) -> Result<()> {
    let node = meta::node_by_uuid(conn, record)?
        .ok_or_else(|| DlfiError::NotFound(record.to_string()))?;
    if node.node_type != NodeType::Record {
        return Err(DlfiError::TypeConflict(format!(
            "{} is a VAULT; files attach to RECORDs",
            node.path
        )));
    }
    let count: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM files WHERE record_uuid = ?1",
            params![record.to_string()],
            |row| row.get(0),
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;

    adjust_refs(conn, hash, 1, 0)?;
    conn.execute(
        "INSERT INTO files (record_uuid, position, display_name, blob_hash, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![record.to_string(), count, display_name, hash, now_secs()],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;
    conn.execute(
        "UPDATE nodes SET updated_at = ?1 WHERE uuid = ?2",
        params![now_secs(), record.to_string()],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(())
}

pub(crate) const BLOB_COLUMNS: &str =
    "hash, ext, size, ref_count, pins, encrypted, storage_path, partition_id, part_offset, part_length";

pub(crate) fn row_to_blob(row: &rusqlite::Row) -> rusqlite::Result<BlobInfo> {
    let hash: String = row.get(0)?;
    let ext: Option<String> = row.get(1)?;
    let size: i64 = row.get(2)?;
    let ref_count: i64 = row.get(3)?;
    let pins: i64 = row.get(4)?;
    let encrypted: i64 = row.get(5)?;
    let storage_path: Option<String> = row.get(6)?;
    let partition_id: Option<i64> = row.get(7)?;
    let part_offset: Option<i64> = row.get(8)?;
    let part_length: Option<i64> = row.get(9)?;

    let location = match storage_path {
        Some(path) => BlobLocation::Loose { path },
        None => BlobLocation::Partitioned {
            partition_id: partition_id.expect("partitioned blob without partition id") as u32,
            offset: part_offset.expect("partitioned blob without offset") as u64,
            length: part_length.expect("partitioned blob without length") as u64,
        },
    };
    Ok(BlobInfo {
        hash,
        ext,
        size: size as u64,
        ref_count: ref_count as u32,
        pins: pins as u32,
        encrypted: encrypted != 0,
        location,
    })
}

pub(crate) fn blob_row(conn: &Connection, hash: &str) -> Result<Option<BlobInfo>> {
    conn.query_row(
        &format!("SELECT {BLOB_COLUMNS} FROM blobs WHERE hash = ?1"),
        params![hash],
        row_to_blob,
    )
    .optional()
    .map_err(|e| DlfiError::Database(e.to_string()))
}

/// Adjust ref/pin counts, keeping partition tombstone accounting in sync
/// when a blob crosses the dead/alive boundary.
pub(crate) fn adjust_refs(conn: &Connection, hash: &str, ref_delta: i64, pin_delta: i64) -> Result<()> {
    let info = blob_row(conn, hash)?.ok_or_else(|| DlfiError::BlobMissing(hash.to_string()))?;
    let new_refs = info.ref_count as i64 + ref_delta;
    let new_pins = info.pins as i64 + pin_delta;
    if new_refs < 0 || new_pins < 0 {
        return Err(DlfiError::Database(format!(
            "ref-count underflow for blob {hash}"
        )));
    }
    conn.execute(
        "UPDATE blobs SET ref_count = ?1, pins = ?2 WHERE hash = ?3",
        params![new_refs, new_pins, hash],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;

    if let BlobLocation::Partitioned {
        partition_id,
        length,
        ..
    } = info.location
    {
        let was_dead = info.ref_count == 0 && info.pins == 0;
        let is_dead = new_refs == 0 && new_pins == 0;
        if !was_dead && is_dead {
            conn.execute(
                "UPDATE partitions SET tombstone_bytes = tombstone_bytes + ?1 WHERE partition_id = ?2",
                params![length as i64, partition_id as i64],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
        } else if was_dead && !is_dead {
            conn.execute(
                "UPDATE partitions SET tombstone_bytes = tombstone_bytes - ?1 WHERE partition_id = ?2",
                params![length as i64, partition_id as i64],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
        }
    }
    Ok(())
}

pub(crate) fn decrement_ref(conn: &Connection, hash: &str) -> Result<()> {
    adjust_refs(conn, hash, -1, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlfi_core::Metadata;

    fn archive() -> (tempfile::TempDir, Archive) {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        (dir, archive)
    }

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn put_dedupes_identical_content() {
        let (_dir, archive) = archive();
        let first = archive.put(&b"hello world, jojo"[..]).unwrap();
        assert!(!first.deduped);
        assert_eq!(first.size, 17);

        let second = archive.put(&b"hello world, jojo"[..]).unwrap();
        assert!(second.deduped);
        assert_eq!(second.hash, first.hash);

        // One loose file on disk.
        let info = archive.blob_info(&first.hash).unwrap();
        assert!(matches!(info.location, BlobLocation::Loose { .. }));
    }

    #[test]
    fn empty_ingest_yields_well_known_hash() {
        let (_dir, archive) = archive();
        let outcome = archive.put(&b""[..]).unwrap();
        assert_eq!(outcome.hash, EMPTY_SHA256);
        assert_eq!(outcome.size, 0);
    }

    #[test]
    fn append_stream_binds_and_counts() {
        let (_dir, archive) = archive();
        let record = archive.create_record("m/jojo/ch1", Metadata::new()).unwrap();

        let a = archive
            .append_stream(record, "page1.txt", &b"hello world, jojo"[..])
            .unwrap();
        let b = archive
            .append_stream(record, "page2.txt", &b"hello world, jojo"[..])
            .unwrap();
        assert!(!a.deduped);
        assert!(b.deduped);
        assert_eq!(a.hash, b.hash);

        let info = archive.blob_info(&a.hash).unwrap();
        assert_eq!(info.ref_count, 2);
        assert_eq!(info.ext, Some("txt".to_string()));

        let bindings = archive.bindings_of(record).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].position, 0);
        assert_eq!(bindings[1].position, 1);
        assert_eq!(bindings[0].display_name, "page1.txt");
    }

    #[test]
    fn append_file_requires_existing_blob_and_record() {
        let (_dir, archive) = archive();
        let record = archive.create_record("r", Metadata::new()).unwrap();
        let vault = archive.create_vault("v").unwrap();

        let err = archive.append_file(record, "x.bin", "ff00").unwrap_err();
        assert!(matches!(err, DlfiError::BlobMissing(_)));

        let put = archive.put(&b"data"[..]).unwrap();
        let err = archive.append_file(vault, "x.bin", &put.hash).unwrap_err();
        assert!(matches!(err, DlfiError::TypeConflict(_)));

        archive.append_file(record, "x.bin", &put.hash).unwrap();
        assert_eq!(archive.blob_info(&put.hash).unwrap().ref_count, 1);
    }

    #[test]
    fn open_blob_roundtrips_content() {
        let (_dir, archive) = archive();
        let put = archive.put(&b"some interesting bytes"[..]).unwrap();
        let mut out = Vec::new();
        archive
            .open_blob(&put.hash)
            .unwrap()
            .read_to_end(&mut out)
            .unwrap();
        assert_eq!(out, b"some interesting bytes");
        archive.verify_blob(&put.hash).unwrap();
    }

    #[test]
    fn remove_file_decrements_and_compacts_positions() {
        let (_dir, archive) = archive();
        let record = archive.create_record("r", Metadata::new()).unwrap();
        archive.append_stream(record, "a", &b"one"[..]).unwrap();
        let two = archive.append_stream(record, "b", &b"two"[..]).unwrap();
        archive.append_stream(record, "c", &b"three"[..]).unwrap();

        archive.remove_file(record, 1).unwrap();
        let bindings = archive.bindings_of(record).unwrap();
        assert_eq!(bindings.len(), 2);
        assert_eq!(bindings[0].display_name, "a");
        assert_eq!(bindings[1].display_name, "c");
        assert_eq!(bindings[1].position, 1);
        assert_eq!(archive.blob_info(&two.hash).unwrap().ref_count, 0);
    }

    #[test]
    fn pins_keep_blobs_alive() {
        let (_dir, archive) = archive();
        let put = archive.put(&b"pinned"[..]).unwrap();
        archive.pin_blob(&put.hash).unwrap();
        assert_eq!(archive.blob_info(&put.hash).unwrap().pins, 1);
        archive.unpin_blob(&put.hash).unwrap();
        archive.unpin_blob(&put.hash).unwrap();
        assert_eq!(archive.blob_info(&put.hash).unwrap().pins, 0);
    }
}
