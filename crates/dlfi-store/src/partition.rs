//! Append-only partition files
//!
//! In partition mode blobs are packed into `part_<nnnn>.dat` container
//! files capped at the configured size. Files are never rewritten in
//! place: dead entries are tombstoned in the index and reclaimed by an
//! explicit compaction that writes a fresh file and swaps it in.

use crate::crypto::{read_chunk, BlobCipher};
use crate::{blob, Archive};
use dlfi_core::{BlobInfo, BlobLocation, DlfiError, Result, IO_CHUNK_SIZE};
use rusqlite::{params, Connection, OptionalExtension};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub(crate) fn partition_path(storage_dir: &Path, id: u32) -> PathBuf {
    storage_dir.join(format!("part_{id:04}.dat"))
}

/// Append a staged file to the current partition, rolling over to a new
/// partition when the current one would exceed `max_size`. Returns the
/// slot as `(partition_id, offset)`.
pub(crate) fn append(
    archive: &Archive,
    conn: &Connection,
    staged_path: &Path,
    len: u64,
    max_size: u64,
) -> Result<(u32, u64)> {
    let last: Option<(i64, i64)> = conn
        .query_row(
            "SELECT partition_id, size FROM partitions ORDER BY partition_id DESC LIMIT 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(|e| DlfiError::Database(e.to_string()))?;

    let id = match last {
        None => 1,
        Some((id, size)) => {
            let size = size as u64;
            if size == 0 || size + len <= max_size {
                id as u32
            } else {
                id as u32 + 1
            }
        }
    };
    conn.execute(
        "INSERT OR IGNORE INTO partitions (partition_id, size, tombstone_bytes) VALUES (?1, 0, 0)",
        params![id as i64],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;

    let path = partition_path(archive.storage_dir(), id);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)?;
    let offset = file.metadata()?.len();

    let mut src = std::fs::File::open(staged_path)?;
    let mut buf = vec![0u8; IO_CHUNK_SIZE];
    loop {
        let n = read_chunk(&mut src, &mut buf)?;
        if n == 0 {
            break;
        }
        file.write_all(&buf[..n])?;
    }
    file.flush()?;

    conn.execute(
        "UPDATE partitions SET size = ?1 WHERE partition_id = ?2",
        params![(offset + len) as i64, id as i64],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;

    debug!("appended {} bytes to partition {} at {}", len, id, offset);
    Ok((id, offset))
}

/// What happens to slot bytes during a partition rewrite.
pub(crate) enum Transform<'a> {
    /// Compaction only: bytes copied verbatim.
    Copy,
    /// Slots hold plaintext; write them encrypted.
    Encrypt(&'a BlobCipher),
    /// Slots hold ciphertext; write them decrypted.
    Decrypt(&'a BlobCipher),
}

pub(crate) fn live_blobs_in(conn: &Connection, partition_id: u32) -> Result<Vec<BlobInfo>> {
    let mut stmt = conn
        .prepare(&format!(
            "SELECT {} FROM blobs
             WHERE partition_id = ?1 AND (ref_count > 0 OR pins > 0)
             ORDER BY part_offset",
            blob::BLOB_COLUMNS
        ))
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    let rows = stmt
        .query_map(params![partition_id as i64], blob::row_to_blob)
        .map_err(|e| DlfiError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(rows)
}

/// Rewrite one partition into a fresh file, dropping tombstoned slots and
/// applying `transform` to each surviving slot. Index entries are updated
/// and the new file swapped in atomically. Returns the bytes reclaimed.
pub(crate) fn rewrite_partition(
    archive: &Archive,
    conn: &Connection,
    partition_id: u32,
    transform: Transform<'_>,
) -> Result<u64> {
    let live = live_blobs_in(conn, partition_id)?;
    let path = partition_path(archive.storage_dir(), partition_id);
    let old_size = match std::fs::metadata(&path) {
        Ok(m) => m.len(),
        Err(_) => 0,
    };

    // Tombstoned entries lose their index rows with the old file.
    conn.execute(
        "DELETE FROM blobs WHERE partition_id = ?1 AND ref_count = 0 AND pins = 0",
        params![partition_id as i64],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;

    if live.is_empty() {
        conn.execute(
            "DELETE FROM partitions WHERE partition_id = ?1",
            params![partition_id as i64],
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        info!("dropped empty partition {}", partition_id);
        return Ok(old_size);
    }

    let mut out = tempfile::NamedTempFile::new_in(archive.storage_dir())?;
    let mut source = std::fs::File::open(&path)?;
    let mut new_offset: u64 = 0;

    for info in &live {
        let (offset, length) = match &info.location {
            BlobLocation::Partitioned { offset, length, .. } => (*offset, *length),
            BlobLocation::Loose { .. } => continue,
        };
        source.seek(SeekFrom::Start(offset))?;
        let mut slot = (&mut source).take(length);

        // Slots already in the target state are copied verbatim, so a
        // resumed enable/disable pass over a mixed partition stays correct.
        let (new_len, encrypted) = match &transform {
            Transform::Encrypt(cipher) if !info.encrypted => {
                let written = cipher.encrypt_stream(&mut slot, out.as_file_mut())?;
                (written, true)
            }
            Transform::Decrypt(cipher) if info.encrypted => {
                let mut plain = cipher.decrypt_reader(&mut slot, length)?;
                let mut buf = vec![0u8; IO_CHUNK_SIZE];
                let mut copied = 0u64;
                loop {
                    let n = read_chunk(&mut plain, &mut buf)?;
                    if n == 0 {
                        break;
                    }
                    out.as_file_mut().write_all(&buf[..n])?;
                    copied += n as u64;
                }
                (copied, false)
            }
            _ => {
                let mut buf = vec![0u8; IO_CHUNK_SIZE];
                let mut copied = 0u64;
                loop {
                    let n = read_chunk(&mut slot, &mut buf)?;
                    if n == 0 {
                        break;
                    }
                    out.as_file_mut().write_all(&buf[..n])?;
                    copied += n as u64;
                }
                (copied, info.encrypted)
            }
        };

        conn.execute(
            "UPDATE blobs SET part_offset = ?1, part_length = ?2, encrypted = ?3 WHERE hash = ?4",
            params![new_offset as i64, new_len as i64, encrypted as i64, info.hash],
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
        new_offset += new_len;
    }

    out.as_file_mut().sync_all()?;
    conn.execute(
        "UPDATE partitions SET size = ?1, tombstone_bytes = 0 WHERE partition_id = ?2",
        params![new_offset as i64, partition_id as i64],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;

    drop(source);
    out.persist(&path).map_err(|e| DlfiError::Io(e.error))?;
    info!(
        "rewrote partition {}: {} -> {} bytes",
        partition_id, old_size, new_offset
    );
    Ok(old_size.saturating_sub(new_offset))
}

/// Partitions carrying any tombstoned bytes, with their sizes.
pub(crate) fn tombstoned_partitions(conn: &Connection) -> Result<Vec<(u32, u64, u64)>> {
    let mut stmt = conn
        .prepare(
            "SELECT partition_id, size, tombstone_bytes FROM partitions
             WHERE tombstone_bytes > 0 ORDER BY partition_id",
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            let size: i64 = row.get(1)?;
            let tombstone: i64 = row.get(2)?;
            Ok((id as u32, size as u64, tombstone as u64))
        })
        .map_err(|e| DlfiError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(rows)
}

/// Every known partition id.
pub(crate) fn all_partitions(conn: &Connection) -> Result<Vec<u32>> {
    let mut stmt = conn
        .prepare("SELECT partition_id FROM partitions ORDER BY partition_id")
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    let rows = stmt
        .query_map([], |row| {
            let id: i64 = row.get(0)?;
            Ok(id as u32)
        })
        .map_err(|e| DlfiError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(rows)
}
