//! SQLite schema and connection tuning

use dlfi_core::{DlfiError, Result};
use rusqlite::Connection;

/// Apply the PRAGMA set for a local single-writer archive.
pub fn tune_connection(conn: &Connection) -> Result<()> {
    // journal_mode returns a row; execute_batch discards it.
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA foreign_keys=ON;",
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(())
}

/// Create all tables and indexes.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS nodes (
            uuid TEXT PRIMARY KEY,
            parent_uuid TEXT,
            node_type TEXT CHECK(node_type IN ('VAULT', 'RECORD')) NOT NULL,
            name TEXT NOT NULL,
            cached_path TEXT NOT NULL UNIQUE,
            metadata TEXT,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            UNIQUE(parent_uuid, name),
            FOREIGN KEY(parent_uuid) REFERENCES nodes(uuid)
        );
        CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_uuid);
        CREATE INDEX IF NOT EXISTS idx_nodes_path ON nodes(cached_path);

        CREATE TABLE IF NOT EXISTS tags (
            node_uuid TEXT NOT NULL,
            tag TEXT NOT NULL,
            PRIMARY KEY (node_uuid, tag),
            FOREIGN KEY(node_uuid) REFERENCES nodes(uuid)
        );
        CREATE INDEX IF NOT EXISTS idx_tags_tag ON tags(tag);

        CREATE TABLE IF NOT EXISTS relationships (
            source_uuid TEXT NOT NULL,
            target_uuid TEXT NOT NULL,
            relation TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (source_uuid, target_uuid, relation),
            FOREIGN KEY(source_uuid) REFERENCES nodes(uuid),
            FOREIGN KEY(target_uuid) REFERENCES nodes(uuid)
        );
        CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_uuid);
        CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_uuid);

        CREATE TABLE IF NOT EXISTS files (
            record_uuid TEXT NOT NULL,
            position INTEGER NOT NULL,
            display_name TEXT NOT NULL,
            blob_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            PRIMARY KEY (record_uuid, position),
            FOREIGN KEY(record_uuid) REFERENCES nodes(uuid),
            FOREIGN KEY(blob_hash) REFERENCES blobs(hash)
        );
        CREATE INDEX IF NOT EXISTS idx_files_blob ON files(blob_hash);

        CREATE TABLE IF NOT EXISTS blobs (
            hash TEXT PRIMARY KEY,
            ext TEXT,
            size INTEGER NOT NULL,
            ref_count INTEGER NOT NULL DEFAULT 0,
            pins INTEGER NOT NULL DEFAULT 0,
            encrypted INTEGER NOT NULL DEFAULT 0,
            storage_path TEXT,
            partition_id INTEGER,
            part_offset INTEGER,
            part_length INTEGER
        );
        CREATE INDEX IF NOT EXISTS idx_blobs_partition ON blobs(partition_id);

        CREATE TABLE IF NOT EXISTS partitions (
            partition_id INTEGER PRIMARY KEY,
            size INTEGER NOT NULL DEFAULT 0,
            tombstone_bytes INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS renditions (
            hash TEXT NOT NULL,
            rendition TEXT NOT NULL,
            rel_path TEXT NOT NULL,
            PRIMARY KEY (hash, rendition)
        );

        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );
        "#,
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;

    Ok(())
}
