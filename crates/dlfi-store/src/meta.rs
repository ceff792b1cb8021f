//! Metadata store operations: nodes, tags, relationships, file bindings
//!
//! Every public mutation here is one transaction; a failure leaves the
//! store unchanged. Path resolution walks the parent chain the way the
//! namespace is laid out on disk: one row per segment.

use crate::{blob, now_secs, Archive};
use dlfi_core::{path, CancelToken, DlfiError, FileBinding, Metadata, Node, NodeType, Relationship, Result};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

/// Partial update applied by [`Archive::update_node`].
#[derive(Debug, Default, Clone)]
pub struct NodeUpdate {
    /// Rename; requires a free sibling slot.
    pub name: Option<String>,
    /// Replaces the entire top-level metadata object.
    pub metadata: Option<Metadata>,
    /// Replaces the tag set (normalized and deduplicated).
    pub tags: Option<Vec<String>>,
}

const NODE_COLUMNS: &str =
    "uuid, parent_uuid, node_type, name, cached_path, metadata, created_at, updated_at";

fn row_to_node(row: &rusqlite::Row) -> rusqlite::Result<Node> {
    let uuid: String = row.get(0)?;
    let parent: Option<String> = row.get(1)?;
    let node_type: String = row.get(2)?;
    let name: String = row.get(3)?;
    let cached_path: String = row.get(4)?;
    let metadata: Option<String> = row.get(5)?;
    let created_at: i64 = row.get(6)?;
    let updated_at: i64 = row.get(7)?;

    Ok(Node {
        uuid: Uuid::parse_str(&uuid).expect("invalid uuid"),
        parent_uuid: parent.map(|p| Uuid::parse_str(&p).expect("invalid uuid")),
        node_type: NodeType::parse(&node_type).expect("invalid node type"),
        name,
        path: cached_path,
        metadata: parse_metadata(metadata),
        created_at,
        updated_at,
    })
}

fn parse_metadata(raw: Option<String>) -> Metadata {
    raw.and_then(|json| serde_json::from_str::<serde_json::Value>(&json).ok())
        .and_then(|value| match value {
            serde_json::Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

fn metadata_to_json(metadata: &Metadata) -> Result<Option<String>> {
    if metadata.is_empty() {
        return Ok(None);
    }
    serde_json::to_string(metadata)
        .map(Some)
        .map_err(|e| DlfiError::Serialization(e.to_string()))
}

pub(crate) fn node_by_uuid(conn: &Connection, uuid: Uuid) -> Result<Option<Node>> {
    conn.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE uuid = ?1"),
        params![uuid.to_string()],
        row_to_node,
    )
    .optional()
    .map_err(|e| DlfiError::Database(e.to_string()))
}

pub(crate) fn node_by_path(conn: &Connection, normalized: &str) -> Result<Option<Node>> {
    conn.query_row(
        &format!("SELECT {NODE_COLUMNS} FROM nodes WHERE cached_path = ?1"),
        params![normalized],
        row_to_node,
    )
    .optional()
    .map_err(|e| DlfiError::Database(e.to_string()))
}

fn child_by_name(conn: &Connection, parent: Option<Uuid>, name: &str) -> Result<Option<Node>> {
    let sql = match parent {
        Some(_) => format!("SELECT {NODE_COLUMNS} FROM nodes WHERE parent_uuid = ?1 AND name = ?2"),
        None => format!("SELECT {NODE_COLUMNS} FROM nodes WHERE parent_uuid IS NULL AND name = ?2"),
    };
    conn.query_row(
        &sql,
        params![parent.map(|p| p.to_string()), name],
        row_to_node,
    )
    .optional()
    .map_err(|e| DlfiError::Database(e.to_string()))
}

fn insert_node(
    conn: &Connection,
    parent: Option<Uuid>,
    node_type: NodeType,
    name: &str,
    cached_path: &str,
    metadata: Option<&Metadata>,
) -> Result<Uuid> {
    let uuid = Uuid::new_v4();
    let now = now_secs();
    let metadata_json = match metadata {
        Some(m) => metadata_to_json(m)?,
        None => None,
    };
    conn.execute(
        "INSERT INTO nodes (uuid, parent_uuid, node_type, name, cached_path, metadata, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            uuid.to_string(),
            parent.map(|p| p.to_string()),
            node_type.as_str(),
            name,
            cached_path,
            metadata_json,
            now,
            now,
        ],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(uuid)
}

/// Walk `normalized`, creating missing ancestors as VAULTs and the final
/// segment as `final_type`. Existing intermediate RECORDs fail
/// `TypeConflict`; an existing final node of the other type fails
/// `PathTaken`. Creation is idempotent for a matching final type.
fn ensure_chain(
    conn: &Connection,
    normalized: &str,
    final_type: NodeType,
    metadata: Option<&Metadata>,
) -> Result<Uuid> {
    let segments: Vec<&str> = normalized.split('/').collect();
    let mut parent: Option<Uuid> = None;
    let mut walked = String::new();

    for (i, segment) in segments.iter().enumerate() {
        let is_last = i + 1 == segments.len();
        if i > 0 {
            walked.push('/');
        }
        walked.push_str(segment);

        match child_by_name(conn, parent, segment)? {
            Some(existing) => {
                if is_last {
                    if existing.node_type != final_type {
                        return Err(DlfiError::PathTaken(format!(
                            "{walked} already exists as {}",
                            existing.node_type
                        )));
                    }
                } else if existing.node_type != NodeType::Vault {
                    return Err(DlfiError::TypeConflict(format!(
                        "{walked} is a RECORD and cannot contain children"
                    )));
                }
                parent = Some(existing.uuid);
            }
            None => {
                let node_type = if is_last { final_type } else { NodeType::Vault };
                let node_metadata = if is_last { metadata } else { None };
                let uuid = insert_node(conn, parent, node_type, segment, &walked, node_metadata)?;
                parent = Some(uuid);
            }
        }
    }

    // The loop always walks at least one segment.
    parent.ok_or_else(|| DlfiError::InvalidPath(normalized.to_string()))
}

impl Archive {
    /// Ensure a VAULT exists at `path`, creating missing ancestors.
    pub fn create_vault(&self, raw_path: &str) -> Result<Uuid> {
        let normalized = path::normalize(raw_path)?;
        self.with_tx(|tx| ensure_chain(tx, &normalized, NodeType::Vault, None))
    }

    /// Ensure a RECORD exists at `path`, creating missing ancestor VAULTs.
    /// Metadata applies only when the record is created here.
    pub fn create_record(&self, raw_path: &str, metadata: Metadata) -> Result<Uuid> {
        let normalized = path::normalize(raw_path)?;
        self.with_tx(|tx| ensure_chain(tx, &normalized, NodeType::Record, Some(&metadata)))
    }

    /// Resolve a path to a node uuid.
    pub fn resolve(&self, raw_path: &str) -> Result<Uuid> {
        let normalized = path::normalize(raw_path)?;
        self.with_conn(|conn| {
            node_by_path(conn, &normalized)?
                .map(|n| n.uuid)
                .ok_or_else(|| DlfiError::NotFound(normalized.clone()))
        })
    }

    pub fn node(&self, uuid: Uuid) -> Result<Node> {
        self.with_conn(|conn| {
            node_by_uuid(conn, uuid)?.ok_or_else(|| DlfiError::NotFound(uuid.to_string()))
        })
    }

    pub fn node_at(&self, raw_path: &str) -> Result<Option<Node>> {
        let normalized = path::normalize(raw_path)?;
        self.with_conn(|conn| node_by_path(conn, &normalized))
    }

    /// Direct children of a VAULT, ordered by name.
    pub fn children(&self, uuid: Uuid) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {NODE_COLUMNS} FROM nodes WHERE parent_uuid = ?1 ORDER BY name"
                ))
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let nodes = stmt
                .query_map(params![uuid.to_string()], row_to_node)
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(nodes)
        })
    }

    /// All nodes ordered by canonical path (export and debugging).
    pub fn all_nodes(&self) -> Result<Vec<Node>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {NODE_COLUMNS} FROM nodes ORDER BY cached_path"
                ))
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let nodes = stmt
                .query_map([], row_to_node)
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(nodes)
        })
    }

    /// Tags in insertion order.
    pub fn tags_of(&self, uuid: Uuid) -> Result<Vec<String>> {
        self.with_conn(|conn| tags_of(conn, uuid))
    }

    /// Outgoing relationships of a node.
    pub fn relationships_of(&self, uuid: Uuid) -> Result<Vec<Relationship>> {
        self.with_conn(|conn| relationships_from(conn, uuid))
    }

    /// Incoming relationships of a node.
    pub fn relationships_to(&self, uuid: Uuid) -> Result<Vec<Relationship>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT source_uuid, target_uuid, relation, created_at
                     FROM relationships WHERE target_uuid = ?1 ORDER BY relation, source_uuid",
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rels = stmt
                .query_map(params![uuid.to_string()], row_to_relationship)
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(rels)
        })
    }

    /// File bindings of a record in position order.
    pub fn bindings_of(&self, uuid: Uuid) -> Result<Vec<FileBinding>> {
        self.with_conn(|conn| bindings_of(conn, uuid))
    }

    /// Apply a partial update: rename, metadata replacement, tag
    /// replacement. A rename rewrites the cached paths of the whole
    /// descendant subtree in the same transaction.
    pub fn update_node(&self, uuid: Uuid, update: NodeUpdate) -> Result<()> {
        self.with_tx(|tx| {
            let node = node_by_uuid(tx, uuid)?
                .ok_or_else(|| DlfiError::NotFound(uuid.to_string()))?;

            if let Some(new_name) = &update.name {
                path::validate_segment(new_name)?;
                if *new_name != node.name {
                    if let Some(sibling) = child_by_name(tx, node.parent_uuid, new_name)? {
                        return Err(DlfiError::PathTaken(sibling.path));
                    }
                    rename_node(tx, &node, new_name)?;
                }
            }

            if let Some(metadata) = &update.metadata {
                let json = metadata_to_json(metadata)?;
                tx.execute(
                    "UPDATE nodes SET metadata = ?1 WHERE uuid = ?2",
                    params![json, uuid.to_string()],
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            }

            if let Some(tags) = &update.tags {
                tx.execute(
                    "DELETE FROM tags WHERE node_uuid = ?1",
                    params![uuid.to_string()],
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
                for tag in tags {
                    insert_tag(tx, uuid, tag)?;
                }
            }

            touch(tx, uuid)?;
            Ok(())
        })
    }

    /// Shallow top-level metadata merge; a JSON `null` value removes the key.
    pub fn merge_metadata(&self, uuid: Uuid, patch: Metadata) -> Result<()> {
        self.with_tx(|tx| {
            let node = node_by_uuid(tx, uuid)?
                .ok_or_else(|| DlfiError::NotFound(uuid.to_string()))?;
            let mut merged = node.metadata;
            for (key, value) in patch {
                if value.is_null() {
                    merged.remove(&key);
                } else {
                    merged.insert(key, value);
                }
            }
            let json = metadata_to_json(&merged)?;
            tx.execute(
                "UPDATE nodes SET metadata = ?1 WHERE uuid = ?2",
                params![json, uuid.to_string()],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
            touch(tx, uuid)?;
            Ok(())
        })
    }

    /// Add a tag (normalized to lowercase). Adding an existing tag is a
    /// no-op.
    pub fn add_tag(&self, uuid: Uuid, tag: &str) -> Result<()> {
        self.with_tx(|tx| {
            require_node(tx, uuid)?;
            insert_tag(tx, uuid, tag)?;
            touch(tx, uuid)
        })
    }

    /// Remove a tag. Removing an absent tag is a no-op.
    pub fn remove_tag(&self, uuid: Uuid, tag: &str) -> Result<()> {
        self.with_tx(|tx| {
            require_node(tx, uuid)?;
            tx.execute(
                "DELETE FROM tags WHERE node_uuid = ?1 AND tag = ?2",
                params![uuid.to_string(), path::normalize_tag(tag)],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
            touch(tx, uuid)
        })
    }

    /// Create a directed relationship. Fails `RelationExists` on a
    /// duplicate triple and `InvalidPath` for a malformed label.
    pub fn link(&self, source: Uuid, target: Uuid, relation: &str) -> Result<()> {
        if !path::valid_relation(relation) {
            return Err(DlfiError::InvalidPath(format!(
                "invalid relation label {relation:?}"
            )));
        }
        if source == target {
            return Err(DlfiError::InvalidPath("self-loops are not allowed".into()));
        }
        self.with_tx(|tx| {
            require_node(tx, source)?;
            require_node(tx, target)?;
            let exists: Option<i64> = tx
                .query_row(
                    "SELECT 1 FROM relationships
                     WHERE source_uuid = ?1 AND target_uuid = ?2 AND relation = ?3",
                    params![source.to_string(), target.to_string(), relation],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            if exists.is_some() {
                return Err(DlfiError::RelationExists(format!(
                    "{source} -{relation}-> {target}"
                )));
            }
            tx.execute(
                "INSERT INTO relationships (source_uuid, target_uuid, relation, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![source.to_string(), target.to_string(), relation, now_secs()],
            )
            .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(())
        })
    }

    /// Remove a relationship. By default a missing edge fails `NotFound`;
    /// pass `idempotent` to make removal a no-op instead.
    pub fn unlink(&self, source: Uuid, target: Uuid, relation: &str, idempotent: bool) -> Result<()> {
        self.with_tx(|tx| {
            let removed = tx
                .execute(
                    "DELETE FROM relationships
                     WHERE source_uuid = ?1 AND target_uuid = ?2 AND relation = ?3",
                    params![source.to_string(), target.to_string(), relation],
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            if removed == 0 && !idempotent {
                return Err(DlfiError::NotFound(format!(
                    "{source} -{relation}-> {target}"
                )));
            }
            Ok(())
        })
    }

    /// Delete a node and its whole subtree: file bindings are dropped
    /// (decrementing blob ref-counts), incident relationships removed in
    /// both directions, then the nodes themselves.
    pub fn delete(&self, uuid: Uuid) -> Result<()> {
        self.with_tx(|tx| delete_subtree(tx, uuid))
    }

    /// Delete a set of nodes with per-item results. One transaction per
    /// item; an individual failure never aborts the batch. After
    /// cancellation the remaining items report `Cancelled`.
    pub fn bulk_delete(
        &self,
        uuids: &[Uuid],
        cancel: &CancelToken,
    ) -> Vec<(Uuid, Result<()>)> {
        let mut results = Vec::with_capacity(uuids.len());
        for &uuid in uuids {
            if cancel.is_cancelled() {
                results.push((uuid, Err(DlfiError::Cancelled)));
                continue;
            }
            results.push((uuid, self.delete(uuid)));
        }
        let failed = results.iter().filter(|(_, r)| r.is_err()).count();
        info!(
            "bulk delete: {} ok, {} failed",
            results.len() - failed,
            failed
        );
        results
    }
}

fn require_node(conn: &Connection, uuid: Uuid) -> Result<Node> {
    node_by_uuid(conn, uuid)?.ok_or_else(|| DlfiError::NotFound(uuid.to_string()))
}

fn touch(conn: &Connection, uuid: Uuid) -> Result<()> {
    conn.execute(
        "UPDATE nodes SET updated_at = ?1 WHERE uuid = ?2",
        params![now_secs(), uuid.to_string()],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(())
}

fn insert_tag(conn: &Connection, uuid: Uuid, tag: &str) -> Result<()> {
    let normalized = path::normalize_tag(tag);
    if normalized.is_empty() {
        return Err(DlfiError::InvalidPath("empty tag".into()));
    }
    conn.execute(
        "INSERT OR IGNORE INTO tags (node_uuid, tag) VALUES (?1, ?2)",
        params![uuid.to_string(), normalized],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(())
}

pub(crate) fn tags_of(conn: &Connection, uuid: Uuid) -> Result<Vec<String>> {
    let mut stmt = conn
        .prepare("SELECT tag FROM tags WHERE node_uuid = ?1 ORDER BY rowid")
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    let tags = stmt
        .query_map(params![uuid.to_string()], |row| row.get(0))
        .map_err(|e| DlfiError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(tags)
}

fn row_to_relationship(row: &rusqlite::Row) -> rusqlite::Result<Relationship> {
    let source: String = row.get(0)?;
    let target: String = row.get(1)?;
    Ok(Relationship {
        source_uuid: Uuid::parse_str(&source).expect("invalid uuid"),
        target_uuid: Uuid::parse_str(&target).expect("invalid uuid"),
        relation: row.get(2)?,
        created_at: row.get(3)?,
    })
}

pub(crate) fn relationships_from(conn: &Connection, uuid: Uuid) -> Result<Vec<Relationship>> {
    let mut stmt = conn
        .prepare(
            "SELECT source_uuid, target_uuid, relation, created_at
             FROM relationships WHERE source_uuid = ?1 ORDER BY relation, target_uuid",
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    let rels = stmt
        .query_map(params![uuid.to_string()], row_to_relationship)
        .map_err(|e| DlfiError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(rels)
}

pub(crate) fn bindings_of(conn: &Connection, uuid: Uuid) -> Result<Vec<FileBinding>> {
    let mut stmt = conn
        .prepare(
            "SELECT record_uuid, position, display_name, blob_hash, created_at
             FROM files WHERE record_uuid = ?1 ORDER BY position",
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    let bindings = stmt
        .query_map(params![uuid.to_string()], |row| {
            let record: String = row.get(0)?;
            Ok(FileBinding {
                record_uuid: Uuid::parse_str(&record).expect("invalid uuid"),
                position: row.get(1)?,
                display_name: row.get(2)?,
                blob_hash: row.get(3)?,
                created_at: row.get(4)?,
            })
        })
        .map_err(|e| DlfiError::Database(e.to_string()))?
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(bindings)
}

fn rename_node(conn: &Connection, node: &Node, new_name: &str) -> Result<()> {
    let old_path = node.path.clone();
    let new_path = match node.path.rfind('/') {
        Some(idx) => format!("{}/{new_name}", &node.path[..idx]),
        None => new_name.to_string(),
    };
    conn.execute(
        "UPDATE nodes SET name = ?1 WHERE uuid = ?2",
        params![new_name, node.uuid.to_string()],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;

    // Rewrite cached paths for the node and every descendant. substr is
    // character-based in SQLite, so the prefix length is counted in chars.
    let old_chars = old_path.chars().count() as i64;
    conn.execute(
        "UPDATE nodes SET cached_path = ?1 || substr(cached_path, ?2)
         WHERE cached_path = ?3
            OR substr(cached_path, 1, ?4) = ?5",
        params![
            new_path,
            old_chars + 1,
            old_path,
            old_chars + 1,
            format!("{old_path}/"),
        ],
    )
    .map_err(|e| DlfiError::Database(e.to_string()))?;
    debug!("renamed {} -> {}", old_path, new_path);
    Ok(())
}

fn delete_subtree(tx: &rusqlite::Transaction, root: Uuid) -> Result<()> {
    let node = node_by_uuid(tx, root)?.ok_or_else(|| DlfiError::NotFound(root.to_string()))?;

    // Gather the descendant set breadth-first.
    let mut order = vec![root];
    let mut queue = std::collections::VecDeque::from([root]);
    while let Some(current) = queue.pop_front() {
        let mut stmt = tx
            .prepare("SELECT uuid FROM nodes WHERE parent_uuid = ?1")
            .map_err(|e| DlfiError::Database(e.to_string()))?;
        let children = stmt
            .query_map(params![current.to_string()], |row| {
                let raw: String = row.get(0)?;
                Ok(Uuid::parse_str(&raw).expect("invalid uuid"))
            })
            .map_err(|e| DlfiError::Database(e.to_string()))?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| DlfiError::Database(e.to_string()))?;
        for child in children {
            order.push(child);
            queue.push_back(child);
        }
    }

    for &uuid in &order {
        // Bindings first so blob ref-counts are adjusted before rows go.
        for binding in bindings_of(tx, uuid)? {
            blob::decrement_ref(tx, &binding.blob_hash)?;
        }
        tx.execute(
            "DELETE FROM files WHERE record_uuid = ?1",
            params![uuid.to_string()],
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
        tx.execute(
            "DELETE FROM tags WHERE node_uuid = ?1",
            params![uuid.to_string()],
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
        tx.execute(
            "DELETE FROM relationships WHERE source_uuid = ?1 OR target_uuid = ?1",
            params![uuid.to_string()],
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    }

    // Children before parents to satisfy the parent foreign key.
    for uuid in order.iter().rev() {
        tx.execute(
            "DELETE FROM nodes WHERE uuid = ?1",
            params![uuid.to_string()],
        )
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    }

    debug!("deleted subtree at {} ({} nodes)", node.path, order.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Archive;

    fn archive() -> (tempfile::TempDir, Archive) {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        (dir, archive)
    }

    #[test]
    fn create_record_builds_vault_chain() {
        let (_dir, archive) = archive();
        let uuid = archive.create_record("m/jojo/ch1", Metadata::new()).unwrap();

        let record = archive.node(uuid).unwrap();
        assert_eq!(record.node_type, NodeType::Record);
        assert_eq!(record.path, "m/jojo/ch1");

        let parent = archive.node_at("m/jojo").unwrap().unwrap();
        assert_eq!(parent.node_type, NodeType::Vault);
        assert!(parent.metadata.is_empty());
        assert!(archive.tags_of(parent.uuid).unwrap().is_empty());
    }

    #[test]
    fn create_is_idempotent_per_type() {
        let (_dir, archive) = archive();
        let a = archive.create_vault("a/b").unwrap();
        let b = archive.create_vault("a/b").unwrap();
        assert_eq!(a, b);

        let err = archive.create_record("a/b", Metadata::new()).unwrap_err();
        assert!(matches!(err, DlfiError::PathTaken(_)));
    }

    #[test]
    fn record_cannot_be_intermediate() {
        let (_dir, archive) = archive();
        archive.create_record("a", Metadata::new()).unwrap();
        let err = archive
            .create_record("a/b/c", Metadata::new())
            .unwrap_err();
        assert!(matches!(err, DlfiError::TypeConflict(_)));
    }

    #[test]
    fn rename_rewrites_descendant_paths() {
        let (_dir, archive) = archive();
        let vault = archive.create_vault("top/old").unwrap();
        let record = archive.create_record("top/old/deep/r", Metadata::new()).unwrap();

        archive
            .update_node(
                vault,
                NodeUpdate {
                    name: Some("new".into()),
                    ..Default::default()
                },
            )
            .unwrap();

        assert_eq!(archive.node(vault).unwrap().path, "top/new");
        assert_eq!(archive.node(record).unwrap().path, "top/new/deep/r");
        assert!(archive.node_at("top/old").unwrap().is_none());
    }

    #[test]
    fn rename_requires_free_sibling_slot() {
        let (_dir, archive) = archive();
        archive.create_vault("top/a").unwrap();
        let b = archive.create_vault("top/b").unwrap();
        let err = archive
            .update_node(
                b,
                NodeUpdate {
                    name: Some("a".into()),
                    ..Default::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, DlfiError::PathTaken(_)));
    }

    #[test]
    fn tags_normalize_and_dedupe() {
        let (_dir, archive) = archive();
        let uuid = archive.create_record("r", Metadata::new()).unwrap();
        archive.add_tag(uuid, "Nature").unwrap();
        archive.add_tag(uuid, "nature").unwrap();
        archive.add_tag(uuid, " LANDSCAPE ").unwrap();
        assert_eq!(archive.tags_of(uuid).unwrap(), vec!["nature", "landscape"]);

        archive.remove_tag(uuid, "NATURE").unwrap();
        archive.remove_tag(uuid, "nature").unwrap();
        assert_eq!(archive.tags_of(uuid).unwrap(), vec!["landscape"]);
    }

    #[test]
    fn link_rejects_bad_labels_and_duplicates() {
        let (_dir, archive) = archive();
        let a = archive.create_record("a", Metadata::new()).unwrap();
        let b = archive.create_record("b", Metadata::new()).unwrap();

        assert!(archive.link(a, b, "authored_by").is_err());
        assert!(archive.link(a, a, "SELF").is_err());

        archive.link(a, b, "AUTHORED_BY").unwrap();
        let err = archive.link(a, b, "AUTHORED_BY").unwrap_err();
        assert!(matches!(err, DlfiError::RelationExists(_)));

        // Same endpoints under a different label are a distinct edge.
        archive.link(a, b, "DREW").unwrap();
        assert_eq!(archive.relationships_of(a).unwrap().len(), 2);
    }

    #[test]
    fn unlink_default_errors_idempotent_does_not() {
        let (_dir, archive) = archive();
        let a = archive.create_record("a", Metadata::new()).unwrap();
        let b = archive.create_record("b", Metadata::new()).unwrap();
        archive.link(a, b, "REL").unwrap();

        archive.unlink(a, b, "REL", false).unwrap();
        let err = archive.unlink(a, b, "REL", false).unwrap_err();
        assert!(matches!(err, DlfiError::NotFound(_)));
        archive.unlink(a, b, "REL", true).unwrap();
    }

    #[test]
    fn metadata_merge_and_replace() {
        let (_dir, archive) = archive();
        let mut meta = Metadata::new();
        meta.insert("year".into(), serde_json::json!(2023));
        meta.insert("title".into(), serde_json::json!("one"));
        let uuid = archive.create_record("r", meta).unwrap();

        let mut patch = Metadata::new();
        patch.insert("title".into(), serde_json::json!("two"));
        patch.insert("year".into(), serde_json::Value::Null);
        archive.merge_metadata(uuid, patch).unwrap();

        let node = archive.node(uuid).unwrap();
        assert_eq!(node.metadata.get("title"), Some(&serde_json::json!("two")));
        assert!(!node.metadata.contains_key("year"));

        // Full replacement drops everything not in the new object.
        let mut fresh = Metadata::new();
        fresh.insert("only".into(), serde_json::json!(true));
        archive
            .update_node(
                uuid,
                NodeUpdate {
                    metadata: Some(fresh),
                    ..Default::default()
                },
            )
            .unwrap();
        let node = archive.node(uuid).unwrap();
        assert_eq!(node.metadata.len(), 1);
        assert!(node.metadata.contains_key("only"));
    }

    #[test]
    fn delete_cascades_and_removes_incident_edges() {
        let (_dir, archive) = archive();
        let vault = archive.create_vault("v").unwrap();
        let inner = archive.create_record("v/r", Metadata::new()).unwrap();
        let outside = archive.create_record("other", Metadata::new()).unwrap();
        archive.link(outside, inner, "POINTS_AT").unwrap();
        archive.link(inner, outside, "POINTS_BACK").unwrap();

        archive.delete(vault).unwrap();

        assert!(archive.node_at("v").unwrap().is_none());
        assert!(archive.node_at("v/r").unwrap().is_none());
        assert!(archive.relationships_of(outside).unwrap().is_empty());
        assert!(archive.relationships_to(outside).unwrap().is_empty());
        // The untouched node survives.
        archive.node(outside).unwrap();
    }

    #[test]
    fn bulk_delete_isolates_failures() {
        let (_dir, archive) = archive();
        let a = archive.create_record("a", Metadata::new()).unwrap();
        let missing = Uuid::new_v4();
        let b = archive.create_record("b", Metadata::new()).unwrap();

        let results = archive.bulk_delete(&[a, missing, b], &CancelToken::new());
        assert!(results[0].1.is_ok());
        assert!(matches!(results[1].1, Err(DlfiError::NotFound(_))));
        assert!(results[2].1.is_ok());
    }
}
