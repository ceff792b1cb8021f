//! `QueryIndex` over the SQLite store
//!
//! One indexed lookup per clause. Metadata lookups go through
//! `json_extract`/`json_type` with the key bound as a quoted JSON path,
//! so arbitrary key names stay data, never SQL.

use crate::{meta, Archive};
use dlfi_core::{path, DlfiError, NodeSummary, NodeType, Result};
use dlfi_query::{QueryIndex, Scalar};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Escape `%`, `_`, and the escape character itself for a LIKE pattern
/// used with `ESCAPE '\'`.
fn like_escape(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// JSON path addressing a top-level key, quoted so dots inside the key do
/// not nest. Double quotes are stripped; they cannot appear in a path.
fn json_path(key: &str) -> String {
    format!("$.\"{}\"", key.replace('"', ""))
}

fn uuid_set(
    conn: &Connection,
    sql: &str,
    params: &[&dyn rusqlite::ToSql],
) -> Result<BTreeSet<Uuid>> {
    let mut stmt = conn
        .prepare(sql)
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    let rows = stmt
        .query_map(params, |row| {
            let raw: String = row.get(0)?;
            Ok(Uuid::parse_str(&raw).expect("invalid uuid"))
        })
        .map_err(|e| DlfiError::Database(e.to_string()))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()
        .map_err(|e| DlfiError::Database(e.to_string()))?;
    Ok(rows)
}

impl QueryIndex for Archive {
    fn universe(&self) -> Result<BTreeSet<Uuid>> {
        self.with_conn(|conn| uuid_set(conn, "SELECT uuid FROM nodes", &[]))
    }

    fn descendants_of(&self, raw_path: &str) -> Result<BTreeSet<Uuid>> {
        let normalized = match path::normalize(raw_path) {
            Ok(p) => p,
            Err(_) => return Ok(BTreeSet::new()),
        };
        let pattern = format!("{}/%", like_escape(&normalized));
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT uuid FROM nodes WHERE cached_path LIKE ?1 ESCAPE '\\'",
                &[&pattern],
            )
        })
    }

    fn by_type(&self, node_type: NodeType) -> Result<BTreeSet<Uuid>> {
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT uuid FROM nodes WHERE node_type = ?1",
                &[&node_type.as_str()],
            )
        })
    }

    fn with_tag(&self, tag: &str) -> Result<BTreeSet<Uuid>> {
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT node_uuid FROM tags WHERE tag = ?1",
                &[&tag],
            )
        })
    }

    fn meta_eq(&self, key: &str, value: &Scalar) -> Result<BTreeSet<Uuid>> {
        let json_path = json_path(key);
        self.with_conn(|conn| match value {
            Scalar::Str(s) => uuid_set(
                conn,
                "SELECT uuid FROM nodes
                 WHERE json_type(metadata, ?1) = 'text' AND json_extract(metadata, ?1) = ?2",
                &[&json_path, s],
            ),
            Scalar::Int(n) => uuid_set(
                conn,
                "SELECT uuid FROM nodes
                 WHERE json_type(metadata, ?1) = 'integer' AND json_extract(metadata, ?1) = ?2",
                &[&json_path, n],
            ),
            Scalar::Bool(b) => {
                let wanted = if *b { "true" } else { "false" };
                uuid_set(
                    conn,
                    "SELECT uuid FROM nodes WHERE json_type(metadata, ?1) = ?2",
                    &[&json_path, &wanted],
                )
            }
            Scalar::Null => uuid_set(
                conn,
                "SELECT uuid FROM nodes WHERE json_type(metadata, ?1) = 'null'",
                &[&json_path],
            ),
        })
    }

    fn meta_like(&self, key: &str, needle: &str) -> Result<BTreeSet<Uuid>> {
        let json_path = json_path(key);
        let pattern = format!("%{}%", like_escape(needle));
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT uuid FROM nodes
                 WHERE json_type(metadata, ?1) = 'text'
                   AND json_extract(metadata, ?1) LIKE ?2 ESCAPE '\\'",
                &[&json_path, &pattern],
            )
        })
    }

    fn related_to(&self, relation: &str, target_path: &str) -> Result<BTreeSet<Uuid>> {
        let target = match path::normalize(target_path)
            .ok()
            .map(|p| self.with_conn(|conn| meta::node_by_path(conn, &p)))
        {
            Some(Ok(Some(node))) => node.uuid,
            Some(Err(e)) => return Err(e),
            _ => return Ok(BTreeSet::new()),
        };
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT source_uuid FROM relationships
                 WHERE target_uuid = ?1 AND relation = ?2",
                &[&target.to_string(), &relation],
            )
        })
    }

    fn contains_related(&self, relation: &str, target_path: &str) -> Result<BTreeSet<Uuid>> {
        let target = match path::normalize(target_path)
            .ok()
            .map(|p| self.with_conn(|conn| meta::node_by_path(conn, &p)))
        {
            Some(Ok(Some(node))) => node.uuid,
            Some(Err(e)) => return Err(e),
            _ => return Ok(BTreeSet::new()),
        };
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT n.uuid FROM nodes n WHERE EXISTS (
                    SELECT 1 FROM nodes child
                    JOIN relationships e ON child.uuid = e.source_uuid
                    WHERE child.cached_path LIKE n.cached_path || '/%'
                      AND e.target_uuid = ?1 AND e.relation = ?2
                 )",
                &[&target.to_string(), &relation],
            )
        })
    }

    fn name_like(&self, needle: &str) -> Result<BTreeSet<Uuid>> {
        let pattern = format!("%{}%", like_escape(needle));
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT uuid FROM nodes WHERE name LIKE ?1 ESCAPE '\\'",
                &[&pattern],
            )
        })
    }

    fn path_like(&self, needle: &str) -> Result<BTreeSet<Uuid>> {
        let pattern = format!("%{}%", like_escape(needle));
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT uuid FROM nodes WHERE cached_path LIKE ?1 ESCAPE '\\'",
                &[&pattern],
            )
        })
    }

    fn with_ext(&self, ext: &str) -> Result<BTreeSet<Uuid>> {
        self.with_conn(|conn| {
            uuid_set(
                conn,
                "SELECT DISTINCT f.record_uuid FROM files f
                 JOIN blobs b ON f.blob_hash = b.hash
                 WHERE b.ext = ?1",
                &[&ext],
            )
        })
    }

    fn summaries(&self, uuids: &BTreeSet<Uuid>) -> Result<Vec<NodeSummary>> {
        self.with_conn(|conn| {
            let mut rows = Vec::with_capacity(uuids.len());
            for &uuid in uuids {
                let Some(node) = meta::node_by_uuid(conn, uuid)? else {
                    continue;
                };
                let tags = meta::tags_of(conn, uuid)?;
                let file_count: i64 = conn
                    .query_row(
                        "SELECT COUNT(*) FROM files WHERE record_uuid = ?1",
                        params![uuid.to_string()],
                        |row| row.get(0),
                    )
                    .map_err(|e| DlfiError::Database(e.to_string()))?;
                rows.push(NodeSummary {
                    uuid: node.uuid,
                    node_type: node.node_type,
                    name: node.name,
                    path: node.path,
                    metadata: node.metadata,
                    tags,
                    file_count: file_count as u32,
                    created_at: node.created_at,
                    updated_at: node.updated_at,
                });
            }
            rows.sort_by(|a, b| {
                let rank = |t: NodeType| if t == NodeType::Vault { 0u8 } else { 1 };
                rank(a.node_type)
                    .cmp(&rank(b.node_type))
                    .then_with(|| a.path.cmp(&b.path))
            });
            Ok(rows)
        })
    }

    fn tag_frequencies(&self) -> Result<Vec<(String, u64)>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT tag, COUNT(*) AS uses FROM tags
                     GROUP BY tag ORDER BY uses DESC, tag",
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| {
                    let tag: String = row.get(0)?;
                    let uses: i64 = row.get(1)?;
                    Ok((tag, uses as u64))
                })
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(rows)
        })
    }

    fn relation_labels(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT relation FROM relationships ORDER BY relation")
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(rows)
        })
    }

    fn paths_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}%", like_escape(prefix));
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT cached_path FROM nodes
                     WHERE cached_path LIKE ?1 ESCAPE '\\' ORDER BY cached_path",
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![pattern], |row| row.get(0))
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(rows)
        })
    }

    fn metadata_keys(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut keys = BTreeSet::new();
            let mut stmt = conn
                .prepare("SELECT metadata FROM nodes WHERE metadata IS NOT NULL")
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            for raw in rows {
                let raw = raw.map_err(|e| DlfiError::Database(e.to_string()))?;
                if let Ok(serde_json::Value::Object(map)) = serde_json::from_str(&raw) {
                    keys.extend(map.keys().cloned());
                }
            }
            Ok(keys.into_iter().collect())
        })
    }

    fn metadata_values(&self, key: &str) -> Result<Vec<String>> {
        let json_path = json_path(key);
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT DISTINCT json_extract(metadata, ?1) FROM nodes
                     WHERE json_type(metadata, ?1) IN ('text', 'integer', 'real', 'true', 'false')
                     ORDER BY 1 LIMIT 50",
                )
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rows = stmt
                .query_map(params![json_path], |row| row.get::<_, SqlValue>(0))
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let mut values = Vec::new();
            for row in rows {
                let value = row.map_err(|e| DlfiError::Database(e.to_string()))?;
                match value {
                    SqlValue::Text(s) => values.push(s),
                    SqlValue::Integer(n) => values.push(n.to_string()),
                    SqlValue::Real(f) => values.push(f.to_string()),
                    _ => {}
                }
            }
            Ok(values)
        })
    }

    fn extensions(&self) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT DISTINCT ext FROM blobs WHERE ext IS NOT NULL ORDER BY ext")
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            let rows = stmt
                .query_map([], |row| row.get(0))
                .map_err(|e| DlfiError::Database(e.to_string()))?
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| DlfiError::Database(e.to_string()))?;
            Ok(rows)
        })
    }
}
