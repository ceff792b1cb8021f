//! DL-FI Export - static projection of a live archive
//!
//! Projects the node tree into a plain directory layout that can be
//! browsed without the database: every node becomes a directory with a
//! `_meta.json` sidecar, record files are written in position order with
//! duplicate display names disambiguated, and a top-level `index.json`
//! maps every uuid to its path. Output is byte-stable: JSON keys are
//! sorted, newlines are `\n`, and nodes are visited in path order.

use dlfi_core::{CancelToken, DlfiError, Node, NodeType, Result};
use dlfi_store::Archive;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Write;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

/// A per-file failure the export skipped over
#[derive(Debug, Clone, Serialize)]
pub struct SkippedFile {
    /// Node path of the record the binding belongs to
    pub path: String,
    pub display_name: String,
    pub blob_hash: String,
    pub error: String,
}

/// Summary of an export run, also written as `export_manifest.json`
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExportManifest {
    pub nodes_exported: u64,
    pub files_written: u64,
    pub skipped: Vec<SkippedFile>,
    pub cancelled: bool,
}

/// Export the archive into `out_dir`, replacing any previous export.
///
/// Per-file read failures are recorded in the manifest and skipped; a
/// cancellation finishes the current node, writes the manifest, and
/// returns `Cancelled`.
pub fn export(archive: &Archive, out_dir: &Path, cancel: &CancelToken) -> Result<ExportManifest> {
    if out_dir.exists() {
        info!("cleaning previous export at {}", out_dir.display());
        std::fs::remove_dir_all(out_dir)?;
    }
    std::fs::create_dir_all(out_dir)?;

    let nodes = archive.all_nodes()?;
    let uuid_to_path: HashMap<Uuid, String> =
        nodes.iter().map(|n| (n.uuid, n.path.clone())).collect();

    let mut manifest = ExportManifest::default();
    for node in &nodes {
        if cancel.is_cancelled() {
            manifest.cancelled = true;
            break;
        }
        export_node(archive, out_dir, node, &uuid_to_path, &mut manifest)?;
        manifest.nodes_exported += 1;
    }

    let index: BTreeMap<String, String> = uuid_to_path
        .iter()
        .map(|(uuid, path)| (uuid.to_string(), path.clone()))
        .collect();
    write_json(&out_dir.join("index.json"), &serde_json::to_value(&index).map_err(json_err)?)?;

    write_json(
        &out_dir.join("export_manifest.json"),
        &canonicalize(&serde_json::to_value(&manifest).map_err(json_err)?),
    )?;

    if manifest.cancelled {
        return Err(DlfiError::Cancelled);
    }
    info!(
        "export complete: {} nodes, {} files, {} skipped",
        manifest.nodes_exported,
        manifest.files_written,
        manifest.skipped.len()
    );
    Ok(manifest)
}

fn export_node(
    archive: &Archive,
    out_dir: &Path,
    node: &Node,
    uuid_to_path: &HashMap<Uuid, String>,
    manifest: &mut ExportManifest,
) -> Result<()> {
    let node_dir = out_dir.join(&node.path);
    std::fs::create_dir_all(&node_dir)?;

    let mut file_names = Vec::new();
    if node.node_type == NodeType::Record {
        let mut used: HashSet<String> = HashSet::new();
        used.insert("_meta.json".to_string());
        for binding in archive.bindings_of(node.uuid)? {
            let name = disambiguate(&binding.display_name, &used);
            match write_blob_file(archive, &binding.blob_hash, &node_dir.join(&name)) {
                Ok(()) => {
                    used.insert(name.clone());
                    file_names.push(name);
                    manifest.files_written += 1;
                }
                Err(e) => {
                    warn!(
                        "skipping {}/{}: {}",
                        node.path, binding.display_name, e
                    );
                    manifest.skipped.push(SkippedFile {
                        path: node.path.clone(),
                        display_name: binding.display_name.clone(),
                        blob_hash: binding.blob_hash.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
    }

    let mut meta = Map::new();
    meta.insert("uuid".into(), Value::String(node.uuid.to_string()));
    meta.insert(
        "type".into(),
        Value::String(node.node_type.as_str().to_string()),
    );
    meta.insert("name".into(), Value::String(node.name.clone()));
    meta.insert("metadata".into(), Value::Object(node.metadata.clone()));
    meta.insert(
        "tags".into(),
        Value::Array(
            archive
                .tags_of(node.uuid)?
                .into_iter()
                .map(Value::String)
                .collect(),
        ),
    );

    // Both vaults and records carry relationships when any outgoing
    // edges exist. Targets outside the exported subtree still resolve to
    // their absolute path.
    let relationships = archive.relationships_of(node.uuid)?;
    if !relationships.is_empty() {
        let rels: Vec<Value> = relationships
            .iter()
            .map(|rel| {
                let mut entry = Map::new();
                entry.insert("relation".into(), Value::String(rel.relation.clone()));
                entry.insert(
                    "target_path".into(),
                    Value::String(
                        uuid_to_path
                            .get(&rel.target_uuid)
                            .cloned()
                            .unwrap_or_else(|| rel.target_uuid.to_string()),
                    ),
                );
                Value::Object(entry)
            })
            .collect();
        meta.insert("relationships".into(), Value::Array(rels));
    }

    if !file_names.is_empty() {
        meta.insert(
            "files".into(),
            Value::Array(file_names.into_iter().map(Value::String).collect()),
        );
    }

    write_json(
        &node_dir.join("_meta.json"),
        &canonicalize(&Value::Object(meta)),
    )
}

fn write_blob_file(archive: &Archive, hash: &str, dest: &Path) -> Result<()> {
    let mut reader = archive.open_blob(hash)?;
    let mut out = std::fs::File::create(dest)?;
    std::io::copy(&mut reader, &mut out)?;
    out.flush()?;
    Ok(())
}

/// First free variant of `name`: `name`, then `<stem>_1.<ext>`,
/// `<stem>_2.<ext>`, and so on.
fn disambiguate(name: &str, used: &HashSet<String>) -> String {
    if !used.contains(name) {
        return name.to_string();
    }
    let (stem, ext) = dlfi_core::path::split_display_name(name);
    for i in 1.. {
        let candidate = match ext {
            Some(ext) => format!("{stem}_{i}.{ext}"),
            None => format!("{stem}_{i}"),
        };
        if !used.contains(&candidate) {
            return candidate;
        }
    }
    unreachable!("counter space exhausted")
}

/// Sort object keys recursively so serialization is byte-stable.
fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            let mut out = Map::new();
            for (key, inner) in sorted {
                out.insert(key.clone(), canonicalize(inner));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

fn write_json(path: &Path, value: &Value) -> Result<()> {
    let mut bytes = serde_json::to_vec_pretty(value).map_err(json_err)?;
    bytes.push(b'\n');
    std::fs::write(path, bytes)?;
    Ok(())
}

fn json_err(e: serde_json::Error) -> DlfiError {
    DlfiError::Serialization(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlfi_core::Metadata;

    fn seeded() -> (tempfile::TempDir, Archive) {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path().join("archive")).unwrap();

        let mut meta = Metadata::new();
        meta.insert("year".into(), serde_json::json!(1987));
        let ch1 = archive.create_record("m/jojo/ch1", meta).unwrap();
        archive.add_tag(ch1, "manga").unwrap();
        archive
            .append_stream(ch1, "page.txt", &b"hello world, jojo"[..])
            .unwrap();
        archive
            .append_stream(ch1, "page.txt", &b"second page"[..])
            .unwrap();

        let araki = archive.create_vault("people/araki").unwrap();
        archive.link(ch1, araki, "AUTHORED_BY").unwrap();
        (dir, archive)
    }

    #[test]
    fn export_writes_tree_and_sidecars() {
        let (dir, archive) = seeded();
        let out = dir.path().join("out");
        let manifest = export(&archive, &out, &CancelToken::new()).unwrap();
        assert_eq!(manifest.files_written, 2);
        assert!(manifest.skipped.is_empty());

        // Record directory holds the disambiguated bindings.
        assert!(out.join("m/jojo/ch1/page.txt").exists());
        assert!(out.join("m/jojo/ch1/page_1.txt").exists());
        assert_eq!(
            std::fs::read(out.join("m/jojo/ch1/page.txt")).unwrap(),
            b"hello world, jojo"
        );

        let meta: Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("m/jojo/ch1/_meta.json")).unwrap())
                .unwrap();
        assert_eq!(meta["type"], "RECORD");
        assert_eq!(meta["name"], "ch1");
        assert_eq!(meta["metadata"]["year"], 1987);
        assert_eq!(meta["tags"][0], "manga");
        assert_eq!(meta["relationships"][0]["relation"], "AUTHORED_BY");
        assert_eq!(meta["relationships"][0]["target_path"], "people/araki");
        assert_eq!(meta["files"][1], "page_1.txt");

        // Vault sidecar has no files key and no relationships.
        let vault_meta: Value =
            serde_json::from_str(&std::fs::read_to_string(out.join("m/jojo/_meta.json")).unwrap())
                .unwrap();
        assert_eq!(vault_meta["type"], "VAULT");
        assert!(vault_meta.get("files").is_none());
        assert!(vault_meta.get("relationships").is_none());

        // index.json maps every uuid to its path.
        let index: BTreeMap<String, String> =
            serde_json::from_str(&std::fs::read_to_string(out.join("index.json")).unwrap()).unwrap();
        assert_eq!(index.len(), archive.all_nodes().unwrap().len());
        let ch1 = archive.node_at("m/jojo/ch1").unwrap().unwrap();
        assert_eq!(index.get(&ch1.uuid.to_string()).unwrap(), "m/jojo/ch1");
    }

    #[test]
    fn export_twice_is_byte_stable() {
        let (dir, archive) = seeded();
        let out_a = dir.path().join("a");
        let out_b = dir.path().join("b");
        export(&archive, &out_a, &CancelToken::new()).unwrap();
        export(&archive, &out_b, &CancelToken::new()).unwrap();

        let mut paths_a = collect_files(&out_a);
        let mut paths_b = collect_files(&out_b);
        paths_a.sort();
        paths_b.sort();
        assert_eq!(paths_a.len(), paths_b.len());
        for (a, b) in paths_a.iter().zip(paths_b.iter()) {
            assert_eq!(
                a.strip_prefix(&out_a).unwrap(),
                b.strip_prefix(&out_b).unwrap()
            );
            assert_eq!(
                std::fs::read(a).unwrap(),
                std::fs::read(b).unwrap(),
                "files differ: {a:?}"
            );
        }
    }

    #[test]
    fn missing_blob_is_skipped_with_manifest_entry() {
        let (dir, archive) = seeded();
        // Break a blob on disk.
        let ch1 = archive.node_at("m/jojo/ch1").unwrap().unwrap();
        let binding = &archive.bindings_of(ch1.uuid).unwrap()[0];
        let info = archive.blob_info(&binding.blob_hash).unwrap();
        let dlfi_core::BlobLocation::Loose { path } = &info.location else {
            panic!("expected loose blob");
        };
        std::fs::remove_file(dir.path().join("archive/.dlfi/storage").join(path)).unwrap();

        let out = dir.path().join("out");
        let manifest = export(&archive, &out, &CancelToken::new()).unwrap();
        assert_eq!(manifest.skipped.len(), 1);
        assert_eq!(manifest.skipped[0].blob_hash, binding.blob_hash);
        // The export as a whole still succeeded.
        assert!(out.join("m/jojo/ch1/_meta.json").exists());
    }

    #[test]
    fn cancelled_export_reports_and_errs() {
        let (dir, archive) = seeded();
        let out = dir.path().join("out");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = export(&archive, &out, &cancel).unwrap_err();
        assert!(matches!(err, DlfiError::Cancelled));
        // Manifest still written, flagged cancelled.
        let manifest: Value = serde_json::from_str(
            &std::fs::read_to_string(out.join("export_manifest.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(manifest["cancelled"], true);
    }

    fn collect_files(dir: &Path) -> Vec<std::path::PathBuf> {
        let mut out = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            for entry in std::fs::read_dir(&current).unwrap() {
                let path = entry.unwrap().path();
                if path.is_dir() {
                    stack.push(path);
                } else {
                    out.push(path);
                }
            }
        }
        out
    }
}
