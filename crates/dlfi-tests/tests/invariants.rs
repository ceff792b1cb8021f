//! Structural invariants checked after sequences of public operations

mod common;

use common::open_archive;
use dlfi_core::{CancelToken, Metadata, NodeType};
use dlfi_store::Archive;
use std::collections::HashMap;
use uuid::Uuid;

/// Build an archive with a bit of everything.
fn populated(dir: &std::path::Path) -> Archive {
    let archive = open_archive(dir);
    let ch1 = archive.create_record("m/jojo/ch1", Metadata::new()).unwrap();
    let ch2 = archive.create_record("m/jojo/ch2", Metadata::new()).unwrap();
    let araki = archive.create_record("people/araki", Metadata::new()).unwrap();

    archive.add_tag(ch1, "manga").unwrap();
    archive.add_tag(ch2, "manga").unwrap();
    archive.link(ch1, araki, "AUTHORED_BY").unwrap();
    archive.link(ch2, araki, "AUTHORED_BY").unwrap();

    archive
        .append_stream(ch1, "p1.txt", &b"shared content"[..])
        .unwrap();
    archive
        .append_stream(ch2, "p1.txt", &b"shared content"[..])
        .unwrap();
    archive
        .append_stream(ch2, "p2.txt", &b"unique content"[..])
        .unwrap();
    archive
}

/// Parents of non-root nodes exist and are vaults.
fn check_parents(archive: &Archive) {
    let nodes = archive.all_nodes().unwrap();
    let by_uuid: HashMap<Uuid, NodeType> =
        nodes.iter().map(|n| (n.uuid, n.node_type)).collect();
    for node in &nodes {
        if let Some(parent) = node.parent_uuid {
            assert_eq!(
                by_uuid.get(&parent),
                Some(&NodeType::Vault),
                "parent of {} must be an existing vault",
                node.path
            );
        }
    }
}

/// Blob ref-counts equal binding counts plus pins.
fn check_refcounts(archive: &Archive) {
    let nodes = archive.all_nodes().unwrap();
    let mut binding_counts: HashMap<String, u32> = HashMap::new();
    for node in &nodes {
        for binding in archive.bindings_of(node.uuid).unwrap() {
            *binding_counts.entry(binding.blob_hash).or_insert(0) += 1;
        }
    }
    for (hash, count) in &binding_counts {
        let info = archive.blob_info(hash).unwrap();
        assert_eq!(
            info.ref_count,
            count + info.pins,
            "ref count mismatch for {hash}"
        );
    }
}

/// Relationship endpoints resolve.
fn check_edges(archive: &Archive) {
    let nodes = archive.all_nodes().unwrap();
    for node in &nodes {
        for rel in archive.relationships_of(node.uuid).unwrap() {
            archive.node(rel.source_uuid).unwrap();
            archive.node(rel.target_uuid).unwrap();
        }
    }
}

#[test]
fn parents_are_vaults_after_moves() {
    let dir = tempfile::tempdir().unwrap();
    let archive = populated(dir.path());
    check_parents(&archive);

    let jojo = archive.node_at("m/jojo").unwrap().unwrap();
    archive
        .update_node(
            jojo.uuid,
            dlfi_store::NodeUpdate {
                name: Some("jjba".into()),
                ..Default::default()
            },
        )
        .unwrap();
    check_parents(&archive);
    assert!(archive.node_at("m/jjba/ch1").unwrap().is_some());
}

#[test]
fn refcounts_track_bindings_and_pins() {
    let dir = tempfile::tempdir().unwrap();
    let archive = populated(dir.path());
    check_refcounts(&archive);

    // Shared blob is referenced twice.
    let ch1 = archive.node_at("m/jojo/ch1").unwrap().unwrap();
    let shared = archive.bindings_of(ch1.uuid).unwrap()[0].blob_hash.clone();
    assert_eq!(archive.blob_info(&shared).unwrap().ref_count, 2);

    archive.pin_blob(&shared).unwrap();
    check_refcounts(&archive);

    archive.remove_file(ch1.uuid, 0).unwrap();
    check_refcounts(&archive);
    assert_eq!(archive.blob_info(&shared).unwrap().ref_count, 1);
    assert_eq!(archive.blob_info(&shared).unwrap().pins, 1);

    // Deleting the remaining owner leaves the pin holding the blob.
    let ch2 = archive.node_at("m/jojo/ch2").unwrap().unwrap();
    archive.delete(ch2.uuid).unwrap();
    check_refcounts(&archive);
    assert_eq!(archive.blob_info(&shared).unwrap().ref_count, 0);
    archive.vacuum(&CancelToken::new()).unwrap();
    // Pinned: survives vacuum.
    assert!(archive.blob_info(&shared).is_ok());
}

#[test]
fn edges_never_dangle() {
    let dir = tempfile::tempdir().unwrap();
    let archive = populated(dir.path());
    check_edges(&archive);

    // Deleting the target drops both incoming edges.
    let araki = archive.node_at("people/araki").unwrap().unwrap();
    archive.delete(araki.uuid).unwrap();
    check_edges(&archive);
    let ch1 = archive.node_at("m/jojo/ch1").unwrap().unwrap();
    assert!(archive.relationships_of(ch1.uuid).unwrap().is_empty());
}

#[test]
fn stored_bytes_hash_to_their_address() {
    let dir = tempfile::tempdir().unwrap();
    let archive = populated(dir.path());
    let nodes = archive.all_nodes().unwrap();
    for node in nodes {
        for binding in archive.bindings_of(node.uuid).unwrap() {
            archive.verify_blob(&binding.blob_hash).unwrap();
        }
    }
}

#[test]
fn deleting_the_only_binding_zeroes_refcount() {
    let dir = tempfile::tempdir().unwrap();
    let archive = open_archive(dir.path());
    let record = archive.create_record("solo", Metadata::new()).unwrap();
    let put = archive
        .append_stream(record, "only.bin", &b"lonely bytes"[..])
        .unwrap();
    archive.remove_file(record, 0).unwrap();
    assert_eq!(archive.blob_info(&put.hash).unwrap().ref_count, 0);
}

#[test]
fn tags_are_idempotent_sets() {
    let dir = tempfile::tempdir().unwrap();
    let archive = open_archive(dir.path());
    let record = archive.create_record("r", Metadata::new()).unwrap();

    for _ in 0..3 {
        archive.add_tag(record, "repeat").unwrap();
    }
    assert_eq!(archive.tags_of(record).unwrap(), vec!["repeat"]);
    for _ in 0..3 {
        archive.remove_tag(record, "repeat").unwrap();
    }
    assert!(archive.tags_of(record).unwrap().is_empty());
}

#[test]
fn type_conflict_on_record_in_the_middle() {
    let dir = tempfile::tempdir().unwrap();
    let archive = open_archive(dir.path());
    archive.create_record("a", Metadata::new()).unwrap();
    let err = archive.create_record("a/b/c", Metadata::new()).unwrap_err();
    assert!(matches!(err, dlfi_core::DlfiError::TypeConflict(_)));
}
