//! DL-FI Extract - the extractor host
//!
//! Extractors turn an external source into a lazy sequence of
//! [`DiscoveredNode`] values; the host routes them into the archive:
//! resolve the suggested path (creating ancestor vaults), create or
//! update the node, ingest files through the blob store, and install tags
//! and relationships. Errors on a single node are logged, counted, and
//! the sequence advances.

use dlfi_core::{CancelToken, DlfiError, Metadata, NodeType, Result};
use dlfi_store::Archive;
use std::io::Read;
use tracing::{error, info, warn};
use uuid::Uuid;

/// A file discovered by an extractor: a display name plus its byte stream.
pub struct DiscoveredFile {
    pub display_name: String,
    pub reader: Box<dyn Read + Send>,
}

impl std::fmt::Debug for DiscoveredFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscoveredFile")
            .field("display_name", &self.display_name)
            .finish_non_exhaustive()
    }
}

/// A vault or record discovered by an extractor
#[derive(Debug)]
pub struct DiscoveredNode {
    /// Virtual path like `download/twitter/post_123`
    pub suggested_path: String,
    pub node_type: NodeType,
    pub metadata: Metadata,
    pub files: Vec<DiscoveredFile>,
    pub tags: Vec<String>,
    /// `(relation, target_path)` pairs; targets must already exist
    pub relationships: Vec<(String, String)>,
}

impl DiscoveredNode {
    pub fn vault(suggested_path: impl Into<String>) -> Self {
        Self {
            suggested_path: suggested_path.into(),
            node_type: NodeType::Vault,
            metadata: Metadata::new(),
            files: Vec::new(),
            tags: Vec::new(),
            relationships: Vec::new(),
        }
    }

    pub fn record(suggested_path: impl Into<String>) -> Self {
        Self {
            node_type: NodeType::Record,
            ..Self::vault(suggested_path)
        }
    }
}

/// A source-specific extractor
pub trait Extractor {
    /// Human-readable name for logs.
    fn name(&self) -> &str;

    /// Whether this extractor understands the given URL.
    fn can_handle(&self, url: &str) -> bool;

    /// Produce the discovered nodes for a URL, lazily.
    fn extract(&self, url: &str) -> Result<Box<dyn Iterator<Item = Result<DiscoveredNode>>>>;
}

/// Registry of extractors; the first one claiming a URL wins.
#[derive(Default)]
pub struct ExtractorSet {
    extractors: Vec<Box<dyn Extractor>>,
}

impl ExtractorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extractor: Box<dyn Extractor>) {
        self.extractors.push(extractor);
    }

    pub fn find(&self, url: &str) -> Option<&dyn Extractor> {
        self.extractors
            .iter()
            .find(|e| e.can_handle(url))
            .map(|e| e.as_ref())
    }

    /// Run the matching extractor for `url` against the archive.
    pub fn run_url(
        &self,
        archive: &Archive,
        url: &str,
        cancel: &CancelToken,
    ) -> Result<IngestReport> {
        let extractor = self
            .find(url)
            .ok_or_else(|| DlfiError::NotFound(format!("no extractor for {url}")))?;
        info!("running extractor {:?} for {url}", extractor.name());
        run(archive, extractor.extract(url)?, cancel)
    }
}

/// Counters for one ingest run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub nodes_ok: u64,
    pub nodes_failed: u64,
    pub files_ok: u64,
    pub files_failed: u64,
    pub links_ok: u64,
    pub links_failed: u64,
}

/// Consume a sequence of discovered nodes. Each node is processed in
/// isolation: a failure is logged and counted, and the sequence advances.
pub fn run<I>(archive: &Archive, nodes: I, cancel: &CancelToken) -> Result<IngestReport>
where
    I: IntoIterator<Item = Result<DiscoveredNode>>,
{
    let mut report = IngestReport::default();
    for node in nodes {
        cancel.check()?;
        let node = match node {
            Ok(node) => node,
            Err(e) => {
                error!("extractor failed to produce a node: {e}");
                report.nodes_failed += 1;
                continue;
            }
        };
        let path = node.suggested_path.clone();
        match ingest_node(archive, node, &mut report) {
            Ok(()) => report.nodes_ok += 1,
            Err(e) => {
                error!("failed to ingest {path}: {e}");
                report.nodes_failed += 1;
            }
        }
    }
    info!(
        "ingest finished: {} nodes ok, {} failed, {} files, {} links",
        report.nodes_ok, report.nodes_failed, report.files_ok, report.links_ok
    );
    Ok(report)
}

fn ingest_node(archive: &Archive, node: DiscoveredNode, report: &mut IngestReport) -> Result<()> {
    let uuid = ensure_node(archive, &node)?;

    for tag in &node.tags {
        archive.add_tag(uuid, tag)?;
    }

    for file in node.files {
        match archive.append_stream(uuid, &file.display_name, file.reader) {
            Ok(_) => report.files_ok += 1,
            Err(e) => {
                error!("failed to ingest file {:?}: {e}", file.display_name);
                report.files_failed += 1;
            }
        }
    }

    // Targets are expected to exist; an extractor yielding children before
    // parents gets a warning, not an abort.
    for (relation, target_path) in &node.relationships {
        match archive
            .resolve(target_path)
            .and_then(|target| archive.link(uuid, target, relation))
        {
            Ok(()) => report.links_ok += 1,
            Err(DlfiError::RelationExists(_)) => report.links_ok += 1,
            Err(e) => {
                warn!("could not link {relation} -> {target_path}: {e}");
                report.links_failed += 1;
            }
        }
    }
    Ok(())
}

/// Create the node (with ancestors) or update an existing one: discovered
/// metadata is merged over what is already stored.
fn ensure_node(archive: &Archive, node: &DiscoveredNode) -> Result<Uuid> {
    let existing = archive.node_at(&node.suggested_path)?;
    match existing {
        Some(found) => {
            if found.node_type != node.node_type {
                return Err(DlfiError::PathTaken(format!(
                    "{} already exists as {}",
                    node.suggested_path, found.node_type
                )));
            }
            if !node.metadata.is_empty() {
                archive.merge_metadata(found.uuid, node.metadata.clone())?;
            }
            Ok(found.uuid)
        }
        None => match node.node_type {
            NodeType::Vault => {
                let uuid = archive.create_vault(&node.suggested_path)?;
                if !node.metadata.is_empty() {
                    archive.merge_metadata(uuid, node.metadata.clone())?;
                }
                Ok(uuid)
            }
            NodeType::Record => archive.create_record(&node.suggested_path, node.metadata.clone()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn archive() -> (tempfile::TempDir, Archive) {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        (dir, archive)
    }

    fn meta(value: serde_json::Value) -> Metadata {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Metadata::new(),
        }
    }

    /// Extractor mirroring the shape real sources produce: an author
    /// vault plus a content record pointing back at it.
    struct FakeSource;

    impl Extractor for FakeSource {
        fn name(&self) -> &str {
            "fake-source"
        }

        fn can_handle(&self, url: &str) -> bool {
            url.contains("fake.example")
        }

        fn extract(&self, _url: &str) -> Result<Box<dyn Iterator<Item = Result<DiscoveredNode>>>> {
            let author = DiscoveredNode {
                metadata: meta(json!({"bio": "a simulated user"})),
                tags: vec!["person".into()],
                ..DiscoveredNode::vault("people/test_user")
            };
            let post = DiscoveredNode {
                metadata: meta(json!({"content": "Hello World", "likes": 42})),
                tags: vec!["post".into()],
                files: vec![DiscoveredFile {
                    display_name: "avatar.ico".into(),
                    reader: Box::new(&b"fake image bytes"[..]),
                }],
                relationships: vec![("AUTHORED_BY".into(), "people/test_user".into())],
                ..DiscoveredNode::record("download/fake/post_12345")
            };
            Ok(Box::new(vec![Ok(author), Ok(post)].into_iter()))
        }
    }

    #[test]
    fn run_url_routes_through_registry() {
        let (_dir, archive) = archive();
        let mut set = ExtractorSet::new();
        set.register(Box::new(FakeSource));

        assert!(set.find("https://other.example/x").is_none());
        let report = set
            .run_url(&archive, "https://fake.example/u/1", &CancelToken::new())
            .unwrap();
        assert_eq!(report.nodes_ok, 2);
        assert_eq!(report.files_ok, 1);
        assert_eq!(report.links_ok, 1);

        let post = archive.node_at("download/fake/post_12345").unwrap().unwrap();
        assert_eq!(post.node_type, NodeType::Record);
        assert_eq!(post.metadata.get("likes"), Some(&json!(42)));
        assert_eq!(archive.tags_of(post.uuid).unwrap(), vec!["post"]);
        assert_eq!(archive.bindings_of(post.uuid).unwrap().len(), 1);
        assert_eq!(archive.relationships_of(post.uuid).unwrap().len(), 1);
    }

    #[test]
    fn node_failures_are_isolated() {
        let (_dir, archive) = archive();
        let bad = DiscoveredNode::record("bad//path");
        let good = DiscoveredNode::record("good/path");
        let report = run(
            &archive,
            vec![Ok(bad), Err(DlfiError::NotFound("upstream".into())), Ok(good)],
            &CancelToken::new(),
        )
        .unwrap();
        assert_eq!(report.nodes_failed, 2);
        assert_eq!(report.nodes_ok, 1);
        assert!(archive.node_at("good/path").unwrap().is_some());
    }

    #[test]
    fn missing_link_target_is_counted_not_fatal() {
        let (_dir, archive) = archive();
        let node = DiscoveredNode {
            relationships: vec![("POINTS_AT".into(), "nowhere/yet".into())],
            ..DiscoveredNode::record("orphan")
        };
        let report = run(&archive, vec![Ok(node)], &CancelToken::new()).unwrap();
        assert_eq!(report.nodes_ok, 1);
        assert_eq!(report.links_failed, 1);
    }

    #[test]
    fn reingest_merges_metadata() {
        let (_dir, archive) = archive();
        let first = DiscoveredNode {
            metadata: meta(json!({"likes": 1, "title": "t"})),
            ..DiscoveredNode::record("download/x")
        };
        run(&archive, vec![Ok(first)], &CancelToken::new()).unwrap();

        let second = DiscoveredNode {
            metadata: meta(json!({"likes": 2})),
            ..DiscoveredNode::record("download/x")
        };
        run(&archive, vec![Ok(second)], &CancelToken::new()).unwrap();

        let node = archive.node_at("download/x").unwrap().unwrap();
        assert_eq!(node.metadata.get("likes"), Some(&json!(2)));
        assert_eq!(node.metadata.get("title"), Some(&json!("t")));
    }

    #[test]
    fn cancellation_stops_the_sequence() {
        let (_dir, archive) = archive();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = run(
            &archive,
            vec![Ok(DiscoveredNode::record("never"))],
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, DlfiError::Cancelled));
        assert!(archive.node_at("never").unwrap().is_none());
    }
}
