//! Node, relationship, blob, and file-binding models

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Top-level metadata object attached to a node.
///
/// Always a JSON object; arrays and scalars are rejected at the API boundary.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// Discriminant for the two node kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "VAULT")]
    Vault,
    #[serde(rename = "RECORD")]
    Record,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Vault => "VAULT",
            NodeType::Record => "RECORD",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "VAULT" => Some(NodeType::Vault),
            "RECORD" => Some(NodeType::Record),
            _ => None,
        }
    }
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A node in the hierarchical namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub uuid: Uuid,
    pub node_type: NodeType,
    /// None for root nodes
    pub parent_uuid: Option<Uuid>,
    /// Path segment; non-empty, never contains `/`
    pub name: String,
    /// Canonical slash path, maintained across renames
    pub path: String,
    pub metadata: Metadata,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Directed labeled edge between two nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub source_uuid: Uuid,
    pub target_uuid: Uuid,
    /// Uppercase identifier, `[A-Z][A-Z0-9_]*`
    pub relation: String,
    pub created_at: i64,
}

/// One file attached to a record, ordered by `position`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileBinding {
    pub record_uuid: Uuid,
    pub position: u32,
    pub display_name: String,
    pub blob_hash: String,
    pub created_at: i64,
}

/// Where a blob's bytes live on disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobLocation {
    /// Relative path under `storage/`, sharded as `aa/bb/<hash>`
    Loose { path: String },
    /// Slot inside an append-only partition file
    Partitioned {
        partition_id: u32,
        offset: u64,
        length: u64,
    },
}

/// Stored blob attributes. `size` is always the plaintext byte count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlobInfo {
    pub hash: String,
    /// Lowercase extension of the first display name that ingested this blob
    pub ext: Option<String>,
    pub size: u64,
    pub ref_count: u32,
    pub pins: u32,
    pub encrypted: bool,
    pub location: BlobLocation,
}

/// Query result row: a node plus the cheap-to-fetch extras the UI shows
#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub uuid: Uuid,
    pub node_type: NodeType,
    pub name: String,
    pub path: String,
    pub metadata: Metadata,
    pub tags: Vec<String>,
    pub file_count: u32,
    pub created_at: i64,
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_type_roundtrip() {
        assert_eq!(NodeType::parse("VAULT"), Some(NodeType::Vault));
        assert_eq!(NodeType::parse("RECORD"), Some(NodeType::Record));
        assert_eq!(NodeType::parse("vault"), None);
        assert_eq!(NodeType::Vault.as_str(), "VAULT");
    }

    #[test]
    fn node_type_serde_uses_uppercase() {
        let json = serde_json::to_string(&NodeType::Record).unwrap();
        assert_eq!(json, "\"RECORD\"");
    }
}
