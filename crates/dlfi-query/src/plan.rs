//! Query planning and execution
//!
//! Each atom lowers to a set of node uuids through one [`QueryIndex`]
//! lookup; boolean structure collapses into set algebra evaluated
//! bottom-up. The index trait is the seam between the language and the
//! metadata store, so this crate never touches SQL.

use crate::parser::{parse, Clause, Expr, Scalar};
use dlfi_core::{NodeSummary, NodeType, Result};
use std::collections::BTreeSet;
use uuid::Uuid;

/// Indexed lookups the planner issues against the metadata store.
///
/// Each method answers one clause with a single indexed query. The
/// autocomplete sources at the bottom feed live suggestion lists.
pub trait QueryIndex {
    fn universe(&self) -> Result<BTreeSet<Uuid>>;
    /// Recursive descendants of the node at `path`; empty for unknown paths.
    fn descendants_of(&self, path: &str) -> Result<BTreeSet<Uuid>>;
    fn by_type(&self, node_type: NodeType) -> Result<BTreeSet<Uuid>>;
    fn with_tag(&self, tag: &str) -> Result<BTreeSet<Uuid>>;
    fn meta_eq(&self, key: &str, value: &Scalar) -> Result<BTreeSet<Uuid>>;
    fn meta_like(&self, key: &str, needle: &str) -> Result<BTreeSet<Uuid>>;
    /// Nodes with an outgoing `relation` edge to the node at `target_path`.
    fn related_to(&self, relation: &str, target_path: &str) -> Result<BTreeSet<Uuid>>;
    /// Nodes with any descendant matching `related_to`.
    fn contains_related(&self, relation: &str, target_path: &str) -> Result<BTreeSet<Uuid>>;
    fn name_like(&self, needle: &str) -> Result<BTreeSet<Uuid>>;
    fn path_like(&self, needle: &str) -> Result<BTreeSet<Uuid>>;
    fn with_ext(&self, ext: &str) -> Result<BTreeSet<Uuid>>;
    /// Assemble result rows, sorted VAULT-first then by path.
    fn summaries(&self, uuids: &BTreeSet<Uuid>) -> Result<Vec<NodeSummary>>;

    // Live autocomplete sources.
    /// Tags with use counts, sorted by frequency descending then name.
    fn tag_frequencies(&self) -> Result<Vec<(String, u64)>>;
    fn relation_labels(&self) -> Result<Vec<String>>;
    fn paths_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;
    fn metadata_keys(&self) -> Result<Vec<String>>;
    fn metadata_values(&self, key: &str) -> Result<Vec<String>>;
    fn extensions(&self) -> Result<Vec<String>>;
}

/// Parse and execute a query, returning sorted summaries.
pub fn run_query<I: QueryIndex + ?Sized>(index: &I, text: &str) -> Result<Vec<NodeSummary>> {
    let expr = parse(text)?;
    let matched = eval(index, &expr)?;
    index.summaries(&matched)
}

/// Evaluate an expression to its uuid set.
pub fn eval<I: QueryIndex + ?Sized>(index: &I, expr: &Expr) -> Result<BTreeSet<Uuid>> {
    match expr {
        Expr::All => index.universe(),
        Expr::Or(branches) => {
            let mut out = BTreeSet::new();
            for branch in branches {
                out.extend(eval(index, branch)?);
            }
            Ok(out)
        }
        Expr::And(parts) => {
            let mut iter = parts.iter();
            let mut out = match iter.next() {
                Some(first) => eval(index, first)?,
                None => return index.universe(),
            };
            for part in iter {
                if out.is_empty() {
                    break;
                }
                let rhs = eval(index, part)?;
                out = out.intersection(&rhs).copied().collect();
            }
            Ok(out)
        }
        Expr::Not(inner) => {
            let universe = index.universe()?;
            let excluded = eval(index, inner)?;
            Ok(universe.difference(&excluded).copied().collect())
        }
        Expr::Clause(clause) => eval_clause(index, clause),
    }
}

fn eval_clause<I: QueryIndex + ?Sized>(index: &I, clause: &Clause) -> Result<BTreeSet<Uuid>> {
    match clause {
        Clause::Inside(path) => index.descendants_of(path),
        Clause::Type(node_type) => index.by_type(*node_type),
        Clause::Tag(tag) => index.with_tag(tag),
        Clause::MetaEq { key, value } => index.meta_eq(key, value),
        Clause::MetaLike { key, needle } => index.meta_like(key, needle),
        Clause::Rel { relation, target } => index.related_to(relation, target),
        Clause::ContainsRel { relation, target } => index.contains_related(relation, target),
        Clause::NameLike(needle) => index.name_like(needle),
        Clause::PathLike(needle) => index.path_like(needle),
        Clause::Ext(ext) => index.with_ext(ext),
    }
}
