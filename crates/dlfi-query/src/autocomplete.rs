//! Context-sensitive autocomplete
//!
//! Classifies the token under the cursor against the clause state machine
//! (field, operator, value) and draws candidates from the static field
//! catalog plus live store values. Output is stable-sorted so suggestion
//! lists are snapshot-testable.

use crate::plan::QueryIndex;
use dlfi_core::Result;
use serde::Serialize;

/// What a suggestion completes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    Field,
    Operator,
    Tag,
    Path,
    Relation,
    NodeType,
    MetadataKey,
    MetadataValue,
    Extension,
}

/// One autocomplete candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Suggestion {
    /// Shown in the list
    pub display: String,
    /// Inserted into the query when picked
    pub insert_text: String,
    #[serde(rename = "type")]
    pub kind: SuggestionKind,
    /// Group header for the UI
    pub section: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl Suggestion {
    fn new(
        display: impl Into<String>,
        insert_text: impl Into<String>,
        kind: SuggestionKind,
        section: &str,
    ) -> Self {
        Self {
            display: display.into(),
            insert_text: insert_text.into(),
            kind,
            section: section.to_string(),
            description: None,
        }
    }

    fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Field catalog: completed text and a short description.
const FIELDS: &[(&str, &str)] = &[
    ("inside:", "descendants of a path"),
    ("type:", "filter by node type"),
    ("tag:", "filter by tag"),
    ("meta.", "filter on a metadata key"),
    ("rel:", "outgoing relationship to a node"),
    ("contains-rel:", "vault containing a related descendant"),
    ("name:", "substring match on node name"),
    ("path:", "substring match on canonical path"),
    ("ext:", "filter records by file extension"),
];

const MAX_SUGGESTIONS: usize = 20;

/// Cursor context inside a clause token
#[derive(Debug, PartialEq, Eq)]
enum Context {
    /// At a term boundary or typing a field name
    Field { prefix: String },
    /// Typing a metadata key after `meta.`, no operator yet
    MetaKey { prefix: String },
    /// Typing a metadata value after `meta.<key>=` or `meta.<key>~`
    MetaValue { key: String, prefix: String },
    /// Typing a value for a known field after `field:`
    Value { field: String, prefix: String },
    /// Typing a relation label after `rel:` / `contains-rel:`
    RelationLabel { prefix: String },
    /// Typing a target path after `rel:<REL>=`
    RelationTarget { prefix: String },
}

/// Suggestions for `text` with the cursor at byte offset `cursor`.
pub fn autocomplete<I: QueryIndex + ?Sized>(
    index: &I,
    text: &str,
    cursor: usize,
) -> Result<Vec<Suggestion>> {
    let mut cursor = cursor.min(text.len());
    while cursor > 0 && !text.is_char_boundary(cursor) {
        cursor -= 1;
    }
    let context = classify(&text[..cursor]);

    let mut out = match context {
        Context::Field { prefix } => field_suggestions(index, &prefix)?,
        Context::MetaKey { prefix } => meta_key_suggestions(index, &prefix)?,
        Context::MetaValue { key, prefix } => meta_value_suggestions(index, &key, &prefix)?,
        Context::Value { field, prefix } => value_suggestions(index, &field, &prefix)?,
        Context::RelationLabel { prefix } => relation_suggestions(index, &prefix)?,
        Context::RelationTarget { prefix } => path_suggestions(index, &prefix)?,
    };
    out.truncate(MAX_SUGGESTIONS);
    Ok(out)
}

/// Find the token under the cursor and classify the clause state.
fn classify(before: &str) -> Context {
    let start = before
        .rfind(|c: char| c.is_whitespace() || matches!(c, '|' | '(' | ')'))
        .map(|i| i + 1)
        .unwrap_or(0);
    // Leading dashes are negation, which does not change what can follow.
    let word = before[start..].trim_start_matches('-');

    if let Some(rest) = word.strip_prefix("meta.") {
        for op in ['=', '~'] {
            if let Some(idx) = rest.find(op) {
                return Context::MetaValue {
                    key: rest[..idx].to_string(),
                    prefix: rest[idx + 1..].to_string(),
                };
            }
        }
        return Context::MetaKey {
            prefix: rest.to_string(),
        };
    }

    if let Some(idx) = word.find(':') {
        let field = word[..idx].to_string();
        let after = &word[idx + 1..];
        if field == "rel" || field == "contains-rel" {
            return match after.find('=') {
                Some(eq) => Context::RelationTarget {
                    prefix: after[eq + 1..].to_string(),
                },
                None => Context::RelationLabel {
                    prefix: after.to_string(),
                },
            };
        }
        return Context::Value {
            field,
            prefix: after.to_string(),
        };
    }

    Context::Field {
        prefix: word.to_string(),
    }
}

fn field_suggestions<I: QueryIndex + ?Sized>(index: &I, prefix: &str) -> Result<Vec<Suggestion>> {
    let lower = prefix.to_lowercase();
    let mut out = Vec::new();
    for (field, description) in FIELDS {
        if field.starts_with(&lower) || lower.is_empty() {
            out.push(
                Suggestion::new(*field, *field, SuggestionKind::Field, "Fields")
                    .describe(*description),
            );
        }
    }
    // Known metadata keys complete straight to a meta clause.
    if lower.is_empty() || "meta.".starts_with(&lower) || lower.starts_with("meta.") {
        let key_prefix = lower.strip_prefix("meta.").unwrap_or("");
        for key in index.metadata_keys()? {
            if key.to_lowercase().starts_with(key_prefix) {
                out.push(
                    Suggestion::new(
                        format!("meta.{key}"),
                        format!("meta.{key}"),
                        SuggestionKind::MetadataKey,
                        "Metadata",
                    )
                    .describe("metadata key"),
                );
            }
        }
    }
    Ok(out)
}

/// Keys completing the prefix, plus the two operators once the prefix is
/// itself a known key.
fn meta_key_suggestions<I: QueryIndex + ?Sized>(index: &I, prefix: &str) -> Result<Vec<Suggestion>> {
    let keys = index.metadata_keys()?;
    let mut out = Vec::new();
    for key in &keys {
        if key.starts_with(prefix) && key != prefix {
            out.push(
                Suggestion::new(
                    format!("meta.{key}"),
                    format!("meta.{key}"),
                    SuggestionKind::MetadataKey,
                    "Metadata",
                )
                .describe("metadata key"),
            );
        }
    }
    if keys.iter().any(|k| k == prefix) {
        out.extend(operator_suggestions(prefix));
    }
    Ok(out)
}

fn operator_suggestions(key: &str) -> Vec<Suggestion> {
    vec![
        Suggestion::new("=", format!("meta.{key}="), SuggestionKind::Operator, "Operators")
            .describe("exact match"),
        Suggestion::new("~", format!("meta.{key}~"), SuggestionKind::Operator, "Operators")
            .describe("substring match"),
    ]
}

fn meta_value_suggestions<I: QueryIndex + ?Sized>(
    index: &I,
    key: &str,
    prefix: &str,
) -> Result<Vec<Suggestion>> {
    let lower = prefix.to_lowercase();
    let mut out = Vec::new();
    for value in index.metadata_values(key)? {
        if value.to_lowercase().starts_with(&lower) || lower.is_empty() {
            out.push(
                Suggestion::new(&value, &value, SuggestionKind::MetadataValue, "Values")
                    .describe(format!("{key} value")),
            );
        }
    }
    Ok(out)
}

fn value_suggestions<I: QueryIndex + ?Sized>(
    index: &I,
    field: &str,
    prefix: &str,
) -> Result<Vec<Suggestion>> {
    let lower = prefix.to_lowercase();
    match field {
        "tag" => {
            let mut out = Vec::new();
            // Frequency order keeps the most used tags on top.
            for (tag, count) in index.tag_frequencies()? {
                if tag.starts_with(&lower) || lower.is_empty() {
                    out.push(
                        Suggestion::new(&tag, &tag, SuggestionKind::Tag, "Tags")
                            .describe(format!("{count} nodes")),
                    );
                }
            }
            Ok(out)
        }
        "type" => Ok(["VAULT", "RECORD"]
            .iter()
            .filter(|t| t.to_lowercase().starts_with(&lower) || lower.is_empty())
            .map(|t| {
                Suggestion::new(*t, *t, SuggestionKind::NodeType, "Types").describe("node type")
            })
            .collect()),
        "inside" | "path" => path_suggestions(index, prefix),
        "ext" => {
            let mut out = Vec::new();
            for ext in index.extensions()? {
                if ext.starts_with(&lower) || lower.is_empty() {
                    out.push(
                        Suggestion::new(&ext, &ext, SuggestionKind::Extension, "Extensions")
                            .describe("file extension"),
                    );
                }
            }
            Ok(out)
        }
        // `name:` takes free text; nothing sensible to offer.
        _ => Ok(Vec::new()),
    }
}

fn relation_suggestions<I: QueryIndex + ?Sized>(
    index: &I,
    prefix: &str,
) -> Result<Vec<Suggestion>> {
    let upper = prefix.to_uppercase();
    let mut out = Vec::new();
    for label in index.relation_labels()? {
        if label.starts_with(&upper) || upper.is_empty() {
            out.push(
                Suggestion::new(&label, format!("{label}="), SuggestionKind::Relation, "Relations")
                    .describe("relationship label"),
            );
        }
    }
    Ok(out)
}

fn path_suggestions<I: QueryIndex + ?Sized>(index: &I, prefix: &str) -> Result<Vec<Suggestion>> {
    let mut out = Vec::new();
    for path in index.paths_with_prefix(prefix)? {
        out.push(Suggestion::new(&path, &path, SuggestionKind::Path, "Paths").describe("node path"));
    }
    Ok(out)
}
