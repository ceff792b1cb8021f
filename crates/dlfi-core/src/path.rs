//! Virtual path normalization and validation
//!
//! Paths are slash-delimited segment lists like `manga/jojo/ch1`. They are
//! purely logical; nothing here touches the filesystem.

use crate::error::{DlfiError, Result};

/// Normalize a raw path: backslashes become slashes, leading/trailing
/// slashes are stripped, and every segment is validated.
///
/// Rejects empty paths and `.` / `..` segments with `InvalidPath`.
pub fn normalize(raw: &str) -> Result<String> {
    let cleaned = raw.replace('\\', "/");
    let trimmed = cleaned.trim_matches('/');
    if trimmed.is_empty() {
        return Err(DlfiError::InvalidPath(format!("empty path: {raw:?}")));
    }
    let mut segments = Vec::new();
    for segment in trimmed.split('/') {
        validate_segment(segment)?;
        segments.push(segment);
    }
    Ok(segments.join("/"))
}

/// Validate a single path segment (a node name).
pub fn validate_segment(segment: &str) -> Result<()> {
    if segment.is_empty() {
        return Err(DlfiError::InvalidPath("empty path segment".into()));
    }
    if segment == "." || segment == ".." {
        return Err(DlfiError::InvalidPath(format!(
            "relative segment {segment:?} is not allowed"
        )));
    }
    if segment.contains('/') || segment.contains('\\') {
        return Err(DlfiError::InvalidPath(format!(
            "segment {segment:?} contains a separator"
        )));
    }
    Ok(())
}

/// Split a normalized path into `(parent_path, name)`.
///
/// The parent is `None` for root-level nodes.
pub fn split(path: &str) -> Result<(Option<String>, String)> {
    let normalized = normalize(path)?;
    match normalized.rfind('/') {
        Some(idx) => {
            let parent = normalized[..idx].to_string();
            let name = normalized[idx + 1..].to_string();
            Ok((Some(parent), name))
        }
        None => Ok((None, normalized)),
    }
}

/// Iterate the ancestor chain of a normalized path, shortest prefix first,
/// including the path itself: `a/b/c` yields `a`, `a/b`, `a/b/c`.
pub fn prefixes(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter_map(|(i, c)| if c == '/' { Some(&path[..i]) } else { None })
        .chain(std::iter::once(path))
}

/// Check a relationship label against `^[A-Z][A-Z0-9_]*$`.
pub fn valid_relation(label: &str) -> bool {
    let mut chars = label.chars();
    match chars.next() {
        Some(c) if c.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Normalize a tag: trimmed and lowercased.
pub fn normalize_tag(tag: &str) -> String {
    tag.trim().to_lowercase()
}

/// Lowercase extension of a display name, without the dot.
/// `photo.JPG` -> `jpg`; dotless names yield `None`.
pub fn file_extension(display_name: &str) -> Option<String> {
    let idx = display_name.rfind('.')?;
    let ext = &display_name[idx + 1..];
    if ext.is_empty() || idx == 0 {
        return None;
    }
    Some(ext.to_lowercase())
}

/// Split a display name into `(stem, Some(ext))` or `(name, None)`.
pub fn split_display_name(display_name: &str) -> (&str, Option<&str>) {
    match display_name.rfind('.') {
        Some(idx) if idx > 0 && idx + 1 < display_name.len() => {
            (&display_name[..idx], Some(&display_name[idx + 1..]))
        }
        _ => (display_name, None),
    }
}
