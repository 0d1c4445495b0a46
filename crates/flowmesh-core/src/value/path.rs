// Copyright (c) 2025 FlowMesh Team
// SPDX-License-Identifier: Apache-2.0

//! JSON-path subset used by `save` mappings and `json_path` assertions.
//!
//! The supported grammar is `$.a.b[0].c` — dotted object keys and bracketed
//! numeric indexes, no predicates or wildcards. A leading `$` (and its dot)
//! is optional so `save` mappings can use the shorter `a.b[0]` form.

use crate::error::{FlowError, Result};
use serde_json::Value;

/// One parsed path segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    /// Object key access.
    Key(String),
    /// Array index access.
    Index(usize),
}

/// Parses a path expression into segments.
pub fn parse_path(path: &str) -> Result<Vec<PathSegment>> {
    let trimmed = path.trim();
    let rest = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let rest = rest.strip_prefix('.').unwrap_or(rest);
    if rest.is_empty() {
        return Ok(Vec::new());
    }

    let mut segments = Vec::new();
    let mut chars = rest.chars().peekable();
    let mut current = String::new();

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
            }
            '[' => {
                if !current.is_empty() {
                    segments.push(PathSegment::Key(std::mem::take(&mut current)));
                }
                let mut digits = String::new();
                for d in chars.by_ref() {
                    if d == ']' {
                        break;
                    }
                    digits.push(d);
                }
                let index: usize = digits.trim().parse().map_err(|_| {
                    FlowError::InvalidDefinition(format!(
                        "invalid array index '{digits}' in path '{path}'"
                    ))
                })?;
                segments.push(PathSegment::Index(index));
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        segments.push(PathSegment::Key(current));
    }
    Ok(segments)
}

/// Extracts a value at `path`, returning `None` when any segment is absent.
///
/// A type mismatch (indexing a non-array, keying a non-object) is reported
/// as a `type_error` rather than silently treated as missing.
pub fn extract_path(root: &Value, path: &str) -> Result<Option<Value>> {
    let segments = parse_path(path)?;
    let mut current = root;
    for segment in &segments {
        match (segment, current) {
            (PathSegment::Key(key), Value::Object(map)) => match map.get(key) {
                Some(next) => current = next,
                None => return Ok(None),
            },
            (PathSegment::Index(i), Value::Array(items)) => match items.get(*i) {
                Some(next) => current = next,
                None => return Ok(None),
            },
            (_, Value::Null) => return Ok(None),
            (PathSegment::Key(key), other) => {
                return Err(FlowError::TypeError(format!(
                    "cannot access field '{key}' on {} at '{path}'",
                    super::type_name(other)
                )));
            }
            (PathSegment::Index(i), other) => {
                return Err(FlowError::TypeError(format!(
                    "cannot index [{i}] into {} at '{path}'",
                    super::type_name(other)
                )));
            }
        }
    }
    Ok(Some(current.clone()))
}
