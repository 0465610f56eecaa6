// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Path normalization for inbound create names
//!
//! Paths use `\` as the separator and are rooted at `\`. A `:` introduces an
//! alternate data stream.

use crate::error::{BridgeError, BridgeResult};

pub const SEPARATOR: char = '\\';
pub const STREAM_SEPARATOR: char = ':';
pub const ROOT: &str = "\\";

/// Collapse a doubled leading separator and drop one trailing separator
///
/// The root path `\` is left alone.
pub fn normalize(raw: &str) -> String {
    let mut path = raw;
    if path.len() > 1 && path.starts_with("\\\\") {
        path = &path[1..];
    }
    trim_trailing_separator(path).to_string()
}

pub fn trim_trailing_separator(path: &str) -> &str {
    if path.len() > 1 && path.ends_with(SEPARATOR) {
        &path[..path.len() - 1]
    } else {
        path
    }
}

/// Combine a related object's path with a relative name
///
/// A separator is inserted only when neither side supplies one. A stream of
/// the root (`\` + `:name`) passes the relative name through unchanged.
pub fn join_related(related: &str, name: &str) -> BridgeResult<String> {
    if name.starts_with(SEPARATOR) {
        return Err(BridgeError::InvalidParameter(
            "name relative to an open object must not be absolute",
        ));
    }
    if related == ROOT && name.starts_with(STREAM_SEPARATOR) {
        return Ok(name.to_string());
    }

    let mut joined = String::with_capacity(related.len() + name.len() + 1);
    joined.push_str(related);
    if !related.is_empty()
        && !name.is_empty()
        && !related.ends_with(SEPARATOR)
        && !name.starts_with(STREAM_SEPARATOR)
    {
        joined.push(SEPARATOR);
    }
    joined.push_str(name);
    Ok(joined)
}

/// Parent directory of `path`, keeping a trailing separator if `path` had one
///
/// `\foo\bar.txt` → `\foo`, `\foo\bar\` → `\foo\`, `\foo` → `\`.
pub fn parent_dir(path: &str) -> BridgeResult<String> {
    if path.is_empty() {
        return Err(BridgeError::InvalidParameter("empty path has no parent"));
    }
    if path == ROOT {
        return Err(BridgeError::AccessDenied);
    }

    let trailing = path.ends_with(SEPARATOR);
    let head = &path[..path.len() - last_char_len(path)];
    match head.rfind(SEPARATOR) {
        None | Some(0) => Ok(ROOT.to_string()),
        Some(at) => {
            let mut parent = head[..at].to_string();
            if trailing && at > 1 {
                parent.push(SEPARATOR);
            }
            Ok(parent)
        }
    }
}

fn last_char_len(path: &str) -> usize {
    path.chars().next_back().map(char::len_utf8).unwrap_or(0)
}

/// Reject stream names when the volume does not expose alternate streams
pub fn check_stream_name(name: &str, alternate_streams: bool) -> BridgeResult<()> {
    if !alternate_streams && name.contains(STREAM_SEPARATOR) {
        return Err(BridgeError::InvalidParameter("alternate streams are disabled"));
    }
    Ok(())
}

pub fn paths_equal(a: &str, b: &str, case_sensitive: bool) -> bool {
    if case_sensitive {
        a == b
    } else {
        fold_key(a) == fold_key(b)
    }
}

/// Case-folded cache key; entries sharing a key are compared exactly on lookup
///
/// Folding is one character to one character, so `ß` does not match `SS`.
pub fn fold_key(path: &str) -> String {
    path.chars().map(fold_char).collect()
}

fn fold_char(c: char) -> char {
    let mut upper = c.to_uppercase();
    match (upper.next(), upper.next()) {
        (Some(single), None) => single,
        _ => c,
    }
}

pub fn starts_with_ignore_case(path: &str, prefix: &str) -> bool {
    fold_key(path).starts_with(&fold_key(prefix))
}
