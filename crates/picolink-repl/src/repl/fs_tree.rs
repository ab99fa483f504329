//! Filesystem walker output parsing and device path helpers.
//!
//! The listing script prints one JSON object: every directory maps to an
//! object whose numeric keys hold the entries in listing order, tagged
//! `{"F": name}` or `{"D": name}`. A directory's own entries sit under its
//! name inside its parent's object.
//!
//! ```text
//! {"": {"0": {"F": "main.py"}, "1": {"D": "lib"}, "lib": {"0": {"F": "thumby.py"}}}}
//! ```

use crate::repl::error::{ReplError, ReplResult};
use crate::repl::types::{FsNode, COMPLETION_TOKEN};
use serde_json::{Map, Value};

/// Parse the walker's printed line (with or without the leading `OK`).
pub fn parse_listing(output: &str) -> ReplResult<FsNode> {
    let json = output
        .trim()
        .strip_prefix(COMPLETION_TOKEN)
        .unwrap_or(output.trim());
    let value: Value = serde_json::from_str(json)?;
    let root = value
        .as_object()
        .and_then(|o| o.get(""))
        .and_then(Value::as_object)
        .ok_or_else(|| ReplError::parse("listing has no root directory"))?;
    Ok(FsNode::Directory {
        name: String::new(),
        children: parse_dir(root),
    })
}

fn parse_dir(dir: &Map<String, Value>) -> Vec<FsNode> {
    let mut indexed: Vec<(usize, &Map<String, Value>)> = dir
        .iter()
        .filter_map(|(k, v)| Some((k.parse::<usize>().ok()?, v.as_object()?)))
        .collect();
    indexed.sort_by_key(|(i, _)| *i);

    indexed
        .into_iter()
        .filter_map(|(_, entry)| {
            if let Some(name) = entry.get("F").and_then(Value::as_str) {
                return Some(FsNode::File { name: name.to_string() });
            }
            let name = entry.get("D").and_then(Value::as_str)?;
            let children = dir
                .get(name)
                .and_then(Value::as_object)
                .map(parse_dir)
                .unwrap_or_default();
            Some(FsNode::Directory {
                name: name.to_string(),
                children,
            })
        })
        .collect()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
//  Device paths
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Absolute, `/`-separated form of `path`. Empty and `.` segments are
/// dropped; `..` is refused.
pub fn normalize_path(path: &str) -> ReplResult<String> {
    let mut parts = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                return Err(ReplError::invalid_path(format!(
                    "'{}': parent references are not supported",
                    path
                )))
            }
            s if s.contains('\0') => {
                return Err(ReplError::invalid_path(format!("'{}' contains a NUL byte", path)))
            }
            s => parts.push(s),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Directory part of a normalised path (`/` for top-level entries).
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(i) => &path[..i],
    }
}

/// Last segment of a normalised path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// `dir` joined with `name`, normalised.
pub fn join_path(dir: &str, name: &str) -> ReplResult<String> {
    normalize_path(&format!("{}/{}", dir, name))
}
