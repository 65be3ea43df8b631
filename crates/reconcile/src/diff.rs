//! Field-path diffs between argument sets

use crate::value::{Arguments, AttrPath, Json, PathSegment};
use std::collections::BTreeSet;

/// Pattern in a replace-on-change set that matches every field
pub const WILDCARD: &str = "*";

/// Compute the field paths that differ between two argument sets
///
/// Objects are compared key by key and arrays of equal length item by item;
/// an array whose length changed is reported as a whole.
pub fn changed_paths(old: &Arguments, new: &Arguments) -> BTreeSet<String> {
    let mut changed = BTreeSet::new();
    let keys: BTreeSet<&String> = old.keys().chain(new.keys()).collect();
    for key in keys {
        let path = AttrPath::new(vec![PathSegment::Key(key.clone())]);
        match (old.get(key), new.get(key)) {
            (Some(a), Some(b)) => diff_values(&path, a, b, &mut changed),
            _ => {
                changed.insert(path.to_string());
            }
        }
    }
    changed
}

fn diff_values(path: &AttrPath, old: &Json, new: &Json, changed: &mut BTreeSet<String>) {
    match (old, new) {
        (Json::Object(a), Json::Object(b)) => {
            let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
            for key in keys {
                let child = path.push_key(key);
                match (a.get(key), b.get(key)) {
                    (Some(x), Some(y)) => diff_values(&child, x, y, changed),
                    _ => {
                        changed.insert(child.to_string());
                    }
                }
            }
        }
        (Json::Array(a), Json::Array(b)) if a.len() == b.len() => {
            for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
                diff_values(&path.push_index(i), x, y, changed);
            }
        }
        _ if old == new => {}
        _ => {
            changed.insert(path.to_string());
        }
    }
}

/// Whether a changed field falls under a replace-on-change pattern
///
/// `*` matches everything. Otherwise a pattern matches the field itself, any
/// field below it, and any field above it (replacing a whole list touches the
/// pattern's item too). Patterns that do not parse as paths compare verbatim.
pub fn matches_pattern(pattern: &str, changed: &str) -> bool {
    if pattern == WILDCARD || pattern == changed {
        return true;
    }
    match (pattern.parse::<AttrPath>(), changed.parse::<AttrPath>()) {
        (Ok(p), Ok(c)) => p.overlaps(&c),
        _ => false,
    }
}

/// Changed fields that trigger a replacement under the given patterns
pub fn replacing_fields<'a>(
    patterns: &BTreeSet<String>,
    changed: &'a BTreeSet<String>,
) -> Vec<&'a str> {
    changed
        .iter()
        .filter(|field| patterns.iter().any(|p| matches_pattern(p, field)))
        .map(String::as_str)
        .collect()
}
