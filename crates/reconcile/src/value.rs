//! Argument values, attribute paths and references between resources
//!
//! A declared argument is either a literal JSON value or a reference to an
//! attribute another resource exposes once applied. Composite arguments may
//! hold references at any depth, so lists and maps of values are modelled
//! explicitly instead of as plain JSON.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Plain JSON, the representation of every resolved value
pub type Json = serde_json::Value;

/// Fully resolved arguments of a resource
pub type Arguments = serde_json::Map<String, Json>;

/// Attributes a provider reports for an applied resource
pub type Outputs = serde_json::Map<String, Json>;

/// One step of an attribute path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

/// Path into a JSON tree, written as `interfaces[0].addresses[0]`
///
/// Dotted numeric segments (`disks.0.volume_id`) are read as indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AttrPath(Vec<PathSegment>);

/// Error raised for a malformed attribute path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid attribute path `{path}`: {reason}")]
pub struct ParsePathError {
    pub path: String,
    pub reason: &'static str,
}

impl AttrPath {
    pub fn new(segments: Vec<PathSegment>) -> Self {
        Self(segments)
    }

    pub fn segments(&self) -> &[PathSegment] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First segment, when it is a key
    pub fn first_key(&self) -> Option<&str> {
        match self.0.first() {
            Some(PathSegment::Key(key)) => Some(key),
            _ => None,
        }
    }

    /// Path without its first segment
    pub fn tail(&self) -> AttrPath {
        Self(self.0.iter().skip(1).cloned().collect())
    }

    pub fn push_key(&self, key: &str) -> AttrPath {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.to_string()));
        Self(segments)
    }

    pub fn push_index(&self, index: usize) -> AttrPath {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }

    /// Whether one path is a prefix of the other
    pub fn overlaps(&self, other: &AttrPath) -> bool {
        self.0.iter().zip(other.0.iter()).all(|(a, b)| a == b)
    }

    /// Follow the path through a JSON tree
    pub fn lookup<'a>(&self, root: &'a Json) -> Option<&'a Json> {
        self.0.iter().try_fold(root, |current, segment| match segment {
            PathSegment::Key(key) => current.as_object()?.get(key),
            PathSegment::Index(index) => current.as_array()?.get(*index),
        })
    }

    /// Follow the path starting from a map of attributes
    pub fn lookup_in<'a>(&self, attributes: &'a serde_json::Map<String, Json>) -> Option<&'a Json> {
        let key = self.first_key()?;
        let first = attributes.get(key)?;
        self.tail().lookup(first)
    }
}

impl FromStr for AttrPath {
    type Err = ParsePathError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason| ParsePathError {
            path: s.to_string(),
            reason,
        };

        let mut segments = Vec::new();
        for part in s.split('.') {
            let (key, mut rest) = match part.find('[') {
                Some(pos) => (&part[..pos], &part[pos..]),
                None => (part, ""),
            };

            if key.is_empty() {
                if rest.is_empty() || segments.is_empty() {
                    return Err(err("empty segment"));
                }
            } else if let Ok(index) = key.parse::<usize>() {
                if segments.is_empty() {
                    return Err(err("path must start with an attribute name"));
                }
                segments.push(PathSegment::Index(index));
            } else {
                segments.push(PathSegment::Key(key.to_string()));
            }

            while !rest.is_empty() {
                let close = rest.find(']').ok_or_else(|| err("unclosed `[`"))?;
                let index = rest[1..close]
                    .parse::<usize>()
                    .map_err(|_| err("index must be a non-negative integer"))?;
                segments.push(PathSegment::Index(index));
                rest = &rest[close + 1..];
                if !rest.is_empty() && !rest.starts_with('[') {
                    return Err(err("unexpected characters after `]`"));
                }
            }
        }

        if segments.is_empty() {
            return Err(err("empty path"));
        }
        Ok(Self(segments))
    }
}

impl TryFrom<String> for AttrPath {
    type Error = ParsePathError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<AttrPath> for String {
    fn from(path: AttrPath) -> Self {
        path.to_string()
    }
}

impl fmt::Display for AttrPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            match segment {
                PathSegment::Key(key) if i == 0 => write!(f, "{key}")?,
                PathSegment::Key(key) => write!(f, ".{key}")?,
                PathSegment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// Reference to an attribute of another resource's outputs
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutputRef {
    /// Logical name of the producing resource
    pub resource: String,
    /// Attribute path inside the producer's outputs
    pub path: AttrPath,
}

impl OutputRef {
    pub fn new(resource: impl Into<String>, path: AttrPath) -> Self {
        Self {
            resource: resource.into(),
            path,
        }
    }
}

impl FromStr for OutputRef {
    type Err = ParsePathError;

    /// Parse `resource.attribute[0].more`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (resource, path) = s.split_once('.').ok_or_else(|| ParsePathError {
            path: s.to_string(),
            reason: "expected `<resource>.<attribute>`",
        })?;
        if resource.is_empty() {
            return Err(ParsePathError {
                path: s.to_string(),
                reason: "missing resource name",
            });
        }
        Ok(Self::new(resource, path.parse()?))
    }
}

impl fmt::Display for OutputRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.resource, self.path)
    }
}

/// A declared argument value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Literal JSON with no references inside
    Literal(Json),
    /// Value taken from another resource once it is applied
    OutputRef(OutputRef),
    /// List whose items may contain references
    List(Vec<Value>),
    /// Map whose entries may contain references
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn literal(value: impl Into<Json>) -> Self {
        Self::Literal(value.into())
    }

    /// Reference `path` on `resource`
    pub fn reference(resource: &str, path: &str) -> Result<Self, ParsePathError> {
        Ok(Self::OutputRef(OutputRef::new(resource, path.parse()?)))
    }

    /// Every reference contained in this value, depth first
    pub fn references(&self) -> Vec<&OutputRef> {
        let mut found = Vec::new();
        self.collect_references(&mut found);
        found
    }

    fn collect_references<'a>(&'a self, found: &mut Vec<&'a OutputRef>) {
        match self {
            Self::Literal(_) => {}
            Self::OutputRef(reference) => found.push(reference),
            Self::List(items) => items.iter().for_each(|v| v.collect_references(found)),
            Self::Map(entries) => entries.values().for_each(|v| v.collect_references(found)),
        }
    }

    /// Replace every reference using `lookup`, producing plain JSON
    pub fn resolve<E, F>(&self, lookup: &mut F) -> Result<Json, E>
    where
        F: FnMut(&OutputRef) -> Result<Json, E>,
    {
        match self {
            Self::Literal(json) => Ok(json.clone()),
            Self::OutputRef(reference) => lookup(reference),
            Self::List(items) => items
                .iter()
                .map(|item| item.resolve(lookup))
                .collect::<Result<Vec<_>, E>>()
                .map(Json::Array),
            Self::Map(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.resolve(lookup)?);
                }
                Ok(Json::Object(map))
            }
        }
    }
}

impl From<OutputRef> for Value {
    fn from(reference: OutputRef) -> Self {
        Self::OutputRef(reference)
    }
}

/// Resolve a whole argument map
pub fn resolve_arguments<E, F>(args: &BTreeMap<String, Value>, lookup: &mut F) -> Result<Arguments, E>
where
    F: FnMut(&OutputRef) -> Result<Json, E>,
{
    let mut resolved = Arguments::new();
    for (key, value) in args {
        resolved.insert(key.clone(), value.resolve(lookup)?);
    }
    Ok(resolved)
}
