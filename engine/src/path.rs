//! Path-addressed reads and immutable writes into a JSON document.
//!
//! Paths use dot/bracket notation: `"a.b[0].c"` addresses key `c` of the
//! first element of the array at `a.b`. An empty path addresses the whole
//! document.
//!
//! Writes never mutate the input tree. [`set_value`] builds a new document
//! with the change applied, so previously handed-out copies stay valid
//! snapshots. Change detection is structural equality (`==`) on the returned
//! tree, never pointer identity.

use crate::error::{Error, Result};
use serde_json::Value;
use std::fmt;

/// One step of a parsed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// An object key, e.g. `a` in `a.b`.
    Key(String),
    /// An array index, e.g. `0` in `a[0]`.
    Index(usize),
}

/// A parsed document path.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Path {
    segments: Vec<Segment>,
}

impl Path {
    /// The whole-document path.
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse dot/bracket notation. The empty string parses to the root path.
    pub fn parse(raw: &str) -> Result<Self> {
        if raw.is_empty() {
            return Ok(Self::root());
        }

        let invalid = || Error::InvalidPath(raw.to_string());
        let mut segments = Vec::new();

        for part in raw.split('.') {
            let mut rest = part;

            // Key portion before any bracket. A part may also be pure
            // brackets ("[0]") when indexing the parent directly.
            let key_end = rest.find('[').unwrap_or(rest.len());
            let key = &rest[..key_end];
            if !key.is_empty() {
                segments.push(Segment::Key(key.to_string()));
            } else if key_end == rest.len() {
                // empty dotted segment such as "a..b"
                return Err(invalid());
            }
            rest = &rest[key_end..];

            while !rest.is_empty() {
                if !rest.starts_with('[') {
                    return Err(invalid());
                }
                let close = rest.find(']').ok_or_else(invalid)?;
                let index: usize = rest[1..close].parse().map_err(|_| invalid())?;
                segments.push(Segment::Index(index));
                rest = &rest[close + 1..];
            }
        }

        Ok(Self { segments })
    }

    /// Parse an optional path, `None` meaning the whole document.
    pub fn parse_opt(raw: Option<&str>) -> Result<Self> {
        match raw {
            Some(raw) => Self::parse(raw),
            None => Ok(Self::root()),
        }
    }

    /// Whether this path addresses the whole document.
    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// The parsed segments.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            match segment {
                Segment::Key(key) => {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write!(f, "{key}")?;
                }
                Segment::Index(index) => write!(f, "[{index}]")?,
            }
        }
        Ok(())
    }
}

/// Read the value at `path`, or `None` if any step is missing or mistyped.
pub fn get_value<'a>(document: &'a Value, path: &Path) -> Option<&'a Value> {
    let mut current = document;
    for segment in path.segments() {
        current = match segment {
            Segment::Key(key) => current.as_object()?.get(key)?,
            Segment::Index(index) => current.as_array()?.get(*index)?,
        };
    }
    Some(current)
}

/// Build a new document with `value` written at `path`.
///
/// `None` erases the addressed location: object keys are removed, in-bounds
/// array elements are spliced out. Missing intermediate nodes are created
/// (objects for keys, null-padded arrays for indices); nodes of the wrong
/// type are replaced. The input document is never mutated.
pub fn set_value(document: &Value, path: &Path, value: Option<&Value>) -> Value {
    if path.is_root() {
        return value.cloned().unwrap_or(Value::Null);
    }
    // Non-root paths always produce a containing node, so the erase marker
    // cannot surface here.
    write_at(Some(document), path.segments(), value).unwrap_or(Value::Null)
}

fn write_at(current: Option<&Value>, segments: &[Segment], value: Option<&Value>) -> Option<Value> {
    let Some((segment, rest)) = segments.split_first() else {
        return value.cloned();
    };

    match segment {
        Segment::Key(key) => {
            let mut map = match current.and_then(Value::as_object) {
                Some(map) => map.clone(),
                None => serde_json::Map::new(),
            };
            match write_at(map.get(key), rest, value) {
                Some(child) => {
                    map.insert(key.clone(), child);
                }
                None => {
                    map.remove(key);
                }
            }
            Some(Value::Object(map))
        }
        Segment::Index(index) => {
            let mut array = match current.and_then(Value::as_array) {
                Some(array) => array.clone(),
                None => Vec::new(),
            };
            match write_at(array.get(*index), rest, value) {
                Some(child) => {
                    while array.len() <= *index {
                        array.push(Value::Null);
                    }
                    array[*index] = child;
                }
                None => {
                    if *index < array.len() {
                        array.remove(*index);
                    }
                }
            }
            Some(Value::Array(array))
        }
    }
}
