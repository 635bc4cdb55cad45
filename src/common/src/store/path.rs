//! Dotted field paths over JSON documents.
//!
//! A path is split into segments once. Intermediate arrays are traversed
//! implicitly (every element is visited), which gives the all-positional
//! behaviour of the document database's `$[]` operator. A [`Segment::Where`]
//! restricts traversal of an array to the elements whose field equals a value,
//! the equivalent of an array filter.

use serde_json::{Map, Value};
use std::fmt;

use super::Document;

#[derive(Debug, Clone, PartialEq)]
pub enum Segment {
    Field(String),
    Where { field: String, value: Value },
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct FieldPath {
    segments: Vec<Segment>,
}

impl FieldPath {
    /// Parse a dotted path such as `teaching.timeBlocks.assignedLessons`.
    pub fn parse(path: &str) -> Self {
        Self {
            segments: path
                .split('.')
                .filter(|part| !part.is_empty())
                .map(|part| Segment::Field(part.to_string()))
                .collect(),
        }
    }

    /// Append a field segment.
    pub fn field(mut self, name: impl Into<String>) -> Self {
        self.segments.push(Segment::Field(name.into()));
        self
    }

    /// Restrict the array at the current position to elements whose `field`
    /// equals `value`.
    pub fn where_eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.segments.push(Segment::Where {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Concatenate two paths.
    pub fn join(&self, other: &FieldPath) -> FieldPath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        FieldPath { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Name of the top-level field this path starts at.
    pub fn root(&self) -> Option<&str> {
        match self.segments.first() {
            Some(Segment::Field(name)) => Some(name),
            _ => None,
        }
    }

    /// Name of the last field segment.
    pub fn leaf(&self) -> Option<&str> {
        self.segments.iter().rev().find_map(|segment| match segment {
            Segment::Field(name) => Some(name.as_str()),
            Segment::Where { .. } => None,
        })
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for segment in &self.segments {
            if !first {
                f.write_str(".")?;
            }
            first = false;
            match segment {
                Segment::Field(name) => f.write_str(name)?,
                Segment::Where { field, value } => write!(f, "$[{field}={value}]")?,
            }
        }
        Ok(())
    }
}

impl From<&str> for FieldPath {
    fn from(path: &str) -> Self {
        Self::parse(path)
    }
}

impl From<String> for FieldPath {
    fn from(path: String) -> Self {
        Self::parse(&path)
    }
}

impl From<&FieldPath> for FieldPath {
    fn from(path: &FieldPath) -> Self {
        path.clone()
    }
}

/// Collect every value reachable at `path` inside `doc`.
///
/// Arrays at the end of the path are returned as-is; callers decide whether
/// to look inside them.
pub fn resolve<'a>(doc: &'a Document, path: &FieldPath) -> Vec<&'a Value> {
    let mut out = Vec::new();
    let Some((head, rest)) = path.segments.split_first() else {
        return out;
    };
    if let Segment::Field(name) = head
        && let Some(child) = doc.get(name)
    {
        collect(child, rest, &mut out);
    }
    out
}

fn collect<'a>(value: &'a Value, segments: &[Segment], out: &mut Vec<&'a Value>) {
    let Some((head, rest)) = segments.split_first() else {
        out.push(value);
        return;
    };

    match (head, value) {
        (Segment::Field(name), Value::Object(map)) => {
            if let Some(child) = map.get(name) {
                collect(child, rest, out);
            }
        }
        (Segment::Field(_), Value::Array(items)) => {
            for item in items {
                collect(item, segments, out);
            }
        }
        (Segment::Where { field, value: expected }, Value::Array(items)) => {
            for item in items {
                if item.get(field.as_str()) == Some(expected) {
                    collect(item, rest, out);
                }
            }
        }
        _ => {}
    }
}

/// Visit every value at `path`, creating missing objects along the way when
/// `create` is set. Returns how many visits reported a modification.
pub fn visit_mut(
    doc: &mut Document,
    path: &FieldPath,
    create: bool,
    f: &mut dyn FnMut(&mut Value) -> bool,
) -> usize {
    let mut root = Value::Object(std::mem::take(doc));
    let modified = visit_value_mut(&mut root, &path.segments, create, f);
    if let Value::Object(map) = root {
        *doc = map;
    }
    modified
}

fn visit_value_mut(
    value: &mut Value,
    segments: &[Segment],
    create: bool,
    f: &mut dyn FnMut(&mut Value) -> bool,
) -> usize {
    let Some((head, rest)) = segments.split_first() else {
        return usize::from(f(value));
    };

    match head {
        Segment::Field(name) => match value {
            Value::Object(map) => {
                if !map.contains_key(name) {
                    if !create {
                        return 0;
                    }
                    let placeholder = if rest.is_empty() {
                        Value::Null
                    } else {
                        Value::Object(Map::new())
                    };
                    map.insert(name.clone(), placeholder);
                }
                match map.get_mut(name) {
                    Some(child) => visit_value_mut(child, rest, create, f),
                    None => 0,
                }
            }
            Value::Array(items) => items
                .iter_mut()
                .map(|item| visit_value_mut(item, segments, create, f))
                .sum(),
            _ => 0,
        },
        Segment::Where {
            field,
            value: expected,
        } => match value {
            Value::Array(items) => items
                .iter_mut()
                .filter(|item| item.get(field.as_str()) == Some(&*expected))
                .map(|item| visit_value_mut(item, rest, create, f))
                .sum(),
            _ => 0,
        },
    }
}

/// Remove the field addressed by `path` wherever it occurs.
pub fn remove(doc: &mut Document, path: &FieldPath) -> usize {
    let mut root = Value::Object(std::mem::take(doc));
    let removed = remove_value(&mut root, &path.segments);
    if let Value::Object(map) = root {
        *doc = map;
    }
    removed
}

fn remove_value(value: &mut Value, segments: &[Segment]) -> usize {
    match segments {
        [] => 0,
        [Segment::Field(name)] => match value {
            Value::Object(map) => usize::from(map.remove(name).is_some()),
            Value::Array(items) => items
                .iter_mut()
                .map(|item| remove_value(item, segments))
                .sum(),
            _ => 0,
        },
        [head, rest @ ..] => match (head, value) {
            (Segment::Field(name), Value::Object(map)) => match map.get_mut(name) {
                Some(child) => remove_value(child, rest),
                None => 0,
            },
            (Segment::Field(_), Value::Array(items)) => items
                .iter_mut()
                .map(|item| remove_value(item, segments))
                .sum(),
            (Segment::Where { field, value: expected }, Value::Array(items)) => items
                .iter_mut()
                .filter(|item| item.get(field.as_str()) == Some(&*expected))
                .map(|item| remove_value(item, rest))
                .sum(),
            _ => 0,
        },
    }
}
