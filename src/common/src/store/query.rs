//! Filter and update evaluation shared by every store backend.

use chrono::{DateTime, FixedOffset};
use serde_json::Value;
use std::cmp::Ordering;

use super::Document;
use super::path::{self, FieldPath};

/// Document filter.
///
/// `Eq` follows document-database semantics: it matches when any value at
/// the path equals the operand, or is an array containing it.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Eq(FieldPath, Value),
    Ne(FieldPath, Value),
    In(FieldPath, Vec<Value>),
    Exists(FieldPath, bool),
    Lt(FieldPath, Value),
    Lte(FieldPath, Value),
    Gt(FieldPath, Value),
    Gte(FieldPath, Value),
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn id(id: impl Into<Value>) -> Self {
        Self::Eq(FieldPath::parse("_id"), id.into())
    }

    pub fn eq(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::Eq(path.into(), value.into())
    }

    pub fn ne(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::Ne(path.into(), value.into())
    }

    pub fn is_in(path: impl Into<FieldPath>, values: impl IntoIterator<Item = Value>) -> Self {
        Self::In(path.into(), values.into_iter().collect())
    }

    pub fn exists(path: impl Into<FieldPath>, exists: bool) -> Self {
        Self::Exists(path.into(), exists)
    }

    pub fn lt(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::Lt(path.into(), value.into())
    }

    pub fn gt(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::Gt(path.into(), value.into())
    }

    pub fn and(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::And(filters.into_iter().collect())
    }

    pub fn or(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self::Or(filters.into_iter().collect())
    }

    pub fn not(filter: Filter) -> Self {
        Self::Not(Box::new(filter))
    }

    pub fn matches(&self, doc: &Document) -> bool {
        match self {
            Filter::All => true,
            Filter::Eq(path, expected) => eq_at(doc, path, expected),
            Filter::Ne(path, expected) => !eq_at(doc, path, expected),
            Filter::In(path, candidates) => candidates.iter().any(|c| eq_at(doc, path, c)),
            Filter::Exists(path, wanted) => !path::resolve(doc, path).is_empty() == *wanted,
            Filter::Lt(path, bound) => cmp_at(doc, path, bound, |o| o == Ordering::Less),
            Filter::Lte(path, bound) => cmp_at(doc, path, bound, |o| o != Ordering::Greater),
            Filter::Gt(path, bound) => cmp_at(doc, path, bound, |o| o == Ordering::Greater),
            Filter::Gte(path, bound) => cmp_at(doc, path, bound, |o| o != Ordering::Less),
            Filter::And(filters) => filters.iter().all(|f| f.matches(doc)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(doc)),
            Filter::Not(inner) => !inner.matches(doc),
        }
    }
}

fn eq_at(doc: &Document, path: &FieldPath, expected: &Value) -> bool {
    path::resolve(doc, path).into_iter().any(|value| {
        value == expected
            || matches!(value, Value::Array(items) if items.contains(expected))
            || (expected.is_null() && value.is_null())
    }) || (expected.is_null() && path::resolve(doc, path).is_empty())
}

fn cmp_at(doc: &Document, path: &FieldPath, bound: &Value, accept: fn(Ordering) -> bool) -> bool {
    path::resolve(doc, path)
        .into_iter()
        .filter_map(|value| compare_values(value, bound))
        .any(accept)
}

/// Order two scalar values. Numbers compare numerically, RFC 3339 strings
/// chronologically, other strings lexically.
pub fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => {
            match (parse_timestamp(x), parse_timestamp(y)) {
                (Some(x), Some(y)) => Some(x.cmp(&y)),
                _ => Some(x.cmp(y)),
            }
        }
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn parse_timestamp(raw: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc3339(raw).ok()
}

/// Element matcher for [`Update::Pull`].
#[derive(Debug, Clone, PartialEq)]
pub enum PullMatcher {
    /// Remove elements equal to the value.
    Value(Value),
    /// Remove object elements whose field equals the value.
    FieldEq { field: String, value: Value },
}

impl PullMatcher {
    fn matches(&self, element: &Value) -> bool {
        match self {
            PullMatcher::Value(expected) => element == expected,
            PullMatcher::FieldEq { field, value } => element.get(field.as_str()) == Some(value),
        }
    }
}

/// Document mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    Set(FieldPath, Value),
    Unset(FieldPath),
    Pull { path: FieldPath, matcher: PullMatcher },
    /// Append to the array at `path` unless an equal element is present.
    AddToSet { path: FieldPath, value: Value },
}

impl Update {
    pub fn set(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::Set(path.into(), value.into())
    }

    pub fn unset(path: impl Into<FieldPath>) -> Self {
        Self::Unset(path.into())
    }

    pub fn pull(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::Pull {
            path: path.into(),
            matcher: PullMatcher::Value(value.into()),
        }
    }

    pub fn pull_where(
        path: impl Into<FieldPath>,
        field: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        Self::Pull {
            path: path.into(),
            matcher: PullMatcher::FieldEq {
                field: field.into(),
                value: value.into(),
            },
        }
    }

    pub fn add_to_set(path: impl Into<FieldPath>, value: impl Into<Value>) -> Self {
        Self::AddToSet {
            path: path.into(),
            value: value.into(),
        }
    }

    /// Apply to `doc`, returning whether anything changed.
    pub fn apply(&self, doc: &mut Document) -> bool {
        match self {
            Update::Set(path, value) => {
                path::visit_mut(doc, path, true, &mut |slot| {
                    if *slot == *value {
                        false
                    } else {
                        *slot = value.clone();
                        true
                    }
                }) > 0
            }
            Update::Unset(path) => path::remove(doc, path) > 0,
            Update::Pull { path, matcher } => {
                path::visit_mut(doc, path, false, &mut |slot| match slot {
                    Value::Array(items) => {
                        let before = items.len();
                        items.retain(|item| !matcher.matches(item));
                        items.len() != before
                    }
                    _ => false,
                }) > 0
            }
            Update::AddToSet { path, value } => {
                path::visit_mut(doc, path, true, &mut |slot| match slot {
                    Value::Null => {
                        *slot = Value::Array(vec![value.clone()]);
                        true
                    }
                    Value::Array(items) if !items.contains(value) => {
                        items.push(value.clone());
                        true
                    }
                    _ => false,
                }) > 0
            }
        }
    }
}

/// Apply every update in order. Returns whether the document changed.
pub fn apply_all(doc: &mut Document, updates: &[Update]) -> bool {
    updates
        .iter()
        .fold(false, |changed, update| update.apply(doc) || changed)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Sort {
    pub path: FieldPath,
    pub descending: bool,
}

/// Options for `find`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FindOptions {
    /// Top-level fields to keep (`_id` is always kept).
    pub projection: Option<Vec<String>>,
    pub limit: Option<usize>,
    pub skip: Option<usize>,
    pub sort: Option<Sort>,
}

impl FindOptions {
    pub fn limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Default::default()
        }
    }

    pub fn with_projection<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_sort(mut self, path: impl Into<FieldPath>, descending: bool) -> Self {
        self.sort = Some(Sort {
            path: path.into(),
            descending,
        });
        self
    }

    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// Filter, sort, page and project a collection's documents.
pub fn select<'a>(
    docs: impl IntoIterator<Item = &'a Document>,
    filter: &Filter,
    options: &FindOptions,
) -> Vec<Document> {
    let mut matched: Vec<&Document> = docs.into_iter().filter(|d| filter.matches(d)).collect();

    if let Some(sort) = &options.sort {
        matched.sort_by(|a, b| {
            let left = path::resolve(a, &sort.path).into_iter().next();
            let right = path::resolve(b, &sort.path).into_iter().next();
            let ordering = match (left, right) {
                (Some(l), Some(r)) => compare_values(l, r).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Greater,
                (None, Some(_)) => Ordering::Less,
                (None, None) => Ordering::Equal,
            };
            if sort.descending {
                ordering.reverse()
            } else {
                ordering
            }
        });
    }

    matched
        .into_iter()
        .skip(options.skip.unwrap_or(0))
        .take(options.limit.unwrap_or(usize::MAX))
        .map(|doc| project(doc, options.projection.as_deref()))
        .collect()
}

fn project(doc: &Document, projection: Option<&[String]>) -> Document {
    match projection {
        None => doc.clone(),
        Some(fields) => doc
            .iter()
            .filter(|(key, _)| key.as_str() == "_id" || fields.iter().any(|f| f == *key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: Value) -> Document {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[test]
    fn test_eq_matches_array_membership() {
        let orchestra = doc(json!({"_id": "o1", "memberIds": ["s1", "s2"]}));
        assert!(Filter::eq("memberIds", "s1").matches(&orchestra));
        assert!(!Filter::eq("memberIds", "s9").matches(&orchestra));
    }

    #[test]
    fn test_eq_null_matches_missing_field() {
        let record = doc(json!({"_id": "r1"}));
        assert!(Filter::eq("archived", Value::Null).matches(&record));
        assert!(!Filter::ne("archived", Value::Null).matches(&record));
    }

    #[test]
    fn test_timestamp_comparison_is_chronological() {
        let record = doc(json!({"timestamp": "2024-01-01T00:00:00.5Z"}));
        assert!(Filter::gt("timestamp", "2024-01-01T00:00:00Z").matches(&record));
        assert!(Filter::lt("timestamp", "2024-01-01T00:00:01Z").matches(&record));
    }

    #[test]
    fn test_pull_nested_objects_by_field() {
        let mut teacher = doc(json!({
            "teaching": {"timeBlocks": [
                {"_id": "b1", "assignedLessons": [{"studentId": "s1"}, {"studentId": "s2"}]},
                {"_id": "b2", "assignedLessons": [{"studentId": "s1"}]}
            ]}
        }));
        let update = Update::pull_where("teaching.timeBlocks.assignedLessons", "studentId", "s1");
        assert!(update.apply(&mut teacher));
        assert_eq!(
            teacher["teaching"]["timeBlocks"][0]["assignedLessons"],
            json!([{"studentId": "s2"}])
        );
        assert_eq!(teacher["teaching"]["timeBlocks"][1]["assignedLessons"], json!([]));
        assert!(!update.apply(&mut teacher));
    }

    #[test]
    fn test_add_to_set_is_idempotent() {
        let mut orchestra = doc(json!({"memberIds": ["s2"]}));
        let update = Update::add_to_set("memberIds", "s1");
        assert!(update.apply(&mut orchestra));
        assert!(!update.apply(&mut orchestra));
        assert_eq!(orchestra["memberIds"], json!(["s2", "s1"]));
    }

    #[test]
    fn test_add_to_set_through_array_filter() {
        let mut teacher = doc(json!({
            "teaching": {"timeBlocks": [
                {"_id": "b1", "assignedLessons": []},
                {"_id": "b2", "assignedLessons": []}
            ]}
        }));
        let path = FieldPath::parse("teaching.timeBlocks")
            .where_eq("_id", "b2")
            .field("assignedLessons");
        assert!(Update::add_to_set(path, json!({"studentId": "s1"})).apply(&mut teacher));
        assert_eq!(teacher["teaching"]["timeBlocks"][0]["assignedLessons"], json!([]));
        assert_eq!(
            teacher["teaching"]["timeBlocks"][1]["assignedLessons"],
            json!([{"studentId": "s1"}])
        );
    }

    #[test]
    fn test_select_sorts_pages_and_projects() {
        let docs = [
            doc(json!({"_id": "a", "n": 2, "extra": true})),
            doc(json!({"_id": "b", "n": 1, "extra": true})),
            doc(json!({"_id": "c", "n": 3, "extra": true})),
        ];
        let options = FindOptions::default()
            .with_sort("n", true)
            .with_skip(1)
            .with_limit(1)
            .with_projection(["n"]);
        let selected = select(docs.iter(), &Filter::All, &options);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0]["_id"], json!("a"));
        assert!(selected[0].get("extra").is_none());
    }
}
