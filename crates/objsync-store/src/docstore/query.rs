//! Filter matching and mutation application for the in-memory backend.
//!
//! Implements the query-language subset documented on [`super::DocStore`].
//! Paths are dotted (`metadata.destination-org-id`) and resolve through
//! embedded documents.

use bson::{Bson, Document, Timestamp};
use objsync_common::{Error, Result};
use std::cmp::Ordering;

/// Resolve a dotted path inside a document
pub(crate) fn get_path<'a>(doc: &'a Document, path: &str) -> Option<&'a Bson> {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        let value = current.get(segment)?;
        if segments.peek().is_none() {
            return Some(value);
        }
        current = value.as_document()?;
    }
    None
}

/// Set a dotted path inside a document, creating intermediate documents
pub(crate) fn set_path(doc: &mut Document, path: &str, value: Bson) {
    let mut current = doc;
    let mut segments = path.split('.').peekable();
    while let Some(segment) = segments.next() {
        if segments.peek().is_none() {
            current.insert(segment, value);
            return;
        }
        if !matches!(current.get(segment), Some(Bson::Document(_))) {
            current.insert(segment, Document::new());
        }
        let Some(Bson::Document(next)) = current.get_mut(segment) else {
            return;
        };
        current = next;
    }
}

fn compare(a: &Bson, b: &Bson) -> Option<Ordering> {
    match (a, b) {
        (Bson::String(x), Bson::String(y)) => Some(x.cmp(y)),
        (Bson::Boolean(x), Bson::Boolean(y)) => Some(x.cmp(y)),
        (Bson::Timestamp(x), Bson::Timestamp(y)) => {
            Some((x.time, x.increment).cmp(&(y.time, y.increment)))
        }
        (Bson::DateTime(x), Bson::DateTime(y)) => Some(x.cmp(y)),
        _ => match (as_i64(a), as_i64(b)) {
            (Some(x), Some(y)) => Some(x.cmp(&y)),
            _ => None,
        },
    }
}

fn as_i64(value: &Bson) -> Option<i64> {
    match value {
        Bson::Int32(v) => Some(i64::from(*v)),
        Bson::Int64(v) => Some(*v),
        _ => None,
    }
}

fn values_equal(a: &Bson, b: &Bson) -> bool {
    compare(a, b) == Some(Ordering::Equal) || a == b
}

fn match_condition(value: Option<&Bson>, cond: &Bson) -> bool {
    if let Bson::Document(ops) = cond {
        if ops.keys().any(|k| k.starts_with('$')) {
            return ops.iter().all(|(op, rhs)| match op.as_str() {
                "$ne" => !value.is_some_and(|v| values_equal(v, rhs)),
                "$lte" => value.is_some_and(|v| {
                    matches!(compare(v, rhs), Some(Ordering::Less | Ordering::Equal))
                }),
                "$gte" => value.is_some_and(|v| {
                    matches!(compare(v, rhs), Some(Ordering::Greater | Ordering::Equal))
                }),
                _ => false,
            });
        }
    }
    value.is_some_and(|v| values_equal(v, cond))
}

/// Check whether a document matches a filter. An empty filter matches
/// everything.
pub(crate) fn matches(doc: &Document, filter: &Document) -> bool {
    filter.iter().all(|(key, cond)| match key.as_str() {
        "$or" => cond
            .as_array()
            .is_some_and(|branches| {
                branches
                    .iter()
                    .filter_map(Bson::as_document)
                    .any(|branch| matches(doc, branch))
            }),
        "$and" => cond
            .as_array()
            .is_some_and(|branches| {
                branches
                    .iter()
                    .filter_map(Bson::as_document)
                    .all(|branch| matches(doc, branch))
            }),
        _ => match_condition(get_path(doc, key), cond),
    })
}

/// Apply a `$set` / `$inc` / `$currentDate` mutation to a document.
/// `now` is the server-side timestamp stamped by `$currentDate`.
pub(crate) fn apply_update(doc: &mut Document, update: &Document, now: Timestamp) -> Result<()> {
    for (op, spec) in update {
        let Some(fields) = spec.as_document() else {
            return Err(Error::storage(format!("malformed update operator {op}")));
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let delta = as_i64(delta)
                        .ok_or_else(|| Error::storage(format!("non-numeric $inc on {path}")))?;
                    let current = get_path(doc, path).and_then(as_i64).unwrap_or(0);
                    let next = current + delta;
                    let value = match get_path(doc, path) {
                        Some(Bson::Int64(_)) | None => Bson::Int64(next),
                        _ => i32::try_from(next).map_or(Bson::Int64(next), Bson::Int32),
                    };
                    set_path(doc, path, value);
                }
            }
            "$currentDate" => {
                for (path, _) in fields {
                    set_path(doc, path, Bson::Timestamp(now));
                }
            }
            other => return Err(Error::storage(format!("unsupported update operator {other}"))),
        }
    }
    Ok(())
}
