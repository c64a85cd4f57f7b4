//! Record layout helpers.
//!
//! Records are plain JSON objects. The engine only relies on three
//! conventions: the identity field, the modification marker, and the
//! reserved-field prefix used for internal metadata.

use crate::{error::Result, CollectionName, Error, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

/// Identity field of every record.
pub const ID_FIELD: &str = "id";

/// Modification marker, milliseconds since epoch.
pub const MODIFIED_FIELD: &str = "updatedAt";

/// Prefix marking internal metadata fields and internal collections.
pub const RESERVED_PREFIX: char = '_';

/// Get the identity of a record, if it has one.
pub fn record_id(record: &Value) -> Option<&str> {
    record.get(ID_FIELD)?.as_str()
}

/// Get the identity of a record or fail with [`Error::InvalidRecord`].
pub fn require_id(record: &Value) -> Result<&str> {
    if !record.is_object() {
        return Err(Error::InvalidRecord("record is not a JSON object".into()));
    }
    record_id(record)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::InvalidRecord(format!("missing string field '{ID_FIELD}'")))
}

/// Read the modification marker of a record.
///
/// Accepts integer or floating point milliseconds. Negative values are
/// treated as missing.
pub fn modified_at(record: &Value) -> Option<Timestamp> {
    let value = record.get(MODIFIED_FIELD)?;
    value.as_u64().or_else(|| {
        value
            .as_f64()
            .filter(|ms| ms.is_finite() && *ms >= 0.0)
            .map(|ms| ms as Timestamp)
    })
}

/// Stamp the modification marker on a record.
pub fn touch(record: &mut Value, timestamp: Timestamp) {
    if let Some(object) = record.as_object_mut() {
        object.insert(MODIFIED_FIELD.to_string(), Value::from(timestamp));
    }
}

/// Whether a field is metadata rather than user data. Reserved fields never
/// conflict; this covers the identity, the modification marker and anything
/// with the reserved prefix.
pub fn is_reserved_field(field: &str) -> bool {
    field == ID_FIELD || field == MODIFIED_FIELD || field.starts_with(RESERVED_PREFIX)
}

/// The later of two records' modification markers.
pub fn latest_modified(a: &Value, b: &Value) -> Option<Timestamp> {
    modified_at(a).max(modified_at(b))
}

/// Whether a collection holds engine bookkeeping rather than user data.
pub fn is_internal_collection(collection: &str) -> bool {
    collection.starts_with(RESERVED_PREFIX)
}

/// Build the key a conflict uses to point at one record.
pub fn collection_key(collection: &str, id: &str) -> String {
    format!("{collection}:{id}")
}

/// Split a key produced by [`collection_key`].
pub fn split_collection_key(key: &str) -> Option<(CollectionName, RecordId)> {
    let (collection, id) = key.split_once(':')?;
    if collection.is_empty() || id.is_empty() {
        return None;
    }
    Some((collection.to_string(), id.to_string()))
}

/// Look up an indexed value. Dotted paths descend into nested objects.
pub fn index_value<'a>(record: &'a Value, index: &str) -> Option<&'a Value> {
    index
        .split('.')
        .try_fold(record, |current, segment| current.get(segment))
}

/// A key range over an indexed field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRange {
    pub lower: Option<Value>,
    pub upper: Option<Value>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl IndexRange {
    /// Match every indexed value.
    pub fn all() -> Self {
        Self::default()
    }

    /// Match exactly one value.
    pub fn only(value: impl Into<Value>) -> Self {
        let value = value.into();
        Self {
            lower: Some(value.clone()),
            upper: Some(value),
            ..Self::default()
        }
    }

    /// Match values `>= lower`.
    pub fn lower_bound(lower: impl Into<Value>) -> Self {
        Self {
            lower: Some(lower.into()),
            ..Self::default()
        }
    }

    /// Match values `<= upper`.
    pub fn upper_bound(upper: impl Into<Value>) -> Self {
        Self {
            upper: Some(upper.into()),
            ..Self::default()
        }
    }

    /// Match values in `[lower, upper]`.
    pub fn bound(lower: impl Into<Value>, upper: impl Into<Value>) -> Self {
        Self {
            lower: Some(lower.into()),
            upper: Some(upper.into()),
            ..Self::default()
        }
    }

    /// Exclude the lower bound.
    pub fn lower_open(mut self) -> Self {
        self.lower_open = true;
        self
    }

    /// Exclude the upper bound.
    pub fn upper_open(mut self) -> Self {
        self.upper_open = true;
        self
    }

    /// Check whether an indexed value falls inside the range.
    ///
    /// Values of a different kind than the bounds never match.
    pub fn contains(&self, value: &Value) -> bool {
        if let Some(lower) = &self.lower {
            match compare_keys(value, lower) {
                Some(Ordering::Greater) => {}
                Some(Ordering::Equal) if !self.lower_open => {}
                _ => return false,
            }
        }
        if let Some(upper) = &self.upper {
            match compare_keys(value, upper) {
                Some(Ordering::Less) => {}
                Some(Ordering::Equal) if !self.upper_open => {}
                _ => return false,
            }
        }
        true
    }
}

fn compare_keys(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}
