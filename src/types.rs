//! # Domain Types for Frostline
//!
//! Newtypes for the identifiers that flow through the core, plus the value
//! model stored by objects.
//!
//! ## Invariants
//!
//! - [`VersionId`]: strictly increasing per committed transaction, never reused,
//!   starts at [`VersionId::INITIAL`] for an empty database
//! - [`ObjectKey`]: primary key, unique per class

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Versions
// =============================================================================

/// Identifier of one committed database version.
///
/// # Ordering
///
/// Versions are totally ordered. A live handle's version only ever increases;
/// a frozen handle's version never changes after creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId(u64);

impl VersionId {
    /// Version of a freshly created, empty database.
    pub const INITIAL: VersionId = VersionId(1);

    /// Creates a version from its raw value.
    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> u64 {
        self.0
    }

    /// Returns the version produced by the next commit.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

// =============================================================================
// Object Identity
// =============================================================================

/// Primary key of an object within its class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectKey(i64);

impl ObjectKey {
    /// Creates a key from its raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the raw value.
    pub fn as_raw(&self) -> i64 {
        self.0
    }
}

impl From<i64> for ObjectKey {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// Field Values
// =============================================================================

/// The value held by one named field of an object.
///
/// Scalars are plain JSON values. Collections are first-class so that they can
/// be observed independently of their owning object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// A scalar (or opaque JSON document).
    Value(Value),
    /// An ordered list allowing duplicates.
    List(Vec<Value>),
    /// A set of distinct values, kept in canonical order.
    Set(Vec<Value>),
    /// A string-keyed dictionary.
    Map(BTreeMap<String, Value>),
}

impl FieldValue {
    /// Creates a list field.
    pub fn list(values: impl IntoIterator<Item = Value>) -> Self {
        FieldValue::List(values.into_iter().collect())
    }

    /// Creates a set field; duplicates are dropped and order is canonicalized.
    pub fn set(values: impl IntoIterator<Item = Value>) -> Self {
        let mut out: Vec<Value> = Vec::new();
        for v in values {
            insert_canonical(&mut out, v);
        }
        FieldValue::Set(out)
    }

    /// Creates a map field.
    pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        FieldValue::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Returns the kind of this field, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            FieldValue::Value(_) => "value",
            FieldValue::List(_) => "list",
            FieldValue::Set(_) => "set",
            FieldValue::Map(_) => "map",
        }
    }
}

impl From<Value> for FieldValue {
    fn from(value: Value) -> Self {
        FieldValue::Value(value)
    }
}

/// The canonical sort key for set members.
///
/// `serde_json::Value` has no total order, so members are ordered by their
/// compact serialized form.
pub(crate) fn canonical_key(value: &Value) -> String {
    value.to_string()
}

/// Inserts into a canonically ordered set. Returns false if already present.
pub(crate) fn insert_canonical(set: &mut Vec<Value>, value: Value) -> bool {
    let key = canonical_key(&value);
    match set.binary_search_by(|probe| canonical_key(probe).cmp(&key)) {
        Ok(_) => false,
        Err(pos) => {
            set.insert(pos, value);
            true
        }
    }
}

/// A full object row: field name to value.
pub type Row = BTreeMap<String, FieldValue>;

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_ordering() {
        let v1 = VersionId::INITIAL;
        let v2 = v1.next();
        assert!(v2 > v1);
        assert_eq!(v2.as_raw(), 2);
        assert_eq!(v2.to_string(), "v2");
    }

    #[test]
    fn test_set_is_canonical_and_distinct() {
        let set = FieldValue::set(vec![json!("b"), json!("a"), json!("b")]);
        assert_eq!(set, FieldValue::Set(vec![json!("a"), json!("b")]));
    }

    #[test]
    fn test_insert_canonical_reports_duplicates() {
        let mut set = vec![];
        assert!(insert_canonical(&mut set, json!(2)));
        assert!(insert_canonical(&mut set, json!(1)));
        assert!(!insert_canonical(&mut set, json!(2)));
        assert_eq!(set, vec![json!(1), json!(2)]);
    }

    #[test]
    fn test_field_value_serde() {
        let field = FieldValue::map(vec![("k", json!(1))]);
        let text = serde_json::to_string(&field).unwrap();
        let back: FieldValue = serde_json::from_str(&text).unwrap();
        assert_eq!(back, field);
        assert_eq!(back.kind(), "map");
    }
}
