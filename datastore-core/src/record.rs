/*!
Records, change sets and parameterized fetch requests.

A record is a typed bag of attributes belonging to one schema entity. Queries
are built from values, never from formatted strings, so attribute values can
not leak into the query structure.
*/

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Attribute value stored on a record
pub type Value = serde_json::Value;

static NULL: Value = Value::Null;

/// Stable identity of a record across every context of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectId(Uuid);

impl ObjectId {
    /// Allocate a fresh identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single object of a schema entity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: ObjectId,
    pub entity: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

impl Record {
    /// Create an empty record for `entity` with a fresh identifier
    pub fn new<S: Into<String>>(entity: S) -> Self {
        Self {
            id: ObjectId::new(),
            entity: entity.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute setter
    pub fn with<K: Into<String>, V: Into<Value>>(mut self, key: K, value: V) -> Self {
        self.set(key, value);
        self
    }

    /// Set an attribute, replacing any previous value
    pub fn set<K: Into<String>, V: Into<Value>>(&mut self, key: K, value: V) {
        self.attributes.insert(key.into(), value.into());
    }

    /// Remove an attribute
    pub fn unset(&mut self, key: &str) -> Option<Value> {
        self.attributes.remove(key)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// String view of an attribute, `None` when absent or not a string
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(Value::as_str)
    }

    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(Value::as_i64)
    }
}

/// Inserted, updated and deleted records produced by one context save
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub inserted: Vec<Record>,
    pub updated: Vec<Record>,
    pub deleted: Vec<ObjectId>,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Number of objects touched by this change set
    pub fn len(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// Filter over record attributes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    Equals(String, Value),
    NotEquals(String, Value),
    In(String, Vec<Value>),
    And(Vec<Predicate>),
    Or(Vec<Predicate>),
    Not(Box<Predicate>),
}

impl Predicate {
    /// `key == value`
    pub fn equals<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        Self::Equals(key.into(), value.into())
    }

    /// `key != value`
    pub fn not_equals<K: Into<String>, V: Into<Value>>(key: K, value: V) -> Self {
        Self::NotEquals(key.into(), value.into())
    }

    /// Conjunction with another predicate
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut all) => {
                all.push(other);
                Self::And(all)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Evaluate the predicate against a record; a missing attribute compares as null
    pub fn evaluate(&self, record: &Record) -> bool {
        let lookup = |key: &str| record.get(key).unwrap_or(&NULL);
        match self {
            Self::Equals(key, value) => lookup(key) == value,
            Self::NotEquals(key, value) => lookup(key) != value,
            Self::In(key, values) => values.contains(lookup(key)),
            Self::And(all) => all.iter().all(|p| p.evaluate(record)),
            Self::Or(any) => any.iter().any(|p| p.evaluate(record)),
            Self::Not(inner) => !inner.evaluate(record),
        }
    }
}

/// Ordering on a single attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortDescriptor {
    pub key: String,
    pub ascending: bool,
}

impl SortDescriptor {
    pub fn ascending<K: Into<String>>(key: K) -> Self {
        Self {
            key: key.into(),
            ascending: true,
        }
    }

    pub fn descending<K: Into<String>>(key: K) -> Self {
        Self {
            key: key.into(),
            ascending: false,
        }
    }
}

/// Everything a context needs to answer a fetch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchRequest {
    pub entity: String,
    pub predicate: Option<Predicate>,
    pub sort_descriptors: Vec<SortDescriptor>,
    pub limit: Option<usize>,
}

impl FetchRequest {
    pub fn new<S: Into<String>>(entity: S) -> Self {
        Self {
            entity: entity.into(),
            predicate: None,
            sort_descriptors: Vec::new(),
            limit: None,
        }
    }

    pub fn with_predicate(mut self, predicate: Predicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    pub fn sorted_by(mut self, descriptor: SortDescriptor) -> Self {
        self.sort_descriptors.push(descriptor);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, record: &Record) -> bool {
        record.entity == self.entity
            && self
                .predicate
                .as_ref()
                .map_or(true, |predicate| predicate.evaluate(record))
    }

    /// Filter, sort and truncate `records` according to this request
    pub fn apply(&self, records: impl IntoIterator<Item = Record>) -> Vec<Record> {
        let mut results: Vec<Record> = records.into_iter().filter(|r| self.matches(r)).collect();
        if !self.sort_descriptors.is_empty() {
            results.sort_by(|a, b| self.compare(a, b));
        }
        if let Some(limit) = self.limit {
            results.truncate(limit);
        }
        results
    }

    fn compare(&self, a: &Record, b: &Record) -> Ordering {
        for descriptor in &self.sort_descriptors {
            let left = a.get(&descriptor.key).unwrap_or(&NULL);
            let right = b.get(&descriptor.key).unwrap_or(&NULL);
            let ordering = compare_values(left, right);
            let ordering = if descriptor.ascending {
                ordering
            } else {
                ordering.reverse()
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }
}

/// Total order over attribute values: null < bool < number < string < array < object
pub fn compare_values(left: &Value, right: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (left, right) {
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            match (a.as_i64(), b.as_i64()) {
                (Some(x), Some(y)) => x.cmp(&y),
                _ => {
                    let x = a.as_f64().unwrap_or(f64::NAN);
                    let y = b.as_f64().unwrap_or(f64::NAN);
                    x.partial_cmp(&y).unwrap_or(Ordering::Equal)
                }
            }
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a
            .iter()
            .zip(b.iter())
            .map(|(x, y)| compare_values(x, y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        _ => rank(left).cmp(&rank(right)),
    }
}
