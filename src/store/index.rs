//! Secondary indexes
//!
//! One index per (collection, field). Each index keeps an equality map for
//! `=`/`in` and an ordered map for range operators, both keyed by a
//! normalized form of the JSON value: numbers compare as doubles, strings
//! byte-wise, nulls form their own bucket, booleans order false < true.
//! Arrays and objects are not indexable.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use parking_lot::RwLock;
use serde_json::Value;

/// Normalized, ordered, hashable index key
#[derive(Debug, Clone)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
}

impl IndexKey {
    /// Normalize a JSON value into an index key. Arrays and objects are
    /// not indexable and return `None`.
    pub fn from_json(v: &Value) -> Option<IndexKey> {
        match v {
            Value::Null => Some(IndexKey::Null),
            Value::Bool(b) => Some(IndexKey::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::number),
            Value::String(s) => Some(IndexKey::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    fn number(n: f64) -> IndexKey {
        // Collapse -0.0 so hashing agrees with ordering
        IndexKey::Number(if n == 0.0 { 0.0 } else { n })
    }

    fn rank(&self) -> u8 {
        match self {
            IndexKey::Null => 0,
            IndexKey::Bool(_) => 1,
            IndexKey::Number(_) => 2,
            IndexKey::Str(_) => 3,
        }
    }
}

impl PartialEq for IndexKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}

impl Eq for IndexKey {}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use IndexKey::*;
        match (self, other) {
            (Null, Null) => std::cmp::Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Number(a), Number(b)) => a.total_cmp(b),
            (Str(a), Str(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::hash::Hash for IndexKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            IndexKey::Null => {}
            IndexKey::Bool(b) => b.hash(state),
            IndexKey::Number(n) => n.to_bits().hash(state),
            IndexKey::Str(s) => s.hash(state),
        }
    }
}

/// Range bound for ordered lookups
#[derive(Debug, Clone, Copy)]
pub struct Bound<'a> {
    pub value: &'a Value,
    pub inclusive: bool,
}

struct IndexInner {
    /// `value → set<_id>`, backing `=` and `in`
    eq: HashMap<IndexKey, HashSet<String>>,
    /// `value → set<_id>` in value order, backing range operators
    ord: BTreeMap<IndexKey, BTreeSet<String>>,
}

/// Index over a single top-level field of a collection
pub struct FieldIndex {
    field: String,
    inner: RwLock<IndexInner>,
}

impl FieldIndex {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            inner: RwLock::new(IndexInner {
                eq: HashMap::new(),
                ord: BTreeMap::new(),
            }),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Index the document's value for this field, if it has one
    pub fn insert(&self, id: &str, doc: &Value) {
        let Some(key) = doc.get(&self.field).and_then(IndexKey::from_json) else {
            return;
        };
        let mut inner = self.inner.write();
        inner
            .eq
            .entry(key.clone())
            .or_default()
            .insert(id.to_string());
        inner.ord.entry(key).or_default().insert(id.to_string());
    }

    /// Remove the document's contribution
    pub fn remove(&self, id: &str, doc: &Value) {
        let Some(key) = doc.get(&self.field).and_then(IndexKey::from_json) else {
            return;
        };
        let mut inner = self.inner.write();
        if let Some(set) = inner.eq.get_mut(&key) {
            set.remove(id);
            if set.is_empty() {
                inner.eq.remove(&key);
            }
        }
        if let Some(set) = inner.ord.get_mut(&key) {
            set.remove(id);
            if set.is_empty() {
                inner.ord.remove(&key);
            }
        }
    }

    /// `=` lookup
    pub fn lookup_eq(&self, value: &Value) -> HashSet<String> {
        let Some(key) = IndexKey::from_json(value) else {
            return HashSet::new();
        };
        self.inner
            .read()
            .eq
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// `in` lookup: union of the candidate values
    pub fn lookup_in(&self, values: &[Value]) -> HashSet<String> {
        let inner = self.inner.read();
        let mut out = HashSet::new();
        for value in values {
            if let Some(key) = IndexKey::from_json(value) {
                if let Some(set) = inner.eq.get(&key) {
                    out.extend(set.iter().cloned());
                }
            }
        }
        out
    }

    /// Range lookup over the ordered map; `None` bounds are open
    pub fn lookup_range(&self, lower: Option<Bound<'_>>, upper: Option<Bound<'_>>) -> HashSet<String> {
        use std::ops::Bound as B;

        let lower_key = match lower {
            Some(b) => match IndexKey::from_json(b.value) {
                Some(k) => {
                    if b.inclusive {
                        B::Included(k)
                    } else {
                        B::Excluded(k)
                    }
                }
                None => return HashSet::new(),
            },
            None => B::Unbounded,
        };
        let upper_key = match upper {
            Some(b) => match IndexKey::from_json(b.value) {
                Some(k) => {
                    if b.inclusive {
                        B::Included(k)
                    } else {
                        B::Excluded(k)
                    }
                }
                None => return HashSet::new(),
            },
            None => B::Unbounded,
        };

        // A reversed range would panic inside BTreeMap::range
        if let (B::Included(a) | B::Excluded(a), B::Included(b) | B::Excluded(b)) =
            (&lower_key, &upper_key)
        {
            if a > b {
                return HashSet::new();
            }
        }

        let inner = self.inner.read();
        let mut out = HashSet::new();
        for (_, ids) in inner.ord.range((lower_key, upper_key)) {
            out.extend(ids.iter().cloned());
        }
        out
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.inner.read().eq.values().map(|s| s.len()).sum()
    }
}
