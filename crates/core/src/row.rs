//! Primary keys and row values.
//!
//! Row payloads are keyed by column tag rather than position, so renaming or
//! reordering columns never rewrites stored rows. NULL cells are not stored:
//! adding a nullable column leaves every existing row byte-identical.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hash::{ContentHasher, Hash};
use crate::schema::{Tag, KEYLESS_CARDINALITY_TAG};
use crate::value::Value;

static NULL: Value = Value::Null;

// ---------------------------------------------------------------------------
// Key
// ---------------------------------------------------------------------------

/// A primary-key tuple, ordered lexicographically by its values.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(pub Vec<Value>);

impl Key {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }

    pub fn values(&self) -> &[Value] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn hash_into(&self, h: &mut ContentHasher) {
        h.write_u64(self.0.len() as u64);
        for v in &self.0 {
            v.hash_into(h);
        }
    }

    pub fn content_hash(&self) -> Hash {
        let mut h = ContentHasher::with_domain("key");
        self.hash_into(&mut h);
        h.finish()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

macro_rules! key_from_scalar {
    ($($t:ty),*) => {
        $(impl From<$t> for Key {
            fn from(v: $t) -> Self {
                Key(vec![Value::from(v)])
            }
        })*
    };
}

key_from_scalar!(i64, i32, u64, &str, String);

impl From<Value> for Key {
    fn from(v: Value) -> Self {
        Key(vec![v])
    }
}

impl From<Vec<Value>> for Key {
    fn from(values: Vec<Value>) -> Self {
        Key(values)
    }
}

// ---------------------------------------------------------------------------
// Row
// ---------------------------------------------------------------------------

/// The non-key cells of a row, keyed by column tag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Row {
    values: BTreeMap<Tag, Value>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style setter.
    pub fn with(mut self, tag: Tag, value: impl Into<Value>) -> Self {
        self.set(tag, value.into());
        self
    }

    /// Value for `tag`, NULL when absent.
    pub fn get(&self, tag: Tag) -> &Value {
        self.values.get(&tag).unwrap_or(&NULL)
    }

    /// Set a cell; setting NULL removes it.
    pub fn set(&mut self, tag: Tag, value: Value) {
        if value.is_null() {
            self.values.remove(&tag);
        } else {
            self.values.insert(tag, value);
        }
    }

    pub fn remove(&mut self, tag: Tag) -> Option<Value> {
        self.values.remove(&tag)
    }

    pub fn contains(&self, tag: Tag) -> bool {
        self.values.contains_key(&tag)
    }

    /// Stored (non-NULL) cells in tag order.
    pub fn iter(&self) -> impl Iterator<Item = (Tag, &Value)> {
        self.values.iter().map(|(t, v)| (*t, v))
    }

    /// Drop every cell whose tag fails `keep`.
    pub fn retain_tags(&mut self, mut keep: impl FnMut(Tag) -> bool) {
        self.values.retain(|t, _| keep(*t));
    }

    /// Number of identical copies this entry stands for in a keyless table.
    pub fn cardinality(&self) -> u64 {
        match self.values.get(&KEYLESS_CARDINALITY_TAG) {
            Some(Value::Uint(n)) => *n,
            _ => 1,
        }
    }

    pub fn set_cardinality(&mut self, n: u64) {
        self.values.insert(KEYLESS_CARDINALITY_TAG, Value::Uint(n));
    }

    /// The row without its keyless bookkeeping cell.
    pub fn without_cardinality(&self) -> Row {
        let mut out = self.clone();
        out.values.remove(&KEYLESS_CARDINALITY_TAG);
        out
    }

    pub fn hash_into(&self, h: &mut ContentHasher) {
        h.write_u64(self.values.len() as u64);
        for (tag, v) in &self.values {
            h.write_u64(*tag);
            v.hash_into(h);
        }
    }

    /// Hash of the cells excluding cardinality; the synthesized key of a
    /// keyless row.
    pub fn keyless_hash(&self) -> Hash {
        let mut h = ContentHasher::with_domain("keyless-row");
        self.without_cardinality().hash_into(&mut h);
        h.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_cells_are_not_stored() {
        let mut row = Row::new().with(1, 5).with(2, Value::Null);
        assert!(!row.contains(2));
        assert_eq!(row.get(2), &Value::Null);
        row.set(1, Value::Null);
        assert_eq!(row, Row::new());
    }

    #[test]
    fn test_key_ordering() {
        let a = Key::new(vec![Value::Int(1), Value::from("b")]);
        let b = Key::new(vec![Value::Int(1), Value::from("c")]);
        let c = Key::new(vec![Value::Int(2), Value::from("a")]);
        assert!(a < b && b < c);
        assert_eq!(a.to_string(), "(1, b)");
    }

    #[test]
    fn test_keyless_hash_ignores_cardinality() {
        let mut a = Row::new().with(7, "x");
        let h = a.keyless_hash();
        a.set_cardinality(3);
        assert_eq!(a.keyless_hash(), h);
        assert_eq!(a.cardinality(), 3);
        assert_eq!(Row::new().cardinality(), 1);
    }
}
