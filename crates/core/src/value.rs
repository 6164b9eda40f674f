//! Cell values and storage kinds.
//!
//! A [`Value`] is a sum type over every supported storage kind. Cross-kind
//! conversion goes through an explicit compatibility table
//! ([`StorageKind::coercibility`]) and a per-value conversion
//! ([`Value::coerce`]) that may fail for individual values.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hash::ContentHasher;

// ---------------------------------------------------------------------------
// Storage kinds
// ---------------------------------------------------------------------------

/// The physical kind a column stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageKind {
    Int,
    Uint,
    Float,
    Bool,
    String,
    Timestamp,
    Binary,
    Json,
}

impl fmt::Display for StorageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int => write!(f, "int"),
            Self::Uint => write!(f, "uint"),
            Self::Float => write!(f, "float"),
            Self::Bool => write!(f, "bool"),
            Self::String => write!(f, "string"),
            Self::Timestamp => write!(f, "timestamp"),
            Self::Binary => write!(f, "binary"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Whether values of one kind can be converted to another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercibility {
    /// Same kind, no conversion.
    Identity,
    /// Every value converts.
    Always,
    /// Conversion is attempted value by value and may fail.
    PerValue,
    /// No value converts.
    Never,
}

impl Coercibility {
    pub fn is_coercible(self) -> bool {
        !matches!(self, Self::Never)
    }
}

impl StorageKind {
    /// The coercion compatibility table.
    pub fn coercibility(self, to: StorageKind) -> Coercibility {
        use Coercibility::*;
        use StorageKind::*;

        if self == to {
            return Identity;
        }
        match (self, to) {
            (_, String) | (_, Json) => match self {
                Binary => PerValue,
                _ => Always,
            },
            (Int, Float) | (Int, Bool) | (Uint, Float) | (Uint, Bool) => Always,
            (Int, Uint) | (Uint, Int) | (Int, Timestamp) => PerValue,
            (Float, Int) | (Float, Uint) => PerValue,
            (Bool, Int) | (Bool, Uint) | (Bool, Float) => Always,
            (String, Int)
            | (String, Uint)
            | (String, Float)
            | (String, Bool)
            | (String, Timestamp) => PerValue,
            (String, Binary) => Always,
            (Timestamp, Int) => Always,
            (Json, Int) | (Json, Uint) | (Json, Float) | (Json, Bool) => PerValue,
            _ => Never,
        }
    }
}

/// A single value failed to convert between kinds.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot coerce {from} value to {to}")]
pub struct CoercionError {
    pub from: StorageKind,
    pub to: StorageKind,
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

/// A single cell value.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Value {
    Null,
    Int(i64),
    Uint(u64),
    Float(f64),
    Bool(bool),
    String(String),
    Timestamp(DateTime<Utc>),
    Binary(Vec<u8>),
    Json(serde_json::Value),
}

impl Value {
    /// Storage kind of this value, `None` for NULL.
    pub fn kind(&self) -> Option<StorageKind> {
        match self {
            Self::Null => None,
            Self::Int(_) => Some(StorageKind::Int),
            Self::Uint(_) => Some(StorageKind::Uint),
            Self::Float(_) => Some(StorageKind::Float),
            Self::Bool(_) => Some(StorageKind::Bool),
            Self::String(_) => Some(StorageKind::String),
            Self::Timestamp(_) => Some(StorageKind::Timestamp),
            Self::Binary(_) => Some(StorageKind::Binary),
            Self::Json(_) => Some(StorageKind::Json),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Ordering rank of the variant; values of different kinds sort by rank.
    fn rank(&self) -> u8 {
        match self {
            Self::Null => 0,
            Self::Bool(_) => 1,
            Self::Int(_) => 2,
            Self::Uint(_) => 3,
            Self::Float(_) => 4,
            Self::String(_) => 5,
            Self::Timestamp(_) => 6,
            Self::Binary(_) => 7,
            Self::Json(_) => 8,
        }
    }

    /// Convert this value to `to`. NULL converts to NULL.
    pub fn coerce(&self, to: StorageKind) -> Result<Value, CoercionError> {
        let from = match self.kind() {
            None => return Ok(Value::Null),
            Some(k) if k == to => return Ok(self.clone()),
            Some(k) => k,
        };
        let fail = CoercionError { from, to };

        let out = match (self, to) {
            (Value::Binary(b), StorageKind::String) => {
                Value::String(String::from_utf8(b.clone()).map_err(|_| fail.clone())?)
            }
            (Value::Binary(b), StorageKind::Json) => {
                serde_json::from_slice(b).map(Value::Json).map_err(|_| fail.clone())?
            }
            (Value::Json(j), StorageKind::String) => Value::String(j.to_string()),
            (v, StorageKind::String) => Value::String(v.to_string()),
            (Value::String(s), StorageKind::Json) => Value::Json(
                serde_json::from_str(s).unwrap_or_else(|_| serde_json::Value::String(s.clone())),
            ),
            (v, StorageKind::Json) => Value::Json(v.clone().json_scalar()),

            (Value::Int(i), StorageKind::Uint) => {
                Value::Uint(u64::try_from(*i).map_err(|_| fail.clone())?)
            }
            (Value::Int(i), StorageKind::Float) => Value::Float(*i as f64),
            (Value::Int(i), StorageKind::Bool) => Value::Bool(*i != 0),
            (Value::Int(i), StorageKind::Timestamp) => Value::Timestamp(
                Utc.timestamp_opt(*i, 0).single().ok_or_else(|| fail.clone())?,
            ),

            (Value::Uint(u), StorageKind::Int) => {
                Value::Int(i64::try_from(*u).map_err(|_| fail.clone())?)
            }
            (Value::Uint(u), StorageKind::Float) => Value::Float(*u as f64),
            (Value::Uint(u), StorageKind::Bool) => Value::Bool(*u != 0),

            (Value::Float(f), StorageKind::Int) => {
                if f.fract() != 0.0 || !f.is_finite() || *f < i64::MIN as f64 || *f > i64::MAX as f64 {
                    return Err(fail);
                }
                Value::Int(*f as i64)
            }
            (Value::Float(f), StorageKind::Uint) => {
                if f.fract() != 0.0 || !f.is_finite() || *f < 0.0 || *f > u64::MAX as f64 {
                    return Err(fail);
                }
                Value::Uint(*f as u64)
            }

            (Value::Bool(b), StorageKind::Int) => Value::Int(i64::from(*b)),
            (Value::Bool(b), StorageKind::Uint) => Value::Uint(u64::from(*b)),
            (Value::Bool(b), StorageKind::Float) => Value::Float(if *b { 1.0 } else { 0.0 }),

            (Value::String(s), StorageKind::Int) => {
                Value::Int(s.trim().parse().map_err(|_| fail.clone())?)
            }
            (Value::String(s), StorageKind::Uint) => {
                Value::Uint(s.trim().parse().map_err(|_| fail.clone())?)
            }
            (Value::String(s), StorageKind::Float) => {
                Value::Float(s.trim().parse().map_err(|_| fail.clone())?)
            }
            (Value::String(s), StorageKind::Bool) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "1" => Value::Bool(true),
                "false" | "0" => Value::Bool(false),
                _ => return Err(fail),
            },
            (Value::String(s), StorageKind::Timestamp) => Value::Timestamp(
                DateTime::parse_from_rfc3339(s.trim())
                    .map_err(|_| fail.clone())?
                    .with_timezone(&Utc),
            ),
            (Value::String(s), StorageKind::Binary) => Value::Binary(s.as_bytes().to_vec()),

            (Value::Timestamp(t), StorageKind::Int) => Value::Int(t.timestamp()),

            (Value::Json(j), StorageKind::Int) => Value::Int(j.as_i64().ok_or(fail)?),
            (Value::Json(j), StorageKind::Uint) => Value::Uint(j.as_u64().ok_or(fail)?),
            (Value::Json(j), StorageKind::Float) => Value::Float(j.as_f64().ok_or(fail)?),
            (Value::Json(j), StorageKind::Bool) => Value::Bool(j.as_bool().ok_or(fail)?),

            _ => return Err(fail),
        };
        Ok(out)
    }

    /// Plain JSON rendering used when a scalar is widened to a JSON column.
    fn json_scalar(self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Int(i) => serde_json::Value::from(i),
            Value::Uint(u) => serde_json::Value::from(u),
            Value::Float(f) => serde_json::Value::from(f),
            Value::Bool(b) => serde_json::Value::from(b),
            Value::String(s) => serde_json::Value::from(s),
            Value::Timestamp(t) => serde_json::Value::from(t.to_rfc3339()),
            Value::Binary(b) => serde_json::Value::from(hex::encode(b)),
            Value::Json(j) => j,
        }
    }

    /// Feed the canonical encoding of this value into a content hasher.
    pub fn hash_into(&self, h: &mut ContentHasher) {
        h.write_u8(self.rank());
        match self {
            Value::Null => {}
            Value::Int(i) => h.write_i64(*i),
            Value::Uint(u) => h.write_u64(*u),
            Value::Float(f) => h.write_u64(f.to_bits()),
            Value::Bool(b) => h.write_u8(u8::from(*b)),
            Value::String(s) => h.write_str(s),
            Value::Timestamp(t) => {
                h.write_i64(t.timestamp());
                h.write_u64(u64::from(t.timestamp_subsec_nanos()));
            }
            Value::Binary(b) => h.write_bytes(b),
            Value::Json(j) => h.write_str(&j.to_string()),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Uint(a), Value::Uint(b)) => a.cmp(b),
            (Value::Float(a), Value::Float(b)) => a.total_cmp(b),
            (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            (Value::Timestamp(a), Value::Timestamp(b)) => a.cmp(b),
            (Value::Binary(a), Value::Binary(b)) => a.cmp(b),
            (Value::Json(a), Value::Json(b)) => a.to_string().cmp(&b.to_string()),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl std::hash::Hash for Value {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        let mut h = ContentHasher::new();
        self.hash_into(&mut h);
        h.finish().hash(state);
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Uint(u) => write!(f, "{u}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::String(s) => write!(f, "{s}"),
            Value::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Binary(b) => write!(f, "0x{}", hex::encode(b)),
            Value::Json(j) => write!(f, "{j}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::Uint(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
