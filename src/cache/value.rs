//! Value Module
//!
//! The values callers store, and how they are laid out inside the arena.
//! Scalars keep a native representation so the atomic updaters can work on
//! them in place; lists and maps go through the configured serializer.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cache::serializer::Serializer;
use crate::error::{CacheError, Result};

// == Value ==
/// A cacheable value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    /// Short type name used in error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Str(_) => "string",
            Value::List(_) => "list",
            Value::Map(_) => "map",
        }
    }

    pub fn as_long(&self) -> Option<i64> {
        match self {
            Value::Long(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Long(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

// == Stored Representation ==
/// Discriminant stored next to a value's payload.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ValueTag {
    Null = 0,
    Bool = 1,
    Long = 2,
    Double = 3,
    Str = 4,
    Serialized = 5,
}

impl ValueTag {
    pub(crate) fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ValueTag::Null),
            1 => Some(ValueTag::Bool),
            2 => Some(ValueTag::Long),
            3 => Some(ValueTag::Double),
            4 => Some(ValueTag::Str),
            5 => Some(ValueTag::Serialized),
            _ => None,
        }
    }
}

/// A value flattened into the bytes that will be copied into a pool.
#[derive(Debug)]
pub(crate) struct Encoded {
    pub tag: ValueTag,
    pub bytes: Vec<u8>,
}

/// Flattens a value. The serializer is only resolved for lists and maps.
pub(crate) fn encode<F>(value: &Value, serializer: F) -> Result<Encoded>
where
    F: FnOnce() -> Result<Arc<dyn Serializer>>,
{
    let (tag, bytes) = match value {
        Value::Null => (ValueTag::Null, Vec::new()),
        Value::Bool(b) => (ValueTag::Bool, vec![*b as u8]),
        Value::Long(v) => (ValueTag::Long, v.to_ne_bytes().to_vec()),
        Value::Double(v) => (ValueTag::Double, v.to_bits().to_ne_bytes().to_vec()),
        Value::Str(s) => (ValueTag::Str, s.as_bytes().to_vec()),
        Value::List(_) | Value::Map(_) => (ValueTag::Serialized, serializer()?.serialize(value)?),
    };
    Ok(Encoded { tag, bytes })
}

/// Rebuilds a value from its stored bytes.
pub(crate) fn decode<F>(tag: ValueTag, bytes: &[u8], serializer: F) -> Result<Value>
where
    F: FnOnce() -> Result<Arc<dyn Serializer>>,
{
    let corrupt = || CacheError::Serialization(format!("corrupt {:?} payload", tag));
    Ok(match tag {
        ValueTag::Null => Value::Null,
        ValueTag::Bool => Value::Bool(*bytes.first().ok_or_else(corrupt)? != 0),
        ValueTag::Long => Value::Long(i64::from_ne_bytes(
            bytes.try_into().map_err(|_| corrupt())?,
        )),
        ValueTag::Double => Value::Double(f64::from_bits(u64::from_ne_bytes(
            bytes.try_into().map_err(|_| corrupt())?,
        ))),
        ValueTag::Str => Value::Str(
            String::from_utf8(bytes.to_vec()).map_err(|e| CacheError::Serialization(e.to_string()))?,
        ),
        ValueTag::Serialized => serializer()?.deserialize(bytes)?,
    })
}
