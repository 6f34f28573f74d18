//! The dynamically-typed value model carried by task arguments and, by
//! extension, by the whole wire envelope (see [`crate::codec`]).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

/// Extension tag reserved for a [reference envelope](crate::envelope) —
/// an argument that must be rehydrated by the resolver before execution.
pub const EXT_TAG_REF: u8 = 1;

/// Extension tag reserved for a serialized prior exception, carried along a
/// retry so the handler can inspect why the previous attempt failed.
pub const EXT_TAG_ERR: u8 = 2;

/// A value that can appear in task arguments or nested inside one.
///
/// This is the payload-side counterpart of [`crate::envelope::TaskEnvelope`]:
/// every argument value, however deeply nested, is one of these variants.
/// `Map` keys are always `String`s and are encoded in sorted order so that
/// [`crate::codec::encode`] is deterministic.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    Seq(Vec<Value>),
    /// Encoded on the wire as a `Seq` carrying the set tag.
    Set(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Instant(DateTime<Utc>),
    Decimal(Decimal),
    Uuid(Uuid),
    /// A tagged extension value: `u8` tag plus an opaque payload `Value`.
    Ext(u8, Box<Value>),
}

impl Value {
    /// Builds a [`EXT_TAG_REF`] reference envelope value.
    ///
    /// `class_path` names the loader registered for this reference type;
    /// `primary_key` is opaque to the codec and interpreted only by the
    /// loader (see [`crate::resolver`]).
    pub fn reference(class_path: impl Into<String>, primary_key: Value) -> Value {
        let mut map = BTreeMap::new();
        map.insert("class_path".to_string(), Value::Str(class_path.into()));
        map.insert("primary_key".to_string(), primary_key);
        Value::Ext(EXT_TAG_REF, Box::new(Value::Map(map)))
    }

    /// Returns `Some((class_path, primary_key))` if this value is a
    /// well-formed `REF` extension.
    pub fn as_reference(&self) -> Option<(&str, &Value)> {
        let Value::Ext(EXT_TAG_REF, inner) = self else {
            return None;
        };
        let Value::Map(map) = inner.as_ref() else {
            return None;
        };
        let Value::Str(class_path) = map.get("class_path")? else {
            return None;
        };
        let primary_key = map.get("primary_key")?;
        Some((class_path.as_str(), primary_key))
    }

    /// Wraps a serialized prior exception as an [`EXT_TAG_ERR`] value.
    pub fn error_carrier(message: impl Into<String>) -> Value {
        Value::Ext(EXT_TAG_ERR, Box::new(Value::Str(message.into())))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_round_trips_through_accessors() {
        let v = Value::reference("User", Value::Int(42));
        let (class_path, pk) = v.as_reference().expect("reference shape");
        assert_eq!(class_path, "User");
        assert_eq!(pk, &Value::Int(42));
    }

    #[test]
    fn non_reference_values_reject_as_reference() {
        assert!(Value::Int(1).as_reference().is_none());
        assert!(Value::Ext(EXT_TAG_ERR, Box::new(Value::Null))
            .as_reference()
            .is_none());
    }
}
