//! The single binary encoding used for envelopes and nested argument values
//!.
//!
//! The wire shape is a simple tag-length-value scheme built on
//! [`bytes::BytesMut`]/[`bytes::Buf`]: every value starts with a one-byte
//! tag, followed by a tag-specific payload. Map keys are written in sorted
//! order so that `encode` is deterministic for identical logical input,
//! regardless of the `BTreeMap`'s (already-sorted) iteration order — sorting
//! is therefore implicit, but stated explicitly here because it is a
//! contract, not an accident of the collection type chosen.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::error::DecodeError;
use crate::value::Value;

const TAG_NULL: u8 = 0;
const TAG_BOOL: u8 = 1;
const TAG_INT: u8 = 2;
const TAG_FLOAT: u8 = 3;
const TAG_STR: u8 = 4;
const TAG_BYTES: u8 = 5;
const TAG_SEQ: u8 = 6;
const TAG_SET: u8 = 7;
const TAG_MAP: u8 = 8;
const TAG_INSTANT: u8 = 9;
const TAG_DECIMAL: u8 = 10;
const TAG_UUID: u8 = 11;
const TAG_EXT: u8 = 12;

/// Encodes a [`Value`] tree to its canonical binary form.
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut buf = BytesMut::new();
    write_value(&mut buf, value);
    buf.to_vec()
}

/// Decodes a [`Value`] tree previously produced by [`encode_value`].
///
/// Returns [`DecodeError`] on truncated input, an unrecognized tag, or an
/// unrecognized extension tag — a reader that doesn't
/// understand an extension type must fail loudly rather than drop it.
pub fn decode_value(bytes: &[u8]) -> Result<Value, DecodeError> {
    let mut buf = Bytes::copy_from_slice(bytes);
    let value = read_value(&mut buf, bytes.len())?;
    Ok(value)
}

fn write_value(buf: &mut BytesMut, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(b) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(*b as u8);
        }
        Value::Int(i) => {
            buf.put_u8(TAG_INT);
            buf.put_i64(*i);
        }
        Value::Float(f) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64(*f);
        }
        Value::Str(s) => {
            buf.put_u8(TAG_STR);
            write_bytes(buf, s.as_bytes());
        }
        Value::Bytes(b) => {
            buf.put_u8(TAG_BYTES);
            write_bytes(buf, b);
        }
        Value::Seq(items) => {
            buf.put_u8(TAG_SEQ);
            write_seq(buf, items);
        }
        Value::Set(items) => {
            buf.put_u8(TAG_SET);
            write_seq(buf, items);
        }
        Value::Map(map) => {
            buf.put_u8(TAG_MAP);
            write_map(buf, map);
        }
        Value::Instant(instant) => {
            buf.put_u8(TAG_INSTANT);
            write_bytes(buf, instant.to_rfc3339().as_bytes());
        }
        Value::Decimal(decimal) => {
            buf.put_u8(TAG_DECIMAL);
            write_bytes(buf, decimal.to_string().as_bytes());
        }
        Value::Uuid(uuid) => {
            buf.put_u8(TAG_UUID);
            buf.put_slice(uuid.as_bytes());
        }
        Value::Ext(tag, inner) => {
            buf.put_u8(TAG_EXT);
            buf.put_u8(*tag);
            write_value(buf, inner);
        }
    }
}

fn write_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn write_seq(buf: &mut BytesMut, items: &[Value]) {
    buf.put_u32(items.len() as u32);
    for item in items {
        write_value(buf, item);
    }
}

fn write_map(buf: &mut BytesMut, map: &BTreeMap<String, Value>) {
    buf.put_u32(map.len() as u32);
    // `BTreeMap` already iterates in sorted key order; this is what makes
    // `encode_value` deterministic for maps built in any insertion order.
    for (key, value) in map {
        write_bytes(buf, key.as_bytes());
        write_value(buf, value);
    }
}

fn read_value(buf: &mut Bytes, total_len: usize) -> Result<Value, DecodeError> {
    let offset = total_len - buf.remaining();
    let tag = read_u8(buf, offset)?;
    match tag {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => Ok(Value::Bool(read_u8(buf, offset)? != 0)),
        TAG_INT => Ok(Value::Int(read_i64(buf, offset)?)),
        TAG_FLOAT => Ok(Value::Float(read_f64(buf, offset)?)),
        TAG_STR => {
            let bytes = read_bytes(buf, offset)?;
            let s = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset })?;
            Ok(Value::Str(s))
        }
        TAG_BYTES => Ok(Value::Bytes(read_bytes(buf, offset)?)),
        TAG_SEQ => Ok(Value::Seq(read_seq(buf, total_len)?)),
        TAG_SET => Ok(Value::Set(read_seq(buf, total_len)?)),
        TAG_MAP => Ok(Value::Map(read_map(buf, total_len)?)),
        TAG_INSTANT => {
            let bytes = read_bytes(buf, offset)?;
            let s = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset })?;
            let instant = DateTime::parse_from_rfc3339(&s)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| DecodeError::InvalidInstant { value: s, offset })?;
            Ok(Value::Instant(instant))
        }
        TAG_DECIMAL => {
            let bytes = read_bytes(buf, offset)?;
            let s = String::from_utf8(bytes).map_err(|_| DecodeError::InvalidUtf8 { offset })?;
            let decimal = s
                .parse::<Decimal>()
                .map_err(|_| DecodeError::InvalidDecimal { value: s, offset })?;
            Ok(Value::Decimal(decimal))
        }
        TAG_UUID => {
            if buf.remaining() < 16 {
                return Err(DecodeError::UnexpectedEof { offset });
            }
            let mut raw = [0u8; 16];
            buf.copy_to_slice(&mut raw);
            Ok(Value::Uuid(Uuid::from_bytes(raw)))
        }
        TAG_EXT => {
            let ext_offset = total_len - buf.remaining();
            let ext_tag = read_u8(buf, ext_offset)?;
            if ext_tag != crate::value::EXT_TAG_REF && ext_tag != crate::value::EXT_TAG_ERR {
                return Err(DecodeError::UnknownExtensionTag {
                    tag: ext_tag,
                    offset: ext_offset,
                });
            }
            let inner = read_value(buf, total_len)?;
            Ok(Value::Ext(ext_tag, Box::new(inner)))
        }
        other => Err(DecodeError::UnknownTag { tag: other, offset }),
    }
}

fn read_u8(buf: &mut Bytes, offset: usize) -> Result<u8, DecodeError> {
    if !buf.has_remaining() {
        return Err(DecodeError::UnexpectedEof { offset });
    }
    Ok(buf.get_u8())
}

fn read_i64(buf: &mut Bytes, offset: usize) -> Result<i64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::UnexpectedEof { offset });
    }
    Ok(buf.get_i64())
}

fn read_f64(buf: &mut Bytes, offset: usize) -> Result<f64, DecodeError> {
    if buf.remaining() < 8 {
        return Err(DecodeError::UnexpectedEof { offset });
    }
    Ok(buf.get_f64())
}

fn read_bytes(buf: &mut Bytes, offset: usize) -> Result<Vec<u8>, DecodeError> {
    if buf.remaining() < 4 {
        return Err(DecodeError::UnexpectedEof { offset });
    }
    let len = buf.get_u32() as usize;
    if buf.remaining() < len {
        return Err(DecodeError::UnexpectedEof { offset });
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn read_seq(buf: &mut Bytes, total_len: usize) -> Result<Vec<Value>, DecodeError> {
    let offset = total_len - buf.remaining();
    if buf.remaining() < 4 {
        return Err(DecodeError::UnexpectedEof { offset });
    }
    let count = buf.get_u32();
    let mut items = Vec::with_capacity(count.min(1 << 16) as usize);
    for _ in 0..count {
        items.push(read_value(buf, total_len)?);
    }
    Ok(items)
}

fn read_map(buf: &mut Bytes, total_len: usize) -> Result<BTreeMap<String, Value>, DecodeError> {
    let offset = total_len - buf.remaining();
    if buf.remaining() < 4 {
        return Err(DecodeError::UnexpectedEof { offset });
    }
    let count = buf.get_u32();
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let key_offset = total_len - buf.remaining();
        let key_bytes = read_bytes(buf, key_offset)?;
        let key = String::from_utf8(key_bytes)
            .map_err(|_| DecodeError::InvalidUtf8 { offset: key_offset })?;
        let value = read_value(buf, total_len)?;
        map.insert(key, value);
    }
    Ok(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn round_trip(value: Value) {
        let encoded = encode_value(&value);
        let decoded = decode_value(&encoded).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn round_trips_every_scalar_variant() {
        round_trip(Value::Null);
        round_trip(Value::Bool(true));
        round_trip(Value::Bool(false));
        round_trip(Value::Int(-42));
        round_trip(Value::Float(3.5));
        round_trip(Value::Str("hello".into()));
        round_trip(Value::Bytes(vec![1, 2, 3]));
        round_trip(Value::Uuid(Uuid::nil()));
        round_trip(Value::Decimal("12.3456".parse().unwrap()));
        round_trip(Value::Instant(Utc::now()));
    }

    #[test]
    fn round_trips_nested_collections() {
        let mut map = BTreeMap::new();
        map.insert("a".to_string(), Value::Int(1));
        map.insert("b".to_string(), Value::Seq(vec![Value::Str("x".into())]));
        round_trip(Value::Map(map));
        round_trip(Value::Set(vec![Value::Int(1), Value::Int(2)]));
    }

    #[test]
    fn round_trips_reference_envelope() {
        let value = Value::reference("User", Value::Int(42));
        round_trip(value);
    }

    #[test]
    fn encoding_is_deterministic_regardless_of_insertion_order() {
        let mut a = BTreeMap::new();
        a.insert("z".to_string(), Value::Int(1));
        a.insert("a".to_string(), Value::Int(2));

        let mut b = BTreeMap::new();
        b.insert("a".to_string(), Value::Int(2));
        b.insert("z".to_string(), Value::Int(1));

        assert_eq!(encode_value(&Value::Map(a)), encode_value(&Value::Map(b)));
    }

    #[test]
    fn unknown_tag_is_a_decode_error() {
        let err = decode_value(&[255]).unwrap_err();
        assert!(matches!(err, DecodeError::UnknownTag { tag: 255, .. }));
    }

    #[test]
    fn unknown_extension_tag_is_a_decode_error_not_silent_loss() {
        let mut buf = BytesMut::new();
        buf.put_u8(TAG_EXT);
        buf.put_u8(99);
        buf.put_u8(TAG_NULL);
        let err = decode_value(&buf).unwrap_err();
        assert!(matches!(
            err,
            DecodeError::UnknownExtensionTag { tag: 99, .. }
        ));
    }

    #[test]
    fn truncated_input_is_unexpected_eof() {
        let err = decode_value(&[TAG_INT, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, DecodeError::UnexpectedEof { .. }));
    }
}
