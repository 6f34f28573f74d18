//! End-to-end codec coverage: build an envelope with every value shape
//! nested in its args, encode it, decode it back, and check field-for-field
//! equality — the guarantee every driver implementation relies on.

use std::collections::BTreeMap;

use asynctasq_core::envelope::{RetryStrategy, TaskEnvelope};
use asynctasq_core::value::Value;
use chrono::Utc;
use rust_decimal::Decimal;
use uuid::Uuid;

fn sample_args() -> BTreeMap<String, Value> {
    let mut nested = BTreeMap::new();
    nested.insert("nested_flag".to_string(), Value::Bool(true));
    nested.insert("nested_null".to_string(), Value::Null);

    let mut args = BTreeMap::new();
    args.insert("int_arg".to_string(), Value::Int(-42));
    args.insert("float_arg".to_string(), Value::Float(3.5));
    args.insert("str_arg".to_string(), Value::Str("hello".to_string()));
    args.insert("bytes_arg".to_string(), Value::Bytes(vec![1, 2, 3, 255]));
    args.insert(
        "seq_arg".to_string(),
        Value::Seq(vec![Value::Int(1), Value::Int(2), Value::Str("three".to_string())]),
    );
    args.insert("map_arg".to_string(), Value::Map(nested));
    args.insert("decimal_arg".to_string(), Value::Decimal(Decimal::new(12345, 2)));
    args.insert("instant_arg".to_string(), Value::Instant(Utc::now()));
    args.insert("uuid_arg".to_string(), Value::Uuid(Uuid::new_v4()));
    args.insert("ref_arg".to_string(), Value::reference("User", Value::Int(7)));
    args
}

#[test]
fn envelope_with_every_value_shape_round_trips_exactly() {
    let envelope = TaskEnvelope::new(
        "billing.charge_card",
        sample_args(),
        "payments",
        5,
        RetryStrategy::Exponential,
        10,
        Some(120),
        45,
        Some("corr-123".to_string()),
        30,
    );

    let encoded = envelope.encode();
    let decoded = TaskEnvelope::decode(&encoded).expect("well-formed envelope decodes");

    assert_eq!(decoded.id, envelope.id);
    assert_eq!(decoded.class_path, envelope.class_path);
    assert_eq!(decoded.args, envelope.args);
    assert_eq!(decoded.queue, envelope.queue);
    assert_eq!(decoded.max_attempts, envelope.max_attempts);
    assert_eq!(decoded.retry_strategy, envelope.retry_strategy);
    assert_eq!(decoded.retry_delay_secs, envelope.retry_delay_secs);
    assert_eq!(decoded.timeout_secs, envelope.timeout_secs);
    assert_eq!(decoded.visibility_timeout_secs, envelope.visibility_timeout_secs);
    assert_eq!(decoded.correlation_id, envelope.correlation_id);
}

#[test]
fn truncated_envelope_bytes_produce_a_decode_error_not_a_panic() {
    let envelope = TaskEnvelope::new(
        "billing.charge_card",
        sample_args(),
        "payments",
        1,
        RetryStrategy::Fixed,
        1,
        None,
        30,
        None,
        0,
    );
    let mut encoded = envelope.encode();
    encoded.truncate(encoded.len() / 2);
    assert!(TaskEnvelope::decode(&encoded).is_err());
}
