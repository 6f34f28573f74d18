//! The task envelope: the canonical serialized form of one task instance
//!.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::codec;
use crate::error::DecodeError;
use crate::value::Value;

/// Backoff shape selected for a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    Fixed,
    Exponential,
}

impl RetryStrategy {
    fn as_str(self) -> &'static str {
        match self {
            RetryStrategy::Fixed => "fixed",
            RetryStrategy::Exponential => "exponential",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "fixed" => Some(RetryStrategy::Fixed),
            "exponential" => Some(RetryStrategy::Exponential),
            _ => None,
        }
    }
}

/// Cause of the most recent re-delivery, carried for observability
///.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReenqueueReason {
    Retry,
    CrashRecovery,
    DecodeError,
}

impl ReenqueueReason {
    fn as_str(self) -> &'static str {
        match self {
            ReenqueueReason::Retry => "retry",
            ReenqueueReason::CrashRecovery => "crash_recovery",
            ReenqueueReason::DecodeError => "decode_error",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "retry" => Some(ReenqueueReason::Retry),
            "crash_recovery" => Some(ReenqueueReason::CrashRecovery),
            "decode_error" => Some(ReenqueueReason::DecodeError),
            _ => None,
        }
    }
}

/// The wire envelope carried by every driver.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskEnvelope {
    pub id: Uuid,
    pub class_path: String,
    pub args: BTreeMap<String, Value>,
    pub queue: String,
    pub max_attempts: u32,
    pub current_attempt: u32,
    pub retry_strategy: RetryStrategy,
    pub retry_delay_secs: u64,
    /// `None` represents an unbounded (infinite) timeout.
    pub timeout_secs: Option<u64>,
    pub visibility_timeout_secs: u64,
    pub correlation_id: Option<String>,
    pub dispatched_at: DateTime<Utc>,
    pub available_at: DateTime<Utc>,
    pub reenqueue_reason: Option<ReenqueueReason>,
}

impl TaskEnvelope {
    /// Builds a new envelope, as the [dispatcher](crate) does at first
    /// enqueue: `current_attempt` starts at zero and `dispatched_at` /
    /// `available_at` are pinned to the same instant unless a delay applies.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        class_path: impl Into<String>,
        args: BTreeMap<String, Value>,
        queue: impl Into<String>,
        max_attempts: u32,
        retry_strategy: RetryStrategy,
        retry_delay_secs: u64,
        timeout_secs: Option<u64>,
        visibility_timeout_secs: u64,
        correlation_id: Option<String>,
        delay_secs: u64,
    ) -> Self {
        let now = Utc::now();
        TaskEnvelope {
            id: Uuid::new_v4(),
            class_path: class_path.into(),
            args,
            queue: queue.into(),
            max_attempts,
            current_attempt: 0,
            retry_strategy,
            retry_delay_secs,
            timeout_secs,
            visibility_timeout_secs,
            correlation_id,
            dispatched_at: now,
            available_at: now + chrono::Duration::seconds(delay_secs as i64),
            reenqueue_reason: None,
        }
    }

    /// Converts the envelope to a [`Value::Map`] for encoding.
    pub fn to_value(&self) -> Value {
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), Value::Uuid(self.id));
        map.insert(
            "class_path".to_string(),
            Value::Str(self.class_path.clone()),
        );
        map.insert("args".to_string(), Value::Map(self.args.clone()));
        map.insert("queue".to_string(), Value::Str(self.queue.clone()));
        map.insert(
            "max_attempts".to_string(),
            Value::Int(self.max_attempts as i64),
        );
        map.insert(
            "current_attempt".to_string(),
            Value::Int(self.current_attempt as i64),
        );
        map.insert(
            "retry_strategy".to_string(),
            Value::Str(self.retry_strategy.as_str().to_string()),
        );
        map.insert(
            "retry_delay_secs".to_string(),
            Value::Int(self.retry_delay_secs as i64),
        );
        map.insert(
            "timeout_secs".to_string(),
            match self.timeout_secs {
                Some(t) => Value::Int(t as i64),
                None => Value::Null,
            },
        );
        map.insert(
            "visibility_timeout_secs".to_string(),
            Value::Int(self.visibility_timeout_secs as i64),
        );
        map.insert(
            "correlation_id".to_string(),
            match &self.correlation_id {
                Some(c) => Value::Str(c.clone()),
                None => Value::Null,
            },
        );
        map.insert("dispatched_at".to_string(), Value::Instant(self.dispatched_at));
        map.insert("available_at".to_string(), Value::Instant(self.available_at));
        map.insert(
            "reenqueue_reason".to_string(),
            match self.reenqueue_reason {
                Some(r) => Value::Str(r.as_str().to_string()),
                None => Value::Null,
            },
        );
        Value::Map(map)
    }

    /// Reconstructs an envelope from a decoded [`Value::Map`].
    pub fn from_value(value: &Value) -> Result<Self, DecodeError> {
        let map = value
            .as_map()
            .ok_or(DecodeError::WrongFieldType { field: "envelope" })?;

        let id = match map.get("id") {
            Some(Value::Uuid(u)) => *u,
            Some(_) => return Err(DecodeError::WrongFieldType { field: "id" }),
            None => return Err(DecodeError::MissingField { field: "id" }),
        };
        let class_path = field_str(map, "class_path")?.to_string();
        let args = match map.get("args") {
            Some(Value::Map(m)) => m.clone(),
            Some(_) => return Err(DecodeError::WrongFieldType { field: "args" }),
            None => return Err(DecodeError::MissingField { field: "args" }),
        };
        let queue = field_str(map, "queue")?.to_string();
        let max_attempts = field_int(map, "max_attempts")? as u32;
        let current_attempt = field_int(map, "current_attempt")? as u32;
        let retry_strategy_str = field_str(map, "retry_strategy")?;
        let retry_strategy = RetryStrategy::parse(retry_strategy_str).ok_or_else(|| {
            DecodeError::InvalidEnumValue {
                field: "retry_strategy",
                value: retry_strategy_str.to_string(),
            }
        })?;
        let retry_delay_secs = field_int(map, "retry_delay_secs")? as u64;
        let timeout_secs = match map.get("timeout_secs") {
            Some(Value::Int(i)) => Some(*i as u64),
            Some(Value::Null) | None => None,
            Some(_) => return Err(DecodeError::WrongFieldType { field: "timeout_secs" }),
        };
        let visibility_timeout_secs = field_int(map, "visibility_timeout_secs")? as u64;
        let correlation_id = match map.get("correlation_id") {
            Some(Value::Str(s)) => Some(s.clone()),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(DecodeError::WrongFieldType {
                    field: "correlation_id",
                })
            }
        };
        let dispatched_at = field_instant(map, "dispatched_at")?;
        let available_at = field_instant(map, "available_at")?;
        let reenqueue_reason = match map.get("reenqueue_reason") {
            Some(Value::Str(s)) => Some(ReenqueueReason::parse(s).ok_or_else(|| {
                DecodeError::InvalidEnumValue {
                    field: "reenqueue_reason",
                    value: s.clone(),
                }
            })?),
            Some(Value::Null) | None => None,
            Some(_) => {
                return Err(DecodeError::WrongFieldType {
                    field: "reenqueue_reason",
                })
            }
        };

        Ok(TaskEnvelope {
            id,
            class_path,
            args,
            queue,
            max_attempts,
            current_attempt,
            retry_strategy,
            retry_delay_secs,
            timeout_secs,
            visibility_timeout_secs,
            correlation_id,
            dispatched_at,
            available_at,
            reenqueue_reason,
        })
    }

    /// Encodes this envelope to its canonical binary wire form.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode_value(&self.to_value())
    }

    /// Decodes a previously-encoded envelope.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let value = codec::decode_value(bytes)?;
        Self::from_value(&value)
    }
}

fn field_str<'a>(
    map: &'a BTreeMap<String, Value>,
    field: &'static str,
) -> Result<&'a str, DecodeError> {
    match map.get(field) {
        Some(Value::Str(s)) => Ok(s.as_str()),
        Some(_) => Err(DecodeError::WrongFieldType { field }),
        None => Err(DecodeError::MissingField { field }),
    }
}

fn field_int(map: &BTreeMap<String, Value>, field: &'static str) -> Result<i64, DecodeError> {
    match map.get(field) {
        Some(Value::Int(i)) => Ok(*i),
        Some(_) => Err(DecodeError::WrongFieldType { field }),
        None => Err(DecodeError::MissingField { field }),
    }
}

fn field_instant(
    map: &BTreeMap<String, Value>,
    field: &'static str,
) -> Result<DateTime<Utc>, DecodeError> {
    match map.get(field) {
        Some(Value::Instant(i)) => Ok(*i),
        Some(_) => Err(DecodeError::WrongFieldType { field }),
        None => Err(DecodeError::MissingField { field }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TaskEnvelope {
        let mut args = BTreeMap::new();
        args.insert("amount".to_string(), Value::Int(100));
        args.insert(
            "account".to_string(),
            Value::reference("Account", Value::Int(7)),
        );
        TaskEnvelope::new(
            "billing.charge",
            args,
            "default",
            5,
            RetryStrategy::Exponential,
            60,
            Some(30),
            120,
            Some("corr-1".to_string()),
            0,
        )
    }

    #[test]
    fn envelope_round_trips_through_the_wire_codec() {
        let envelope = sample();
        let encoded = envelope.encode();
        let decoded = TaskEnvelope::decode(&encoded).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn invariant_current_attempt_never_exceeds_max_attempts_on_construction() {
        let envelope = sample();
        assert!(envelope.current_attempt <= envelope.max_attempts);
    }

    #[test]
    fn unbounded_timeout_round_trips_as_null() {
        let mut envelope = sample();
        envelope.timeout_secs = None;
        let decoded = TaskEnvelope::decode(&envelope.encode()).unwrap();
        assert_eq!(decoded.timeout_secs, None);
    }

    #[test]
    fn missing_required_field_is_a_decode_error() {
        let mut map = BTreeMap::new();
        map.insert("id".to_string(), Value::Uuid(Uuid::nil()));
        let err = TaskEnvelope::from_value(&Value::Map(map)).unwrap_err();
        assert!(matches!(err, DecodeError::MissingField { field: "class_path" }));
    }
}
