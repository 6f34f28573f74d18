//! The error taxonomy shared across every crate in this workspace
//!. Library code returns these typed errors; only the binary
//! entry points in `asynctasq-worker` collapse them into `anyhow::Error`.

use thiserror::Error;

/// Failure to decode a wire envelope or a nested [`crate::value::Value`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input while decoding at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("unknown value tag {tag} at offset {offset}")]
    UnknownTag { tag: u8, offset: usize },

    #[error("unknown extension tag {tag} at offset {offset}")]
    UnknownExtensionTag { tag: u8, offset: usize },

    #[error("invalid utf-8 string at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("invalid decimal literal {value:?} at offset {offset}")]
    InvalidDecimal { value: String, offset: usize },

    #[error("invalid instant literal {value:?} at offset {offset}")]
    InvalidInstant { value: String, offset: usize },

    #[error("invalid uuid bytes at offset {offset}")]
    InvalidUuid { offset: usize },

    #[error("envelope is missing required field {field}")]
    MissingField { field: &'static str },

    #[error("envelope field {field} has the wrong shape")]
    WrongFieldType { field: &'static str },

    #[error("unrecognized value for field {field}: {value}")]
    InvalidEnumValue { field: &'static str, value: String },
}

/// Dispatch-time validation failure: the encoded envelope exceeds the
/// configured maximum size.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("encoded envelope is {actual} bytes, exceeding the {limit} byte cap")]
pub struct PayloadTooLarge {
    pub actual: usize,
    pub limit: usize,
}

/// Errors a [`crate::driver::Driver`] implementation may return.
///
/// These map directly onto the "Failure kinds" column of /// operation table.
#[derive(Debug, Error)]
pub enum DriverError {
    /// Transient backend unavailability; callers should retry with backoff.
    #[error("backend connection failed: {0}")]
    ConnectFail(#[source] anyhow::Error),

    /// The backend rejected the enqueue because it is at capacity
    /// (implementation-defined; e.g. a bounded AMQP queue).
    #[error("queue is full")]
    QueueFull,

    /// `ack`/`nack`/`extend_lease` was called on a handle whose lease has
    /// already expired or been revoked by another worker.
    #[error("lease for this delivery has already expired or been revoked")]
    LeaseLost,

    /// The backend cannot fulfill the requested operation at all (e.g. an
    /// SQS delay greater than 900 seconds, or an explicit `dead_letter` call
    /// against a queue with no redrive policy configured).
    #[error("operation unsupported by this backend: {0}")]
    UnsupportedOp(&'static str),

    /// A fetched envelope could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// Any other backend-specific failure not covered above.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Top-level configuration error, fatal at startup.
#[derive(Debug, Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(pub String);
