//! Per-backend [`asynctasq_core::Driver`] implementations plus a Redis Pub/Sub [`asynctasq_core::EventSink`].
//!
//! Each backend lives behind its own Cargo feature so a deployment only
//! links the driver(s) it actually uses.

#[cfg(feature = "redis-driver")]
pub mod redis_driver;
#[cfg(feature = "redis-driver")]
pub mod pubsub_sink;

#[cfg(any(feature = "sql-postgres", feature = "sql-mysql"))]
pub mod sql;

#[cfg(feature = "sqs-driver")]
pub mod sqs_driver;

#[cfg(feature = "amqp-driver")]
pub mod amqp_driver;

#[cfg(feature = "redis-driver")]
pub use redis_driver::RedisDriver;
#[cfg(feature = "redis-driver")]
pub use pubsub_sink::RedisPubSubSink;

#[cfg(feature = "sql-postgres")]
pub use sql::SqlPostgresDriver;
#[cfg(feature = "sql-mysql")]
pub use sql::SqlMysqlDriver;

#[cfg(feature = "sqs-driver")]
pub use sqs_driver::SqsDriver;

#[cfg(feature = "amqp-driver")]
pub use amqp_driver::AmqpDriver;
