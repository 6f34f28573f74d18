//! Shared substrate for the `asynctasq` distributed task queue: the wire
//! envelope and its binary codec, the driver capability trait, the
//! retry/backoff policy, the event bus, the reference-envelope resolver, and
//! the explicit task-handler registry.
//!
//! Backend-specific driver implementations live in `asynctasq-drivers`;
//! the worker runtime, executor, dispatcher and process pool manager live
//! in `asynctasq-worker`. This crate is the one every other crate in the
//! workspace depends on.

pub mod codec;
pub mod driver;
pub mod envelope;
pub mod error;
pub mod events;
pub mod registry;
pub mod resolver;
pub mod retry;
pub mod value;

pub use driver::{DeliveryHandle, Delivery, Driver, DynDriver, QueueDepth};
pub use envelope::{ReenqueueReason, RetryStrategy, TaskEnvelope};
pub use error::{ConfigError, DecodeError, DriverError, PayloadTooLarge};
pub use events::{Event, EventBus, EventSink, TaskContext, TracingSink};
pub use registry::{Outcome, TaskHandler, TaskKind, TaskRegistry};
pub use resolver::{RefLoader, ResolveError, Resolver};
pub use retry::RetryPolicy;
pub use value::Value;
