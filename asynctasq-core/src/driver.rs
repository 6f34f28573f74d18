//! The uniform driver capability surface consumed by the worker runtime and
//! the dispatcher.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DriverError;

/// An opaque token redeemable by `ack`/`nack`/`extend_lease` for exactly the
/// delivery that produced it.
///
/// Each driver stashes whatever it needs inside the `Any` payload (raw
/// envelope bytes for Redis, a `(Uuid, DateTime<Utc>)` pair for SQL, a
/// receipt handle string for SQS, a delivery tag for AMQP) without leaking
/// those shapes into the [`Driver`] trait itself.
#[derive(Clone)]
pub struct DeliveryHandle {
    inner: Arc<dyn Any + Send + Sync>,
    /// Human-readable discriminant, used only for logging.
    pub kind: &'static str,
}

impl DeliveryHandle {
    pub fn new<T: Any + Send + Sync>(kind: &'static str, inner: T) -> Self {
        DeliveryHandle {
            inner: Arc::new(inner),
            kind,
        }
    }

    pub fn downcast_ref<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryHandle").field("kind", &self.kind).finish()
    }
}

/// One delivered item: its handle, the still-encoded envelope bytes, and the
/// delivery attempt counter the backend has observed so far.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub handle: DeliveryHandle,
    pub envelope_bytes: Vec<u8>,
    pub delivery_attempt: u32,
}

/// Best-effort queue depth; backends that cannot count cheaply set
/// `approximate = true` rather than lying about precision.
#[derive(Debug, Clone, Copy)]
pub struct QueueDepth {
    pub count: u64,
    pub approximate: bool,
}

/// The capability surface every backend implements.
///
/// `fetch` scans `queues` in priority order — higher-priority queues are
/// polled before lower ones — and returns promptly (possibly with zero
/// items) once `wait_deadline` elapses, so the worker's cooperative
/// scheduler can observe a shutdown signal between polls.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn connect(&self) -> Result<(), DriverError>;

    /// Best-effort: implementations log and swallow close failures rather
    /// than propagate them, since shutdown must proceed regardless.
    async fn close(&self);

    async fn enqueue(
        &self,
        queue: &str,
        envelope_bytes: Vec<u8>,
        delay: std::time::Duration,
    ) -> Result<(), DriverError>;

    async fn fetch(
        &self,
        queues: &[String],
        max_batch: usize,
        wait_deadline: std::time::Duration,
    ) -> Result<Vec<Delivery>, DriverError>;

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), DriverError>;

    /// Re-queues a failed delivery. `envelope_bytes` is the (possibly
    /// re-encoded, attempt-incremented) envelope to put back; backends that
    /// track the attempt count server-side (SQL) may ignore it, but
    /// backends that store the envelope verbatim (Redis, AMQP) must persist
    /// it so the next fetch observes the bumped `current_attempt`.
    async fn nack(
        &self,
        handle: &DeliveryHandle,
        envelope_bytes: &[u8],
        requeue_after: Option<std::time::Duration>,
    ) -> Result<(), DriverError>;

    async fn dead_letter(&self, handle: &DeliveryHandle, reason: &str) -> Result<(), DriverError>;

    /// Extends the visibility window for `handle` and returns the handle to
    /// use for subsequent `ack`/`nack`/`extend_lease` calls. Some backends
    /// (Redis, AMQP) encode the lease deadline inside the handle itself, so
    /// extending it produces a new handle value; callers must replace their
    /// copy with the one returned here.
    async fn extend_lease(
        &self,
        handle: &DeliveryHandle,
        additional: std::time::Duration,
    ) -> Result<DeliveryHandle, DriverError>;

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, DriverError>;

    /// Whether this driver needs the worker to run a periodic lease-renewal
    /// loop (SQL and SQS) as opposed to relying on a
    /// natively push-based visibility mechanism.
    fn requires_lease_renewal(&self) -> bool {
        false
    }
}

/// Type-erased handle to any `Driver` implementation, the shape the worker
/// runtime and dispatcher actually hold.
pub type DynDriver = Arc<dyn Driver>;
