//! Producer-side API: build an envelope, encode it, enforce the size limit,
//! emit the `enqueued` event, and hand it to a driver.

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use asynctasq_core::driver::DynDriver;
use asynctasq_core::envelope::{RetryStrategy, TaskEnvelope};
use asynctasq_core::error::{DriverError, PayloadTooLarge};
use asynctasq_core::events::{Event, EventBus, TaskContext};
use asynctasq_core::value::Value;
use uuid::Uuid;

/// Per-call overrides, applied method-chain style before a task is built
///.
#[derive(Debug, Clone, Default)]
pub struct DispatchOptions {
    pub queue: Option<String>,
    pub delay: Duration,
    pub max_attempts: Option<u32>,
    pub retry_strategy: Option<RetryStrategy>,
    pub retry_delay_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    pub visibility_timeout_secs: Option<u64>,
    pub correlation_id: Option<String>,
    /// Pins this dispatch to a driver other than the process-wide default.
    pub driver: Option<DynDriver>,
}

impl DispatchOptions {
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.retry_strategy = Some(strategy);
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_secs = Some(delay.as_secs());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout_secs = Some(timeout.as_secs());
        self
    }

    pub fn correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn driver(mut self, driver: DynDriver) -> Self {
        self.driver = Some(driver);
        self
    }
}

/// Default envelope parameters a [`Dispatcher`] applies when an option is
/// left unset.
#[derive(Debug, Clone)]
pub struct DispatcherDefaults {
    pub queue: String,
    pub max_attempts: u32,
    pub retry_strategy: RetryStrategy,
    pub retry_delay_secs: u64,
    pub timeout_secs: Option<u64>,
    pub visibility_timeout_secs: u64,
    pub max_envelope_bytes: usize,
}

impl Default for DispatcherDefaults {
    fn default() -> Self {
        DispatcherDefaults {
            queue: "default".to_string(),
            max_attempts: 3,
            retry_strategy: RetryStrategy::Exponential,
            retry_delay_secs: 5,
            timeout_secs: None,
            visibility_timeout_secs: 30,
            max_envelope_bytes: 1024 * 1024,
        }
    }
}

pub struct Dispatcher {
    driver: DynDriver,
    events: Arc<EventBus>,
    defaults: DispatcherDefaults,
}

impl Dispatcher {
    pub fn new(driver: DynDriver, events: Arc<EventBus>, defaults: DispatcherDefaults) -> Self {
        Dispatcher {
            driver,
            events,
            defaults,
        }
    }

    /// Builds, encodes, and enqueues one task.
    pub async fn dispatch(
        &self,
        class_path: impl Into<String>,
        args: BTreeMap<String, Value>,
        options: DispatchOptions,
    ) -> Result<Uuid, DriverError> {
        let driver = options.driver.clone().unwrap_or_else(|| self.driver.clone());
        let queue = options.queue.clone().unwrap_or_else(|| self.defaults.queue.clone());

        let envelope = TaskEnvelope::new(
            class_path,
            args,
            queue.clone(),
            options.max_attempts.unwrap_or(self.defaults.max_attempts),
            options.retry_strategy.unwrap_or(self.defaults.retry_strategy),
            options.retry_delay_secs.unwrap_or(self.defaults.retry_delay_secs),
            options.timeout_secs.or(self.defaults.timeout_secs),
            options.visibility_timeout_secs.unwrap_or(self.defaults.visibility_timeout_secs),
            options.correlation_id.clone(),
            options.delay.as_secs(),
        );

        let encoded = envelope.encode();
        if encoded.len() > self.defaults.max_envelope_bytes {
            return Err(DriverError::Other(anyhow::Error::from(PayloadTooLarge {
                actual: encoded.len(),
                limit: self.defaults.max_envelope_bytes,
            })));
        }

        self.events.emit(Event::Enqueued(TaskContext {
            task_id: envelope.id,
            class_path: envelope.class_path.clone(),
            queue: queue.clone(),
            current_attempt: 1,
            max_attempts: envelope.max_attempts,
            correlation_id: envelope.correlation_id.clone(),
        }));

        driver.enqueue(&queue, encoded, options.delay).await?;
        Ok(envelope.id)
    }
}

static DEFAULT_DISPATCHER: OnceLock<Arc<Dispatcher>> = OnceLock::new();

/// Installs the process-wide default dispatcher. Must be called exactly
/// once, before the first call to [`dispatch`]; later callers of `dispatch`
/// use whatever was installed here, overridden per-call by
/// `DispatchOptions::driver`.
pub fn install_default(dispatcher: Dispatcher) {
    DEFAULT_DISPATCHER
        .set(Arc::new(dispatcher))
        .unwrap_or_else(|_| panic!("default dispatcher already installed"));
}

/// Dispatches against the process-wide default dispatcher.
///
/// # Panics
/// Panics if [`install_default`] has not been called yet.
pub async fn dispatch(
    class_path: impl Into<String>,
    args: BTreeMap<String, Value>,
    options: DispatchOptions,
) -> Result<Uuid, DriverError> {
    let dispatcher = DEFAULT_DISPATCHER
        .get()
        .expect("default dispatcher not installed; call dispatcher::install_default first")
        .clone();
    dispatcher.dispatch(class_path, args, options).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use asynctasq_core::driver::{Delivery, DeliveryHandle, QueueDepth};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingDriver {
        enqueued: Mutex<Vec<(String, Vec<u8>, Duration)>>,
    }

    #[async_trait]
    impl asynctasq_core::driver::Driver for RecordingDriver {
        async fn connect(&self) -> Result<(), DriverError> {
            Ok(())
        }
        async fn close(&self) {}
        async fn enqueue(&self, queue: &str, envelope_bytes: Vec<u8>, delay: Duration) -> Result<(), DriverError> {
            self.enqueued.lock().unwrap().push((queue.to_string(), envelope_bytes, delay));
            Ok(())
        }
        async fn fetch(&self, _queues: &[String], _max_batch: usize, _wait_deadline: Duration) -> Result<Vec<Delivery>, DriverError> {
            Ok(Vec::new())
        }
        async fn ack(&self, _handle: &DeliveryHandle) -> Result<(), DriverError> {
            Ok(())
        }
        async fn nack(&self, _handle: &DeliveryHandle, _envelope_bytes: &[u8], _requeue_after: Option<Duration>) -> Result<(), DriverError> {
            Ok(())
        }
        async fn dead_letter(&self, _handle: &DeliveryHandle, _reason: &str) -> Result<(), DriverError> {
            Ok(())
        }
        async fn extend_lease(&self, handle: &DeliveryHandle, _additional: Duration) -> Result<DeliveryHandle, DriverError> {
            Ok(handle.clone())
        }
        async fn queue_depth(&self, _queue: &str) -> Result<QueueDepth, DriverError> {
            Ok(QueueDepth { count: 0, approximate: false })
        }
    }

    struct CountingSink(Arc<AtomicUsize>);
    impl asynctasq_core::events::EventSink for CountingSink {
        fn handle(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn dispatch_encodes_and_enqueues_with_defaults() {
        let driver: DynDriver = Arc::new(RecordingDriver::default());
        let mut events = EventBus::new();
        let emitted = Arc::new(AtomicUsize::new(0));
        events.register(Arc::new(CountingSink(emitted.clone())));
        let dispatcher = Dispatcher::new(driver.clone(), Arc::new(events), DispatcherDefaults::default());

        let id = dispatcher
            .dispatch("demo.task", BTreeMap::new(), DispatchOptions::default())
            .await
            .unwrap();

        assert_ne!(id, Uuid::nil());
        assert_eq!(emitted.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_envelope_is_rejected_before_enqueue() {
        let driver: DynDriver = Arc::new(RecordingDriver::default());
        let events = Arc::new(EventBus::new());
        let mut defaults = DispatcherDefaults::default();
        defaults.max_envelope_bytes = 10;
        let dispatcher = Dispatcher::new(driver, events, defaults);

        let mut args = BTreeMap::new();
        args.insert("payload".to_string(), Value::Str("x".repeat(1000)));
        let err = dispatcher
            .dispatch("demo.task", args, DispatchOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, DriverError::Other(_)));
    }
}
