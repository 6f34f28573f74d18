//! Full pipeline test with a fake in-memory driver: dispatch a task, run a
//! worker against it, and check it completes, retries, or dead-letters as
//! expected — no real backend needed, so this runs as a plain `cargo test`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use asynctasq_core::driver::{DeliveryHandle, Delivery, Driver, DynDriver, QueueDepth};
use asynctasq_core::envelope::{RetryStrategy, TaskEnvelope};
use asynctasq_core::error::DriverError;
use asynctasq_core::events::EventBus;
use asynctasq_core::registry::{Outcome, TaskHandler, TaskKind, TaskRegistry};
use asynctasq_core::resolver::Resolver;
use asynctasq_core::value::Value;
use asynctasq_worker::dispatcher::{DispatchOptions, Dispatcher, DispatcherDefaults};
use asynctasq_worker::executor::Executor;
use asynctasq_worker::worker::{Worker, WorkerConfig};
use tokio_util::sync::CancellationToken;

/// A trivial single-queue in-memory driver: a pending `VecDeque` and a map
/// of currently-leased items keyed by an incrementing handle id. Good
/// enough to drive the worker loop without any network dependency.
#[derive(Default)]
struct MemoryDriver {
    pending: Mutex<VecDeque<(Vec<u8>, u32)>>,
    dead: Mutex<Vec<Vec<u8>>>,
    acked: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) {}

    async fn enqueue(&self, _queue: &str, envelope_bytes: Vec<u8>, _delay: Duration) -> Result<(), DriverError> {
        self.pending.lock().unwrap().push_back((envelope_bytes, 1));
        Ok(())
    }

    async fn fetch(&self, _queues: &[String], max_batch: usize, _wait_deadline: Duration) -> Result<Vec<Delivery>, DriverError> {
        let mut pending = self.pending.lock().unwrap();
        let mut out = Vec::new();
        while out.len() < max_batch {
            let Some((bytes, attempt)) = pending.pop_front() else { break };
            out.push(Delivery {
                handle: DeliveryHandle::new("memory", (bytes.clone(), attempt)),
                envelope_bytes: bytes,
                delivery_attempt: attempt,
            });
        }
        Ok(out)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), DriverError> {
        let (bytes, _attempt) = handle.downcast_ref::<(Vec<u8>, u32)>().unwrap().clone();
        self.acked.lock().unwrap().push(bytes);
        Ok(())
    }

    async fn nack(&self, handle: &DeliveryHandle, envelope_bytes: &[u8], _requeue_after: Option<Duration>) -> Result<(), DriverError> {
        let (_, attempt) = handle.downcast_ref::<(Vec<u8>, u32)>().unwrap().clone();
        self.pending.lock().unwrap().push_back((envelope_bytes.to_vec(), attempt + 1));
        Ok(())
    }

    async fn dead_letter(&self, handle: &DeliveryHandle, _reason: &str) -> Result<(), DriverError> {
        let (bytes, _attempt) = handle.downcast_ref::<(Vec<u8>, u32)>().unwrap().clone();
        self.dead.lock().unwrap().push(bytes);
        Ok(())
    }

    async fn extend_lease(&self, handle: &DeliveryHandle, _additional: Duration) -> Result<DeliveryHandle, DriverError> {
        Ok(handle.clone())
    }

    async fn queue_depth(&self, _queue: &str) -> Result<QueueDepth, DriverError> {
        Ok(QueueDepth {
            count: self.pending.lock().unwrap().len() as u64,
            approximate: false,
        })
    }

    fn requires_lease_renewal(&self) -> bool {
        false
    }
}

struct AlwaysSucceeds {
    calls: AtomicU32,
}

#[async_trait]
impl TaskHandler for AlwaysSucceeds {
    fn kind(&self) -> TaskKind {
        TaskKind::AsyncIo
    }

    async fn execute(&self, _envelope: &TaskEnvelope) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Outcome::Ok(b"done".to_vec())
    }
}

struct AlwaysFails;

#[async_trait]
impl TaskHandler for AlwaysFails {
    fn kind(&self) -> TaskKind {
        TaskKind::AsyncIo
    }

    async fn execute(&self, _envelope: &TaskEnvelope) -> Outcome {
        Outcome::Err {
            message: "boom".to_string(),
            retryable: false,
        }
    }
}

fn build_worker(registry: TaskRegistry, driver: DynDriver) -> Worker {
    let executor = Arc::new(Executor::new(Arc::new(registry), Arc::new(Resolver::new()), None));
    let events = Arc::new(EventBus::new());
    let config = WorkerConfig {
        queues: vec!["default".to_string()],
        concurrency: 4,
        shutdown_grace: Duration::from_secs(1),
        lease_renewal_interval: None,
        poll_wait: Duration::from_millis(50),
    };
    Worker::new(driver, executor, events, config)
}

#[tokio::test]
async fn dispatched_task_completes_and_gets_acked() {
    let memory = Arc::new(MemoryDriver::default());
    let driver: DynDriver = memory.clone();

    let dispatcher = Dispatcher::new(driver.clone(), Arc::new(EventBus::new()), DispatcherDefaults::default());
    let mut args = BTreeMap::new();
    args.insert("n".to_string(), Value::Int(1));
    dispatcher
        .dispatch("tests.always_succeeds", args, DispatchOptions::default())
        .await
        .expect("dispatch");

    let mut registry = TaskRegistry::new();
    let handler = Arc::new(AlwaysSucceeds { calls: AtomicU32::new(0) });
    registry.register("tests.always_succeeds", handler.clone());

    let worker = build_worker(registry, driver);
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_clone.cancel();
    });
    worker.run(shutdown).await;

    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    assert_eq!(memory.acked.lock().unwrap().len(), 1);
    assert!(memory.dead.lock().unwrap().is_empty());
}

#[tokio::test]
async fn non_retryable_failure_is_dead_lettered_without_retry() {
    let memory = Arc::new(MemoryDriver::default());
    let driver: DynDriver = memory.clone();

    let dispatcher = Dispatcher::new(driver.clone(), Arc::new(EventBus::new()), DispatcherDefaults::default());
    dispatcher
        .dispatch(
            "tests.always_fails",
            BTreeMap::new(),
            DispatchOptions::default().max_attempts(3).retry_strategy(RetryStrategy::Fixed),
        )
        .await
        .expect("dispatch");

    let mut registry = TaskRegistry::new();
    registry.register("tests.always_fails", Arc::new(AlwaysFails));

    let worker = build_worker(registry, driver);
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_clone.cancel();
    });
    worker.run(shutdown).await;

    assert_eq!(memory.dead.lock().unwrap().len(), 1);
    assert!(memory.acked.lock().unwrap().is_empty());
}

#[tokio::test]
async fn unknown_class_path_is_dead_lettered_not_retried() {
    let memory = Arc::new(MemoryDriver::default());
    let driver: DynDriver = memory.clone();

    let dispatcher = Dispatcher::new(driver.clone(), Arc::new(EventBus::new()), DispatcherDefaults::default());
    dispatcher
        .dispatch("tests.does_not_exist", BTreeMap::new(), DispatchOptions::default())
        .await
        .expect("dispatch");

    let worker = build_worker(TaskRegistry::new(), driver);
    let shutdown = CancellationToken::new();
    let shutdown_clone = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        shutdown_clone.cancel();
    });
    worker.run(shutdown).await;

    assert_eq!(memory.dead.lock().unwrap().len(), 1);
}
