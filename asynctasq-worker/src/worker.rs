//! Multi-queue polling loop: fetches deliveries up to a concurrency cap,
//! runs each through the [`Executor`], and resolves it to `ack`/`nack`/
//! `dead_letter` against the driver.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use asynctasq_core::driver::{Delivery, DynDriver};
use asynctasq_core::envelope::TaskEnvelope;
use asynctasq_core::events::{Event, EventBus, TaskContext};
use asynctasq_core::registry::Outcome;
use asynctasq_core::retry::{RetryPolicy, DECODE_ERROR_RETRY_DELAY, DECODE_ERROR_RETRY_LIMIT};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::executor::Executor;

/// Construction parameters for a [`Worker`].
pub struct WorkerConfig {
    pub queues: Vec<String>,
    pub concurrency: usize,
    pub shutdown_grace: Duration,
    /// `Some` only for drivers whose `requires_lease_renewal()` is true.
    pub lease_renewal_interval: Option<Duration>,
    pub poll_wait: Duration,
}

pub struct Worker {
    driver: DynDriver,
    executor: Arc<Executor>,
    events: Arc<EventBus>,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(driver: DynDriver, executor: Arc<Executor>, events: Arc<EventBus>, config: WorkerConfig) -> Self {
        Worker {
            driver,
            executor,
            events,
            config,
        }
    }

    /// Runs the fetch loop until `shutdown` is cancelled, then drains
    /// in-flight units up to `shutdown_grace` before returning.
    pub async fn run(&self, shutdown: CancellationToken) {
        let in_flight = Arc::new(Semaphore::new(self.config.concurrency));
        let active = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let available = in_flight.available_permits();
            if available == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(50)) => continue,
                    _ = shutdown.cancelled() => break,
                }
            }

            let fetch = self.driver.fetch(&self.config.queues, available, self.config.poll_wait);
            let deliveries = tokio::select! {
                result = fetch => match result {
                    Ok(deliveries) => deliveries,
                    Err(err) => {
                        warn!(error = %err, "fetch failed, backing off");
                        tokio::select! {
                            _ = tokio::time::sleep(Duration::from_secs(1)) => continue,
                            _ = shutdown.cancelled() => break,
                        }
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            for delivery in deliveries {
                let permit = match in_flight.clone().try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                active.fetch_add(1, Ordering::SeqCst);

                let driver = self.driver.clone();
                let executor = self.executor.clone();
                let events = self.events.clone();
                let lease_renewal_interval = self.config.lease_renewal_interval;
                let active = active.clone();

                let handle = tokio::spawn(async move {
                    run_in_flight_unit(driver, executor, events, delivery, lease_renewal_interval).await;
                    drop(permit);
                    active.fetch_sub(1, Ordering::SeqCst);
                });
                handles.push(handle);
            }

            handles.retain(|h| !h.is_finished());
        }

        info!(
            in_flight = active.load(Ordering::SeqCst),
            "stopped fetching, draining in-flight units"
        );
        let drain = futures::future::join_all(handles);
        match tokio::time::timeout(self.config.shutdown_grace, drain).await {
            Ok(_) => info!("all in-flight units drained before shutdown grace elapsed"),
            Err(_) => warn!(
                remaining = active.load(Ordering::SeqCst),
                "shutdown grace elapsed with units still in flight; they will be redelivered after their lease expires"
            ),
        }

        self.driver.close().await;
    }
}

async fn run_in_flight_unit(
    driver: DynDriver,
    executor: Arc<Executor>,
    events: Arc<EventBus>,
    delivery: Delivery,
    lease_renewal_interval: Option<Duration>,
) {
    let envelope = match TaskEnvelope::decode(&delivery.envelope_bytes) {
        Ok(envelope) => envelope,
        Err(err) => {
            handle_decode_failure(&driver, &delivery, &err.to_string()).await;
            return;
        }
    };

    let ctx = TaskContext {
        task_id: envelope.id,
        class_path: envelope.class_path.clone(),
        queue: envelope.queue.clone(),
        current_attempt: delivery.delivery_attempt,
        max_attempts: envelope.max_attempts,
        correlation_id: envelope.correlation_id.clone(),
    };
    events.emit(Event::Started(ctx.clone()));

    let renewal_token = CancellationToken::new();
    let renewal_task = lease_renewal_interval.map(|interval| {
        let driver = driver.clone();
        let handle = delivery.handle.clone();
        let token = renewal_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(interval) => {
                        if let Err(err) = driver.extend_lease(&handle, interval.saturating_mul(3)).await {
                            warn!(error = %err, "lease renewal failed; task may be redelivered");
                        }
                    }
                    _ = token.cancelled() => return,
                }
            }
        })
    });

    let started = tokio::time::Instant::now();
    let outcome = executor.run(&envelope).await;
    renewal_token.cancel();
    if let Some(task) = renewal_task {
        let _ = task.await;
    }

    match outcome {
        Outcome::Ok(_) => {
            events.emit(Event::Completed(ctx, started.elapsed()));
            if let Err(err) = driver.ack(&delivery.handle).await {
                warn!(error = %err, "ack failed after successful execution");
            }
        }
        failure => resolve_failure(driver, executor, events, ctx, &envelope, &delivery, failure).await,
    }
}

async fn resolve_failure(
    driver: DynDriver,
    executor: Arc<Executor>,
    events: Arc<EventBus>,
    ctx: TaskContext,
    envelope: &TaskEnvelope,
    delivery: &Delivery,
    outcome: Outcome,
) {
    let (message, retryable) = match outcome {
        Outcome::Err { message, retryable } => (message, retryable),
        Outcome::TimedOut => ("task timed out".to_string(), true),
        Outcome::Ok(_) => unreachable!("Ok is handled by the caller"),
    };

    let policy = RetryPolicy::new(envelope.retry_strategy, Duration::from_secs(envelope.retry_delay_secs));
    let should_retry = policy.should_retry(ctx.current_attempt, envelope.max_attempts, retryable);

    if should_retry {
        let delay = policy.next_delay(ctx.current_attempt);
        events.emit(Event::Retrying(ctx, delay, message));
        // Bump and re-encode the attempt counter before requeuing: backends
        // that store the envelope verbatim (Redis, AMQP) have no other way
        // to observe that this was attempt N rather than attempt 1 again.
        let mut retried = envelope.clone();
        retried.current_attempt = retried.current_attempt.saturating_add(1);
        let reencoded = retried.encode();
        if let Err(err) = driver.nack(&delivery.handle, &reencoded, Some(delay)).await {
            warn!(error = %err, "nack failed; task may instead be redelivered by visibility timeout");
        }
    } else {
        events.emit(Event::Failed(ctx, message.clone(), true));
        executor.run_failed_hook(envelope, &message).await;
        if let Err(err) = driver.dead_letter(&delivery.handle, &message).await {
            warn!(error = %err, "dead_letter failed; task may instead be redelivered by visibility timeout");
        }
    }
}

async fn handle_decode_failure(driver: &DynDriver, delivery: &Delivery, message: &str) {
    warn!(error = %message, "failed to decode envelope");
    if delivery.delivery_attempt >= DECODE_ERROR_RETRY_LIMIT {
        if let Err(err) = driver.dead_letter(&delivery.handle, message).await {
            warn!(error = %err, "dead_letter failed for an undecodable envelope");
        }
        return;
    }
    // The envelope can't be decoded, so there is nothing to bump or
    // re-encode; requeue the bytes exactly as received.
    if let Err(err) = driver
        .nack(&delivery.handle, &delivery.envelope_bytes, Some(DECODE_ERROR_RETRY_DELAY))
        .await
    {
        warn!(error = %err, "nack failed for an undecodable envelope");
    }
}
