//! Redis list + sorted-set driver.
//!
//! Three keys per queue `Q`:
//! - `Q` — FIFO list of pending envelopes.
//! - `Q:processing` — list of items currently held by a worker, each
//!   wrapped with an 8-byte big-endian `locked_until` (epoch-ms) header,
//!   since Redis has no native visibility-timeout mechanism of its own.
//! - `Q:delayed` — sorted set, score = earliest-visibility epoch-ms.
//! - `Q:dead` — list of dead-lettered entries (`reason\0envelope`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use asynctasq_core::driver::{DeliveryHandle, Delivery, Driver, QueueDepth};
use asynctasq_core::envelope::TaskEnvelope;
use asynctasq_core::error::DriverError;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::debug;

/// Sweep cadence for delayed-item promotion and stale in-flight reclaim.
const SWEEP_INTERVAL: Duration = Duration::from_millis(250);

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

fn wrap(locked_until_ms: i64, envelope: &[u8]) -> Vec<u8> {
    let mut wrapped = Vec::with_capacity(8 + envelope.len());
    wrapped.extend_from_slice(&locked_until_ms.to_be_bytes());
    wrapped.extend_from_slice(envelope);
    wrapped
}

fn unwrap(wrapped: &[u8]) -> Option<(i64, &[u8])> {
    if wrapped.len() < 8 {
        return None;
    }
    let mut header = [0u8; 8];
    header.copy_from_slice(&wrapped[..8]);
    Some((i64::from_be_bytes(header), &wrapped[8..]))
}

struct Keys {
    pending: String,
    processing: String,
    delayed: String,
    dead: String,
}

impl Keys {
    fn for_queue(queue: &str) -> Self {
        Keys {
            pending: queue.to_string(),
            processing: format!("{queue}:processing"),
            delayed: format!("{queue}:delayed"),
            dead: format!("{queue}:dead"),
        }
    }
}

/// The handle payload this driver stashes inside [`DeliveryHandle`]: the
/// queue name (needed to rebuild key names on ack/nack/extend) and the
/// wrapped, lease-stamped envelope bytes currently sitting in
/// `Q:processing`.
type RedisHandle = (String, Vec<u8>);

pub struct RedisDriver {
    conn: Mutex<ConnectionManager>,
    visibility_timeout: Duration,
    sweep_started: AtomicBool,
    sweep_handle: Mutex<Option<JoinHandle<()>>>,
}

impl RedisDriver {
    pub async fn connect_url(url: &str, visibility_timeout: Duration) -> Result<Self, DriverError> {
        let client = redis::Client::open(url).map_err(|e| DriverError::ConnectFail(e.into()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| DriverError::ConnectFail(e.into()))?;
        Ok(RedisDriver {
            conn: Mutex::new(conn),
            visibility_timeout,
            sweep_started: AtomicBool::new(false),
            sweep_handle: Mutex::new(None),
        })
    }

    /// Promotes due delayed items and reclaims in-flight items whose lease
    /// has gone stale, i.e. the worker holding it is presumed dead.
    async fn sweep_once(conn: &mut ConnectionManager, keys: &Keys, visibility_timeout: Duration) {
        let now = now_ms();

        let due: Vec<Vec<u8>> = conn
            .zrangebyscore(&keys.delayed, 0, now)
            .await
            .unwrap_or_default();
        for envelope in due {
            let _: Result<(), _> = conn.zrem(&keys.delayed, &envelope).await;
            let _: Result<(), _> = conn.lpush(&keys.pending, &envelope).await;
        }

        let in_flight: Vec<Vec<u8>> = conn
            .lrange(&keys.processing, 0, -1)
            .await
            .unwrap_or_default();
        for wrapped in in_flight {
            let Some((locked_until, envelope)) = unwrap(&wrapped) else {
                continue;
            };
            if now > locked_until + visibility_timeout.as_millis() as i64 {
                let removed: i64 = conn.lrem(&keys.processing, 1, &wrapped).await.unwrap_or(0);
                if removed > 0 {
                    let _: Result<(), _> = conn.lpush(&keys.pending, envelope).await;
                    debug!(queue = %keys.pending, "swept stale in-flight item back to pending");
                }
            }
        }
    }

    /// Spawns the sweep loop at most once per driver instance. The sweeper
    /// only needs a cloned `ConnectionManager` handle (cheap: it's a
    /// multiplexed connection wrapper), not a reference back to the driver,
    /// so this can run from a plain `&self` method.
    async fn ensure_sweeper(&self, queues: &[String]) {
        if self.sweep_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let conn = self.conn.lock().await.clone();
        let visibility_timeout = self.visibility_timeout;
        let keys: Vec<Keys> = queues.iter().map(|q| Keys::for_queue(q)).collect();
        let handle = tokio::spawn(async move {
            let mut conn = conn;
            loop {
                tokio::time::sleep(SWEEP_INTERVAL).await;
                for k in &keys {
                    Self::sweep_once(&mut conn, k, visibility_timeout).await;
                }
            }
        });
        *self.sweep_handle.lock().await = Some(handle);
    }
}

#[async_trait]
impl Driver for RedisDriver {
    async fn connect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) {
        if let Some(handle) = self.sweep_handle.lock().await.take() {
            handle.abort();
        }
    }

    async fn enqueue(
        &self,
        queue: &str,
        envelope_bytes: Vec<u8>,
        delay: Duration,
    ) -> Result<(), DriverError> {
        let keys = Keys::for_queue(queue);
        let mut conn = self.conn.lock().await;
        if delay.is_zero() {
            conn.lpush::<_, _, ()>(&keys.pending, envelope_bytes)
                .await
                .map_err(|e| DriverError::Other(e.into()))?;
        } else {
            let score = now_ms() + delay.as_millis() as i64;
            conn.zadd::<_, _, _, ()>(&keys.delayed, envelope_bytes, score)
                .await
                .map_err(|e| DriverError::Other(e.into()))?;
        }
        Ok(())
    }

    async fn fetch(
        &self,
        queues: &[String],
        max_batch: usize,
        wait_deadline: Duration,
    ) -> Result<Vec<Delivery>, DriverError> {
        self.ensure_sweeper(queues).await;
        let deadline = tokio::time::Instant::now() + wait_deadline;
        let mut out = Vec::new();

        loop {
            for queue in queues {
                if out.len() >= max_batch {
                    return Ok(out);
                }
                let keys = Keys::for_queue(queue);
                let moved: Option<Vec<u8>> = {
                    let mut conn = self.conn.lock().await;
                    conn.lmove(
                        &keys.pending,
                        &keys.processing,
                        redis::Direction::Right,
                        redis::Direction::Left,
                    )
                    .await
                    .unwrap_or(None)
                };

                if let Some(envelope) = moved {
                    let locked_until = now_ms() + self.visibility_timeout.as_millis() as i64;
                    let wrapped = wrap(locked_until, &envelope);

                    let mut conn = self.conn.lock().await;
                    // Replace the unwrapped copy LMOVE just placed with the
                    // wrapped, lease-stamped form.
                    let _: Result<i64, _> = conn.lrem(&keys.processing, 1, &envelope).await;
                    let _: Result<(), _> = conn.lpush(&keys.processing, &wrapped).await;
                    drop(conn);

                    // `current_attempt` is bumped and re-encoded by `nack`
                    // on every failed delivery, so it doubles as the
                    // redelivery counter here: this is the (current_attempt
                    // + 1)-th attempt, matching the SQL drivers' counting.
                    let delivery_attempt = TaskEnvelope::decode(&envelope)
                        .map(|e| e.current_attempt.saturating_add(1))
                        .unwrap_or(1);

                    out.push(Delivery {
                        handle: DeliveryHandle::new(
                            "redis",
                            (queue.clone(), wrapped) as RedisHandle,
                        ),
                        envelope_bytes: envelope,
                        delivery_attempt,
                    });
                }
            }

            if !out.is_empty() || tokio::time::Instant::now() >= deadline {
                return Ok(out);
            }
            let remaining = deadline - tokio::time::Instant::now();
            let jitter = Duration::from_millis(10 + rand::random::<u64>() % 40);
            tokio::time::sleep(jitter.min(remaining)).await;
        }
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), DriverError> {
        let (queue, wrapped) = handle.downcast_ref::<RedisHandle>().ok_or(DriverError::LeaseLost)?;
        let keys = Keys::for_queue(queue);
        let mut conn = self.conn.lock().await;
        let removed: i64 = conn
            .lrem(&keys.processing, 1, wrapped)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        if removed == 0 {
            return Err(DriverError::LeaseLost);
        }
        Ok(())
    }

    async fn nack(
        &self,
        handle: &DeliveryHandle,
        envelope_bytes: &[u8],
        requeue_after: Option<Duration>,
    ) -> Result<(), DriverError> {
        let (queue, wrapped) = handle.downcast_ref::<RedisHandle>().ok_or(DriverError::LeaseLost)?;
        let keys = Keys::for_queue(queue);
        let mut conn = self.conn.lock().await;
        let removed: i64 = conn
            .lrem(&keys.processing, 1, wrapped)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        if removed == 0 {
            return Err(DriverError::LeaseLost);
        }
        match requeue_after {
            None | Some(Duration::ZERO) => {
                conn.lpush::<_, _, ()>(&keys.pending, envelope_bytes)
                    .await
                    .map_err(|e| DriverError::Other(e.into()))?;
            }
            Some(delay) => {
                let score = now_ms() + delay.as_millis() as i64;
                conn.zadd::<_, _, _, ()>(&keys.delayed, envelope_bytes, score)
                    .await
                    .map_err(|e| DriverError::Other(e.into()))?;
            }
        }
        Ok(())
    }

    async fn dead_letter(&self, handle: &DeliveryHandle, reason: &str) -> Result<(), DriverError> {
        let (queue, wrapped) = handle.downcast_ref::<RedisHandle>().ok_or(DriverError::LeaseLost)?;
        let keys = Keys::for_queue(queue);
        let Some((_, envelope)) = unwrap(wrapped) else {
            return Err(DriverError::LeaseLost);
        };
        let mut conn = self.conn.lock().await;
        let removed: i64 = conn
            .lrem(&keys.processing, 1, wrapped)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        if removed == 0 {
            return Err(DriverError::LeaseLost);
        }
        let mut dead_entry = Vec::with_capacity(reason.len() + 1 + envelope.len());
        dead_entry.extend_from_slice(reason.as_bytes());
        dead_entry.push(0);
        dead_entry.extend_from_slice(envelope);
        conn.lpush::<_, _, ()>(&keys.dead, dead_entry)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        handle: &DeliveryHandle,
        additional: Duration,
    ) -> Result<DeliveryHandle, DriverError> {
        let (queue, wrapped) = handle.downcast_ref::<RedisHandle>().ok_or(DriverError::LeaseLost)?;
        let keys = Keys::for_queue(queue);
        let Some((_, envelope)) = unwrap(wrapped) else {
            return Err(DriverError::LeaseLost);
        };
        let new_wrapped = wrap(now_ms() + additional.as_millis() as i64, envelope);

        let mut conn = self.conn.lock().await;
        let removed: i64 = conn
            .lrem(&keys.processing, 1, wrapped)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        if removed == 0 {
            return Err(DriverError::LeaseLost);
        }
        conn.lpush::<_, _, ()>(&keys.processing, &new_wrapped)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;

        Ok(DeliveryHandle::new(
            "redis",
            (queue.clone(), new_wrapped) as RedisHandle,
        ))
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, DriverError> {
        let keys = Keys::for_queue(queue);
        let mut conn = self.conn.lock().await;
        let count: u64 = conn
            .llen(&keys.pending)
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(QueueDepth {
            count,
            approximate: false,
        })
    }

    fn requires_lease_renewal(&self) -> bool {
        false
    }
}

/// Per-queue debug counters, exposed for the metrics layer in
/// `asynctasq-worker`; not part of the `Driver` trait itself.
pub async fn queue_snapshot(
    driver: &RedisDriver,
    queue: &str,
) -> Result<HashMap<&'static str, u64>, DriverError> {
    let keys = Keys::for_queue(queue);
    let mut conn = driver.conn.lock().await;
    let pending: u64 = conn
        .llen(&keys.pending)
        .await
        .map_err(|e| DriverError::Other(e.into()))?;
    let processing: u64 = conn
        .llen(&keys.processing)
        .await
        .map_err(|e| DriverError::Other(e.into()))?;
    let delayed: u64 = conn
        .zcard(&keys.delayed)
        .await
        .map_err(|e| DriverError::Other(e.into()))?;
    let mut out = HashMap::new();
    out.insert("pending", pending);
    out.insert("processing", processing);
    out.insert("delayed", delayed);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_round_trips() {
        let wrapped = wrap(1234, b"hello");
        let (locked_until, envelope) = unwrap(&wrapped).unwrap();
        assert_eq!(locked_until, 1234);
        assert_eq!(envelope, b"hello");
    }

    #[test]
    fn unwrap_rejects_truncated_input() {
        assert!(unwrap(&[1, 2, 3]).is_none());
    }

    #[test]
    fn keys_follow_the_spec_naming_scheme() {
        let keys = Keys::for_queue("emails");
        assert_eq!(keys.pending, "emails");
        assert_eq!(keys.processing, "emails:processing");
        assert_eq!(keys.delayed, "emails:delayed");
        assert_eq!(keys.dead, "emails:dead");
    }
}
