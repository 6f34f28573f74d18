//! RabbitMQ driver over a direct exchange.
//!
//! Topology: one durable direct exchange `E`; one durable queue per logical
//! queue name bound to `E` with its own name as routing key; one companion
//! `{queue}.delayed` queue holding items not yet ready, each body prefixed
//! with an 8-byte big-endian `f64` ready-timestamp (epoch seconds).

use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use asynctasq_core::driver::{DeliveryHandle, Delivery, Driver, QueueDepth};
use asynctasq_core::error::DriverError;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions,
    ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use tokio::sync::Mutex;
use tracing::warn;

const EXCHANGE_NAME: &str = "asynctasq.direct";
const DELAYED_SCAN_INTERVAL: Duration = Duration::from_millis(250);

fn delayed_queue_name(queue: &str) -> String {
    format!("{queue}.delayed")
}

fn now_epoch_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn wrap_with_timestamp(ready_at_secs: f64, envelope: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(8 + envelope.len());
    body.extend_from_slice(&ready_at_secs.to_be_bytes());
    body.extend_from_slice(envelope);
    body
}

fn unwrap_timestamp(body: &[u8]) -> Option<(f64, &[u8])> {
    if body.len() < 8 {
        return None;
    }
    let mut header = [0u8; 8];
    header.copy_from_slice(&body[..8]);
    Some((f64::from_be_bytes(header), &body[8..]))
}

#[derive(Clone)]
struct AmqpHandle {
    channel: Channel,
    delivery_tag: u64,
    queue: String,
    envelope_bytes: Vec<u8>,
}

pub struct AmqpDriver {
    _connection: Connection,
    channel: Channel,
    consumers: Mutex<HashMap<String, Consumer>>,
    declared_queues: Mutex<HashMap<String, ()>>,
    prefetch: u16,
}

impl AmqpDriver {
    pub async fn connect(uri: &str, prefetch: u16) -> Result<Self, DriverError> {
        let connection = Connection::connect(uri, ConnectionProperties::default())
            .await
            .map_err(|e| DriverError::ConnectFail(e.into()))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| DriverError::ConnectFail(e.into()))?;
        channel
            .exchange_declare(
                EXCHANGE_NAME,
                ExchangeKind::Direct,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DriverError::ConnectFail(e.into()))?;
        channel
            .basic_qos(prefetch, Default::default())
            .await
            .map_err(|e| DriverError::ConnectFail(e.into()))?;
        Ok(AmqpDriver {
            _connection: connection,
            channel,
            consumers: Mutex::new(HashMap::new()),
            declared_queues: Mutex::new(HashMap::new()),
            prefetch,
        })
    }

    async fn ensure_topology(&self, queue: &str) -> Result<(), DriverError> {
        if self.declared_queues.lock().await.contains_key(queue) {
            return Ok(());
        }
        self.channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        self.channel
            .queue_bind(
                queue,
                EXCHANGE_NAME,
                queue,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        self.channel
            .queue_declare(
                &delayed_queue_name(queue),
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        self.declared_queues.lock().await.insert(queue.to_string(), ());
        self.spawn_delayed_scanner(queue.to_string());
        Ok(())
    }

    /// One scanner per queue, consuming its `.delayed` companion and
    /// re-publishing items whose ready-timestamp has passed.
    fn spawn_delayed_scanner(&self, queue: String) {
        let channel = self.channel.clone();
        tokio::spawn(async move {
            let delayed_queue = delayed_queue_name(&queue);
            let consumer_result = channel
                .basic_consume(
                    &delayed_queue,
                    &format!("asynctasq-delayed-scan-{queue}"),
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await;
            let mut consumer = match consumer_result {
                Ok(c) => c,
                Err(err) => {
                    warn!(error = %err, %queue, "failed to start delayed-queue scanner");
                    return;
                }
            };
            loop {
                let Some(delivery) = consumer.next().await else {
                    return;
                };
                let Ok(delivery) = delivery else { continue };
                let Some((ready_at, envelope)) = unwrap_timestamp(&delivery.data) else {
                    let _ = delivery.ack(BasicAckOptions::default()).await;
                    continue;
                };
                if now_epoch_secs() >= ready_at {
                    let publish = channel
                        .basic_publish(
                            EXCHANGE_NAME,
                            &queue,
                            BasicPublishOptions::default(),
                            envelope,
                            BasicProperties::default().with_delivery_mode(2),
                        )
                        .await;
                    if publish.is_ok() {
                        let _ = delivery.ack(BasicAckOptions::default()).await;
                    } else {
                        let _ = delivery
                            .nack(BasicNackOptions {
                                requeue: true,
                                ..Default::default()
                            })
                            .await;
                    }
                } else {
                    tokio::time::sleep(DELAYED_SCAN_INTERVAL).await;
                    let _ = delivery
                        .nack(BasicNackOptions {
                            requeue: true,
                            ..Default::default()
                        })
                        .await;
                }
            }
        });
    }
}

#[async_trait]
impl Driver for AmqpDriver {
    async fn connect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) {
        let _ = self.channel.close(200, "shutdown").await;
    }

    async fn enqueue(
        &self,
        queue: &str,
        envelope_bytes: Vec<u8>,
        delay: Duration,
    ) -> Result<(), DriverError> {
        self.ensure_topology(queue).await?;
        if delay.is_zero() {
            self.channel
                .basic_publish(
                    EXCHANGE_NAME,
                    queue,
                    BasicPublishOptions::default(),
                    &envelope_bytes,
                    BasicProperties::default().with_delivery_mode(2),
                )
                .await
                .map_err(|e| DriverError::Other(e.into()))?;
        } else {
            let ready_at = now_epoch_secs() + delay.as_secs_f64();
            let body = wrap_with_timestamp(ready_at, &envelope_bytes);
            self.channel
                .basic_publish(
                    "",
                    &delayed_queue_name(queue),
                    BasicPublishOptions::default(),
                    &body,
                    BasicProperties::default().with_delivery_mode(2),
                )
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
        let deadline = tokio::time::Instant::now() + wait_deadline;
        let mut out = Vec::new();

        for queue in queues {
            if out.len() >= max_batch {
                break;
            }
            self.ensure_topology(queue).await?;

            let mut consumers = self.consumers.lock().await;
            if !consumers.contains_key(queue) {
                let consumer = self
                    .channel
                    .basic_consume(
                        queue,
                        &format!("asynctasq-worker-{queue}"),
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| DriverError::Other(e.into()))?;
                consumers.insert(queue.clone(), consumer);
            }
            let consumer = consumers.get_mut(queue).unwrap();

            while out.len() < max_batch {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break;
                }
                let next = tokio::time::timeout(remaining, consumer.next()).await;
                let Ok(Some(delivery)) = next else { break };
                let Ok(delivery) = delivery else { continue };
                let delivery_tag = delivery.delivery_tag;
                let envelope_bytes = delivery.data.clone();
                out.push(Delivery {
                    handle: DeliveryHandle::new(
                        "amqp",
                        AmqpHandle {
                            channel: self.channel.clone(),
                            delivery_tag,
                            queue: queue.clone(),
                            envelope_bytes: envelope_bytes.clone(),
                        },
                    ),
                    envelope_bytes,
                    delivery_attempt: if delivery.redelivered { 2 } else { 1 },
                });
            }
        }

        Ok(out)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), DriverError> {
        let h = handle.downcast_ref::<AmqpHandle>().ok_or(DriverError::LeaseLost)?;
        h.channel
            .basic_ack(h.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn nack(
        &self,
        handle: &DeliveryHandle,
        envelope_bytes: &[u8],
        requeue_after: Option<Duration>,
    ) -> Result<(), DriverError> {
        let h = handle.downcast_ref::<AmqpHandle>().ok_or(DriverError::LeaseLost)?;
        // Native `basic_nack(requeue: true)` would put the original broker
        // message back verbatim, losing the caller's bumped `current_attempt`.
        // Republishing `envelope_bytes` ourselves and acking the original
        // delivery keeps the attempt counter visible on redelivery the same
        // way the delayed path already does.
        let ready_at = now_epoch_secs() + requeue_after.unwrap_or(Duration::ZERO).as_secs_f64();
        let body = wrap_with_timestamp(ready_at, envelope_bytes);
        h.channel
            .basic_publish(
                "",
                &delayed_queue_name(&h.queue),
                BasicPublishOptions::default(),
                &body,
                BasicProperties::default().with_delivery_mode(2),
            )
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        h.channel
            .basic_ack(h.delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn dead_letter(&self, handle: &DeliveryHandle, _reason: &str) -> Result<(), DriverError> {
        let h = handle.downcast_ref::<AmqpHandle>().ok_or(DriverError::LeaseLost)?;
        h.channel
            .basic_nack(
                h.delivery_tag,
                BasicNackOptions {
                    requeue: false,
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn extend_lease(
        &self,
        _handle: &DeliveryHandle,
        _additional: Duration,
    ) -> Result<DeliveryHandle, DriverError> {
        // AMQP has no native visibility-timeout concept: a delivered,
        // unacked message stays invisible to other consumers until the
        // channel closes. Nothing to extend.
        Err(DriverError::UnsupportedOp(
            "AMQP deliveries have no visibility timeout to extend",
        ))
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, DriverError> {
        self.ensure_topology(queue).await?;
        let declared = self
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(QueueDepth {
            count: declared.message_count() as u64,
            approximate: true,
        })
    }

    fn requires_lease_renewal(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_wrapping_round_trips() {
        let body = wrap_with_timestamp(123.5, b"payload");
        let (ready_at, envelope) = unwrap_timestamp(&body).unwrap();
        assert_eq!(ready_at, 123.5);
        assert_eq!(envelope, b"payload");
    }

    #[test]
    fn delayed_queue_naming_matches_convention() {
        assert_eq!(delayed_queue_name("emails"), "emails.delayed");
    }
}
