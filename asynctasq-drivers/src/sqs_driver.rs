//! AWS SQS driver. SQS requires UTF-8 message bodies,
//! so the binary envelope is base64-wrapped on the way in and unwrapped on
//! the way out.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use asynctasq_core::driver::{DeliveryHandle, Delivery, Driver, QueueDepth};
use asynctasq_core::error::DriverError;
use async_trait::async_trait;
use aws_sdk_sqs::Client;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::warn;

/// SQS rejects `DelaySeconds` above this; see `UnsupportedDelay`
/// flag.
const MAX_SQS_DELAY_SECS: u64 = 900;

#[derive(Clone)]
struct SqsHandle {
    queue_url: String,
    receipt_handle: String,
}

pub struct SqsDriver {
    client: Client,
    /// Resolved once per queue name and cached; SQS addresses queues by URL,
    /// not name.
    queue_urls: RwLock<HashMap<String, String>>,
}

impl SqsDriver {
    pub async fn connect() -> Result<Self, DriverError> {
        let config = aws_config::load_from_env().await;
        let client = Client::new(&config);
        Ok(SqsDriver {
            client,
            queue_urls: RwLock::new(HashMap::new()),
        })
    }

    async fn queue_url(&self, queue: &str) -> Result<String, DriverError> {
        if let Some(url) = self.queue_urls.read().unwrap().get(queue).cloned() {
            return Ok(url);
        }
        let response = self
            .client
            .get_queue_url()
            .queue_name(queue)
            .send()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        let url = response
            .queue_url()
            .ok_or_else(|| DriverError::Other(anyhow::anyhow!("SQS returned no queue URL for {queue}")))?
            .to_string();
        self.queue_urls
            .write()
            .unwrap()
            .insert(queue.to_string(), url.clone());
        Ok(url)
    }
}

#[async_trait]
impl Driver for SqsDriver {
    async fn connect(&self) -> Result<(), DriverError> {
        Ok(())
    }

    async fn close(&self) {}

    async fn enqueue(
        &self,
        queue: &str,
        envelope_bytes: Vec<u8>,
        delay: Duration,
    ) -> Result<(), DriverError> {
        if delay.as_secs() > MAX_SQS_DELAY_SECS {
            return Err(DriverError::UnsupportedOp(
                "SQS DelaySeconds cannot exceed 900 seconds",
            ));
        }
        let url = self.queue_url(queue).await?;
        let body = BASE64.encode(&envelope_bytes);
        self.client
            .send_message()
            .queue_url(url)
            .message_body(body)
            .delay_seconds(delay.as_secs() as i32)
            .send()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
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

        'outer: for queue in queues {
            if out.len() >= max_batch {
                break;
            }
            let url = self.queue_url(queue).await?;
            loop {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if remaining.is_zero() {
                    break 'outer;
                }
                // ReceiveMessage's WaitTimeSeconds caps at 20s; longer
                // deadlines loop with repeated long polls.
                let wait_secs = remaining.as_secs().min(20).max(0) as i32;
                let response = self
                    .client
                    .receive_message()
                    .queue_url(&url)
                    .max_number_of_messages((max_batch - out.len()).min(10) as i32)
                    .wait_time_seconds(wait_secs)
                    .message_system_attribute_names(aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount)
                    .send()
                    .await
                    .map_err(|e| DriverError::Other(e.into()))?;

                let messages = response.messages.unwrap_or_default();
                if messages.is_empty() {
                    continue;
                }

                for message in messages {
                    let (Some(body), Some(receipt_handle)) =
                        (message.body.clone(), message.receipt_handle.clone())
                    else {
                        continue;
                    };
                    let envelope_bytes = match BASE64.decode(body.as_bytes()) {
                        Ok(bytes) => bytes,
                        Err(err) => {
                            warn!(error = %err, "dropping SQS message with non-base64 body");
                            continue;
                        }
                    };
                    let delivery_attempt = message
                        .attributes
                        .as_ref()
                        .and_then(|attrs| attrs.get(&aws_sdk_sqs::types::MessageSystemAttributeName::ApproximateReceiveCount))
                        .and_then(|v| v.parse::<u32>().ok())
                        .unwrap_or(1);
                    out.push(Delivery {
                        handle: DeliveryHandle::new(
                            "sqs",
                            SqsHandle {
                                queue_url: url.clone(),
                                receipt_handle,
                            },
                        ),
                        envelope_bytes,
                        delivery_attempt,
                    });
                    if out.len() >= max_batch {
                        break 'outer;
                    }
                }
                break;
            }
        }

        Ok(out)
    }

    async fn ack(&self, handle: &DeliveryHandle) -> Result<(), DriverError> {
        let h = handle.downcast_ref::<SqsHandle>().ok_or(DriverError::LeaseLost)?;
        self.client
            .delete_message()
            .queue_url(&h.queue_url)
            .receipt_handle(&h.receipt_handle)
            .send()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn nack(
        &self,
        handle: &DeliveryHandle,
        _envelope_bytes: &[u8],
        requeue_after: Option<Duration>,
    ) -> Result<(), DriverError> {
        // SQS requeues by visibility timeout, not by replacing the body, so
        // the re-encoded envelope has nowhere to go; `current_attempt` is
        // tracked via `ApproximateReceiveCount` instead.
        let h = handle.downcast_ref::<SqsHandle>().ok_or(DriverError::LeaseLost)?;
        let visibility = requeue_after.unwrap_or(Duration::ZERO).as_secs().min(MAX_SQS_DELAY_SECS) as i32;
        self.client
            .change_message_visibility()
            .queue_url(&h.queue_url)
            .receipt_handle(&h.receipt_handle)
            .visibility_timeout(visibility)
            .send()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(())
    }

    async fn dead_letter(&self, handle: &DeliveryHandle, _reason: &str) -> Result<(), DriverError> {
        // No local DLQ: SQS redrive policies are provisioned out of band.
        // The driver's only responsibility is to stop redelivering this
        // message; the event bus records the terminal outcome.
        self.ack(handle).await
    }

    async fn extend_lease(
        &self,
        handle: &DeliveryHandle,
        additional: Duration,
    ) -> Result<DeliveryHandle, DriverError> {
        let h = handle.downcast_ref::<SqsHandle>().ok_or(DriverError::LeaseLost)?;
        self.client
            .change_message_visibility()
            .queue_url(&h.queue_url)
            .receipt_handle(&h.receipt_handle)
            .visibility_timeout(additional.as_secs() as i32)
            .send()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        Ok(handle.clone())
    }

    async fn queue_depth(&self, queue: &str) -> Result<QueueDepth, DriverError> {
        let url = self.queue_url(queue).await?;
        let response = self
            .client
            .get_queue_attributes()
            .queue_url(url)
            .attribute_names(aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages)
            .send()
            .await
            .map_err(|e| DriverError::Other(e.into()))?;
        let count = response
            .attributes
            .as_ref()
            .and_then(|attrs| attrs.get(&aws_sdk_sqs::types::QueueAttributeName::ApproximateNumberOfMessages))
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        Ok(QueueDepth {
            count,
            approximate: true,
        })
    }

    fn requires_lease_renewal(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base64_round_trips_arbitrary_envelope_bytes() {
        let original = vec![0u8, 255, 1, 2, 3, 254];
        let encoded = BASE64.encode(&original);
        let decoded = BASE64.decode(encoded.as_bytes()).unwrap();
        assert_eq!(decoded, original);
    }
}
