//! Redis Pub/Sub [`EventSink`].
//!
//! `EventSink::handle` is a synchronous, non-blocking callback invoked
//! directly from the worker's hot path, so this sink never awaits a
//! network round trip there. It serializes the event and drops it onto an
//! unbounded channel; a background task owns the actual `PUBLISH` calls.

use std::time::Duration;

use asynctasq_core::events::{Event, EventSink};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Serialize)]
struct EventMessage<'a> {
    event: &'a str,
    task_id: String,
    class_path: &'a str,
    queue: &'a str,
    current_attempt: u32,
    max_attempts: u32,
    correlation_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    duration_ms: Option<u128>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    retryable: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
}

fn to_message(event: &Event) -> EventMessage<'_> {
    let ctx = event.context();
    let mut msg = EventMessage {
        event: event.name(),
        task_id: ctx.task_id.to_string(),
        class_path: &ctx.class_path,
        queue: &ctx.queue,
        current_attempt: ctx.current_attempt,
        max_attempts: ctx.max_attempts,
        correlation_id: ctx.correlation_id.as_deref(),
        duration_ms: None,
        error: None,
        retryable: None,
        reason: None,
    };
    match event {
        Event::Completed(_, duration) => msg.duration_ms = Some(duration.as_millis()),
        Event::Failed(_, error, retryable) => {
            msg.error = Some(error);
            msg.retryable = Some(*retryable);
        }
        Event::Retrying(_, delay, error) => {
            msg.duration_ms = Some(delay.as_millis());
            msg.error = Some(error);
        }
        Event::Reenqueued(_, reason) => msg.reason = Some(reason),
        Event::Enqueued(_) | Event::Started(_) => {}
    }
    msg
}

/// Publishes every event as JSON to the `{channel_prefix}:{queue}` channel.
pub struct RedisPubSubSink {
    sender: mpsc::UnboundedSender<(String, String)>,
}

impl RedisPubSubSink {
    /// Spawns the background publisher task and returns the sink. Publish
    /// failures are logged, never propagated — a subscriber outage must not
    /// affect task execution.
    pub fn spawn(conn: ConnectionManager, channel_prefix: impl Into<String>) -> Self {
        let channel_prefix = channel_prefix.into();
        let (sender, mut receiver) = mpsc::unbounded_channel::<(String, String)>();
        tokio::spawn(async move {
            let mut conn = conn;
            while let Some((queue, payload)) = receiver.recv().await {
                let channel = format!("{channel_prefix}:{queue}");
                if let Err(err) = conn.publish::<_, _, ()>(&channel, &payload).await {
                    warn!(%channel, error = %err, "failed to publish task event");
                }
            }
        });
        RedisPubSubSink { sender }
    }

    /// Connects a fresh connection manager and spawns the publisher.
    pub async fn connect(
        url: &str,
        channel_prefix: impl Into<String>,
    ) -> Result<Self, asynctasq_core::error::DriverError> {
        let client = redis::Client::open(url)
            .map_err(|e| asynctasq_core::error::DriverError::ConnectFail(e.into()))?;
        let conn = client
            .get_connection_manager()
            .await
            .map_err(|e| asynctasq_core::error::DriverError::ConnectFail(e.into()))?;
        Ok(Self::spawn(conn, channel_prefix))
    }
}

impl EventSink for RedisPubSubSink {
    fn handle(&self, event: &Event) {
        let queue = event.context().queue.clone();
        let message = to_message(event);
        match serde_json::to_string(&message) {
            Ok(payload) => {
                // An unbounded send only fails if the receiver task has
                // exited (e.g. during shutdown); dropping the event there
                // is correct, not an error worth surfacing per-event.
                let _ = self.sender.send((queue, payload));
            }
            Err(err) => warn!(error = %err, "failed to serialize task event"),
        }
    }
}

#[allow(dead_code)]
const NOISY_RECONNECT_BACKOFF: Duration = Duration::from_secs(1);

#[cfg(test)]
mod tests {
    use super::*;
    use asynctasq_core::events::TaskContext;
    use uuid::Uuid;

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: Uuid::nil(),
            class_path: "demo.task".into(),
            queue: "default".into(),
            current_attempt: 1,
            max_attempts: 3,
            correlation_id: Some("corr-1".into()),
        }
    }

    #[test]
    fn completed_event_serializes_duration() {
        let event = Event::Completed(ctx(), Duration::from_millis(42));
        let message = to_message(&event);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"duration_ms\":42"));
        assert!(json.contains("\"event\":\"completed\""));
    }

    #[test]
    fn failed_event_serializes_error_and_retryable() {
        let event = Event::Failed(ctx(), "boom".to_string(), true);
        let message = to_message(&event);
        let json = serde_json::to_string(&message).unwrap();
        assert!(json.contains("\"error\":\"boom\""));
        assert!(json.contains("\"retryable\":true"));
    }

    #[test]
    fn enqueued_event_omits_optional_fields() {
        let event = Event::Enqueued(ctx());
        let message = to_message(&event);
        let json = serde_json::to_string(&message).unwrap();
        assert!(!json.contains("duration_ms"));
        assert!(!json.contains("error"));
    }
}
