//! Named lifecycle events with pluggable sinks.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};
use uuid::Uuid;

/// Identity shared by every event, matching the tuple in .
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub task_id: Uuid,
    pub class_path: String,
    pub queue: String,
    pub current_attempt: u32,
    pub max_attempts: u32,
    pub correlation_id: Option<String>,
}

/// One lifecycle transition. Emission is fire-and-forget from the
/// producer/worker's point of view — see [`EventBus::emit`].
#[derive(Debug, Clone)]
pub enum Event {
    Enqueued(TaskContext),
    Started(TaskContext),
    Completed(TaskContext, Duration),
    Failed(TaskContext, String, bool),
    Retrying(TaskContext, Duration, String),
    Reenqueued(TaskContext, &'static str),
}

impl Event {
    pub fn context(&self) -> &TaskContext {
        match self {
            Event::Enqueued(c)
            | Event::Started(c)
            | Event::Completed(c, _)
            | Event::Failed(c, _, _)
            | Event::Retrying(c, _, _)
            | Event::Reenqueued(c, _) => c,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Enqueued(_) => "enqueued",
            Event::Started(_) => "started",
            Event::Completed(_, _) => "completed",
            Event::Failed(_, _, _) => "failed",
            Event::Retrying(_, _, _) => "retrying",
            Event::Reenqueued(_, _) => "reenqueued",
        }
    }
}

/// A registered event consumer. A sink that panics or errors is logged and
/// never retried, and never blocks other sinks.
pub trait EventSink: Send + Sync {
    fn handle(&self, event: &Event);
}

/// Structured-log sink: the built-in default, records every event at
/// `info` level via `tracing`.
pub struct TracingSink;

impl EventSink for TracingSink {
    fn handle(&self, event: &Event) {
        let ctx = event.context();
        info!(
            event = event.name(),
            task_id = %ctx.task_id,
            class_path = %ctx.class_path,
            queue = %ctx.queue,
            current_attempt = ctx.current_attempt,
            max_attempts = ctx.max_attempts,
            correlation_id = ctx.correlation_id.as_deref().unwrap_or(""),
            "task lifecycle event"
        );
    }
}

/// Fans a single [`Event`] out to every registered [`EventSink`].
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus { sinks: Vec::new() }
    }

    pub fn register(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    /// Emits `event` to every sink. A sink that panics is caught and logged;
    /// it does not stop other sinks from receiving the event.
    pub fn emit(&self, event: Event) {
        for sink in &self.sinks {
            let sink = sink.clone();
            let event_for_sink = event.clone();
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                sink.handle(&event_for_sink);
            }));
            if let Err(panic) = result {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                error!(sink_panic = %message, "event sink panicked, dropping this emission");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> TaskContext {
        TaskContext {
            task_id: Uuid::nil(),
            class_path: "demo.task".into(),
            queue: "default".into(),
            current_attempt: 1,
            max_attempts: 3,
            correlation_id: None,
        }
    }

    struct CountingSink(Arc<AtomicUsize>);
    impl EventSink for CountingSink {
        fn handle(&self, _event: &Event) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct PanickingSink;
    impl EventSink for PanickingSink {
        fn handle(&self, _event: &Event) {
            panic!("sink blew up");
        }
    }

    #[test]
    fn every_registered_sink_observes_the_event() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();
        bus.register(Arc::new(CountingSink(count.clone())));
        bus.register(Arc::new(CountingSink(count.clone())));
        bus.emit(Event::Enqueued(ctx()));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn a_panicking_sink_does_not_stop_other_sinks() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut bus = EventBus::new();
        bus.register(Arc::new(PanickingSink));
        bus.register(Arc::new(CountingSink(count.clone())));
        bus.emit(Event::Enqueued(ctx()));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
