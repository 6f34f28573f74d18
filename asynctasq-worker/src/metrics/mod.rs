use asynctasq_core::events::{Event, EventSink};
use metrics::{counter, gauge, histogram, SharedString};

/// Thin wrapper over the `metrics` macros, named for the queue-specific
/// series this worker emits.
pub struct Metrics {}

impl Metrics {
    pub fn new() -> Self {
        Self {}
    }

    pub fn increment_tasks_enqueued(&self, class_path: &str) {
        let class_path = SharedString::from(String::from(class_path));
        counter!("asynctasq_tasks_enqueued_total", "class_path" => class_path).increment(1);
    }

    pub fn increment_tasks_completed(&self, class_path: &str) {
        let class_path = SharedString::from(String::from(class_path));
        counter!("asynctasq_tasks_completed_total", "class_path" => class_path).increment(1);
    }

    pub fn increment_tasks_retried(&self, class_path: &str) {
        let class_path = SharedString::from(String::from(class_path));
        counter!("asynctasq_tasks_retried_total", "class_path" => class_path).increment(1);
    }

    pub fn increment_tasks_dead_lettered(&self, class_path: &str) {
        let class_path = SharedString::from(String::from(class_path));
        counter!("asynctasq_tasks_dead_lettered_total", "class_path" => class_path).increment(1);
    }

    pub fn observe_task_duration(&self, class_path: &str, duration_secs: f64) {
        let class_path = SharedString::from(String::from(class_path));
        histogram!("asynctasq_task_duration_seconds", "class_path" => class_path).record(duration_secs);
    }

    pub fn increment_decode_errors(&self) {
        counter!("asynctasq_decode_errors_total").increment(1);
    }

    pub fn increment_lease_renewal_failures(&self) {
        counter!("asynctasq_lease_renewal_failures_total").increment(1);
    }

    pub fn set_in_flight(&self, count: u64) {
        gauge!("asynctasq_tasks_in_flight").set(count as f64);
    }

    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        let queue = SharedString::from(String::from(queue));
        gauge!("asynctasq_queue_depth", "queue" => queue).set(depth as f64);
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Adapts [`Metrics`] to the event bus so lifecycle
/// transitions update Prometheus series without the dispatcher or worker
/// loop calling `Metrics` directly.
pub struct MetricsSink(pub Metrics);

impl EventSink for MetricsSink {
    fn handle(&self, event: &Event) {
        let ctx = event.context();
        match event {
            Event::Enqueued(_) => self.0.increment_tasks_enqueued(&ctx.class_path),
            Event::Completed(_, duration) => {
                self.0.increment_tasks_completed(&ctx.class_path);
                self.0.observe_task_duration(&ctx.class_path, duration.as_secs_f64());
            }
            Event::Retrying(_, _, _) => self.0.increment_tasks_retried(&ctx.class_path),
            Event::Failed(_, _, _) => self.0.increment_tasks_dead_lettered(&ctx.class_path),
            Event::Started(_) | Event::Reenqueued(_, _) => {}
        }
    }
}
