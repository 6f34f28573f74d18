//! Explicit task-handler registry.
//!
//! Each task type registers its `class_path` up front, and the registry
//! resolves `class_path -> handler` at fetch time rather than looking one
//! up dynamically by dotted module path. An unknown `class_path` is a
//! [`DecodeError`], not a panic.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::TaskEnvelope;
use crate::error::DecodeError;

/// The outcome of one execution attempt.
#[derive(Debug)]
pub enum Outcome {
    Ok(Vec<u8>),
    Err { message: String, retryable: bool },
    TimedOut,
}

/// The kind of runtime a task is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    AsyncIo,
    SyncIo,
    AsyncCpu,
    SyncCpu,
}

/// Unifies retries, timeouts and dead-lettering behind a single result type
///.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Which kind of runtime executes this task.
    fn kind(&self) -> TaskKind;

    /// Runs one attempt. The handler receives the fully materialized
    /// argument map (after [`crate::resolver::Resolver`] has substituted any
    /// `REF` values) and returns an [`Outcome`].
    async fn execute(&self, envelope: &TaskEnvelope) -> Outcome;

    /// Classifies an error as retryable or not. Defaults to "always retryable".
    fn is_retryable(&self, _message: &str) -> bool {
        true
    }

    /// Best-effort terminal hook, invoked when a task has exhausted its
    /// retries or been classified non-retryable. Exceptions/panics inside it
    /// must not propagate; the executor enforces this with
    /// `catch_unwind` around the call site, not this trait.
    async fn failed(&self, _envelope: &TaskEnvelope, _error: &str) {}
}

/// Maps `class_path -> handler`, populated at program init.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        TaskRegistry {
            handlers: HashMap::new(),
        }
    }

    pub fn register(&mut self, class_path: impl Into<String>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(class_path.into(), handler);
    }

    /// Looks up the handler for `class_path`. An unknown class path at
    /// fetch time is a [`DecodeError`], not a panic.
    pub fn resolve(&self, class_path: &str) -> Result<Arc<dyn TaskHandler>, DecodeError> {
        self.handlers
            .get(class_path)
            .cloned()
            .ok_or_else(|| DecodeError::InvalidEnumValue {
                field: "class_path",
                value: class_path.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        fn kind(&self) -> TaskKind {
            TaskKind::AsyncIo
        }

        async fn execute(&self, _envelope: &TaskEnvelope) -> Outcome {
            Outcome::Ok(Vec::new())
        }
    }

    #[test]
    fn unknown_class_path_is_a_decode_error() {
        let registry = TaskRegistry::new();
        let err = registry.resolve("does.not.exist").unwrap_err();
        assert!(matches!(err, DecodeError::InvalidEnumValue { .. }));
    }

    #[tokio::test]
    async fn registered_handler_resolves_and_executes() {
        let mut registry = TaskRegistry::new();
        registry.register("demo.noop", Arc::new(Noop));
        let handler = registry.resolve("demo.noop").expect("resolves");
        assert_eq!(handler.kind(), TaskKind::AsyncIo);

        let envelope = crate::envelope::TaskEnvelope::new(
            "demo.noop",
            BTreeMap::new(),
            "default",
            1,
            crate::envelope::RetryStrategy::Fixed,
            0,
            None,
            30,
            None,
            0,
        );
        match handler.execute(&envelope).await {
            Outcome::Ok(_) => {}
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
