//! Runs one task attempt: resolves reference arguments, routes to the right
//! runtime for the task's [`TaskKind`], enforces the envelope's timeout, and
//! isolates handler panics behind an [`Outcome::Err`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use asynctasq_core::envelope::TaskEnvelope;
use asynctasq_core::registry::{Outcome, TaskKind, TaskRegistry};
use asynctasq_core::resolver::{ResolveError, Resolver};
use futures::FutureExt;
use tracing::warn;

use crate::pool::ProcessPool;

/// Executes tasks against a handler registry, routing `SyncCpu` work to a
/// warm process pool when one is configured.
pub struct Executor {
    registry: Arc<TaskRegistry>,
    resolver: Arc<Resolver>,
    process_pool: Option<Arc<ProcessPool>>,
}

impl Executor {
    pub fn new(registry: Arc<TaskRegistry>, resolver: Arc<Resolver>, process_pool: Option<Arc<ProcessPool>>) -> Self {
        Executor {
            registry,
            resolver,
            process_pool,
        }
    }

    /// Runs one attempt of `envelope`, applying its timeout if set.
    ///
    /// A missing `class_path` or a reference the resolver can't load both
    /// surface as non-retryable `Outcome::Err`s: retrying a task whose
    /// handler doesn't exist, or whose arguments can't be materialized,
    /// cannot succeed on a later attempt.
    pub async fn run(&self, envelope: &TaskEnvelope) -> Outcome {
        let handler = match self.registry.resolve(&envelope.class_path) {
            Ok(handler) => handler,
            Err(err) => {
                return Outcome::Err {
                    message: err.to_string(),
                    retryable: false,
                }
            }
        };

        let resolved_args = match self.resolver.resolve_args(&envelope.args).await {
            Ok(args) => args,
            Err(err) => {
                return Outcome::Err {
                    message: resolve_error_message(&err),
                    retryable: false,
                }
            }
        };

        let mut resolved = envelope.clone();
        resolved.args = resolved_args;

        let kind = handler.kind();
        let run_fut = async {
            match kind {
                TaskKind::AsyncIo | TaskKind::AsyncCpu => {
                    run_catching_panics(handler.execute(&resolved)).await
                }
                TaskKind::SyncIo => {
                    let handler = handler.clone();
                    let resolved = resolved.clone();
                    match tokio::task::spawn_blocking(move || {
                        tokio::runtime::Handle::current().block_on(handler.execute(&resolved))
                    })
                    .await
                    {
                        Ok(outcome) => outcome,
                        Err(join_err) => blocking_task_panicked(join_err),
                    }
                }
                TaskKind::SyncCpu => match &self.process_pool {
                    Some(pool) => pool.execute(&resolved).await,
                    None => {
                        warn!(
                            class_path = %resolved.class_path,
                            "task declares SyncCpu but no process pool is configured; running inline"
                        );
                        run_catching_panics(handler.execute(&resolved)).await
                    }
                },
            }
        };

        match resolved.timeout_secs {
            Some(secs) if secs > 0 => {
                match tokio::time::timeout(Duration::from_secs(secs), run_fut).await {
                    Ok(outcome) => outcome,
                    Err(_) => Outcome::TimedOut,
                }
            }
            _ => run_fut.await,
        }
    }

    /// Invokes the terminal `failed` hook on a task's handler, exactly once,
    /// after it has exhausted its retries or been classified non-retryable.
    /// Best-effort: an unknown `class_path` has nothing to call, and a
    /// panicking hook is caught and logged rather than propagated.
    pub async fn run_failed_hook(&self, envelope: &TaskEnvelope, error: &str) {
        let Ok(handler) = self.registry.resolve(&envelope.class_path) else {
            return;
        };
        if let Err(panic) = AssertUnwindSafe(handler.failed(envelope, error)).catch_unwind().await {
            warn!(
                class_path = %envelope.class_path,
                panic = %panic_message(panic),
                "failed() hook panicked"
            );
        }
    }
}

async fn run_catching_panics(fut: impl std::future::Future<Output = Outcome>) -> Outcome {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => Outcome::Err {
            message: panic_message(panic),
            retryable: false,
        },
    }
}

fn blocking_task_panicked(join_err: tokio::task::JoinError) -> Outcome {
    Outcome::Err {
        message: format!("task handler thread panicked: {join_err}"),
        retryable: false,
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "<non-string panic payload>".to_string())
}

fn resolve_error_message(err: &ResolveError) -> String {
    format!("failed to resolve reference argument for {}: {}", err.class_path, err.message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeMap;

    struct Echo;

    #[async_trait]
    impl asynctasq_core::registry::TaskHandler for Echo {
        fn kind(&self) -> TaskKind {
            TaskKind::AsyncIo
        }

        async fn execute(&self, _envelope: &TaskEnvelope) -> Outcome {
            Outcome::Ok(b"ok".to_vec())
        }
    }

    struct SleepsForever;

    #[async_trait]
    impl asynctasq_core::registry::TaskHandler for SleepsForever {
        fn kind(&self) -> TaskKind {
            TaskKind::AsyncIo
        }

        async fn execute(&self, _envelope: &TaskEnvelope) -> Outcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Outcome::Ok(Vec::new())
        }
    }

    struct Panics;

    #[async_trait]
    impl asynctasq_core::registry::TaskHandler for Panics {
        fn kind(&self) -> TaskKind {
            TaskKind::AsyncIo
        }

        async fn execute(&self, _envelope: &TaskEnvelope) -> Outcome {
            panic!("boom");
        }
    }

    fn envelope(class_path: &str, timeout_secs: Option<u64>) -> TaskEnvelope {
        TaskEnvelope::new(
            class_path,
            BTreeMap::new(),
            "default",
            3,
            asynctasq_core::envelope::RetryStrategy::Fixed,
            0,
            timeout_secs,
            30,
            None,
            0,
        )
    }

    fn executor_with(class_path: &str, handler: Arc<dyn asynctasq_core::registry::TaskHandler>) -> Executor {
        let mut registry = TaskRegistry::new();
        registry.register(class_path, handler);
        Executor::new(Arc::new(registry), Arc::new(Resolver::new()), None)
    }

    #[tokio::test]
    async fn unknown_class_path_is_non_retryable() {
        let executor = executor_with("demo.echo", Arc::new(Echo));
        let outcome = executor.run(&envelope("demo.missing", None)).await;
        assert!(matches!(outcome, Outcome::Err { retryable: false, .. }));
    }

    #[tokio::test]
    async fn successful_task_returns_its_result_bytes() {
        let executor = executor_with("demo.echo", Arc::new(Echo));
        let outcome = executor.run(&envelope("demo.echo", None)).await;
        assert!(matches!(outcome, Outcome::Ok(bytes) if bytes == b"ok"));
    }

    #[tokio::test]
    async fn timeout_elapsing_produces_timed_out() {
        let executor = executor_with("demo.sleep", Arc::new(SleepsForever));
        let outcome = executor.run(&envelope("demo.sleep", Some(1))).await;
        assert!(matches!(outcome, Outcome::TimedOut));
    }

    #[tokio::test]
    async fn handler_panic_is_isolated_as_a_non_retryable_error() {
        let executor = executor_with("demo.panics", Arc::new(Panics));
        let outcome = executor.run(&envelope("demo.panics", None)).await;
        assert!(matches!(outcome, Outcome::Err { retryable: false, .. }));
    }
}
