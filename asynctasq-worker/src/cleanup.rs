//! Orderly shutdown hook registry, run as the last step of the worker's
//! shutdown protocol: once `driver.close()` has returned and the event bus
//! has flushed, every registered hook runs once, in reverse registration
//! order (last acquired, first released), so a hook that depends on one
//! registered earlier always runs first.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt;
use tracing::{error, info};

type CleanupHook = Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = ()> + Send>> + Send>;

/// A queue of shutdown actions, executed LIFO by [`CleanupRegistry::run_all`].
#[derive(Default)]
pub struct CleanupRegistry {
    hooks: Vec<CleanupHook>,
}

impl CleanupRegistry {
    pub fn new() -> Self {
        CleanupRegistry { hooks: Vec::new() }
    }

    /// Registers an async cleanup action, e.g. closing a secondary
    /// connection pool or flushing a metrics exporter.
    pub fn register<F, Fut>(&mut self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.hooks.push(Box::new(move || Box::pin(hook())));
    }

    /// Runs every hook, most-recently-registered first. A hook that panics
    /// is caught and logged; it does not prevent the remaining hooks from
    /// running.
    pub async fn run_all(mut self) {
        while let Some(hook) = self.hooks.pop() {
            if let Err(panic) = AssertUnwindSafe(hook()).catch_unwind().await {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "<non-string panic payload>".to_string());
                error!(error = %message, "cleanup hook panicked");
            }
        }
        info!("all cleanup hooks completed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn hooks_run_in_reverse_registration_order() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut registry = CleanupRegistry::new();

        let order1 = order.clone();
        registry.register(move || async move {
            order1.lock().unwrap().push(1);
        });
        let order2 = order.clone();
        registry.register(move || async move {
            order2.lock().unwrap().push(2);
        });

        registry.run_all().await;
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[tokio::test]
    async fn a_panicking_hook_does_not_stop_the_rest() {
        let ran = Arc::new(AtomicUsize::new(0));
        let mut registry = CleanupRegistry::new();

        registry.register(|| async {
            panic!("boom");
        });
        let ran2 = ran.clone();
        registry.register(move || async move {
            ran2.fetch_add(1, Ordering::SeqCst);
        });

        registry.run_all().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }
}
