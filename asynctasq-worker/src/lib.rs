//! Worker runtime, executor, dispatcher and process pool for the
//! asynctasq task queue — the binaries in `src/bin/` are thin front-ends
//! over these modules.

pub mod cleanup;
pub mod config;
pub mod dispatcher;
pub mod executor;
pub mod metrics;
pub mod pool;
pub mod worker;

pub use dispatcher::{dispatch, install_default, DispatchOptions, Dispatcher, DispatcherDefaults};
pub use executor::Executor;
pub use worker::{Worker, WorkerConfig};
