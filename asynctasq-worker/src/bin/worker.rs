use std::fs;
use std::io::Write;
use std::panic;
use std::path::Path;
use std::process::ExitCode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use asynctasq_core::driver::DynDriver;
use asynctasq_core::error::DriverError;
use asynctasq_core::events::{EventBus, TracingSink};
use asynctasq_core::registry::TaskRegistry;
use asynctasq_core::resolver::Resolver;
use asynctasq_worker::cleanup::CleanupRegistry;
use asynctasq_worker::config::{CliOverrides, Config};
use asynctasq_worker::executor::Executor;
use asynctasq_worker::metrics::{Metrics, MetricsSink};
use asynctasq_worker::pool::ProcessPool;
use asynctasq_worker::worker::{Worker, WorkerConfig as RuntimeWorkerConfig};
use backtrace::Backtrace;
use clap::Parser;
use mimalloc::MiMalloc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing::{debug, error, info};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;
use warp::Filter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Clone, Debug)]
struct Cli {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<String>,

    /// If set, output logs in JSON format.
    #[clap(short, long, action)]
    json: bool,

    /// Overrides `driver.backend`.
    #[clap(long)]
    backend: Option<String>,

    /// Overrides `worker.queues` (comma-separated, priority-ordered).
    #[clap(long, value_delimiter = ',')]
    queues: Option<Vec<String>>,

    /// Overrides `worker.max_in_flight`.
    #[clap(long)]
    concurrency: Option<usize>,

    /// Path to write a termination reason to on fatal exit, for container
    /// orchestrators that surface it (e.g. Kubernetes' termination log).
    #[clap(long)]
    exit_reason_path: Option<String>,
}

fn setup_logging(json: bool) {
    if json {
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("setting up logging failed");
    } else {
        let subscriber = tracing_subscriber::fmt()
            .pretty()
            .compact()
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .finish();
        tracing::subscriber::set_global_default(subscriber).expect("setting up logging failed");
    }
}

/// Saves `reason` to `path`, best-effort, for container orchestrators that
/// surface a termination log (e.g. Kubernetes' `/dev/termination-log`).
fn exit_reason(path: &str, reason: impl AsRef<str>) {
    if let Some(parent) = Path::new(path).parent() {
        let _ = fs::create_dir_all(parent);
    }
    if let Ok(mut file) = fs::OpenOptions::new().create(true).truncate(true).write(true).open(path) {
        let _ = file.write_all(reason.as_ref().as_bytes());
        let _ = file.sync_data();
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Child processes are re-exec'd as `current_exe --cpu-worker`, a flag
    // `Cli` doesn't know about; detect and branch before clap ever sees it.
    if std::env::args().any(|a| a == "--cpu-worker") {
        setup_logging(false);
        let registry = Arc::new(TaskRegistry::new());
        asynctasq_worker::pool::run_cpu_child(registry).await;
        return ExitCode::SUCCESS;
    }

    let cli = Cli::parse();
    setup_logging(cli.json);

    panic::set_hook(Box::new(|panic_info| {
        let msg = match panic_info.payload().downcast_ref::<&'static str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => &s[..],
                None => "Box<dyn Any>",
            },
        };
        let (file, lineno, col) = match panic_info.location() {
            Some(l) => (l.file(), l.line(), l.column()),
            None => ("<unknown>", 0, 0),
        };
        error!(msg, file, lineno, col, "panic occurred: {:?}", Backtrace::new());
    }));

    let overrides = CliOverrides {
        backend: cli.backend.clone(),
        queues: cli.queues.clone(),
        max_in_flight: cli.concurrency,
    };
    let config = Config::load(cli.config.clone(), overrides);
    config.validate();
    debug!("loaded configuration: {:?}", config);

    if let Err(err) = run(&config).await {
        if let Some(path) = &cli.exit_reason_path {
            exit_reason(path, format!("worker exited due to an error: {err:?}"));
        }
        error!("worker exited due to an error: {err:?}");
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}

async fn build_driver(config: &Config) -> anyhow::Result<DynDriver> {
    match config.driver.backend.as_str() {
        #[cfg(feature = "redis-driver")]
        "redis" => {
            let driver = asynctasq_drivers::RedisDriver::connect_url(
                config.driver.redis.url.expose_secret(),
                Duration::from_secs(config.driver.visibility_timeout_secs),
            )
            .await
            .context("connecting redis driver")?;
            Ok(Arc::new(driver))
        }
        #[cfg(feature = "sql-postgres")]
        "sql-postgres" => {
            let driver = asynctasq_drivers::SqlPostgresDriver::connect(
                config.driver.sql.database_url.expose_secret(),
                Duration::from_secs(config.driver.visibility_timeout_secs),
                config.driver.keep_completed_tasks,
            )
            .await
            .context("connecting postgres driver")?;
            Ok(Arc::new(driver))
        }
        #[cfg(feature = "sql-mysql")]
        "sql-mysql" => {
            let driver = asynctasq_drivers::SqlMysqlDriver::connect(
                config.driver.sql.database_url.expose_secret(),
                Duration::from_secs(config.driver.visibility_timeout_secs),
                config.driver.keep_completed_tasks,
            )
            .await
            .context("connecting mysql driver")?;
            Ok(Arc::new(driver))
        }
        #[cfg(feature = "sqs-driver")]
        "sqs" => {
            let driver = asynctasq_drivers::SqsDriver::connect().await.context("connecting sqs driver")?;
            Ok(Arc::new(driver))
        }
        #[cfg(feature = "amqp-driver")]
        "amqp" => {
            let driver = asynctasq_drivers::AmqpDriver::connect(config.driver.amqp.uri.expose_secret(), config.driver.amqp.prefetch)
                .await
                .context("connecting amqp driver")?;
            Ok(Arc::new(driver))
        }
        other => anyhow::bail!(
            "driver backend '{other}' is not compiled into this binary; enable its Cargo feature"
        ),
    }
}

async fn run(config: &Config) -> anyhow::Result<()> {
    let version = env!("CARGO_PKG_VERSION");
    info!(version, backend = %config.driver.backend, "starting worker");

    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.prometheus.port))
        .install()
        .context("setting up Prometheus")?;

    let driver = build_driver(config).await?;
    driver.connect().await.map_err(|err: DriverError| anyhow::anyhow!(err))?;

    let mut events = EventBus::new();
    events.register(Arc::new(TracingSink));
    events.register(Arc::new(MetricsSink(Metrics::new())));
    #[cfg(feature = "redis-driver")]
    if config.events.redis_pubsub_enabled {
        let sink = asynctasq_drivers::RedisPubSubSink::connect(
            config.driver.redis.url.expose_secret(),
            config.events.redis_pubsub_channel_prefix.clone(),
        )
        .await
        .context("connecting redis pub/sub event sink")?;
        events.register(Arc::new(sink));
    }
    let events = Arc::new(events);

    // Task handlers are registered by the embedding application before this
    // binary is built from the workspace; none are known here.
    let registry = Arc::new(TaskRegistry::new());
    let resolver = Arc::new(Resolver::new());

    let process_pool = if config.process_pool.enabled {
        let pool = ProcessPool::spawn(
            config.process_pool.size,
            "--cpu-worker",
            config.process_pool.max_tasks_per_worker,
        )
        .await
        .context("spawning process pool")?;
        Some(Arc::new(pool))
    } else {
        None
    };

    let mut cleanup = CleanupRegistry::new();
    if let Some(pool) = process_pool.clone() {
        cleanup.register(move || async move {
            pool.shutdown().await;
        });
    }

    let executor = Arc::new(Executor::new(registry, resolver, process_pool));

    let last_task_processed = Arc::new(AtomicU64::new(now_secs()));
    let liveness_check_interval = config.worker.liveness_check_interval_secs;
    let readiness_last_task_processed = last_task_processed.clone();
    tokio::spawn(async move {
        let readiness_route = warp::path!("readiness").map(|| warp::reply::with_status("OK", warp::http::StatusCode::OK));
        let liveness_route = warp::path!("liveness").map(move || {
            let last_processed = readiness_last_task_processed.load(Ordering::Relaxed);
            let now = now_secs();
            if now.saturating_sub(last_processed) <= liveness_check_interval {
                warp::reply::with_status("OK", warp::http::StatusCode::OK)
            } else {
                warp::reply::with_status("FAIL", warp::http::StatusCode::INTERNAL_SERVER_ERROR)
            }
        });
        let routes = readiness_route.or(liveness_route);
        warp::serve(routes).run(([0, 0, 0, 0], 8081)).await;
    });

    let requires_lease_renewal = driver.requires_lease_renewal();
    let runtime_config = RuntimeWorkerConfig {
        queues: config.worker.queues.clone(),
        concurrency: config.worker.max_in_flight,
        shutdown_grace: Duration::from_secs(config.worker.shutdown_grace_secs),
        lease_renewal_interval: requires_lease_renewal
            .then(|| Duration::from_secs(config.driver.visibility_timeout_secs / 3).max(Duration::from_secs(1))),
        poll_wait: Duration::from_secs(config.worker.poll_wait_secs).min(Duration::from_secs(1)),
    };
    let worker = Worker::new(driver, executor, events, runtime_config);

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("received shutdown signal");
        signal_token.cancel();
    });

    worker.run(shutdown).await;
    cleanup.run_all().await;
    Ok(())
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
