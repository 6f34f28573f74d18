//! CLI front-end over the dispatcher: enqueues one task from the
//! command line, mainly useful for smoke-testing a deployment without
//! writing a producer program.

use std::collections::BTreeMap;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context;
use asynctasq_core::events::EventBus;
use asynctasq_core::value::Value;
use asynctasq_worker::config::{CliOverrides, Config};
use asynctasq_worker::dispatcher::{DispatchOptions, Dispatcher, DispatcherDefaults};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
struct Cli {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<String>,

    /// Overrides `driver.backend`.
    #[clap(long)]
    backend: Option<String>,

    /// Registry key of the handler to invoke.
    class_path: String,

    /// Task arguments as a JSON object, e.g. '{"user_id": 42}'.
    #[clap(long, default_value = "{}")]
    args: String,

    /// Destination queue; defaults to the dispatcher's default queue.
    #[clap(long)]
    queue: Option<String>,

    /// Delay, in seconds, before the task becomes visible.
    #[clap(long, default_value_t = 0)]
    delay_secs: u64,

    /// Overrides the task's maximum attempt count.
    #[clap(long)]
    max_attempts: Option<u32>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Config::load(
        cli.config.clone(),
        CliOverrides {
            backend: cli.backend.clone(),
            queues: None,
            max_in_flight: None,
        },
    );
    config.validate();

    match run(&config, &cli).await {
        Ok(id) => {
            info!(task_id = %id, "task dispatched");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("dispatch failed: {err:?}");
            ExitCode::FAILURE
        }
    }
}

async fn run(config: &Config, cli: &Cli) -> anyhow::Result<uuid::Uuid> {
    let driver = build_driver(config).await?;
    let args_json: serde_json::Value = serde_json::from_str(&cli.args).context("parsing --args as JSON")?;
    let args = match json_to_value(args_json) {
        Value::Map(map) => map,
        _ => anyhow::bail!("--args must be a JSON object"),
    };

    let mut defaults = DispatcherDefaults::default();
    defaults.max_envelope_bytes = config.codec.max_envelope_bytes;
    let dispatcher = Dispatcher::new(driver, std::sync::Arc::new(EventBus::new()), defaults);

    let mut options = DispatchOptions::default().delay(Duration::from_secs(cli.delay_secs));
    if let Some(queue) = &cli.queue {
        options = options.queue(queue.clone());
    }
    if let Some(max_attempts) = cli.max_attempts {
        options = options.max_attempts(max_attempts);
    }

    let id = dispatcher.dispatch(cli.class_path.clone(), args, options).await?;
    Ok(id)
}

async fn build_driver(config: &Config) -> anyhow::Result<asynctasq_core::driver::DynDriver> {
    use std::sync::Arc;
    match config.driver.backend.as_str() {
        #[cfg(feature = "redis-driver")]
        "redis" => Ok(Arc::new(
            asynctasq_drivers::RedisDriver::connect_url(
                config.driver.redis.url.expose_secret(),
                Duration::from_secs(config.driver.visibility_timeout_secs),
            )
            .await
            .context("connecting redis driver")?,
        )),
        #[cfg(feature = "sql-postgres")]
        "sql-postgres" => Ok(Arc::new(
            asynctasq_drivers::SqlPostgresDriver::connect(
                config.driver.sql.database_url.expose_secret(),
                Duration::from_secs(config.driver.visibility_timeout_secs),
                config.driver.keep_completed_tasks,
            )
            .await
            .context("connecting postgres driver")?,
        )),
        #[cfg(feature = "sql-mysql")]
        "sql-mysql" => Ok(Arc::new(
            asynctasq_drivers::SqlMysqlDriver::connect(
                config.driver.sql.database_url.expose_secret(),
                Duration::from_secs(config.driver.visibility_timeout_secs),
                config.driver.keep_completed_tasks,
            )
            .await
            .context("connecting mysql driver")?,
        )),
        #[cfg(feature = "sqs-driver")]
        "sqs" => Ok(Arc::new(asynctasq_drivers::SqsDriver::connect().await.context("connecting sqs driver")?)),
        #[cfg(feature = "amqp-driver")]
        "amqp" => Ok(Arc::new(
            asynctasq_drivers::AmqpDriver::connect(config.driver.amqp.uri.expose_secret(), config.driver.amqp.prefetch)
                .await
                .context("connecting amqp driver")?,
        )),
        other => anyhow::bail!("driver backend '{other}' is not compiled into this binary; enable its Cargo feature"),
    }
}

fn json_to_value(json: serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or(0.0))
            }
        }
        serde_json::Value::String(s) => Value::Str(s),
        serde_json::Value::Array(items) => Value::Seq(items.into_iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => {
            let map: BTreeMap<String, Value> = map.into_iter().map(|(k, v)| (k, json_to_value(v))).collect();
            Value::Map(map)
        }
    }
}
