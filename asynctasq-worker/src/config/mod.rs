//! Layered configuration: defaults embedded at compile time, overridden by
//! an optional file, then environment variables, then explicit CLI flags —
//! so the worker binaries have somewhere to put connection strings and
//! tuning knobs.

use config::FileFormat;
use lazy_static_include::*;
use redact::Secret;
use serde_derive::Deserialize;
use tracing::debug;

lazy_static_include_str! {
    DEFAULT_CONFIG => "src/config/default.toml",
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Config {
    pub worker: WorkerConfig,
    pub driver: DriverConfig,
    pub codec: CodecConfig,
    pub retry: RetryConfig,
    pub process_pool: ProcessPoolConfig,
    pub prometheus: PrometheusConfig,
    pub events: EventsConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub queues: Vec<String>,
    pub max_in_flight: usize,
    pub poll_wait_secs: u64,
    pub shutdown_grace_secs: u64,
    pub liveness_check_interval_secs: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub backend: String,
    pub visibility_timeout_secs: u64,
    pub keep_completed_tasks: bool,
    pub redis: RedisConfig,
    pub sql: SqlConfig,
    pub sqs: SqsConfig,
    pub amqp: AmqpConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RedisConfig {
    pub url: Secret<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SqlConfig {
    pub database_url: Secret<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct SqsConfig {
    pub region: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct AmqpConfig {
    pub uri: Secret<String>,
    pub prefetch: u16,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CodecConfig {
    pub max_envelope_bytes: usize,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub decode_error_retry_delay_secs: u64,
    pub exponential_ceiling_secs: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ProcessPoolConfig {
    pub enabled: bool,
    pub size: usize,
    pub max_tasks_per_worker: u32,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PrometheusConfig {
    pub port: u16,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct EventsConfig {
    pub redis_pubsub_enabled: bool,
    pub redis_pubsub_channel_prefix: String,
}

/// CLI flags that may override a config-file/env value; applied last.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub backend: Option<String>,
    pub queues: Option<Vec<String>>,
    pub max_in_flight: Option<usize>,
}

impl Config {
    pub fn load(local_file: Option<String>, overrides: CliOverrides) -> Config {
        let mut builder = config::Config::builder()
            .add_source(config::File::from_str(&DEFAULT_CONFIG, FileFormat::Toml));

        if let Some(local_file) = local_file {
            debug!("loading local configuration from {}", local_file);
            builder = builder.add_source(config::File::with_name(&local_file).required(false));
        }

        let builder = builder
            .add_source(
                config::Environment::default()
                    .prefix("ASYNCTASQ")
                    .separator("__")
                    .ignore_empty(true),
            )
            .build()
            .expect("could not build configuration sources");

        let mut config: Config = builder
            .try_deserialize()
            .expect("could not deserialize configuration");

        if let Some(backend) = overrides.backend {
            config.driver.backend = backend;
        }
        if let Some(queues) = overrides.queues {
            config.worker.queues = queues;
        }
        if let Some(max_in_flight) = overrides.max_in_flight {
            config.worker.max_in_flight = max_in_flight;
        }

        config
    }

    pub fn validate(&self) {
        assert!(!self.worker.queues.is_empty(), "at least one queue is required");
        assert!(self.worker.max_in_flight > 0, "max_in_flight must be positive");
        assert!(
            self.driver.visibility_timeout_secs > 0,
            "visibility_timeout_secs must be positive"
        );
        assert!(
            matches!(
                self.driver.backend.as_str(),
                "redis" | "sql-postgres" | "sql-mysql" | "sqs" | "amqp"
            ),
            "unknown driver backend: {}",
            self.driver.backend
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_load_and_validate() {
        let config = Config::load(None, CliOverrides::default());
        config.validate();
        assert_eq!(config.worker.queues, vec!["default".to_string()]);
        assert_eq!(config.driver.backend, "redis");
    }

    #[test]
    fn cli_overrides_take_precedence() {
        let config = Config::load(
            None,
            CliOverrides {
                backend: Some("amqp".to_string()),
                queues: Some(vec!["high".to_string(), "low".to_string()]),
                max_in_flight: Some(8),
            },
        );
        assert_eq!(config.driver.backend, "amqp");
        assert_eq!(config.worker.queues, vec!["high", "low"]);
        assert_eq!(config.worker.max_in_flight, 8);
    }
}
