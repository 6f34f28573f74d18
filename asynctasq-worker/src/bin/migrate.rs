//! Standalone entry point for schema migrations: runs the idempotent SQL
//! DDL for whichever backend is configured, then exits. Safe to run
//! repeatedly and safe to run against a database that already has the
//! schema.

use std::process::ExitCode;

use anyhow::Context;
use asynctasq_worker::config::{CliOverrides, Config};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Clone, Debug)]
struct Cli {
    /// Path to the configuration file.
    #[clap(short, long)]
    config: Option<String>,

    /// Overrides `driver.backend`; must be `sql-postgres` or `sql-mysql`.
    #[clap(long)]
    backend: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = Config::load(
        cli.config,
        CliOverrides {
            backend: cli.backend,
            queues: None,
            max_in_flight: None,
        },
    );
    config.validate();

    if let Err(err) = run(&config).await {
        error!("migration failed: {err:?}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

async fn run(config: &asynctasq_worker::config::Config) -> anyhow::Result<()> {
    match config.driver.backend.as_str() {
        #[cfg(feature = "sql-postgres")]
        "sql-postgres" => {
            let pool = sqlx::postgres::PgPoolOptions::new()
                .connect(config.driver.sql.database_url.expose_secret())
                .await
                .context("connecting to postgres")?;
            asynctasq_drivers::sql::migrator::migrate_postgres(&pool)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            info!("postgres schema is up to date");
            Ok(())
        }
        #[cfg(feature = "sql-mysql")]
        "sql-mysql" => {
            let pool = sqlx::mysql::MySqlPoolOptions::new()
                .connect(config.driver.sql.database_url.expose_secret())
                .await
                .context("connecting to mysql")?;
            asynctasq_drivers::sql::migrator::migrate_mysql(&pool)
                .await
                .map_err(|e| anyhow::anyhow!(e))?;
            info!("mysql schema is up to date");
            Ok(())
        }
        other => anyhow::bail!("'{other}' has no migration step; only sql-postgres and sql-mysql do"),
    }
}
