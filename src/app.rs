use crate::cli::Args;
use crate::config::Config;
use crate::logging::setup_logging;
use crate::runtime::QueueRuntime;
use crate::status::ServiceStatusRegistry;
use crate::supervisor::Supervisor;
use crate::telemetry::TelemetryRegistry;
use crate::worker::WorkerRegistry;
use anyhow::Context;
use figment::{Figment, providers::Env, providers::Format, providers::Toml};
use sqlx::postgres::PgPoolOptions;
use std::process::ExitCode;
use std::time::Duration;
use tracing::info;

/// Main application struct containing all necessary components.
pub struct App {
    config: Config,
    db_pool: sqlx::PgPool,
    supervisor: Supervisor,
    statuses: ServiceStatusRegistry,
}

impl App {
    /// Load configuration, connect to the database, run migrations, and
    /// wire up the queue runtime.
    ///
    /// `registry` carries the embedding application's workers; the bundled
    /// binary runs with an empty one, acting as a staging/retention node.
    pub async fn new(
        args: &Args,
        registry: WorkerRegistry,
        telemetry: TelemetryRegistry,
    ) -> Result<Self, anyhow::Error> {
        let config: Config = Figment::new()
            .merge(Toml::file("stoker.toml"))
            .merge(Env::raw().split("__"))
            .extract()
            .context("failed to load config")?;

        config.validate().context("invalid configuration")?;

        setup_logging(&config, args.tracing.clone());

        info!(
            version = env!("CARGO_PKG_VERSION"),
            name = %config.name,
            node = %config.node,
            environment = if cfg!(debug_assertions) { "development" } else { "production" },
            "starting stoker"
        );

        let db_pool = PgPoolOptions::new()
            .min_connections(0)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(4))
            .idle_timeout(Duration::from_secs(60 * 2))
            .max_lifetime(Duration::from_secs(60 * 30))
            .connect(&config.database_url)
            .await
            .context("failed to create database pool")?;

        sqlx::migrate!("./migrations")
            .run(&db_pool)
            .await
            .context("failed to run database migrations")?;

        info!(
            queues = ?config.queues,
            shutdown_timeout = format!("{:.2?}", config.shutdown_timeout),
            "configuration loaded"
        );

        let statuses = ServiceStatusRegistry::new();

        let runtime = QueueRuntime::new(
            config.clone(),
            db_pool.clone(),
            registry,
            telemetry,
            statuses.clone(),
        );
        let supervisor = Supervisor::new(runtime, config.shutdown_timeout);

        Ok(App {
            config,
            db_pool,
            supervisor,
            statuses,
        })
    }

    /// Run the node until a signal arrives or the runtime dies.
    pub async fn run(self) -> ExitCode {
        self.supervisor.run().await
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn db_pool(&self) -> &sqlx::PgPool {
        &self.db_pool
    }

    pub fn statuses(&self) -> &ServiceStatusRegistry {
        &self.statuses
    }
}
