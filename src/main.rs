//! Hookguard inbound bot event service.
//!
//! Main entry point. Wires storage, handlers and the HTTP surface, runs the
//! pending sweeper and delayed job runner beside the server, and coordinates
//! graceful shutdown of all three.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use hookguard_api::{create_router_with_timeout, shutdown_signal, AppState, Config};
use hookguard_core::{storage::Storage, Clock, RealClock};
use hookguard_processing::{
    handlers::{
        books::{ensure_book_schema, PgPurchaseBook, PgRepairBook},
        register_reference_handlers, ReferenceCollaborators,
    },
    scheduler::PURCHASE_FOLLOW_UP,
    DelayedJobScheduler, EventService, EventStorage, FollowUpExecutor, HandlerRegistry,
    HttpNotifier, JobRunner, JobStorage, LogNotifier, Notifier, PendingSweeper,
    PostgresEventStorage, PostgresJobStorage, ServiceParts,
};
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    let pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    let storage = Arc::new(Storage::new(pool.clone()));
    storage.migrate().await.context("Failed to run event log migrations")?;
    ensure_book_schema(&pool).await.context("Failed to prepare business tables")?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let events: Arc<dyn EventStorage> = Arc::new(PostgresEventStorage::new(storage.clone()));
    let jobs: Arc<dyn JobStorage> = Arc::new(PostgresJobStorage::new(storage.clone()));
    let notifier = build_notifier(&config)?;
    let scheduler = DelayedJobScheduler::new(jobs.clone(), clock.clone());

    let mut registry = HandlerRegistry::new();
    register_reference_handlers(&mut registry, &ReferenceCollaborators {
        purchases: Arc::new(PgPurchaseBook::new(pool.clone())),
        repairs: Arc::new(PgRepairBook::new(pool.clone())),
        notifier: notifier.clone(),
        scheduler: Some(scheduler.clone()),
        follow_up_delay: config.follow_up_delay(),
        clock: clock.clone(),
    });
    info!(handlers = ?registry.registered(), "Handlers registered");

    let service = EventService::new(ServiceParts {
        storage: events.clone(),
        registry: Arc::new(registry),
        verifier: config.signature_verifier(),
        tokens: config.confirmation_tokens(),
        clock: clock.clone(),
        store_retry: config.store_retry(),
    });

    let shutdown = CancellationToken::new();

    let sweeper = PendingSweeper::new(
        events,
        service.dispatcher().clone(),
        clock.clone(),
        config.sweeper_config(),
        shutdown.child_token(),
    );
    let sweeper_handle = tokio::spawn(async move { sweeper.run().await });

    let runner = JobRunner::new(jobs, clock, config.runner_config(), shutdown.child_token())
        .with_executor(PURCHASE_FOLLOW_UP, Arc::new(FollowUpExecutor::new(notifier)));
    let runner_handle = tokio::spawn(async move { runner.run().await });

    let operators = config.operator_keys()?;
    if operators.is_empty() {
        warn!("No operator keys configured; operator endpoints will reject every request");
    }
    let state = AppState::new(service, scheduler, operators)
        .with_max_payload_bytes(config.max_payload_bytes)
        .with_signature_header(&config.signature_header);
    let router =
        create_router_with_timeout(state, Duration::from_secs(config.request_timeout));
    let addr = config.parse_server_addr()?;

    let server_handle = tokio::spawn({
        let stop = shutdown.clone();
        async move {
            if let Err(e) =
                hookguard_api::start_server(router, addr, stop.cancelled_owned()).await
            {
                error!(error = %e, "Server failed");
            }
        }
    });

    info!(%addr, "Hookguard is ready to receive events");

    shutdown_signal().await;
    shutdown.cancel();

    let drained = async {
        let _ = tokio::join!(server_handle, sweeper_handle, runner_handle);
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drained).await.is_err() {
        warn!("Shutdown grace period expired");
    }

    pool.close().await;
    info!("Hookguard shutdown complete");
    Ok(())
}

/// Initializes tracing; `RUST_LOG` wins over the configured filter.
fn init_tracing(default_filter: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    match config.notification_url.as_deref().filter(|url| !url.is_empty()) {
        Some(url) => {
            let timeout = Duration::from_secs(config.notification_timeout_seconds);
            let notifier = HttpNotifier::new(url, timeout)
                .context("Failed to build notification client")?;
            info!(%url, "Notifications delivered over HTTP");
            Ok(Arc::new(notifier))
        },
        None => {
            info!("No notification URL configured; notifications are logged only");
            Ok(Arc::new(LogNotifier))
        },
    }
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    const RETRY_DELAY: Duration = Duration::from_secs(2);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;
                return Ok(pool);
            },
            Err(e) if attempt < config.database_connect_attempts => {
                warn!(
                    attempt,
                    max_attempts = config.database_connect_attempts,
                    error = %e,
                    "Database connection failed, retrying"
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}
