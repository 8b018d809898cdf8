//! Conductor - Main Entry Point
//! Wires the SQLite store, in-process lock and pubsub, executor and scheduler.

mod config;
mod telemetry;

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinError;
use tracing::{error, info, warn};

use conductor_core::application::constants::DEFAULT_RETRY_BASE_DELAY_MS;
use conductor_core::application::maintenance::register_purge;
use conductor_core::application::{
    shutdown_channel, BackgroundServiceRunner, Executor, PurgeHandler, RetryPolicy, Scheduler,
    SchedulerService,
};
use conductor_core::port::id_provider::{replica_id, UuidProvider};
use conductor_core::port::time_provider::SystemTimeProvider;
use conductor_core::port::{JobStore, TimeProvider};
use conductor_infra_memory::{InMemoryMutexManager, InMemoryPubSub};
use conductor_infra_sqlite::{create_pool, run_migrations, SqliteJobStore};

use crate::config::Settings;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// How long running jobs get to settle after Ctrl+C
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Initialize logging
    let _log_guard = telemetry::init_tracing()?;

    info!("Conductor v{} starting...", VERSION);

    // 2. Load configuration
    let settings = Settings::load().context("failed to load configuration")?;
    settings.validate()?;

    info!(
        database_url = %settings.database_url,
        lock_namespace = %settings.lock.namespace,
        pubsub_namespace = %settings.pubsub.namespace,
        leader_only = settings.jobs.leader_only,
        "Configuration loaded"
    );

    // 3. Initialize database
    let pool = create_pool(&settings.database_url)
        .await
        .context("DB pool creation failed")?;
    run_migrations(&pool).await.context("Migration failed")?;

    // 4. Setup dependencies (DI wiring)
    let time_provider: Arc<dyn TimeProvider> = Arc::new(SystemTimeProvider);
    let host = std::env::var("HOSTNAME").unwrap_or_default();
    let replica = replica_id(&host, &UuidProvider);

    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::new(pool.clone()));
    let mutexes = Arc::new(InMemoryMutexManager::new(settings.lock_config()));
    let pubsub = Arc::new(InMemoryPubSub::new(settings.pubsub_config()));
    let retry_policy = Arc::new(RetryPolicy::new(
        time_provider.clone(),
        DEFAULT_RETRY_BASE_DELAY_MS,
    ));

    let executor = Arc::new(Executor::new(
        replica.clone(),
        store.clone(),
        pubsub.clone(),
        time_provider.clone(),
        retry_policy,
    ));
    let cancellations = executor.subscribe_cancellations(pubsub.as_ref()).await;

    let scheduler = Arc::new(Scheduler::new(
        store.clone(),
        executor.clone(),
        pubsub.clone(),
        time_provider.clone(),
    ));

    // 5. Built-in maintenance job
    let purge = PurgeHandler::new(
        store.clone(),
        mutexes.clone(),
        time_provider.clone(),
        settings.retention(),
    );
    register_purge(&scheduler, purge, &settings.jobs.purge_cron)
        .await
        .context("failed to register the purge job")?;

    // 6. Start the scheduling loop
    let (shutdown_tx, shutdown) = shutdown_channel();

    let mut engine = if settings.jobs.leader_only {
        info!("Starting scheduler under leader election...");
        let service = SchedulerService::new(scheduler.clone()).with_wait_for(settings.background_poll());
        let runner = BackgroundServiceRunner::new(mutexes.clone()).with_service(Arc::new(service));
        tokio::spawn(async move { runner.run(shutdown).await })
    } else {
        info!("Starting scheduler...");
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run(shutdown).await })
    };

    info!(replica = %replica, "System ready. Waiting for jobs...");
    info!("Press Ctrl+C to shutdown");

    // 7. Wait for shutdown signal or an engine failure
    let outcome = tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutdown signal received. Exiting gracefully...");
            shutdown_tx.shutdown();
            match tokio::time::timeout(SHUTDOWN_GRACE, &mut engine).await {
                Ok(joined) => engine_result(joined),
                Err(_) => {
                    warn!(running = executor.running_count(), "Scheduler did not stop in time");
                    engine.abort();
                    Ok(())
                }
            }
        }
        joined = &mut engine => {
            let result = engine_result(joined);
            if result.is_ok() {
                warn!("Scheduler stopped without a shutdown signal");
            }
            result
        }
    };

    // 8. Release resources
    if let Err(e) = cancellations.close() {
        warn!(error = %e, "Failed to close cancel subscription");
    }
    pool.close().await;

    if let Err(e) = &outcome {
        error!(error = ?e, "Scheduler failed");
    }
    info!("Shutdown complete.");

    outcome
}

fn engine_result(joined: std::result::Result<conductor_core::Result<()>, JoinError>) -> Result<()> {
    joined
        .context("scheduler task panicked")?
        .context("scheduler loop failed")
}
