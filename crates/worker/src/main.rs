use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use waypoint_durable::{
    PostgresHistoryStore, PostgresResumeQueue, ResumeWorker, TimerScanner, WorkflowEngine,
};
use waypoint_worker::{register_all, telemetry, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine; variables may come from the environment
    let _ = dotenvy::dotenv();

    let config = WorkerConfig::from_env();
    telemetry::init_tracing(&config);

    tracing::info!(
        worker_id = %config.worker_id,
        max_concurrency = config.max_concurrency,
        "waypoint-worker starting..."
    );

    // Each execution keeps one connection for its instance lease and needs another for queries
    let pool = PgPoolOptions::new()
        .max_connections(config.max_concurrency as u32 * 2 + 4)
        .connect(&config.database_url)
        .await
        .context("Failed to connect to database")?;

    let store = Arc::new(PostgresHistoryStore::new(pool.clone()));
    if config.run_migrations {
        store
            .migrate()
            .await
            .context("Failed to run database migrations")?;
        tracing::info!("Database migrations applied");
    }
    let queue = Arc::new(PostgresResumeQueue::new(pool));

    let mut engine = WorkflowEngine::new(store, queue);
    register_all(&mut engine);
    let engine = Arc::new(engine);

    let worker = ResumeWorker::new(engine.clone(), config.resume_worker_config());
    let scanner = TimerScanner::new(engine, config.timer_scanner_config());

    worker.start().context("Failed to start resume worker")?;
    scanner.start();

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    scanner.shutdown().await;
    if let Err(e) = worker.shutdown().await {
        tracing::error!(error = %e, "Worker did not drain cleanly");
        return Err(e.into());
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
