//! Payment worker service
//!
//! Runs the outgoing payment engine's worker pool against the configured
//! database and capability services.

use anyhow::{Context, Result};
use futures_util::future::join_all;
use payment_engine::spawn_workers;
use shared::{db, Config};
use tokio::signal;
use tokio_util::sync::CancellationToken;

mod adapters;

/// Hostname for worker instance tracking in logs
fn get_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    shared::init_tracing();

    tracing::info!(instance = %get_hostname(), "Starting Payment Worker...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;

    // Create database connection pool
    let db_pool = db::create_pool(&config.database)
        .await
        .context("Failed to create database pool")?;

    // Apply migrations and check health
    db::run_migrations(&db_pool)
        .await
        .context("Failed to run database migrations")?;
    db::check_health(&db_pool)
        .await
        .context("Database health check failed")?;

    // Wire the capability adapters from the service endpoints
    let deps = adapters::build_deps(&config.services)
        .context("Failed to build capability adapters")?;

    // Start the worker pool
    let shutdown = CancellationToken::new();
    let workers = spawn_workers(db_pool, deps, config.engine.clone(), shutdown.clone());

    tracing::info!(
        worker_count = config.engine.worker_count,
        "Payment Worker ready"
    );

    // Wait for shutdown signal
    signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    tracing::info!("Shutdown signal received, stopping Payment Worker...");

    // Workers release any held row lock and exit at the next check
    shutdown.cancel();
    for result in join_all(workers).await {
        if let Err(e) = result {
            tracing::error!("Worker task panicked: {}", e);
        }
    }

    tracing::info!("Payment Worker stopped");
    Ok(())
}
