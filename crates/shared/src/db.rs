//! Database pool and migrations for the payments backend

use crate::config::DatabaseConfig;
use crate::error::Result;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

/// Type alias for the database pool
pub type DbPool = PgPool;

/// Connect a pool sized for the worker pool plus the command surface
///
/// Each worker holds one connection for the whole claim-dispatch-commit
/// transaction, so `max_connections` must at least cover the worker count;
/// the rest is headroom for command-surface calls. A short acquire timeout
/// keeps a saturated pool from stalling workers silently.
///
/// # Errors
///
/// Returns an error if the pool cannot be created or the connection fails
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(1)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.connection_url())
        .await?;

    tracing::info!(
        max_connections = config.max_connections,
        "database pool ready"
    );

    Ok(pool)
}

/// Apply pending migrations from the workspace `migrations/` directory
///
/// # Errors
///
/// Returns an error if a migration fails to apply
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    sqlx::migrate!("../../migrations")
        .run(pool)
        .await
        .map_err(sqlx::Error::from)?;

    tracing::info!("Database migrations applied");
    Ok(())
}

/// Verify the payments schema is reachable
///
/// Probes the `outgoing_payments` table rather than issuing a bare ping:
/// this runs after migrations, so a missing table is a deployment fault
/// worth failing startup over.
///
/// # Errors
///
/// Returns an error if the table cannot be queried
pub async fn check_health(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1 FROM outgoing_payments LIMIT 1")
        .execute(pool)
        .await?;
    Ok(())
}
