//! Database connection pool management
//!
//! The pool is created once at startup. The first connection is retried with
//! exponential backoff so the service can start before Postgres is ready.

use backoff::{future::retry, ExponentialBackoff};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::ConnectOptions;
use std::str::FromStr;
use std::time::Duration;

use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

pub type DbPool = PgPool;

/// Longest time spent waiting for the database at startup
const CONNECT_MAX_ELAPSED: Duration = Duration::from_secs(60);

/// Connect, retrying until Postgres answers `SELECT 1` or the backoff gives up
pub async fn create_pool(config: &DatabaseConfig) -> Result<DbPool> {
    let connect_options = PgConnectOptions::from_str(&config.url)
        .map_err(|e| Error::config(format!("Invalid database URL: {}", e)))?
        .application_name("order-ingest")
        .log_statements(tracing::log::LevelFilter::Debug)
        .statement_cache_capacity(100);

    let pool_options = PgPoolOptions::new()
        .max_connections(config.pool_max_size)
        .min_connections(config.pool_min_idle)
        .acquire_timeout(config.pool_timeout())
        .idle_timeout(Some(config.idle_timeout()))
        .test_before_acquire(true)
        .max_lifetime(Some(Duration::from_secs(3600)));

    let backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(500),
        max_interval: Duration::from_secs(10),
        max_elapsed_time: Some(CONNECT_MAX_ELAPSED),
        ..Default::default()
    };

    let pool = retry(backoff, || async {
        let pool = pool_options
            .clone()
            .connect_with(connect_options.clone())
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Database not reachable yet, retrying");
                backoff::Error::transient(e)
            })?;

        sqlx::query("SELECT 1")
            .fetch_one(&pool)
            .await
            .map_err(backoff::Error::transient)?;

        Ok::<_, backoff::Error<sqlx::Error>>(pool)
    })
    .await
    .map_err(|e| Error::database(format!("Failed to create connection pool: {}", e)))?;

    tracing::info!(
        max_connections = config.pool_max_size,
        min_idle = config.pool_min_idle,
        "Database connection pool created"
    );

    Ok(pool)
}
