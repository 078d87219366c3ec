//! Database module for order-ingest
//!
//! Connection pooling, migrations and the idempotent order repository.

pub mod order_repo;
pub mod pool;
pub mod repository;

// Re-export commonly used types
pub use order_repo::PgOrderRepository;
pub use pool::{create_pool, DbPool};
pub use repository::{
    OrderRecord, OrderRepository, Repository, RepositoryError, RepositoryResult, UpsertOutcome,
};

use sqlx::migrate::Migrator;

/// Database migrator for running schema migrations
pub static MIGRATOR: Migrator = sqlx::migrate!("./migrations");

/// Run database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    MIGRATOR.run(pool).await
}
