//! PostgreSQL order repository
//!
//! Writes go through `INSERT ... ON CONFLICT (order_id) DO NOTHING` and are
//! never retried here: a failed write is reported to the pipeline, which
//! decides whether the message is redelivered. Reads are retried with
//! exponential backoff.

use async_trait::async_trait;
use backoff::{future::retry, ExponentialBackoff};
use sqlx::Row;
use std::time::Duration;

use crate::{
    db::{
        repository::{
            OrderRecord, OrderRepository, Repository, RepositoryError, RepositoryResult,
            UpsertOutcome,
        },
        DbPool,
    },
    logging::Timer,
    models::Money,
};

/// PostgreSQL implementation of [`OrderRepository`]
#[derive(Clone)]
pub struct PgOrderRepository {
    pool: DbPool,
    read_backoff: ExponentialBackoff,
}

impl PgOrderRepository {
    /// Create a new PostgreSQL order repository
    pub fn new(pool: DbPool) -> Self {
        Self {
            pool,
            read_backoff: ExponentialBackoff {
                initial_interval: Duration::from_millis(50),
                max_interval: Duration::from_secs(1),
                max_elapsed_time: Some(Duration::from_secs(5)),
                ..Default::default()
            },
        }
    }

    /// Run a read with retry on transient errors
    async fn read_with_retry<F, T>(&self, operation: F) -> RepositoryResult<T>
    where
        F: Fn() -> futures::future::BoxFuture<'static, Result<T, RepositoryError>>,
    {
        retry(self.read_backoff.clone(), || async {
            match operation().await {
                Ok(value) => Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::warn!(error = ?e, "Retrying database read");
                    Err(backoff::Error::transient(e))
                },
                Err(e) => Err(backoff::Error::permanent(e)),
            }
        })
        .await
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> RepositoryResult<OrderRecord> {
        Ok(OrderRecord {
            order_id: row.try_get("order_id")?,
            total: Money::from_cents(row.try_get("total_cents")?),
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl Repository for PgOrderRepository {
    type Entity = OrderRecord;
    type Id = String;

    async fn find_by_id(&self, id: String) -> RepositoryResult<Option<OrderRecord>> {
        let pool = self.pool.clone();

        self.read_with_retry(|| {
            let pool = pool.clone();
            let id = id.clone();
            Box::pin(async move {
                let row = sqlx::query(
                    r#"
                    SELECT order_id, (total * 100)::BIGINT AS total_cents, created_at
                    FROM orders
                    WHERE order_id = $1
                    "#,
                )
                .bind(id)
                .fetch_optional(&pool)
                .await?;

                row.as_ref().map(Self::row_to_record).transpose()
            })
        })
        .await
    }

    async fn exists(&self, id: String) -> RepositoryResult<bool> {
        let pool = self.pool.clone();

        self.read_with_retry(|| {
            let pool = pool.clone();
            let id = id.clone();
            Box::pin(async move {
                let exists = sqlx::query_scalar::<_, bool>(
                    "SELECT EXISTS(SELECT 1 FROM orders WHERE order_id = $1)",
                )
                .bind(id)
                .fetch_one(&pool)
                .await?;

                Ok(exists)
            })
        })
        .await
    }

    async fn count(&self) -> RepositoryResult<i64> {
        let pool = self.pool.clone();

        self.read_with_retry(|| {
            let pool = pool.clone();
            Box::pin(async move {
                let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM orders")
                    .fetch_one(&pool)
                    .await?;

                Ok(count)
            })
        })
        .await
    }

    async fn health_check(&self) -> RepositoryResult<()> {
        sqlx::query("SELECT 1")
            .fetch_one(&self.pool)
            .await
            .map(|_| ())
            .map_err(|e| RepositoryError::Connection(format!("Health check failed: {}", e)))
    }
}

#[async_trait]
impl OrderRepository for PgOrderRepository {
    async fn upsert_if_absent(
        &self,
        order_id: &str,
        total: Money,
    ) -> RepositoryResult<UpsertOutcome> {
        let timer = Timer::start("orders.upsert_if_absent");

        let result = sqlx::query(
            r#"
            INSERT INTO orders (order_id, total)
            VALUES ($1, $2::NUMERIC / 100)
            ON CONFLICT (order_id) DO NOTHING
            "#,
        )
        .bind(order_id)
        .bind(total.cents())
        .execute(&self.pool)
        .await?;

        timer.stop();

        Ok(if result.rows_affected() == 1 {
            UpsertOutcome::Inserted
        } else {
            UpsertOutcome::AlreadyPresent
        })
    }
}
