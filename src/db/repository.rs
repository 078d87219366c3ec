//! Repository abstractions for order persistence
//!
//! Persistence is keyed by the order id. The only write the pipeline needs is
//! a conditional insert: a second write for the same key is reported as
//! `AlreadyPresent` rather than as an error, which is what makes redelivery
//! harmless.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use thiserror::Error;

use crate::models::Money;

pub type RepositoryResult<T> = Result<T, RepositoryError>;

/// SQLSTATE codes worth another attempt: connection exceptions (class 08),
/// serialization failure, deadlock, admin shutdown, too many connections.
const TRANSIENT_SQLSTATES: &[&str] = &["40001", "40P01", "57P01", "57P03", "53300"];

/// Failures talking to the orders store
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Query execution error: {0}")]
    QueryExecution(String),

    /// A stored row could not be mapped back, e.g. an out-of-range total
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Connection pool exhausted")]
    PoolExhausted,

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl RepositoryError {
    /// Transient failures are retried by the pipeline; everything else dead-letters
    pub fn is_retryable(&self) -> bool {
        match self {
            RepositoryError::Connection(_)
            | RepositoryError::PoolExhausted
            | RepositoryError::Timeout(_) => true,
            RepositoryError::Database(sqlx::Error::Database(db_err)) => {
                db_err.code().map_or(false, |code| {
                    code.starts_with("08") || TRANSIENT_SQLSTATES.contains(&&*code)
                })
            },
            RepositoryError::Database(e) => matches!(
                e,
                sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
            ),
            _ => false,
        }
    }
}

impl From<RepositoryError> for crate::error::Error {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::Timeout(msg) => crate::error::Error::Timeout(msg),
            _ => crate::error::Error::database(err.to_string()),
        }
    }
}

/// Result of a conditional insert
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// The key was new and the row was written
    Inserted,
    /// A row with the key already existed; nothing was written
    AlreadyPresent,
}

impl UpsertOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpsertOutcome::Inserted => "inserted",
            UpsertOutcome::AlreadyPresent => "already_present",
        }
    }
}

/// A persisted order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderRecord {
    pub order_id: String,
    pub total: Money,
    pub created_at: DateTime<Utc>,
}

/// Read side shared by every store
#[async_trait]
pub trait Repository: Send + Sync {
    type Entity: Send + Sync;

    type Id: Send + Sync + Debug;

    async fn find_by_id(&self, id: Self::Id) -> RepositoryResult<Option<Self::Entity>>;

    async fn exists(&self, id: Self::Id) -> RepositoryResult<bool>;

    async fn count(&self) -> RepositoryResult<i64>;

    /// Cheap round trip used by `/readyz`
    async fn health_check(&self) -> RepositoryResult<()>;
}

/// Idempotent order storage
#[async_trait]
pub trait OrderRepository: Repository<Entity = OrderRecord, Id = String> {
    /// Insert the order unless a row with the same id exists.
    ///
    /// Atomic with respect to concurrent callers: exactly one of them sees
    /// `Inserted` for a given id.
    async fn upsert_if_absent(
        &self,
        order_id: &str,
        total: Money,
    ) -> RepositoryResult<UpsertOutcome>;
}
