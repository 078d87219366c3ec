//! order-ingest library
//!
//! Consumes `OrderCreated` events from Kafka, decodes them across schema
//! versions, validates and persists them idempotently, and dead-letters what
//! cannot be processed. Also exposes the HTTP ingress and the schema
//! compatibility checker used by the `schema-compat` tool.

pub mod api;
pub mod codec;
pub mod config;
pub mod db;
pub mod dlq;
pub mod error;
pub mod kafka;
pub mod logging;
pub mod models;
pub mod retry;
pub mod schema;

#[doc(hidden)]
pub mod test_utils;

// Re-export commonly used types at the crate root
pub use config::Config;
pub use error::{Error, Result};

// Re-export model types
pub use models::{CreateOrderRequest, Money, OrderCreated, ValidationError, ValidationErrorKind};

// Re-export API server functions
pub use api::server::{create_router, create_server, shutdown_signal, AppState};

// Re-export health check types
pub use api::{
    BuildInfo, ComponentHealth, HealthResponse, HealthState, HealthStatus, ReadyResponse,
    SchemaVersions,
};
