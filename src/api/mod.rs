//! HTTP API for order-ingest
//!
//! `POST /api/orders` publishes new orders; `/healthz`, `/readyz` and `/build`
//! serve probes and operators.

pub mod health;
pub mod orders;
pub mod server;

pub use health::{
    build_info, health_check, ready_check, BuildInfo, ComponentHealth, HealthResponse,
    HealthState, HealthStatus, ReadyResponse, SchemaVersions,
};
pub use orders::{create_order, OrderAccepted, OrderIngress};
pub use server::{create_router, create_server, shutdown_signal, AppState};

/// Compile-time build metadata served on `/build`
pub const BUILD_INFO: BuildInfo = BuildInfo {
    version: env!("CARGO_PKG_VERSION"),
    commit: match option_env!("GIT_COMMIT") {
        Some(commit) => commit,
        None => "unknown",
    },
    build_time: match option_env!("BUILD_TIME") {
        Some(time) => time,
        None => "unknown",
    },
    latest_schema_version: crate::schema::LATEST_ORDER_CREATED_VERSION,
};
