//! Probe endpoints
//!
//! `/healthz` is pure liveness. `/readyz` re-checks the database on every call
//! and also reports components the rest of the process marked, such as the
//! consumer pool, together with the schema versions this instance reads and
//! writes.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::api::BUILD_INFO;
use crate::db::OrderRepository;

pub const DATABASE_COMPONENT: &str = "database";
pub const CONSUMER_COMPONENT: &str = "consumer";

/// Ordered from best to worst so the overall status is the maximum
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    /// Still serving, but something needs attention
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    pub fn to_status_code(&self) -> StatusCode {
        match self {
            HealthStatus::Healthy | HealthStatus::Degraded => StatusCode::OK,
            HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub last_check: DateTime<Utc>,
}

/// Reader and writer schema versions in use
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SchemaVersions {
    pub subject: String,
    /// Version the consumer projects every payload into
    pub reader_version: u32,
    /// Version the ingress encodes with
    pub writer_version: u32,
}

/// Body of `/healthz`
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// Body of `/readyz`
#[derive(Debug, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub status: HealthStatus,
    pub checks: HashMap<String, ComponentHealth>,
    pub schema: SchemaVersions,
    pub timestamp: DateTime<Utc>,
}

/// Body of `/build`
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildInfo {
    pub version: &'static str,
    pub commit: &'static str,
    pub build_time: &'static str,
    /// Newest bundled `OrderCreated` schema
    pub latest_schema_version: u32,
}

/// Component health shared between the probes and the background tasks
#[derive(Clone)]
pub struct HealthState {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    repository: Arc<dyn OrderRepository>,
    schema: SchemaVersions,
}

impl HealthState {
    pub fn new(repository: Arc<dyn OrderRepository>, schema: SchemaVersions) -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            repository,
            schema,
        }
    }

    pub async fn update_component(
        &self,
        name: impl Into<String>,
        status: HealthStatus,
        message: Option<String>,
    ) {
        self.components.write().await.insert(
            name.into(),
            ComponentHealth {
                status,
                message,
                last_check: Utc::now(),
            },
        );
    }

    /// Re-run the checks this state owns
    pub async fn refresh(&self) {
        let health = check_database_health(self.repository.as_ref()).await;
        self.update_component(DATABASE_COMPONENT, health.status, health.message)
            .await;
    }

    pub async fn components(&self) -> HashMap<String, ComponentHealth> {
        self.components.read().await.clone()
    }

    /// Worst status among all reported components
    pub async fn get_status(&self) -> HealthStatus {
        self.components
            .read()
            .await
            .values()
            .map(|c| c.status)
            .max()
            .unwrap_or(HealthStatus::Healthy)
    }

    pub fn schema(&self) -> &SchemaVersions {
        &self.schema
    }
}

/// `GET /healthz`: the process is up; dependencies are not consulted
pub async fn health_check() -> Response {
    let response = HealthResponse {
        status: HealthStatus::Healthy,
        message: Some("order-ingest is running".to_string()),
        timestamp: Utc::now(),
    };

    (StatusCode::OK, Json(response)).into_response()
}

/// `GET /readyz`: 503 while the database is unreachable or a component
/// reported itself unhealthy
pub async fn ready_check(State(state): State<Arc<HealthState>>) -> Response {
    state.refresh().await;

    let status = state.get_status().await;
    let response = ReadyResponse {
        status,
        checks: state.components().await,
        schema: state.schema().clone(),
        timestamp: Utc::now(),
    };

    (status.to_status_code(), Json(response)).into_response()
}

/// `GET /build`
pub async fn build_info() -> Response {
    (StatusCode::OK, Json(&BUILD_INFO)).into_response()
}

pub async fn check_database_health(repository: &dyn OrderRepository) -> ComponentHealth {
    let (status, message) = match repository.health_check().await {
        Ok(()) => (HealthStatus::Healthy, "orders store reachable".to_string()),
        Err(e) => (HealthStatus::Unhealthy, e.to_string()),
    };

    ComponentHealth {
        status,
        message: Some(message),
        last_check: Utc::now(),
    }
}

/// Refresh component health every `interval`
pub async fn health_monitor(state: Arc<HealthState>, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;
        state.refresh().await;
        tracing::debug!("Health check completed");
    }
}
