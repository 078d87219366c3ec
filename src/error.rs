//! Application error type
//!
//! Layer errors (`RepositoryError`, `SchemaError`, `KafkaIntegrationError`,
//! `ValidationError`) convert into [`Error`] at the edges: startup, the HTTP
//! ingress and the worker pool. Per-message failures inside the pipeline use
//! `ProcessingError` instead and never reach this type.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Broker unreachable, publish rejected or the consumer pool died
    #[error("Kafka error: {0}")]
    Kafka(String),

    /// A request the ingress refuses to publish
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Schema error: {0}")]
    Schema(#[from] crate::schema::SchemaError),

    #[error("Encoding error: {0}")]
    Encode(#[from] crate::codec::EncodeError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn database<S: Into<String>>(msg: S) -> Self {
        Error::Database(msg.into())
    }

    pub fn kafka<S: Into<String>>(msg: S) -> Self {
        Error::Kafka(msg.into())
    }

    pub fn validation<S: Into<String>>(msg: S) -> Self {
        Error::Validation(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// HTTP status for the ingress. A publish failure is the broker's
    /// problem, not the client's, so it maps to 503.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::Kafka(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Config(_)
            | Error::Database(_)
            | Error::Schema(_)
            | Error::Encode(_)
            | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether trying the same operation again can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Database(_) | Error::Kafka(_) | Error::Timeout(_)
        )
    }

    /// Short machine-readable label used in response bodies
    pub fn error_type(&self) -> &'static str {
        match self {
            Error::Config(_) => "configuration_error",
            Error::Database(_) => "database_error",
            Error::Kafka(_) => "kafka_error",
            Error::Validation(_) => "validation_error",
            Error::Schema(_) => "schema_error",
            Error::Encode(_) => "encode_error",
            Error::Internal(_) => "internal_error",
            Error::Timeout(_) => "timeout",
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!(error = %self, error_type = self.error_type(), "Request failed");
        } else {
            tracing::warn!(error = %self, error_type = self.error_type(), "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "status": status.as_u16(),
            }
        }));

        (status, body).into_response()
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Internal(err.to_string())
    }
}

impl From<envconfig::Error> for Error {
    fn from(err: envconfig::Error) -> Self {
        Error::Config(err.to_string())
    }
}
