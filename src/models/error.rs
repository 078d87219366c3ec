//! Validation error types for order models
//!
//! Validation failures are terminal for a message: the pipeline dead-letters
//! them instead of retrying. The `Display` output is what ends up in the
//! dead-letter annotations, so it stays short and greppable.

use std::fmt;
use thiserror::Error;

/// A single field-level validation failure
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// The kind of validation error
    pub kind: ValidationErrorKind,
    /// The field that failed validation
    pub field: String,
    /// Optional additional context
    pub context: Option<String>,
}

impl ValidationError {
    /// Create a new validation error
    pub fn new(kind: ValidationErrorKind, field: impl Into<String>) -> Self {
        Self {
            kind,
            field: field.into(),
            context: None,
        }
    }

    /// Create a validation error with additional context
    pub fn with_context(
        kind: ValidationErrorKind,
        field: impl Into<String>,
        context: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            field: field.into(),
            context: Some(context.into()),
        }
    }

    pub fn missing_order_id() -> Self {
        Self::new(ValidationErrorKind::MissingOrderId, "orderId")
    }

    pub fn missing_customer_id() -> Self {
        Self::new(ValidationErrorKind::MissingCustomerId, "customerId")
    }

    pub fn negative_total(total: impl fmt::Display) -> Self {
        Self::with_context(
            ValidationErrorKind::NegativeTotal,
            "total",
            format!("got {}", total),
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.context {
            Some(ctx) => write!(f, "validation: {} ({})", self.kind, ctx),
            None => write!(f, "validation: {}", self.kind),
        }
    }
}

/// Specific validation error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationErrorKind {
    #[error("missing orderId")]
    MissingOrderId,

    #[error("missing customerId")]
    MissingCustomerId,

    /// Total is below zero
    #[error("negative total")]
    NegativeTotal,

    /// Total could not be read as a two-decimal amount
    #[error("invalid total")]
    InvalidTotal,
}

/// Result type alias for validation operations
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Convert validation errors to application errors
impl From<ValidationError> for crate::error::Error {
    fn from(err: ValidationError) -> Self {
        crate::error::Error::validation(err.to_string())
    }
}
