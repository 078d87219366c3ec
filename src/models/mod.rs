//! Data models for the order pipeline
//!
//! This module contains the order event, the amount type and the
//! validation rules shared by the ingress and the consumer.

pub mod error;
pub mod order;
pub mod validation;

// Re-export commonly used types
pub use error::{ValidationError, ValidationErrorKind, ValidationResult};
pub use order::{CreateOrderRequest, Money, OrderCreated};
pub use validation::{has_text, validate_has_text, validate_order};
