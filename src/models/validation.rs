//! Validation rules for order events
//!
//! `validate_has_text` plugs into the `validator` derive on ingress requests;
//! `validate_order` is the check the consumer applies after decoding.

use validator::ValidationError;

use super::error::{ValidationError as ModelValidationError, ValidationResult};
use super::order::OrderCreated;

/// True when the value contains at least one non-whitespace character
pub fn has_text(value: &str) -> bool {
    !value.trim().is_empty()
}

/// Reject blank strings, for the validator crate
pub fn validate_has_text(value: &str) -> Result<(), ValidationError> {
    if has_text(value) {
        Ok(())
    } else {
        Err(ValidationError::new("blank"))
    }
}

/// Business rules applied to a decoded event before it is persisted.
///
/// The order id is checked first, then the total, so an event that breaks
/// both rules reports the missing id. A blank `customerId` is refused at the
/// HTTP ingress only; a decoded event without one is still persisted.
pub fn validate_order(event: &OrderCreated) -> ValidationResult<()> {
    if !has_text(&event.order_id) {
        return Err(ModelValidationError::missing_order_id());
    }

    if event.total.is_negative() {
        return Err(ModelValidationError::negative_total(event.total));
    }

    Ok(())
}
