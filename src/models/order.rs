//! Order domain types
//!
//! `OrderCreated` is the event carried on the orders topic. Amounts are kept
//! as whole cents in [`Money`] so the Avro `decimal(18, 2)` encoding is exact.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use validator::Validate;

use super::error::{ValidationError, ValidationErrorKind, ValidationResult};
use super::validation::validate_has_text;

/// Number of fractional digits carried by every amount
pub const MONEY_SCALE: u32 = 2;

/// Fixed-point amount with two fractional digits, stored as cents
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Create an amount from its unscaled value
    pub const fn from_cents(cents: i64) -> Self {
        Money(cents)
    }

    /// The unscaled value (`amount * 100`)
    pub const fn cents(self) -> i64 {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

impl FromStr for Money {
    type Err = ValidationError;

    /// Parse a plain decimal literal such as `99.5`, `-5.00` or `10`.
    ///
    /// More than two fractional digits, exponents and values outside the
    /// `i64` cent range are rejected rather than rounded.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || {
            ValidationError::with_context(
                ValidationErrorKind::InvalidTotal,
                "total",
                format!("cannot read '{}' as an amount with 2 decimals", s),
            )
        };

        let trimmed = s.trim();
        let (negative, digits) = match trimmed.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };

        let (whole, fraction) = match digits.split_once('.') {
            Some((whole, fraction)) => (whole, fraction),
            None => (digits, ""),
        };

        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }
        if fraction.len() > MONEY_SCALE as usize
            || !whole.chars().all(|c| c.is_ascii_digit())
            || !fraction.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let whole_value: i64 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid())?
        };
        let mut fraction_value: i64 = if fraction.is_empty() {
            0
        } else {
            fraction.parse().map_err(|_| invalid())?
        };
        if fraction.len() == 1 {
            fraction_value *= 10;
        }

        let cents = whole_value
            .checked_mul(100)
            .and_then(|v| v.checked_add(fraction_value))
            .ok_or_else(invalid)?;

        Ok(Money(if negative { -cents } else { cents }))
    }
}

/// An order was placed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderCreated {
    pub event_id: String,
    /// Natural key used for idempotent persistence
    pub order_id: String,
    /// Partition key on the orders topic
    pub customer_id: String,
    pub total: Money,
    pub ts: DateTime<Utc>,
    /// Only present in schema v2 and later
    pub promotion_code: Option<String>,
}

impl OrderCreated {
    /// Build a fresh event with a derived event id and the current time
    pub fn new(order_id: impl Into<String>, customer_id: impl Into<String>, total: Money) -> Self {
        let order_id = order_id.into();
        Self {
            event_id: format!("EVT-{}", order_id),
            order_id,
            customer_id: customer_id.into(),
            total,
            ts: now_millis(),
            promotion_code: None,
        }
    }

    pub fn with_promotion_code(mut self, code: impl Into<String>) -> Self {
        self.promotion_code = Some(code.into());
        self
    }

    pub fn with_ts(mut self, ts: DateTime<Utc>) -> Self {
        self.ts = ts;
        self
    }
}

/// Current time truncated to whole milliseconds, the precision of the wire format
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    let sub_millis = i64::from(now.timestamp_subsec_nanos() % 1_000_000);
    now - Duration::nanoseconds(sub_millis)
}

/// Request body accepted by `POST /api/orders`
#[derive(Debug, Clone, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateOrderRequest {
    #[serde(default)]
    #[validate(custom(function = "validate_has_text"))]
    pub order_id: String,

    #[serde(default)]
    #[validate(custom(function = "validate_has_text"))]
    pub customer_id: String,

    /// Defaults to zero when absent
    #[serde(default)]
    pub total: Option<serde_json::Number>,

    #[serde(default)]
    pub promotion_code: Option<String>,
}

impl CreateOrderRequest {
    /// Validate the request and turn it into an event ready for publishing
    pub fn into_event(self) -> ValidationResult<OrderCreated> {
        if let Err(errors) = self.validate() {
            let fields = errors.field_errors();
            if fields.contains_key("order_id") {
                return Err(ValidationError::missing_order_id());
            }
            if fields.contains_key("customer_id") {
                return Err(ValidationError::missing_customer_id());
            }
            return Err(ValidationError::with_context(
                ValidationErrorKind::InvalidTotal,
                "request",
                errors.to_string(),
            ));
        }

        let total = match &self.total {
            Some(number) => number.to_string().parse::<Money>()?,
            None => Money::ZERO,
        };
        if total.is_negative() {
            return Err(ValidationError::negative_total(total));
        }

        let event = OrderCreated::new(self.order_id, self.customer_id, total);
        Ok(match self.promotion_code {
            Some(code) if !code.trim().is_empty() => event.with_promotion_code(code),
            _ => event,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(body: serde_json::Value) -> CreateOrderRequest {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_money_parse_and_display() {
        assert_eq!("99.5".parse::<Money>().unwrap(), Money::from_cents(9950));
        assert_eq!("99.50".parse::<Money>().unwrap(), Money::from_cents(9950));
        assert_eq!("10".parse::<Money>().unwrap(), Money::from_cents(1000));
        assert_eq!("-5.00".parse::<Money>().unwrap(), Money::from_cents(-500));
        assert_eq!(".5".parse::<Money>().unwrap(), Money::from_cents(50));

        assert_eq!(Money::from_cents(9950).to_string(), "99.50");
        assert_eq!(Money::from_cents(-500).to_string(), "-5.00");
        assert_eq!(Money::from_cents(7).to_string(), "0.07");
        assert_eq!(Money::from_cents(i64::MIN).cents(), i64::MIN);
    }

    #[test]
    fn test_money_rejects_unrepresentable_values() {
        for input in ["", "-", "1.234", "1e3", "abc", "1.2.3", "99999999999999999999"] {
            let err = input.parse::<Money>().unwrap_err();
            assert_eq!(err.kind, ValidationErrorKind::InvalidTotal, "input {:?}", input);
        }
    }

    #[test]
    fn test_new_event_derives_event_id() {
        let event = OrderCreated::new("ORD-123", "C-42", Money::from_cents(9950));
        assert_eq!(event.event_id, "EVT-ORD-123");
        assert_eq!(event.customer_id, "C-42");
        assert!(event.promotion_code.is_none());
        assert_eq!(event.ts.timestamp_subsec_nanos() % 1_000_000, 0);
    }

    #[test]
    fn test_request_into_event() {
        let event = request(json!({
            "orderId": "ORD-123",
            "customerId": "C-42",
            "total": 99.50
        }))
        .into_event()
        .unwrap();

        assert_eq!(event.order_id, "ORD-123");
        assert_eq!(event.total, Money::from_cents(9950));
    }

    #[test]
    fn test_request_missing_fields() {
        let err = request(json!({ "customerId": "C-42", "total": 1 }))
            .into_event()
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::MissingOrderId);

        let err = request(json!({ "orderId": "ORD-1", "customerId": "   " }))
            .into_event()
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::MissingCustomerId);
    }

    #[test]
    fn test_request_negative_total() {
        let err = request(json!({ "orderId": "ORD-1", "customerId": "C-1", "total": -5.0 }))
            .into_event()
            .unwrap_err();
        assert_eq!(err.kind, ValidationErrorKind::NegativeTotal);
    }

    #[test]
    fn test_request_defaults_total_to_zero() {
        let event = request(json!({ "orderId": "ORD-1", "customerId": "C-1" }))
            .into_event()
            .unwrap();
        assert_eq!(event.total, Money::ZERO);
    }
}
