//! Avro binary codec for `OrderCreated`
//!
//! Encoding is driven by the writer schema: only the fields it declares are
//! written. Decoding reads the datum with the writer schema and projects it
//! onto the reader schema by field name, after the pair has been checked for
//! compatibility, so a structural mismatch is reported before any byte is read.
//!
//! Decimals are written with minimal-length two's-complement bytes, which is
//! what JVM producers emit, so resolution is done here instead of through
//! `Value::resolve` (it rejects decimals shorter than their precision needs).

use apache_avro::types::Value;
use apache_avro::{Decimal, Schema};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

use crate::models::{Money, OrderCreated};
use crate::schema::{check, Compatibility, SchemaError};

/// Widest unscaled decimal that fits in `Money`
const MAX_DECIMAL_BYTES: usize = 8;

/// Failures turning bytes into an event. Never retryable.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("message has no payload")]
    EmptyPayload,

    #[error("{0}")]
    Schema(#[from] SchemaError),

    #[error("reader schema cannot read writer schema: {}", .0.join("; "))]
    IncompatibleSchemas(Vec<String>),

    #[error("malformed avro datum: {0}")]
    Malformed(#[source] apache_avro::Error),

    #[error("schema resolution failed: {0}")]
    Resolution(String),

    #[error("field '{field}': {reason}")]
    Field { field: &'static str, reason: String },
}

impl DecodeError {
    fn field(field: &'static str, reason: impl Into<String>) -> Self {
        DecodeError::Field {
            field,
            reason: reason.into(),
        }
    }
}

/// Failures turning an event into bytes
#[derive(Error, Debug)]
pub enum EncodeError {
    #[error("writer schema is not a record")]
    NotARecord,

    #[error("writer field '{0}' has no value and no default")]
    UnknownField(String),

    #[error("no union branch accepts {0}")]
    NoUnionBranch(String),

    #[error("avro encoding failed: {0}")]
    Avro(#[from] apache_avro::Error),
}

/// Encode an event as a bare Avro datum (no wire header)
pub fn encode(event: &OrderCreated, writer: &Schema) -> Result<Vec<u8>, EncodeError> {
    let Schema::Record(record) = writer else {
        return Err(EncodeError::NotARecord);
    };

    let mut values = event_values(event);
    let mut fields = Vec::with_capacity(record.fields.len());
    for field in &record.fields {
        let value = match values.remove(field.name.as_str()) {
            Some(value) => value,
            None => match &field.default {
                Some(default) => Value::from(default.clone()),
                None => return Err(EncodeError::UnknownField(field.name.clone())),
            },
        };
        fields.push((field.name.clone(), wrap_union(value, &field.schema)?));
    }

    Ok(apache_avro::to_avro_datum(writer, Value::Record(fields))?)
}

/// Decode a bare Avro datum written with `writer` into the `reader` view
pub fn decode(datum: &[u8], writer: &Schema, reader: &Schema) -> Result<OrderCreated, DecodeError> {
    if let Compatibility::Incompatible(reasons) = check(reader, writer) {
        return Err(DecodeError::IncompatibleSchemas(reasons));
    }

    let written = apache_avro::from_avro_datum(writer, &mut &datum[..], None)
        .map_err(DecodeError::Malformed)?;
    let mut fields = project(written, reader)?;

    Ok(OrderCreated {
        event_id: take_string(&mut fields, "eventId")?,
        order_id: take_string(&mut fields, "orderId")?,
        customer_id: take_string(&mut fields, "customerId")?,
        total: take_total(&mut fields)?,
        ts: take_timestamp(&mut fields)?,
        promotion_code: take_optional_string(&mut fields, "promotionCode")?,
    })
}

/// Every field the event can carry, keyed by its Avro name
fn event_values(event: &OrderCreated) -> HashMap<&'static str, Value> {
    let promotion_code = match &event.promotion_code {
        Some(code) => Value::String(code.clone()),
        None => Value::Null,
    };

    HashMap::from([
        ("eventId", Value::String(event.event_id.clone())),
        ("orderId", Value::String(event.order_id.clone())),
        ("customerId", Value::String(event.customer_id.clone())),
        (
            "total",
            Value::Decimal(Decimal::from(decimal_bytes(event.total.cents()))),
        ),
        ("ts", Value::TimestampMillis(event.ts.timestamp_millis())),
        ("promotionCode", promotion_code),
    ])
}

/// Select the union branch matching `value`, when the field is a union
fn wrap_union(value: Value, schema: &Schema) -> Result<Value, EncodeError> {
    let Schema::Union(union) = schema else {
        return Ok(value);
    };

    let branch = union.variants().iter().position(|variant| {
        matches!(
            (&value, variant),
            (Value::Null, Schema::Null)
                | (Value::String(_), Schema::String)
                | (Value::Long(_), Schema::Long)
                | (Value::Int(_), Schema::Int)
                | (Value::Boolean(_), Schema::Boolean)
                | (Value::Decimal(_), Schema::Decimal(_))
                | (Value::TimestampMillis(_), Schema::TimestampMillis)
        )
    });

    match branch {
        Some(index) => Ok(Value::Union(index as u32, Box::new(value))),
        None => Err(EncodeError::NoUnionBranch(format!("{:?}", value))),
    }
}

/// Resolve a record written with the writer schema into the reader's fields.
///
/// Reader fields missing from the writer take the reader default; writer
/// fields unknown to the reader are dropped.
fn project(written: Value, reader: &Schema) -> Result<HashMap<String, Value>, DecodeError> {
    let Value::Record(written) = written else {
        return Err(DecodeError::Resolution("writer datum is not a record".into()));
    };
    let Schema::Record(reader) = reader else {
        return Err(DecodeError::Resolution("reader schema is not a record".into()));
    };

    let mut written: HashMap<String, Value> = written.into_iter().collect();
    let mut projected = HashMap::with_capacity(reader.fields.len());
    for field in &reader.fields {
        let value = match (written.remove(&field.name), &field.default) {
            (Some(value), _) => value,
            (None, Some(default)) => Value::from(default.clone()),
            (None, None) => {
                return Err(DecodeError::Resolution(format!(
                    "reader field '{}' has no writer value and no default",
                    field.name
                )))
            },
        };
        projected.insert(field.name.clone(), value);
    }
    Ok(projected)
}

/// Minimal two's-complement big-endian bytes of an unscaled decimal
pub fn decimal_bytes(unscaled: i64) -> Vec<u8> {
    let bytes = unscaled.to_be_bytes();
    let mut start = 0;
    while start < bytes.len() - 1 {
        let redundant_sign = (bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0);
        if !redundant_sign {
            break;
        }
        start += 1;
    }
    bytes[start..].to_vec()
}

/// Inverse of [`decimal_bytes`], sign-extending to 64 bits
pub fn decimal_from_bytes(bytes: &[u8]) -> Result<i64, DecodeError> {
    if bytes.is_empty() {
        return Err(DecodeError::field("total", "empty decimal"));
    }
    if bytes.len() > MAX_DECIMAL_BYTES {
        return Err(DecodeError::field(
            "total",
            format!("{}-byte decimal does not fit in 64 bits", bytes.len()),
        ));
    }

    let fill = if bytes[0] & 0x80 != 0 { 0xFF } else { 0x00 };
    let mut buf = [fill; MAX_DECIMAL_BYTES];
    buf[MAX_DECIMAL_BYTES - bytes.len()..].copy_from_slice(bytes);
    Ok(i64::from_be_bytes(buf))
}

/// Strip a union wrapper, if any
fn unwrap_union(value: Value) -> Value {
    match value {
        Value::Union(_, inner) => *inner,
        other => other,
    }
}

fn take(fields: &mut HashMap<String, Value>, name: &'static str) -> Result<Value, DecodeError> {
    fields
        .remove(name)
        .map(unwrap_union)
        .ok_or_else(|| DecodeError::field(name, "missing from reader schema"))
}

fn take_string(fields: &mut HashMap<String, Value>, name: &'static str) -> Result<String, DecodeError> {
    match take(fields, name)? {
        Value::String(s) => Ok(s),
        Value::Bytes(bytes) => String::from_utf8(bytes)
            .map_err(|e| DecodeError::field(name, format!("invalid utf-8: {}", e))),
        other => Err(DecodeError::field(name, format!("expected a string, got {:?}", other))),
    }
}

fn take_optional_string(
    fields: &mut HashMap<String, Value>,
    name: &'static str,
) -> Result<Option<String>, DecodeError> {
    match fields.remove(name).map(unwrap_union) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(other) => Err(DecodeError::field(name, format!("expected a string, got {:?}", other))),
    }
}

fn take_total(fields: &mut HashMap<String, Value>) -> Result<Money, DecodeError> {
    let unscaled = match take(fields, "total")? {
        Value::Decimal(decimal) => {
            let bytes = Vec::<u8>::try_from(&decimal)
                .map_err(|e| DecodeError::field("total", e.to_string()))?;
            decimal_from_bytes(&bytes)?
        },
        Value::Bytes(bytes) => decimal_from_bytes(&bytes)?,
        other => {
            return Err(DecodeError::field(
                "total",
                format!("expected a decimal, got {:?}", other),
            ))
        },
    };
    Ok(Money::from_cents(unscaled))
}

fn take_timestamp(fields: &mut HashMap<String, Value>) -> Result<DateTime<Utc>, DecodeError> {
    let millis = match take(fields, "ts")? {
        Value::TimestampMillis(ms) | Value::Long(ms) => ms,
        other => {
            return Err(DecodeError::field(
                "ts",
                format!("expected timestamp-millis, got {:?}", other),
            ))
        },
    };
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| DecodeError::field("ts", format!("{} is out of range", millis)))
}
