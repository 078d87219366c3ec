//! Avro schema handling
//!
//! Bundled `OrderCreated` schema versions, the wire framing that tags every
//! payload with its writer schema id, an in-process registry and the
//! compatibility checker used to govern schema evolution.

pub mod compatibility;
pub mod registry;
pub mod wire;

use apache_avro::Schema;
use thiserror::Error;

pub use compatibility::{
    check, classify, classify_files, Compatibility, CompatibilityLevel, CompatibilityReport,
};
pub use registry::{InMemorySchemaRegistry, SchemaRegistry};
pub use wire::{frame, unframe, MAGIC_BYTE};

/// Registry subject under which the order event schemas are published
pub const ORDER_CREATED_SUBJECT: &str = "orders.created-value";

const ORDER_CREATED_V1: &str = include_str!("../../schemas/order_created/v1.avsc");
const ORDER_CREATED_V2: &str = include_str!("../../schemas/order_created/v2.avsc");

/// Latest published version of the order event schema
pub const LATEST_ORDER_CREATED_VERSION: u32 = 2;

/// Errors raised while loading, registering or comparing schemas
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Unknown schema id {0}")]
    UnknownSchemaId(i32),

    #[error("Schema not found: {subject} version {version}")]
    VersionNotFound { subject: String, version: u32 },

    #[error("Invalid wire format: {0}")]
    Framing(String),

    #[error("Compatibility violation ({required}): {}", .reasons.join("; "))]
    CompatibilityViolation {
        required: CompatibilityLevel,
        reasons: Vec<String>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for schema operations
pub type Result<T> = std::result::Result<T, SchemaError>;

/// A published, immutable schema version
#[derive(Debug, Clone)]
pub struct SchemaVersion {
    /// Registry-wide id written into the wire header
    pub id: i32,
    pub subject: String,
    /// Version number within the subject, starting at 1
    pub version: u32,
    pub schema: Schema,
}

/// Parse an Avro schema document
pub fn parse(document: &str) -> Result<Schema> {
    Schema::parse_str(document).map_err(|e| SchemaError::InvalidSchema(e.to_string()))
}

/// Raw JSON of a bundled `OrderCreated` schema version
pub fn order_created_source(version: u32) -> Result<&'static str> {
    match version {
        1 => Ok(ORDER_CREATED_V1),
        2 => Ok(ORDER_CREATED_V2),
        _ => Err(SchemaError::VersionNotFound {
            subject: ORDER_CREATED_SUBJECT.to_string(),
            version,
        }),
    }
}

/// Parsed bundled `OrderCreated` schema version
pub fn order_created(version: u32) -> Result<Schema> {
    parse(order_created_source(version)?)
}
