//! Kafka integration for order events
//!
//! This module provides:
//! - The consumer worker pool with manual offset management
//! - The ingestion pipeline each worker runs per message
//! - Producers for order events and for the Dead Letter Queue
//! - Graceful shutdown with offset commits

mod config;
mod consumer;
pub mod processor;
mod producer;

pub use config::KafkaConfig;
pub use consumer::EventConsumer;
pub use processor::{IngestionPipeline, IngestionState, ProcessingError, ProcessingOutcome};
pub use producer::{DlqProducer, OrderProducer};

use async_trait::async_trait;
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Message};
use thiserror::Error;

/// Kafka-specific error types
#[derive(Debug, Error)]
pub enum KafkaIntegrationError {
    #[error("Kafka connection error: {0}")]
    ConnectionError(#[from] KafkaError),

    #[error("Publish to '{topic}' failed: {reason}")]
    PublishError { topic: String, reason: String },

    #[error("Dead letter for partition {partition} offset {offset} could not be published after {attempts} attempts")]
    DeadLetterExhausted {
        partition: i32,
        offset: i64,
        attempts: u32,
    },

    /// The partition could not be rewound, so the failed message would be skipped
    #[error("Seek back to partition {partition} offset {offset} failed: {reason}")]
    SeekFailed {
        partition: i32,
        offset: i64,
        reason: String,
    },
}

impl From<KafkaIntegrationError> for crate::error::Error {
    fn from(err: KafkaIntegrationError) -> Self {
        crate::error::Error::kafka(err.to_string())
    }
}

/// An owned copy of a consumed record.
///
/// The pipeline works on this rather than on rdkafka's borrowed message so it
/// can be driven without a broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
    pub timestamp: Option<i64>,
}

impl InboundMessage {
    pub fn key_str(&self) -> Option<String> {
        self.key
            .as_deref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

impl<'a> From<&BorrowedMessage<'a>> for InboundMessage {
    fn from(message: &BorrowedMessage<'a>) -> Self {
        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            payload: message.payload().map(|p| p.to_vec()),
            timestamp: message.timestamp().to_millis(),
        }
    }
}

/// Publishes framed order events to the orders topic
#[async_trait]
pub trait OrderPublisher: Send + Sync {
    /// Send `payload` keyed by `key`; returns once the broker acknowledged it
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), KafkaIntegrationError>;
}
