//! Producers for order events and the Dead Letter Queue

use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{KafkaIntegrationError, OrderPublisher};
use crate::dlq::{DeadLetter, DeadLetterError, DeadLetterPublisher};
use crate::error::{Error, Result};

/// Producer for sending failed messages to the Dead Letter Queue
#[derive(Clone)]
pub struct DlqProducer {
    /// Kafka producer instance
    producer: FutureProducer,

    /// DLQ topic name
    dlq_topic: String,

    /// How long a record may wait in the local queue
    send_timeout: Duration,
}

impl DlqProducer {
    /// Create a new DLQ producer
    pub fn new(config: ClientConfig, dlq_topic: String) -> Result<Self> {
        let producer: FutureProducer = config
            .create()
            .map_err(|e| Error::from(KafkaIntegrationError::ConnectionError(e)))?;

        Ok(Self {
            producer,
            dlq_topic,
            send_timeout: Duration::from_secs(30),
        })
    }

    pub fn topic(&self) -> &str {
        &self.dlq_topic
    }

    /// Flush any pending messages
    pub fn flush(&self) -> Result<()> {
        self.producer
            .flush(self.send_timeout)
            .map_err(|e| Error::from(KafkaIntegrationError::ConnectionError(e)))
    }
}

/// The original bytes go out untouched; the failure travels in headers
fn dead_letter_headers(letter: &DeadLetter) -> OwnedHeaders {
    letter
        .headers()
        .iter()
        .fold(OwnedHeaders::new(), |headers, (name, value)| {
            headers.insert(Header {
                key: *name,
                value: Some(value.as_bytes()),
            })
        })
}

#[async_trait]
impl DeadLetterPublisher for DlqProducer {
    async fn publish(&self, letter: &DeadLetter) -> std::result::Result<(), DeadLetterError> {
        let mut record: FutureRecord<'_, [u8], [u8]> =
            FutureRecord::to(&self.dlq_topic).headers(dead_letter_headers(letter));

        if let Some(payload) = letter.payload.as_deref() {
            record = record.payload(payload);
        }
        if let Some(key) = letter.key.as_deref() {
            record = record.key(key);
        }

        match self.producer.send(record, self.send_timeout).await {
            Ok(delivery) => {
                info!(
                    dlq_topic = %self.dlq_topic,
                    partition = delivery.0,
                    offset = delivery.1,
                    source_partition = letter.source_partition,
                    source_offset = letter.source_offset,
                    "Sent message to DLQ"
                );
                Ok(())
            },
            Err((kafka_error, _)) => {
                error!(
                    dlq_topic = %self.dlq_topic,
                    error = %kafka_error,
                    "Failed to send message to DLQ"
                );
                Err(DeadLetterError::Publish {
                    topic: self.dlq_topic.clone(),
                    reason: kafka_error.to_string(),
                })
            },
        }
    }
}

/// Publishes framed `OrderCreated` events for the HTTP ingress
#[derive(Clone)]
pub struct OrderProducer {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl OrderProducer {
    pub fn new(config: ClientConfig, topic: String) -> Result<Self> {
        let producer: FutureProducer = config
            .create()
            .map_err(|e| Error::from(KafkaIntegrationError::ConnectionError(e)))?;

        Ok(Self {
            producer,
            topic,
            send_timeout: Duration::from_secs(10),
        })
    }

    /// Flush any pending messages
    pub fn flush(&self) -> Result<()> {
        self.producer
            .flush(self.send_timeout)
            .map_err(|e| Error::from(KafkaIntegrationError::ConnectionError(e)))
    }
}

#[async_trait]
impl OrderPublisher for OrderProducer {
    async fn publish(
        &self,
        key: &str,
        payload: Vec<u8>,
    ) -> std::result::Result<(), KafkaIntegrationError> {
        let record = FutureRecord::to(&self.topic).key(key).payload(&payload);

        match self.producer.send(record, self.send_timeout).await {
            Ok(delivery) => {
                debug!(
                    topic = %self.topic,
                    key,
                    partition = delivery.0,
                    offset = delivery.1,
                    "Order event published"
                );
                Ok(())
            },
            Err((kafka_error, _)) => Err(KafkaIntegrationError::PublishError {
                topic: self.topic.clone(),
                reason: kafka_error.to_string(),
            }),
        }
    }
}
