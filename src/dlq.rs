//! Dead-letter routing
//!
//! A message that cannot be processed is republished unmodified to the DLQ
//! topic, keyed by its original partition key so it lands in the matching
//! partition, with the failure recorded in headers.

use async_trait::async_trait;
use std::error::Error as StdError;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

use crate::kafka::processor::ProcessingError;
use crate::kafka::InboundMessage;

pub const HEADER_EXCEPTION_MESSAGE: &str = "exception-message";
pub const HEADER_EXCEPTION_CAUSE_MESSAGE: &str = "exception-cause-message";
pub const HEADER_ORIGINAL_EXCEPTION_MESSAGE: &str = "original-exception-message";
pub const HEADER_ORIGINAL_TOPIC: &str = "original-topic";
pub const HEADER_ORIGINAL_PARTITION: &str = "original-partition";
pub const HEADER_ORIGINAL_OFFSET: &str = "original-offset";
pub const HEADER_FAILURE_CLASS: &str = "failure-class";
pub const HEADER_ATTEMPTS: &str = "attempts";

/// Errors publishing to the DLQ. These are never retried by the router.
#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("dead-letter publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    #[error("dead-letter publish timed out after {0:?}")]
    Timeout(Duration),
}

/// Failure description derived from an error's `source()` chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureAnnotations {
    /// Message of the outermost error
    pub exception_message: Option<String>,
    /// Message of its direct cause
    pub cause_message: Option<String>,
    /// Message of the innermost cause
    pub original_message: Option<String>,
}

impl FailureAnnotations {
    pub fn from_error(err: &(dyn StdError + 'static)) -> Self {
        let top = err.to_string();
        let cause = err.source();

        let mut innermost = cause;
        while let Some(next) = innermost.and_then(|e| e.source()) {
            innermost = Some(next);
        }

        Self {
            exception_message: Some(if top.is_empty() {
                "unknown failure".to_string()
            } else {
                top
            }),
            cause_message: cause.map(|e| e.to_string()),
            original_message: innermost.map(|e| e.to_string()),
        }
    }

    /// Whether any annotation mentions `needle`
    pub fn mentions(&self, needle: &str) -> bool {
        [
            &self.exception_message,
            &self.cause_message,
            &self.original_message,
        ]
        .into_iter()
        .flatten()
        .any(|m| m.contains(needle))
    }
}

/// A message on its way to the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Original bytes, untouched. `None` for a tombstone.
    pub payload: Option<Vec<u8>>,
    /// Original partition key
    pub key: Option<Vec<u8>>,
    pub annotations: FailureAnnotations,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
    /// Which stage failed: `decode`, `validation` or `storage`
    pub failure_class: &'static str,
    pub attempts: u32,
}

impl DeadLetter {
    /// Build from the failed message and the error that ended its processing
    pub fn new(message: &InboundMessage, failure: &ProcessingError, attempts: u32) -> Self {
        Self {
            payload: message.payload.clone(),
            key: message.key.clone(),
            annotations: FailureAnnotations::from_error(failure),
            source_topic: message.topic.clone(),
            source_partition: message.partition,
            source_offset: message.offset,
            failure_class: failure.kind(),
            attempts,
        }
    }

    /// Headers to attach to the DLQ record, annotations first
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let annotations = &self.annotations;
        let mut headers: Vec<(&'static str, String)> = [
            (HEADER_EXCEPTION_MESSAGE, &annotations.exception_message),
            (HEADER_EXCEPTION_CAUSE_MESSAGE, &annotations.cause_message),
            (HEADER_ORIGINAL_EXCEPTION_MESSAGE, &annotations.original_message),
        ]
        .into_iter()
        .filter_map(|(name, value)| value.clone().map(|v| (name, v)))
        .collect();

        headers.extend([
            (HEADER_ORIGINAL_TOPIC, self.source_topic.clone()),
            (HEADER_ORIGINAL_PARTITION, self.source_partition.to_string()),
            (HEADER_ORIGINAL_OFFSET, self.source_offset.to_string()),
            (HEADER_FAILURE_CLASS, self.failure_class.to_string()),
            (HEADER_ATTEMPTS, self.attempts.to_string()),
        ]);
        headers
    }

    pub fn key_str(&self) -> Option<String> {
        self.key.as_deref().map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

/// Transport for dead letters
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError>;
}

/// Routes terminally failed messages to the DLQ
#[derive(Clone)]
pub struct DeadLetterRouter {
    publisher: Arc<dyn DeadLetterPublisher>,
    timeout: Duration,
}

impl DeadLetterRouter {
    pub fn new(publisher: Arc<dyn DeadLetterPublisher>, timeout: Duration) -> Self {
        Self { publisher, timeout }
    }

    /// Publish the failed message once. A failure is logged as an alert and
    /// handed back to the caller, which must not commit the offset.
    pub async fn route(
        &self,
        message: &InboundMessage,
        failure: &ProcessingError,
        attempts: u32,
    ) -> Result<DeadLetter, DeadLetterError> {
        let letter = DeadLetter::new(message, failure, attempts);

        let publish = self.publisher.publish(&letter);
        let result = match tokio::time::timeout(self.timeout, publish).await {
            Ok(result) => result,
            Err(_) => Err(DeadLetterError::Timeout(self.timeout)),
        };

        match result {
            Ok(()) => {
                warn!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    key = ?letter.key_str(),
                    attempts,
                    error = %failure,
                    "Message dead-lettered"
                );
                Ok(letter)
            },
            Err(e) => {
                error!(
                    alert = true,
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    error = %e,
                    "Failed to publish dead letter"
                );
                Err(e)
            },
        }
    }
}
