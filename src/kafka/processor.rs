//! The per-message ingestion state machine
//!
//! ```text
//! Received -> Decoded -> Validated -> Persisted
//!     |           |
//!     v           v
//! DecodeFailed  ValidationFailed  --> DeadLettered
//! ```
//!
//! Storage failures are either redelivered (transient, budget left) or
//! dead-lettered. Every error is resolved here; the worker only sees a
//! [`ProcessingOutcome`].

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn, Instrument, Span};

use crate::codec::{self, DecodeError};
use crate::db::{OrderRepository, RepositoryError, UpsertOutcome};
use crate::dlq::{DeadLetterError, DeadLetterRouter};
use crate::models::{validate_order, OrderCreated, ValidationError};
use crate::retry::{FailureClass, RetryPolicy};
use crate::schema::{unframe, SchemaRegistry, SchemaVersion};

use super::InboundMessage;

/// Where a message is in its processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionState {
    Received,
    Decoded,
    Validated,
    Persisted,
    DecodeFailed,
    ValidationFailed,
    DeadLettered,
}

impl IngestionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestionState::Received => "received",
            IngestionState::Decoded => "decoded",
            IngestionState::Validated => "validated",
            IngestionState::Persisted => "persisted",
            IngestionState::DecodeFailed => "decode_failed",
            IngestionState::ValidationFailed => "validation_failed",
            IngestionState::DeadLettered => "dead_lettered",
        }
    }

    /// Whether the message's offset may be committed in this state
    pub fn is_terminal(&self) -> bool {
        matches!(self, IngestionState::Persisted | IngestionState::DeadLettered)
    }
}

/// Why a message could not be ingested
#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("decode failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("storage failed: {0}")]
    Storage(#[from] RepositoryError),

    #[error("persistence timed out after {0:?}")]
    PersistTimeout(Duration),
}

impl ProcessingError {
    /// Whether a later attempt could succeed
    pub fn is_transient(&self) -> bool {
        match self {
            ProcessingError::Decode(_) | ProcessingError::Validation(_) => false,
            ProcessingError::Storage(e) => e.is_retryable(),
            ProcessingError::PersistTimeout(_) => true,
        }
    }

    /// Pipeline stage that failed
    pub fn kind(&self) -> &'static str {
        match self {
            ProcessingError::Decode(_) => "decode",
            ProcessingError::Validation(_) => "validation",
            ProcessingError::Storage(_) | ProcessingError::PersistTimeout(_) => "storage",
        }
    }

    /// State the message ends in when this error is terminal
    pub fn failed_state(&self) -> IngestionState {
        match self {
            ProcessingError::Decode(_) => IngestionState::DecodeFailed,
            ProcessingError::Validation(_) => IngestionState::ValidationFailed,
            ProcessingError::Storage(_) | ProcessingError::PersistTimeout(_) => {
                IngestionState::Validated
            },
        }
    }
}

/// What the worker must do with the message after one attempt
#[derive(Debug)]
pub enum ProcessingOutcome {
    /// Stored (or already stored); commit
    Persisted(UpsertOutcome),
    /// Published to the DLQ; commit
    DeadLettered { class: &'static str },
    /// Seek back and redeliver after `delay`
    Retry { attempt: u32, delay: Duration },
    /// The DLQ publish itself failed; do not commit
    DeadLetterFailed(DeadLetterError),
}

impl ProcessingOutcome {
    /// Whether the offset can be committed
    pub fn should_commit(&self) -> bool {
        self.state().is_terminal()
    }

    pub fn state(&self) -> IngestionState {
        match self {
            ProcessingOutcome::Persisted(_) => IngestionState::Persisted,
            ProcessingOutcome::DeadLettered { .. } => IngestionState::DeadLettered,
            ProcessingOutcome::Retry { .. } | ProcessingOutcome::DeadLetterFailed(_) => {
                IngestionState::Received
            },
        }
    }
}

/// Decode, validate and persist one message at a time.
///
/// Holds only immutable, shared collaborators, so one pipeline can be cloned
/// into every worker.
#[derive(Clone)]
pub struct IngestionPipeline {
    registry: Arc<dyn SchemaRegistry>,
    reader: Arc<SchemaVersion>,
    repository: Arc<dyn OrderRepository>,
    router: DeadLetterRouter,
    policy: RetryPolicy,
    persist_timeout: Duration,
}

impl IngestionPipeline {
    pub fn new(
        registry: Arc<dyn SchemaRegistry>,
        reader: Arc<SchemaVersion>,
        repository: Arc<dyn OrderRepository>,
        router: DeadLetterRouter,
        policy: RetryPolicy,
        persist_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            reader,
            repository,
            router,
            policy,
            persist_timeout,
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run one delivery of `message`. `attempt` is 1-based.
    pub async fn process(&self, message: &InboundMessage, attempt: u32) -> ProcessingOutcome {
        let span = crate::kafka_span!(message.partition, message.offset, attempt);

        async move {
            span_state(IngestionState::Received);

            let failure = match self.ingest(message).await {
                Ok(outcome) => {
                    span_state(IngestionState::Persisted);
                    info!(outcome = outcome.as_str(), "Order persisted");
                    return ProcessingOutcome::Persisted(outcome);
                },
                Err(failure) => failure,
            };

            match self.policy.classify(&failure, attempt) {
                FailureClass::Retryable => {
                    let delay = self.policy.next_delay(attempt);
                    warn!(
                        error = %failure,
                        delay_ms = delay.as_millis() as u64,
                        "Transient failure, message will be redelivered"
                    );
                    ProcessingOutcome::Retry { attempt, delay }
                },
                FailureClass::Terminal => {
                    span_state(failure.failed_state());
                    match self.router.route(message, &failure, attempt).await {
                        Ok(_) => {
                            span_state(IngestionState::DeadLettered);
                            ProcessingOutcome::DeadLettered {
                                class: failure.kind(),
                            }
                        },
                        Err(e) => ProcessingOutcome::DeadLetterFailed(e),
                    }
                },
            }
        }
        .instrument(span)
        .await
    }

    async fn ingest(&self, message: &InboundMessage) -> Result<UpsertOutcome, ProcessingError> {
        let event = self.decode(message).await?;
        Span::current().record("order_id", event.order_id.as_str());
        span_state(IngestionState::Decoded);

        validate_order(&event)?;
        span_state(IngestionState::Validated);

        self.persist(&event).await
    }

    async fn decode(&self, message: &InboundMessage) -> Result<OrderCreated, DecodeError> {
        let payload = match message.payload.as_deref() {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Err(DecodeError::EmptyPayload),
        };

        let (schema_id, datum) = unframe(payload)?;
        let writer = self.registry.resolve(schema_id).await?;
        debug!(
            schema_id,
            writer_version = writer.version,
            reader_version = self.reader.version,
            "Resolved writer schema"
        );

        codec::decode(datum, &writer.schema, &self.reader.schema)
    }

    async fn persist(&self, event: &OrderCreated) -> Result<UpsertOutcome, ProcessingError> {
        let upsert = self
            .repository
            .upsert_if_absent(&event.order_id, event.total);

        match tokio::time::timeout(self.persist_timeout, upsert).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProcessingError::PersistTimeout(self.persist_timeout)),
        }
    }
}

fn span_state(state: IngestionState) {
    Span::current().record("state", state.as_str());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Repository;
    use crate::models::Money;
    use crate::schema::{frame, InMemorySchemaRegistry};
    use crate::test_utils::{
        framed_order, inbound, sample_order, InMemoryOrderRepository,
        RecordingDeadLetterPublisher,
    };

    struct Harness {
        pipeline: IngestionPipeline,
        repository: Arc<InMemoryOrderRepository>,
        dlq: Arc<RecordingDeadLetterPublisher>,
    }

    async fn harness(reader_version: u32) -> Harness {
        let registry = InMemorySchemaRegistry::with_bundled().await.unwrap();
        let reader = registry
            .version(crate::schema::ORDER_CREATED_SUBJECT, reader_version)
            .await
            .unwrap();
        let repository = Arc::new(InMemoryOrderRepository::new());
        let dlq = Arc::new(RecordingDeadLetterPublisher::new());
        let policy = RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            multiplier: 2.0,
        };

        let pipeline = IngestionPipeline::new(
            Arc::new(registry),
            reader,
            repository.clone(),
            DeadLetterRouter::new(dlq.clone(), Duration::from_secs(1)),
            policy,
            Duration::from_millis(200),
        );

        Harness {
            pipeline,
            repository,
            dlq,
        }
    }

    #[tokio::test]
    async fn test_valid_message_is_persisted() {
        let h = harness(2).await;
        let order = sample_order("ORD-1", "C-1", 1000);
        let message = inbound(framed_order(&order, 2), "C-1", 0, 0);

        let outcome = h.pipeline.process(&message, 1).await;

        assert!(matches!(
            outcome,
            ProcessingOutcome::Persisted(UpsertOutcome::Inserted)
        ));
        assert!(outcome.should_commit());
        assert_eq!(
            h.repository.get("ORD-1").map(|r| r.total),
            Some(Money::from_cents(1000))
        );
    }

    #[tokio::test]
    async fn test_redelivery_is_idempotent() {
        let h = harness(2).await;
        let order = sample_order("ORD-999", "C-1", 1000);
        let payload = framed_order(&order, 2);

        let first = h.pipeline.process(&inbound(payload.clone(), "C-1", 0, 0), 1).await;
        let second = h.pipeline.process(&inbound(payload, "C-1", 0, 1), 1).await;

        assert!(matches!(first, ProcessingOutcome::Persisted(UpsertOutcome::Inserted)));
        assert!(matches!(
            second,
            ProcessingOutcome::Persisted(UpsertOutcome::AlreadyPresent)
        ));
        assert_eq!(h.repository.count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_negative_total_is_dead_lettered() {
        let h = harness(2).await;
        let order = sample_order("ORD-BAD", "C-9", -500);
        let message = inbound(framed_order(&order, 2), "C-9", 0, 3);

        let outcome = h.pipeline.process(&message, 1).await;

        assert!(matches!(
            outcome,
            ProcessingOutcome::DeadLettered { class: "validation" }
        ));
        assert!(h.repository.get("ORD-BAD").is_none());

        let letters = h.dlq.letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].key_str().as_deref(), Some("C-9"));
        assert!(letters[0].annotations.mentions("negative total"));
        assert_eq!(letters[0].payload, message.payload);
    }

    #[tokio::test]
    async fn test_missing_payload_is_dead_lettered() {
        let h = harness(2).await;
        let mut message = inbound(Vec::new(), "C-1", 0, 0);
        message.payload = None;

        let outcome = h.pipeline.process(&message, 1).await;

        assert!(matches!(outcome, ProcessingOutcome::DeadLettered { class: "decode" }));
        let letters = h.dlq.letters().await;
        assert_eq!(letters.len(), 1);
        assert!(letters[0].payload.is_none());
    }

    #[tokio::test]
    async fn test_unknown_schema_id_is_dead_lettered() {
        let h = harness(2).await;
        let order = sample_order("ORD-2", "C-1", 100);
        let datum = codec::encode(&order, &crate::schema::order_created(2).unwrap()).unwrap();
        let message = inbound(frame(42, &datum), "C-1", 0, 0);

        let outcome = h.pipeline.process(&message, 1).await;

        assert!(matches!(outcome, ProcessingOutcome::DeadLettered { class: "decode" }));
        let letters = h.dlq.letters().await;
        assert!(letters[0].annotations.mentions("42"));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_dead_lettered() {
        let h = harness(2).await;
        let message = inbound(b"{\"orderId\":\"ORD-1\"}".to_vec(), "C-1", 0, 0);

        let outcome = h.pipeline.process(&message, 1).await;

        assert!(matches!(outcome, ProcessingOutcome::DeadLettered { class: "decode" }));
        assert_eq!(h.repository.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_storage_failure_retries_then_dead_letters() {
        let h = harness(2).await;
        h.repository.fail_times(10);
        let order = sample_order("ORD-3", "C-1", 100);
        let message = inbound(framed_order(&order, 2), "C-1", 1, 7);

        let first = h.pipeline.process(&message, 1).await;
        assert!(matches!(
            first,
            ProcessingOutcome::Retry { attempt: 1, delay } if delay == Duration::from_millis(10)
        ));
        assert!(!first.should_commit());

        let second = h.pipeline.process(&message, 2).await;
        assert!(matches!(
            second,
            ProcessingOutcome::Retry { attempt: 2, delay } if delay == Duration::from_millis(20)
        ));

        let third = h.pipeline.process(&message, 3).await;
        assert!(matches!(third, ProcessingOutcome::DeadLettered { class: "storage" }));

        let letters = h.dlq.letters().await;
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_transient_failure_recovers_on_redelivery() {
        let h = harness(2).await;
        h.repository.fail_times(1);
        let order = sample_order("ORD-4", "C-1", 100);
        let message = inbound(framed_order(&order, 2), "C-1", 0, 0);

        assert!(matches!(
            h.pipeline.process(&message, 1).await,
            ProcessingOutcome::Retry { .. }
        ));
        assert!(matches!(
            h.pipeline.process(&message, 2).await,
            ProcessingOutcome::Persisted(UpsertOutcome::Inserted)
        ));
        assert!(h.dlq.letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_slow_storage_times_out_as_transient() {
        let h = harness(2).await;
        h.repository.set_latency(Duration::from_secs(5));
        let order = sample_order("ORD-5", "C-1", 100);
        let message = inbound(framed_order(&order, 2), "C-1", 0, 0);

        let outcome = h.pipeline.process(&message, 1).await;

        assert!(matches!(outcome, ProcessingOutcome::Retry { attempt: 1, .. }));
    }

    #[tokio::test]
    async fn test_dead_letter_failure_is_not_committed() {
        let h = harness(2).await;
        h.dlq.fail_next_publish().await;
        let order = sample_order("ORD-6", "C-9", -1);
        let message = inbound(framed_order(&order, 2), "C-9", 0, 0);

        let outcome = h.pipeline.process(&message, 1).await;

        assert!(matches!(outcome, ProcessingOutcome::DeadLetterFailed(_)));
        assert!(!outcome.should_commit());
    }

    #[tokio::test]
    async fn test_v1_reader_accepts_v2_writer() {
        let h = harness(1).await;
        let order = sample_order("ORD-200", "C-1", 100).with_promotion_code("SAVE10");
        let message = inbound(framed_order(&order, 2), "C-1", 0, 0);

        let outcome = h.pipeline.process(&message, 1).await;

        assert!(matches!(outcome, ProcessingOutcome::Persisted(_)));
        assert!(h.repository.get("ORD-200").is_some());
    }

    #[test]
    fn test_error_classification() {
        assert!(!ProcessingError::Decode(DecodeError::EmptyPayload).is_transient());
        assert!(ProcessingError::PersistTimeout(Duration::from_secs(1)).is_transient());
        assert!(ProcessingError::Storage(RepositoryError::PoolExhausted).is_transient());
        assert_eq!(
            ProcessingError::PersistTimeout(Duration::from_secs(1)).kind(),
            "storage"
        );
        assert_eq!(
            ProcessingError::Validation(ValidationError::missing_order_id()).failed_state(),
            IngestionState::ValidationFailed
        );
    }
}
