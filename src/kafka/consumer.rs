//! Consumer worker pool with manual offset management
//!
//! Each worker owns one `StreamConsumer` in the shared consumer group. The
//! broker assigns every partition to exactly one member, and a worker handles
//! its messages strictly one after another, so per-partition order holds
//! without any coordination between workers.
//!
//! Offsets are committed only once a message is persisted or dead-lettered. A
//! retry seeks the partition back to the failed offset and sleeps for the
//! policy's delay before polling again. A seek that keeps failing stops the
//! worker, as does a dead letter that cannot be published within the budget.

use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaResult;
use rdkafka::topic_partition_list::TopicPartitionList;
use rdkafka::Offset;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::{IngestionPipeline, InboundMessage, KafkaConfig, KafkaIntegrationError, ProcessingOutcome};
use crate::error::{Error, Result};
use crate::retry::{AttemptTracker, RetryPolicy};

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);
const SEEK_ATTEMPTS: u32 = 3;
const SEEK_BACKOFF: Duration = Duration::from_millis(100);

/// Pool of consumer workers feeding the ingestion pipeline
pub struct EventConsumer {
    config: KafkaConfig,
    pipeline: IngestionPipeline,
    worker_count: usize,
    shutdown: Arc<AtomicBool>,
}

impl EventConsumer {
    pub fn new(config: KafkaConfig, pipeline: IngestionPipeline, worker_count: usize) -> Self {
        Self {
            config,
            pipeline,
            worker_count: worker_count.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops every worker after its in-flight message
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Ask all workers to stop
    pub fn shutdown(&self) {
        info!("Initiating consumer shutdown");
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Run all workers until shutdown or until one of them fails fatally.
    ///
    /// A fatal worker error stops the remaining workers and is returned.
    pub async fn run(self) -> Result<()> {
        info!(
            topic = %self.config.orders_topic,
            group_id = %self.config.group_id,
            workers = self.worker_count,
            "Starting Kafka consumer workers"
        );

        let mut workers = JoinSet::new();
        for id in 0..self.worker_count {
            let worker = Worker::new(id, &self.config, self.pipeline.clone(), self.shutdown_handle())?;
            workers.spawn(worker.run());
        }

        let mut first_error = None;
        while let Some(joined) = workers.join_next().await {
            let result = joined.unwrap_or_else(|e| {
                Err(Error::internal(format!("Consumer worker panicked: {}", e)))
            });

            if let Err(e) = result {
                error!(alert = true, error = %e, "Consumer worker stopped with a fatal error");
                self.shutdown.store(true, Ordering::SeqCst);
                first_error.get_or_insert(e);
            }
        }

        info!("Kafka consumer stopped");
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Offset operations a worker performs on the partitions it owns
trait PartitionCursor {
    /// Mark `offset` as done so the group resumes after it
    fn commit(&self, partition: i32, offset: i64) -> KafkaResult<()>;

    /// Rewind so the next poll returns `offset` again
    fn seek(&self, partition: i32, offset: i64) -> KafkaResult<()>;
}

/// A group member subscribed to the orders topic
struct TopicCursor {
    consumer: StreamConsumer,
    topic: String,
}

impl PartitionCursor for TopicCursor {
    fn commit(&self, partition: i32, offset: i64) -> KafkaResult<()> {
        let offsets = commit_list(&self.topic, partition, offset)?;
        self.consumer.commit(&offsets, CommitMode::Sync)
    }

    fn seek(&self, partition: i32, offset: i64) -> KafkaResult<()> {
        self.consumer
            .seek(&self.topic, partition, Offset::Offset(offset), SEEK_TIMEOUT)
    }
}

/// What the worker does with the partition after one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextStep {
    Commit,
    Redeliver(Duration),
}

/// Settle one outcome against the message's attempt count.
///
/// A failed dead-letter publish counts as an attempt; once the policy's budget
/// is used up the error is returned and the worker must stop.
fn next_step(
    outcome: &ProcessingOutcome,
    attempts: &mut AttemptTracker,
    policy: &RetryPolicy,
    partition: i32,
    offset: i64,
) -> std::result::Result<NextStep, KafkaIntegrationError> {
    match outcome {
        ProcessingOutcome::Persisted(_) | ProcessingOutcome::DeadLettered { .. } => {
            attempts.clear(partition, offset);
            Ok(NextStep::Commit)
        },
        ProcessingOutcome::Retry { delay, .. } => {
            attempts.record_failure(partition, offset);
            Ok(NextStep::Redeliver(*delay))
        },
        ProcessingOutcome::DeadLetterFailed(_) => {
            let failures = attempts.record_failure(partition, offset);
            if policy.is_exhausted(failures) {
                return Err(KafkaIntegrationError::DeadLetterExhausted {
                    partition,
                    offset,
                    attempts: failures,
                });
            }
            Ok(NextStep::Redeliver(policy.next_delay(failures)))
        },
    }
}

struct Worker<C> {
    id: usize,
    cursor: C,
    pipeline: IngestionPipeline,
    attempts: AttemptTracker,
    shutdown: Arc<AtomicBool>,
}

impl Worker<TopicCursor> {
    fn new(
        id: usize,
        config: &KafkaConfig,
        pipeline: IngestionPipeline,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let mut client_config = config.build_consumer_config();
        client_config.set("client.id", format!("order-ingest-{}", id));

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(KafkaIntegrationError::from)?;

        consumer
            .subscribe(&[&config.orders_topic])
            .map_err(KafkaIntegrationError::from)?;

        Ok(Self {
            id,
            cursor: TopicCursor {
                consumer,
                topic: config.orders_topic.clone(),
            },
            pipeline,
            attempts: AttemptTracker::new(),
            shutdown,
        })
    }

    async fn run(mut self) -> Result<()> {
        info!(worker = self.id, "Consumer worker started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }

            let next = tokio::select! {
                msg = self.cursor.consumer.recv() => msg,
                _ = sleep(POLL_INTERVAL) => continue,
            };

            let message = match next {
                Ok(msg) => InboundMessage::from(&msg),
                Err(e) => {
                    error!(worker = self.id, error = %e, "Kafka consumer error");
                    continue;
                },
            };

            self.handle(&message).await?;
        }

        info!(worker = self.id, pending = self.attempts.len(), "Consumer worker stopped");
        Ok(())
    }
}

impl<C: PartitionCursor> Worker<C> {
    /// Run one delivery and act on the outcome. Errors are fatal for the
    /// worker and raise the shutdown flag; nothing past the message is
    /// committed.
    async fn handle(&mut self, message: &InboundMessage) -> Result<()> {
        let (partition, offset) = (message.partition, message.offset);
        let attempt = self.attempts.current(partition, offset);

        let outcome = self.pipeline.process(message, attempt).await;

        let step = match next_step(
            &outcome,
            &mut self.attempts,
            self.pipeline.policy(),
            partition,
            offset,
        ) {
            Ok(step) => step,
            Err(e) => {
                self.shutdown.store(true, Ordering::SeqCst);
                return Err(e.into());
            },
        };

        match step {
            NextStep::Commit => {
                if let Err(e) = self.cursor.commit(partition, offset) {
                    // The message is redelivered after a rebalance; persistence is idempotent.
                    error!(worker = self.id, partition, offset, error = %e, "Offset commit failed");
                } else {
                    debug!(worker = self.id, partition, offset, "Offset committed");
                }
            },
            NextStep::Redeliver(delay) => {
                if let ProcessingOutcome::DeadLetterFailed(e) = &outcome {
                    warn!(
                        worker = self.id,
                        partition,
                        offset,
                        failures = attempt,
                        error = %e,
                        "Dead letter not published, message will be redelivered"
                    );
                }
                self.redeliver(partition, offset, delay).await?;
            },
        }

        Ok(())
    }

    /// Rewind the partition so the broker hands the message out again.
    ///
    /// Polling after a failed seek would return the next offset and a later
    /// commit would skip this message, so running out of seek attempts stops
    /// the worker.
    async fn redeliver(&mut self, partition: i32, offset: i64, delay: Duration) -> Result<()> {
        let mut tries = 0;
        loop {
            tries += 1;
            match self.cursor.seek(partition, offset) {
                Ok(()) => break,
                Err(e) if tries < SEEK_ATTEMPTS => {
                    warn!(
                        worker = self.id,
                        partition,
                        offset,
                        tries,
                        error = %e,
                        "Seek for redelivery failed"
                    );
                    sleep(SEEK_BACKOFF).await;
                },
                Err(e) => {
                    self.attempts.clear(partition, offset);
                    self.shutdown.store(true, Ordering::SeqCst);
                    return Err(KafkaIntegrationError::SeekFailed {
                        partition,
                        offset,
                        reason: e.to_string(),
                    }
                    .into());
                },
            }
        }

        sleep(delay).await;
        Ok(())
    }
}

/// Offsets to commit after `offset` reached a terminal state
fn commit_list(topic: &str, partition: i32, offset: i64) -> KafkaResult<TopicPartitionList> {
    let mut offsets = TopicPartitionList::new();
    offsets.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;
    Ok(offsets)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::UpsertOutcome;
    use crate::dlq::{DeadLetterError, DeadLetterRouter};
    use crate::schema::{InMemorySchemaRegistry, SchemaRegistry, ORDER_CREATED_SUBJECT};
    use crate::test_utils::{
        framed_order, inbound, sample_order, InMemoryOrderRepository, RecordingDeadLetterPublisher,
    };
    use rdkafka::error::KafkaError;
    use std::sync::Mutex;

    /// Records commits and seeks; the first `failing_seeks` seeks fail
    #[derive(Default)]
    struct RecordingCursor {
        commits: Mutex<Vec<(i32, i64)>>,
        seeks: Mutex<Vec<(i32, i64)>>,
        failing_seeks: Mutex<u32>,
    }

    impl RecordingCursor {
        fn failing_seeks(times: u32) -> Self {
            Self {
                failing_seeks: Mutex::new(times),
                ..Self::default()
            }
        }

        fn commits(&self) -> Vec<(i32, i64)> {
            self.commits.lock().unwrap().clone()
        }

        fn seeks(&self) -> Vec<(i32, i64)> {
            self.seeks.lock().unwrap().clone()
        }
    }

    impl PartitionCursor for RecordingCursor {
        fn commit(&self, partition: i32, offset: i64) -> KafkaResult<()> {
            self.commits.lock().unwrap().push((partition, offset));
            Ok(())
        }

        fn seek(&self, partition: i32, offset: i64) -> KafkaResult<()> {
            self.seeks.lock().unwrap().push((partition, offset));
            let mut failing = self.failing_seeks.lock().unwrap();
            if *failing > 0 {
                *failing -= 1;
                return Err(KafkaError::Seek("partition not assigned".to_string()));
            }
            Ok(())
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            multiplier: 2.0,
        }
    }

    async fn pipeline_with(
        repository: Arc<InMemoryOrderRepository>,
        dlq: Arc<RecordingDeadLetterPublisher>,
    ) -> IngestionPipeline {
        let registry = InMemorySchemaRegistry::with_bundled().await.unwrap();
        let reader = registry.version(ORDER_CREATED_SUBJECT, 2).await.unwrap();

        IngestionPipeline::new(
            Arc::new(registry),
            reader,
            repository,
            DeadLetterRouter::new(dlq, Duration::from_secs(1)),
            fast_policy(),
            Duration::from_secs(1),
        )
    }

    async fn pipeline() -> IngestionPipeline {
        pipeline_with(
            Arc::new(InMemoryOrderRepository::new()),
            Arc::new(RecordingDeadLetterPublisher::new()),
        )
        .await
    }

    fn worker(pipeline: IngestionPipeline, cursor: RecordingCursor) -> Worker<RecordingCursor> {
        Worker {
            id: 0,
            cursor,
            pipeline,
            attempts: AttemptTracker::new(),
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    fn dlq_down() -> ProcessingOutcome {
        ProcessingOutcome::DeadLetterFailed(DeadLetterError::Publish {
            topic: "orders.created.DLQ".to_string(),
            reason: "broker down".to_string(),
        })
    }

    #[test]
    fn test_commit_list_points_past_the_message() {
        let offsets = commit_list("orders.created", 2, 41).unwrap();
        let element = offsets.find_partition("orders.created", 2).unwrap();
        assert_eq!(element.offset(), Offset::Offset(42));
    }

    #[test]
    fn test_terminal_outcome_commits_and_forgets_attempts() {
        let mut attempts = AttemptTracker::new();
        attempts.record_failure(1, 7);

        let step = next_step(
            &ProcessingOutcome::Persisted(UpsertOutcome::Inserted),
            &mut attempts,
            &fast_policy(),
            1,
            7,
        )
        .unwrap();

        assert_eq!(step, NextStep::Commit);
        assert!(attempts.is_empty());
    }

    #[test]
    fn test_retry_outcome_counts_the_attempt() {
        let mut attempts = AttemptTracker::new();
        let outcome = ProcessingOutcome::Retry {
            attempt: 1,
            delay: Duration::from_millis(200),
        };

        let step = next_step(&outcome, &mut attempts, &fast_policy(), 1, 7).unwrap();

        assert_eq!(step, NextStep::Redeliver(Duration::from_millis(200)));
        assert_eq!(attempts.current(1, 7), 2);
    }

    #[test]
    fn test_dead_letter_failures_are_bounded() {
        let policy = fast_policy();
        let mut attempts = AttemptTracker::new();

        for failures in 1..policy.max_attempts {
            let step = next_step(&dlq_down(), &mut attempts, &policy, 4, 10).unwrap();
            assert_eq!(step, NextStep::Redeliver(policy.next_delay(failures)));
        }

        let err = next_step(&dlq_down(), &mut attempts, &policy, 4, 10).unwrap_err();
        assert!(matches!(
            err,
            KafkaIntegrationError::DeadLetterExhausted {
                partition: 4,
                offset: 10,
                attempts: 3
            }
        ));
    }

    #[tokio::test]
    async fn test_persisted_message_is_committed() {
        let repository = Arc::new(InMemoryOrderRepository::new());
        let pipeline =
            pipeline_with(repository.clone(), Arc::new(RecordingDeadLetterPublisher::new())).await;
        let mut worker = worker(pipeline, RecordingCursor::default());

        let order = sample_order("ORD-1", "C-1", 100);
        worker
            .handle(&inbound(framed_order(&order, 2), "C-1", 4, 10))
            .await
            .unwrap();

        assert_eq!(worker.cursor.commits(), vec![(4, 10)]);
        assert!(worker.cursor.seeks().is_empty());
        assert!(repository.get("ORD-1").is_some());
    }

    #[tokio::test]
    async fn test_unpublishable_dead_letter_stops_the_worker() {
        let dlq = Arc::new(RecordingDeadLetterPublisher::new());
        dlq.fail_times(10).await;
        let pipeline = pipeline_with(Arc::new(InMemoryOrderRepository::new()), dlq.clone()).await;
        let mut worker = worker(pipeline, RecordingCursor::default());
        let shutdown = Arc::clone(&worker.shutdown);

        let bad = sample_order("ORD-BAD", "C-9", -500);
        let message = inbound(framed_order(&bad, 2), "C-9", 4, 10);

        worker.handle(&message).await.unwrap();
        worker.handle(&message).await.unwrap();
        assert_eq!(worker.cursor.seeks(), vec![(4, 10), (4, 10)]);
        assert!(!shutdown.load(Ordering::SeqCst));

        let err = worker.handle(&message).await.unwrap_err();

        assert!(err.to_string().contains("after 3 attempts"));
        assert!(shutdown.load(Ordering::SeqCst));
        assert!(worker.cursor.commits().is_empty());
        assert!(dlq.letters().await.is_empty());
    }

    #[tokio::test]
    async fn test_failed_seek_stops_the_worker() {
        let repository = Arc::new(InMemoryOrderRepository::new());
        repository.fail_next_operation();
        let pipeline =
            pipeline_with(repository, Arc::new(RecordingDeadLetterPublisher::new())).await;
        let mut worker = worker(pipeline, RecordingCursor::failing_seeks(u32::MAX));
        let shutdown = Arc::clone(&worker.shutdown);

        let order = sample_order("ORD-2", "C-2", 100);
        let err = worker
            .handle(&inbound(framed_order(&order, 2), "C-2", 4, 10))
            .await
            .unwrap_err();

        assert!(err.to_string().contains("offset 10"));
        assert!(shutdown.load(Ordering::SeqCst));
        assert_eq!(worker.cursor.seeks().len(), SEEK_ATTEMPTS as usize);
        assert!(worker.cursor.commits().is_empty());
        assert!(worker.attempts.is_empty());
    }

    #[tokio::test]
    async fn test_seek_recovers_within_bound() {
        let repository = Arc::new(InMemoryOrderRepository::new());
        repository.fail_next_operation();
        let pipeline =
            pipeline_with(repository.clone(), Arc::new(RecordingDeadLetterPublisher::new())).await;
        let mut worker = worker(pipeline, RecordingCursor::failing_seeks(1));

        let order = sample_order("ORD-3", "C-3", 100);
        let message = inbound(framed_order(&order, 2), "C-3", 4, 10);

        worker.handle(&message).await.unwrap();
        assert_eq!(worker.cursor.seeks(), vec![(4, 10), (4, 10)]);
        assert!(worker.cursor.commits().is_empty());

        worker.handle(&message).await.unwrap();
        assert_eq!(worker.cursor.commits(), vec![(4, 10)]);
        assert!(repository.get("ORD-3").is_some());
        assert!(!worker.shutdown.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_flag() {
        let consumer = EventConsumer::new(KafkaConfig::default(), pipeline().await, 3);
        let handle = consumer.shutdown_handle();

        assert!(!handle.load(Ordering::SeqCst));
        consumer.shutdown();
        assert!(handle.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_zero_workers_is_raised_to_one() {
        let consumer = EventConsumer::new(KafkaConfig::default(), pipeline().await, 0);
        assert_eq!(consumer.worker_count, 1);
    }

    #[tokio::test]
    async fn test_worker_creation_without_broker() {
        let worker = Worker::new(
            0,
            &KafkaConfig::default(),
            pipeline().await,
            Arc::new(AtomicBool::new(false)),
        );
        assert!(worker.is_ok());
    }

    #[tokio::test]
    async fn test_run_returns_once_shut_down() {
        let consumer = EventConsumer::new(KafkaConfig::default(), pipeline().await, 2);
        consumer.shutdown();

        let result = tokio::time::timeout(Duration::from_secs(10), consumer.run()).await;
        assert!(matches!(result, Ok(Ok(()))));
    }
}
