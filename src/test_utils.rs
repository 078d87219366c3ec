//! Test utilities for order-ingest
//!
//! In-memory stand-ins for the database, the DLQ and the order topic, plus
//! fixtures shared by unit and integration tests.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::api::{AppState, HealthState, OrderIngress, SchemaVersions};
use crate::config::{Config, DatabaseConfig, KafkaConfig, ProcessingConfig, SchemaConfig, ServerConfig};
use crate::db::{
    OrderRecord, OrderRepository, Repository, RepositoryError, RepositoryResult, UpsertOutcome,
};
use crate::dlq::{DeadLetter, DeadLetterError, DeadLetterPublisher};
use crate::kafka::{InboundMessage, KafkaIntegrationError, OrderPublisher};
use crate::models::{Money, OrderCreated};
use crate::schema::{InMemorySchemaRegistry, SchemaRegistry, ORDER_CREATED_SUBJECT};

/// In-memory implementation of [`OrderRepository`]
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderRepository {
    orders: Arc<Mutex<HashMap<String, OrderRecord>>>,
    failures_remaining: Arc<Mutex<u32>>,
    latency: Arc<Mutex<Option<Duration>>>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next operation with a transient connection error
    pub fn fail_next_operation(&self) {
        self.fail_times(1);
    }

    /// Fail the next `times` operations with a transient connection error
    pub fn fail_times(&self, times: u32) {
        *self.failures_remaining.lock().unwrap() = times;
    }

    /// Delay every upsert by `latency`
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = Some(latency);
    }

    pub fn get(&self, order_id: &str) -> Option<OrderRecord> {
        self.orders.lock().unwrap().get(order_id).cloned()
    }

    pub fn all(&self) -> Vec<OrderRecord> {
        self.orders.lock().unwrap().values().cloned().collect()
    }

    fn check_failure(&self) -> RepositoryResult<()> {
        let mut remaining = self.failures_remaining.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(RepositoryError::Connection("injected failure".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Repository for InMemoryOrderRepository {
    type Entity = OrderRecord;
    type Id = String;

    async fn find_by_id(&self, id: String) -> RepositoryResult<Option<OrderRecord>> {
        self.check_failure()?;
        Ok(self.get(&id))
    }

    async fn exists(&self, id: String) -> RepositoryResult<bool> {
        self.check_failure()?;
        Ok(self.orders.lock().unwrap().contains_key(&id))
    }

    async fn count(&self) -> RepositoryResult<i64> {
        self.check_failure()?;
        Ok(self.orders.lock().unwrap().len() as i64)
    }

    async fn health_check(&self) -> RepositoryResult<()> {
        self.check_failure()
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn upsert_if_absent(
        &self,
        order_id: &str,
        total: Money,
    ) -> RepositoryResult<UpsertOutcome> {
        let latency = *self.latency.lock().unwrap();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.check_failure()?;

        let mut orders = self.orders.lock().unwrap();
        if orders.contains_key(order_id) {
            return Ok(UpsertOutcome::AlreadyPresent);
        }

        orders.insert(
            order_id.to_string(),
            OrderRecord {
                order_id: order_id.to_string(),
                total,
                created_at: Utc::now(),
            },
        );
        Ok(UpsertOutcome::Inserted)
    }
}

/// Collects dead letters instead of sending them
#[derive(Debug, Default)]
pub struct RecordingDeadLetterPublisher {
    letters: tokio::sync::Mutex<Vec<DeadLetter>>,
    failures_remaining: tokio::sync::Mutex<u32>,
}

impl RecordingDeadLetterPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }

    pub async fn fail_next_publish(&self) {
        self.fail_times(1).await;
    }

    pub async fn fail_times(&self, times: u32) {
        *self.failures_remaining.lock().await = times;
    }
}

#[async_trait]
impl DeadLetterPublisher for RecordingDeadLetterPublisher {
    async fn publish(&self, letter: &DeadLetter) -> Result<(), DeadLetterError> {
        let mut remaining = self.failures_remaining.lock().await;
        if *remaining > 0 {
            *remaining -= 1;
            return Err(DeadLetterError::Publish {
                topic: "orders.created.DLQ".to_string(),
                reason: "injected failure".to_string(),
            });
        }

        self.letters.lock().await.push(letter.clone());
        Ok(())
    }
}

/// Collects published order events as `(key, payload)` pairs
#[derive(Debug, Default)]
pub struct RecordingOrderPublisher {
    published: tokio::sync::Mutex<Vec<(String, Vec<u8>)>>,
    fail_next: tokio::sync::Mutex<bool>,
}

impl RecordingOrderPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().await.clone()
    }

    pub async fn fail_next_publish(&self) {
        *self.fail_next.lock().await = true;
    }

    /// Turn everything published so far into consumer-side messages, in order
    pub async fn drain_as_inbound(&self, topic: &str) -> Vec<InboundMessage> {
        self.published
            .lock()
            .await
            .drain(..)
            .enumerate()
            .map(|(offset, (key, payload))| {
                let mut message = inbound(payload, &key, 0, offset as i64);
                message.topic = topic.to_string();
                message
            })
            .collect()
    }
}

#[async_trait]
impl OrderPublisher for RecordingOrderPublisher {
    async fn publish(&self, key: &str, payload: Vec<u8>) -> Result<(), KafkaIntegrationError> {
        let mut fail = self.fail_next.lock().await;
        if *fail {
            *fail = false;
            return Err(KafkaIntegrationError::PublishError {
                topic: "orders.created".to_string(),
                reason: "injected failure".to_string(),
            });
        }

        self.published.lock().await.push((key.to_string(), payload));
        Ok(())
    }
}

/// A consumed record on `orders.created`
pub fn inbound(payload: Vec<u8>, key: &str, partition: i32, offset: i64) -> InboundMessage {
    InboundMessage {
        topic: "orders.created".to_string(),
        partition,
        offset,
        key: Some(key.as_bytes().to_vec()),
        payload: Some(payload),
        timestamp: Some(Utc::now().timestamp_millis()),
    }
}

/// An order with a total given in cents
pub fn sample_order(order_id: &str, customer_id: &str, total_cents: i64) -> OrderCreated {
    OrderCreated::new(order_id, customer_id, Money::from_cents(total_cents))
}

/// Encode with bundled schema `version` and frame with the matching
/// id of [`InMemorySchemaRegistry::with_bundled`]
pub fn framed_order(order: &OrderCreated, version: u32) -> Vec<u8> {
    let schema = crate::schema::order_created(version).unwrap();
    let datum = crate::codec::encode(order, &schema).unwrap();
    crate::schema::frame(version as i32, &datum)
}

/// Configuration suitable for tests; nothing in it is contacted
pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            log_level: "debug".to_string(),
            environment: "test".to_string(),
            request_timeout_secs: 30,
            shutdown_timeout_secs: 30,
        },
        kafka: KafkaConfig::default(),
        database: DatabaseConfig {
            url: "postgresql://test@localhost/test".to_string(),
            pool_max_size: 5,
            pool_min_idle: 1,
            pool_timeout_seconds: 5,
            pool_idle_timeout_seconds: 60,
        },
        processing: ProcessingConfig::default(),
        schema: SchemaConfig {
            reader_version: 2,
            writer_version: 2,
        },
    }
}

/// Versions as reported on `/readyz`
pub fn schema_versions(reader_version: u32, writer_version: u32) -> SchemaVersions {
    SchemaVersions {
        subject: ORDER_CREATED_SUBJECT.to_string(),
        reader_version,
        writer_version,
    }
}

/// Router state wired to in-memory collaborators and the bundled v2 writer
pub async fn app_state(
    repository: Arc<InMemoryOrderRepository>,
    publisher: Arc<RecordingOrderPublisher>,
) -> AppState {
    let registry = InMemorySchemaRegistry::with_bundled().await.unwrap();
    let writer = registry.version(ORDER_CREATED_SUBJECT, 2).await.unwrap();

    AppState {
        config: Arc::new(test_config()),
        health: Arc::new(HealthState::new(repository, schema_versions(2, writer.version))),
        ingress: Arc::new(OrderIngress::new(publisher, writer)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_repository() {
        let repo = InMemoryOrderRepository::new();

        let first = repo.upsert_if_absent("ORD-1", Money::from_cents(100)).await.unwrap();
        let second = repo.upsert_if_absent("ORD-1", Money::from_cents(999)).await.unwrap();

        assert_eq!(first, UpsertOutcome::Inserted);
        assert_eq!(second, UpsertOutcome::AlreadyPresent);
        assert_eq!(repo.count().await.unwrap(), 1);
        assert_eq!(repo.get("ORD-1").unwrap().total, Money::from_cents(100));
        assert!(repo.exists("ORD-1".to_string()).await.unwrap());
    }

    #[tokio::test]
    async fn test_in_memory_repository_failure() {
        let repo = InMemoryOrderRepository::new();
        repo.fail_next_operation();

        let err = repo
            .upsert_if_absent("ORD-1", Money::ZERO)
            .await
            .unwrap_err();
        assert!(err.is_retryable());

        assert!(repo.upsert_if_absent("ORD-1", Money::ZERO).await.is_ok());
    }

    #[tokio::test]
    async fn test_recording_order_publisher_drains_in_order() {
        let publisher = RecordingOrderPublisher::new();
        publisher.publish("C-1", vec![1]).await.unwrap();
        publisher.publish("C-2", vec![2]).await.unwrap();

        let messages = publisher.drain_as_inbound("orders.created").await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].offset, 1);
        assert_eq!(messages[1].key_str().as_deref(), Some("C-2"));
        assert!(publisher.published().await.is_empty());
    }
}
