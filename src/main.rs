//! order-ingest service
//!
//! Runs the consumer worker pool that ingests `OrderCreated` events and the
//! HTTP ingress that publishes them, until SIGINT/SIGTERM or until the
//! consumer stops on a fatal error.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use order_ingest::api::health::{health_monitor, CONSUMER_COMPONENT};
use order_ingest::api::{AppState, HealthState, HealthStatus, OrderIngress, SchemaVersions};
use order_ingest::config::Config;
use order_ingest::db::{self, PgOrderRepository};
use order_ingest::dlq::DeadLetterRouter;
use order_ingest::error::{Error, Result};
use order_ingest::kafka::{DlqProducer, EventConsumer, IngestionPipeline, OrderProducer};
use order_ingest::retry::RetryPolicy;
use order_ingest::schema::{
    self, InMemorySchemaRegistry, SchemaRegistry, LATEST_ORDER_CREATED_VERSION,
    ORDER_CREATED_SUBJECT,
};
use order_ingest::{create_server, logging, shutdown_signal};

const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Arc::new(Config::from_env()?);
    config.validate()?;

    logging::init_tracing(&config.server.log_level, config.server.is_production())?;
    config.log_config();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting order-ingest");

    let pool = db::create_pool(&config.database).await?;
    db::run_migrations(&pool)
        .await
        .map_err(|e| Error::database(format!("Migration failed: {}", e)))?;
    let repository = Arc::new(PgOrderRepository::new(pool.clone()));

    let registry = Arc::new(InMemorySchemaRegistry::with_bundled().await?);
    let reader = registry
        .version(ORDER_CREATED_SUBJECT, config.schema.reader_version)
        .await?;
    let writer = registry
        .version(ORDER_CREATED_SUBJECT, config.schema.writer_version)
        .await?;

    // Every published writer version must stay readable by the configured reader.
    for version in 1..=LATEST_ORDER_CREATED_VERSION {
        let candidate = registry.version(ORDER_CREATED_SUBJECT, version).await?;
        let verdict = schema::check(&reader.schema, &candidate.schema);
        if !verdict.is_compatible() {
            tracing::warn!(
                reader_version = reader.version,
                writer_version = version,
                reasons = ?verdict.reasons(),
                "Reader schema cannot read a published writer version"
            );
        }
    }

    let dlq_producer = DlqProducer::new(
        config.kafka.build_producer_config(),
        config.kafka.dlq_topic.clone(),
    )?;
    let order_producer = OrderProducer::new(
        config.kafka.build_producer_config(),
        config.kafka.orders_topic.clone(),
    )?;

    let pipeline = IngestionPipeline::new(
        registry.clone(),
        reader.clone(),
        repository.clone(),
        DeadLetterRouter::new(
            Arc::new(dlq_producer.clone()),
            config.processing.dlq_timeout(),
        ),
        RetryPolicy::from(&config.processing),
        config.processing.persist_timeout(),
    );

    let health = Arc::new(HealthState::new(
        repository.clone(),
        SchemaVersions {
            subject: ORDER_CREATED_SUBJECT.to_string(),
            reader_version: reader.version,
            writer_version: writer.version,
        },
    ));
    tokio::spawn(health_monitor(health.clone(), HEALTH_CHECK_INTERVAL));

    let consumer = EventConsumer::new(
        config.kafka.clone(),
        pipeline,
        config.processing.worker_concurrency,
    );
    let stop_consumer = consumer.shutdown_handle();
    let (stopped_tx, mut stopped_rx) = tokio::sync::watch::channel(false);

    let consumer_health = health.clone();
    let consumer_task = tokio::spawn(async move {
        let result = consumer.run().await;
        if let Err(e) = &result {
            consumer_health
                .update_component(CONSUMER_COMPONENT, HealthStatus::Unhealthy, Some(e.to_string()))
                .await;
        }
        let _ = stopped_tx.send(true);
        result
    });

    let state = AppState {
        config: config.clone(),
        health,
        ingress: Arc::new(OrderIngress::new(Arc::new(order_producer.clone()), writer)),
    };

    let server_result = create_server(state, async move {
        tokio::select! {
            _ = shutdown_signal() => {},
            _ = stopped_rx.changed() => {
                tracing::error!(alert = true, "Consumer stopped, shutting down");
            },
        }
    })
    .await;

    stop_consumer.store(true, Ordering::SeqCst);
    let consumer_result =
        match tokio::time::timeout(config.server.shutdown_timeout(), consumer_task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(Error::internal(format!("Consumer task failed: {}", e))),
            Err(_) => {
                tracing::warn!("Consumer did not stop within the shutdown timeout");
                Ok(())
            },
        };

    if let Err(e) = dlq_producer.flush() {
        tracing::error!(error = %e, "Failed to flush DLQ producer");
    }
    if let Err(e) = order_producer.flush() {
        tracing::error!(error = %e, "Failed to flush order producer");
    }
    pool.close().await;

    server_result?;
    consumer_result?;

    tracing::info!("order-ingest shutdown complete");
    Ok(())
}
