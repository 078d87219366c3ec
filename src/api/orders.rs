//! `POST /api/orders`: the ingress for new orders
//!
//! A request is validated synchronously (400 on failure), turned into an
//! `OrderCreated` event, encoded with the configured writer schema, framed
//! with its schema id and published keyed by customer id. Persistence
//! happens later, in the consumer.

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    Json,
};
use serde::Serialize;
use std::sync::Arc;

use crate::codec;
use crate::error::{Error, Result};
use crate::kafka::OrderPublisher;
use crate::models::{CreateOrderRequest, OrderCreated};
use crate::schema::{frame, SchemaVersion};

/// Body of a 202 response
#[derive(Debug, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderAccepted {
    pub event_id: String,
    pub order_id: String,
    pub status: String,
}

/// Turns accepted requests into published events
pub struct OrderIngress {
    publisher: Arc<dyn OrderPublisher>,
    writer: Arc<SchemaVersion>,
}

impl OrderIngress {
    pub fn new(publisher: Arc<dyn OrderPublisher>, writer: Arc<SchemaVersion>) -> Self {
        Self { publisher, writer }
    }

    /// Validate, encode and publish one order
    pub async fn submit(&self, request: CreateOrderRequest) -> Result<OrderCreated> {
        let event = request.into_event()?;

        let datum = codec::encode(&event, &self.writer.schema)?;
        let payload = frame(self.writer.id, &datum);

        self.publisher
            .publish(&event.customer_id, payload)
            .await?;

        tracing::info!(
            order_id = %event.order_id,
            customer_id = %event.customer_id,
            schema_id = self.writer.id,
            "Order event published"
        );

        Ok(event)
    }
}

/// Handler for `POST /api/orders`
pub async fn create_order(
    State(ingress): State<Arc<OrderIngress>>,
    body: std::result::Result<Json<CreateOrderRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<OrderAccepted>)> {
    let Json(request) =
        body.map_err(|rejection| Error::validation(rejection.body_text()))?;

    let event = ingress.submit(request).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(OrderAccepted {
            event_id: event.event_id,
            order_id: event.order_id,
            status: "accepted".to_string(),
        }),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Money;
    use crate::schema::{unframe, InMemorySchemaRegistry, SchemaRegistry, ORDER_CREATED_SUBJECT};
    use crate::test_utils::RecordingOrderPublisher;
    use serde_json::json;

    async fn ingress(writer_version: u32) -> (OrderIngress, Arc<RecordingOrderPublisher>) {
        let registry = InMemorySchemaRegistry::with_bundled().await.unwrap();
        let writer = registry
            .version(ORDER_CREATED_SUBJECT, writer_version)
            .await
            .unwrap();
        let publisher = Arc::new(RecordingOrderPublisher::new());
        (OrderIngress::new(publisher.clone(), writer), publisher)
    }

    fn request(body: serde_json::Value) -> CreateOrderRequest {
        serde_json::from_value(body).unwrap()
    }

    #[tokio::test]
    async fn test_submit_publishes_framed_event_keyed_by_customer() {
        let (ingress, publisher) = ingress(2).await;

        let event = ingress
            .submit(request(json!({"orderId": "ORD-123", "customerId": "C-42", "total": 99.50})))
            .await
            .unwrap();
        assert_eq!(event.event_id, "EVT-ORD-123");

        let published = publisher.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "C-42");

        let (schema_id, datum) = unframe(&published[0].1).unwrap();
        assert_eq!(schema_id, 2);

        let schema = crate::schema::order_created(2).unwrap();
        let decoded = codec::decode(datum, &schema, &schema).unwrap();
        assert_eq!(decoded.order_id, "ORD-123");
        assert_eq!(decoded.total, Money::from_cents(9950));
    }

    #[tokio::test]
    async fn test_submit_uses_configured_writer_version() {
        let (ingress, publisher) = ingress(1).await;

        ingress
            .submit(request(json!({
                "orderId": "ORD-7",
                "customerId": "C-1",
                "total": 1,
                "promotionCode": "SAVE10"
            })))
            .await
            .unwrap();

        let published = publisher.published().await;
        let (schema_id, _) = unframe(&published[0].1).unwrap();
        assert_eq!(schema_id, 1);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_requests_without_publishing() {
        let (ingress, publisher) = ingress(2).await;

        for body in [
            json!({"orderId": "", "customerId": "C-1", "total": 1}),
            json!({"orderId": "ORD-1", "customerId": "  ", "total": 1}),
            json!({"orderId": "ORD-1", "customerId": "C-1", "total": -5.00}),
        ] {
            let err = ingress.submit(request(body)).await.unwrap_err();
            assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        }

        assert!(publisher.published().await.is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_service_unavailable() {
        let (ingress, publisher) = ingress(2).await;
        publisher.fail_next_publish().await;

        let err = ingress
            .submit(request(json!({"orderId": "ORD-1", "customerId": "C-1", "total": 1})))
            .await
            .unwrap_err();

        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
