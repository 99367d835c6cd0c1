//! Order participant: owns orders and announces their cancellation.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::Payload;
use dispatcher::{CommandDispatcher, CommandHandler, HandlerError};
use event_bus::{CommandEnvelope, DomainEventPublisher};
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::fields::{from_original, payload, require_cents, require_str};

pub const SERVICE: &str = "order";
pub const CREATE_ORDER: &str = "create_order";
pub const CANCEL_ORDER: &str = "cancel_order";
pub const GET_ORDER: &str = "get_order";

/// Published when an order is cancelled; keyed by order id.
pub const ORDER_CANCELLED: &str = "order_cancelled";

/// Lifecycle of an order record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderState {
    Created,
    Cancelled,
}

/// An order as stored by the participant.
#[derive(Debug, Clone, Serialize)]
pub struct OrderRecord {
    pub order_id: String,
    pub customer_id: String,
    pub items: Vec<Value>,
    pub total_cents: u64,
    pub state: OrderState,
    pub created_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct OrderBook {
    orders: HashMap<String, OrderRecord>,
    next_id: u32,
}

/// In-memory order participant.
#[derive(Clone)]
pub struct OrderParticipant {
    book: Arc<RwLock<OrderBook>>,
    events: Arc<dyn DomainEventPublisher>,
}

impl OrderParticipant {
    /// Creates an empty order book publishing through `events`.
    pub fn new(events: Arc<dyn DomainEventPublisher>) -> Self {
        Self {
            book: Arc::new(RwLock::new(OrderBook::default())),
            events,
        }
    }

    /// Registers the order commands on `dispatcher`.
    pub fn register(&self, dispatcher: &mut CommandDispatcher) {
        dispatcher.register_command(CREATE_ORDER, CreateOrder(self.clone()));
        dispatcher.register_command(CANCEL_ORDER, CancelOrder(self.clone()));
        dispatcher.register_command(GET_ORDER, GetOrder(self.clone()));
    }

    /// Returns a copy of the order, if known.
    pub async fn order(&self, order_id: &str) -> Option<OrderRecord> {
        self.book.read().await.orders.get(order_id).cloned()
    }

    /// Returns the number of orders ever created.
    pub async fn order_count(&self) -> usize {
        self.book.read().await.orders.len()
    }
}

struct CreateOrder(OrderParticipant);

#[async_trait]
impl CommandHandler for CreateOrder {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let customer_id = require_str(&request, "customer_id")?.to_string();
        let items = match request.get("items") {
            Some(Value::Array(items)) if !items.is_empty() => items.clone(),
            _ => return Err(HandlerError::rejected("Order must contain at least one item")),
        };
        let total_cents = require_cents(&request, "total_amount")?;

        let mut book = self.0.book.write().await;
        book.next_id += 1;
        let order_id = format!("ORD-{:06}", book.next_id);
        book.orders.insert(
            order_id.clone(),
            OrderRecord {
                order_id: order_id.clone(),
                customer_id,
                items,
                total_cents,
                state: OrderState::Created,
                created_at: Utc::now(),
                cancelled_at: None,
            },
        );
        tracing::info!(%order_id, "order created");

        Ok(payload([
            ("order_id", json!(order_id)),
            ("order_status", json!(OrderState::Created)),
        ]))
    }
}

struct CancelOrder(OrderParticipant);

#[async_trait]
impl CommandHandler for CancelOrder {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let order_id = from_original(&request, "order_id").ok_or_else(|| HandlerError::missing("order_id"))?;

        let newly_cancelled = {
            let mut book = self.0.book.write().await;
            match book.orders.get_mut(&order_id) {
                Some(order) if order.state == OrderState::Created => {
                    order.state = OrderState::Cancelled;
                    order.cancelled_at = Some(Utc::now());
                    true
                }
                Some(_) => false,
                None => {
                    return Err(HandlerError::rejected(format!("Order {order_id} not found")));
                }
            }
        };

        if newly_cancelled {
            tracing::info!(%order_id, "order cancelled");
            let reason = request
                .get("reason")
                .cloned()
                .unwrap_or_else(|| json!("saga compensation"));
            self.0
                .events
                .publish_domain_event(
                    ORDER_CANCELLED,
                    &order_id,
                    SERVICE,
                    payload([("order_id", json!(order_id)), ("reason", reason)]),
                )
                .await?;
        }

        Ok(payload([
            ("order_id", json!(order_id)),
            ("order_status", json!(OrderState::Cancelled)),
        ]))
    }
}

struct GetOrder(OrderParticipant);

#[async_trait]
impl CommandHandler for GetOrder {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let order_id = require_str(&request, "order_id")?;
        let order = self
            .0
            .order(order_id)
            .await
            .ok_or_else(|| HandlerError::rejected(format!("Order {order_id} not found")))?;
        match serde_json::to_value(order)? {
            Value::Object(fields) => Ok(fields),
            _ => Err(HandlerError::Internal("order did not serialize to an object".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::CorrelationId;
    use event_bus::{BusConfig, EventBusClient, InMemoryBus};

    async fn participant(bus: &InMemoryBus) -> OrderParticipant {
        let client = EventBusClient::connect(Arc::new(bus.clone()), BusConfig::new(SERVICE))
            .await
            .unwrap();
        OrderParticipant::new(Arc::new(client))
    }

    fn command() -> CommandEnvelope {
        CommandEnvelope::new("test", Payload::new(), CorrelationId::new(), None, "replies", "test")
    }

    fn request(value: Value) -> Payload {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected object"),
        }
    }

    #[tokio::test]
    async fn test_create_order_assigns_sequential_ids() {
        let bus = InMemoryBus::new();
        let orders = participant(&bus).await;
        let body = request(json!({"customer_id": "c-1", "items": [{"product_id": "SKU-1"}], "total_amount": 10.5}));

        let first = CreateOrder(orders.clone()).handle(body.clone(), &command()).await.unwrap();
        let second = CreateOrder(orders.clone()).handle(body, &command()).await.unwrap();

        assert_eq!(first["order_id"], "ORD-000001");
        assert_eq!(second["order_id"], "ORD-000002");
        assert_eq!(first["order_status"], "CREATED");
        assert_eq!(orders.order("ORD-000001").await.unwrap().total_cents, 1050);
    }

    #[tokio::test]
    async fn test_create_order_rejects_empty_items() {
        let bus = InMemoryBus::new();
        let orders = participant(&bus).await;

        let err = CreateOrder(orders.clone())
            .handle(request(json!({"customer_id": "c-1", "items": [], "total_amount": 1.0})), &command())
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
        assert_eq!(orders.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_cancel_publishes_event_once() {
        let bus = InMemoryBus::new();
        let orders = participant(&bus).await;
        let created = CreateOrder(orders.clone())
            .handle(
                request(json!({"customer_id": "c-1", "items": [{"product_id": "SKU-1"}], "total_amount": 3.0})),
                &command(),
            )
            .await
            .unwrap();

        let mut cancel = Payload::new();
        cancel.insert("original_response".into(), Value::Object(created));
        CancelOrder(orders.clone()).handle(cancel.clone(), &command()).await.unwrap();
        CancelOrder(orders.clone()).handle(cancel, &command()).await.unwrap();

        let events = bus.records("order_domain_events").await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].payload["event_type"], ORDER_CANCELLED);
        assert_eq!(events[0].key.as_deref(), Some("ORD-000001"));
        assert_eq!(
            orders.order("ORD-000001").await.unwrap().state,
            OrderState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_get_unknown_order_is_rejected() {
        let bus = InMemoryBus::new();
        let orders = participant(&bus).await;
        let err = GetOrder(orders)
            .handle(request(json!({"order_id": "ORD-404"})), &command())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Order ORD-404 not found");
    }
}
