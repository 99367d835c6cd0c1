//! The order processing saga.

use std::sync::Arc;
use std::time::Duration;

use common::{Payload, SagaId};
use event_bus::{CommandSender, DomainEventPublisher};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::saga::Saga;
use crate::state::SagaStatus;
use crate::step::SagaStep;

/// The saga type identifier for order processing.
pub const SAGA_TYPE: &str = "OrderSaga";

/// `(service, action, compensation)` of every step, in execution order.
pub const STEPS: [(&str, &str, &str); 5] = [
    ("order", "create_order", "cancel_order"),
    ("inventory", "reserve_inventory", "release_inventory"),
    ("payment", "process_payment", "refund_payment"),
    ("shipping", "schedule_shipping", "cancel_shipping"),
    ("notification", "send_notification", "cancel_notification"),
];

/// One order line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product_id: String,
    pub quantity: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
}

/// Input of an order saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub customer_id: String,
    pub items: Vec<OrderItem>,
    pub total_amount: f64,
}

impl OrderRequest {
    /// Checks the request before a saga is started for it.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.customer_id.trim().is_empty() {
            return Err("customer_id must not be empty".to_string());
        }
        if self.items.is_empty() {
            return Err("items must not be empty".to_string());
        }
        if let Some(item) = self.items.iter().find(|item| item.quantity == 0) {
            return Err(format!("quantity of {} must be positive", item.product_id));
        }
        if !self.total_amount.is_finite() || self.total_amount <= 0.0 {
            return Err("total_amount must be positive".to_string());
        }
        Ok(())
    }

    /// Returns the request as the saga's initial context.
    pub fn to_payload(&self) -> Payload {
        match serde_json::to_value(self) {
            Ok(Value::Object(fields)) => fields,
            _ => Payload::new(),
        }
    }
}

/// The reduced view of an order saga returned to API callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OrderSagaResult {
    pub saga_id: SagaId,
    pub order_id: Option<String>,
    pub status: SagaStatus,
    pub message: String,
}

/// Create order → reserve inventory → process payment → schedule shipping →
/// send notification, compensated in reverse.
pub struct OrderSaga {
    saga: Saga,
}

impl OrderSaga {
    /// Builds the five-step saga for `request`.
    pub fn new(sender: Arc<dyn CommandSender>, request: &OrderRequest) -> Self {
        let steps = STEPS
            .iter()
            .map(|(service, action, compensation)| SagaStep::new(*service, *action, *compensation))
            .collect();
        Self {
            saga: Saga::new(sender, steps, request.to_payload()).with_saga_type(SAGA_TYPE),
        }
    }

    /// Publishes lifecycle events through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn DomainEventPublisher>) -> Self {
        self.saga = self.saga.with_publisher(publisher);
        self
    }

    /// Sets the per-step reply timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.saga = self.saga.with_step_timeout(timeout);
        self
    }

    pub fn saga(&self) -> &Saga {
        &self.saga
    }

    /// Executes the saga and reduces the outcome for the caller.
    pub async fn process_order(&mut self) -> Result<OrderSagaResult> {
        let outcome = self.saga.execute().await?;
        let order_id = outcome
            .context
            .get("order_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let message = match outcome.status {
            SagaStatus::Completed => "Order processed successfully".to_string(),
            _ => format!(
                "Order processing failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            ),
        };

        Ok(OrderSagaResult {
            saga_id: self.saga.id(),
            order_id,
            status: outcome.status,
            message,
        })
    }
}
