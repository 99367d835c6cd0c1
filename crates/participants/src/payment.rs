//! Payment participant: charges and refunds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::Payload;
use dispatcher::{CommandDispatcher, CommandHandler, HandlerError};
use event_bus::CommandEnvelope;
use serde_json::json;
use tokio::sync::RwLock;

use crate::fields::{from_original, payload, require_cents};

pub const SERVICE: &str = "payment";
pub const PROCESS_PAYMENT: &str = "process_payment";
pub const REFUND_PAYMENT: &str = "refund_payment";

/// A captured payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRecord {
    pub payment_id: String,
    pub order_id: Option<String>,
    pub amount_cents: u64,
    pub refunded: bool,
}

#[derive(Debug, Default)]
struct Ledger {
    payments: HashMap<String, PaymentRecord>,
    next_id: u32,
    limit_cents: Option<u64>,
    decline_all: bool,
}

/// In-memory payment participant.
#[derive(Clone, Default)]
pub struct PaymentParticipant {
    ledger: Arc<RwLock<Ledger>>,
}

impl PaymentParticipant {
    /// Creates a participant declining single charges above `limit_cents`.
    pub fn new(limit_cents: Option<u64>) -> Self {
        Self {
            ledger: Arc::new(RwLock::new(Ledger {
                limit_cents,
                ..Ledger::default()
            })),
        }
    }

    pub fn register(&self, dispatcher: &mut CommandDispatcher) {
        dispatcher.register_command(PROCESS_PAYMENT, ProcessPayment(self.clone()));
        dispatcher.register_command(REFUND_PAYMENT, RefundPayment(self.clone()));
    }

    /// Makes every following charge fail.
    pub async fn set_decline_all(&self, decline: bool) {
        self.ledger.write().await.decline_all = decline;
    }

    pub async fn payment(&self, payment_id: &str) -> Option<PaymentRecord> {
        self.ledger.read().await.payments.get(payment_id).cloned()
    }

    /// Returns the number of payments not refunded.
    pub async fn captured_count(&self) -> usize {
        self.ledger
            .read()
            .await
            .payments
            .values()
            .filter(|p| !p.refunded)
            .count()
    }
}

struct ProcessPayment(PaymentParticipant);

#[async_trait]
impl CommandHandler for ProcessPayment {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let amount_cents = require_cents(&request, "total_amount")?;
        let order_id = request
            .get("order_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut ledger = self.0.ledger.write().await;
        if ledger.decline_all {
            return Err(HandlerError::rejected("Payment declined"));
        }
        match ledger.limit_cents {
            Some(limit) if amount_cents > limit => {
                return Err(HandlerError::rejected(format!(
                    "Payment declined: {amount_cents} cents exceeds the limit of {limit} cents"
                )));
            }
            _ => {}
        }

        ledger.next_id += 1;
        let payment_id = format!("PAY-{:06}", ledger.next_id);
        ledger.payments.insert(
            payment_id.clone(),
            PaymentRecord {
                payment_id: payment_id.clone(),
                order_id,
                amount_cents,
                refunded: false,
            },
        );
        tracing::info!(%payment_id, amount_cents, "payment captured");

        Ok(payload([
            ("payment_id", json!(payment_id)),
            ("amount_charged_cents", json!(amount_cents)),
        ]))
    }
}

struct RefundPayment(PaymentParticipant);

#[async_trait]
impl CommandHandler for RefundPayment {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let payment_id =
            from_original(&request, "payment_id").ok_or_else(|| HandlerError::missing("payment_id"))?;

        let mut ledger = self.0.ledger.write().await;
        let Some(record) = ledger.payments.get_mut(&payment_id) else {
            return Err(HandlerError::rejected(format!("Payment {payment_id} not found")));
        };
        let already_refunded = record.refunded;
        record.refunded = true;
        if !already_refunded {
            tracing::info!(%payment_id, "payment refunded");
        }

        Ok(payload([
            ("payment_id", json!(payment_id)),
            ("refunded_cents", json!(record.amount_cents)),
            ("already_refunded", json!(already_refunded)),
        ]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::CorrelationId;
    use serde_json::Value;

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
    async fn test_charge_over_limit_is_declined() {
        let payments = PaymentParticipant::new(Some(10_000));

        let ok = ProcessPayment(payments.clone())
            .handle(request(json!({"total_amount": 99.99})), &command())
            .await
            .unwrap();
        assert_eq!(ok["payment_id"], "PAY-000001");

        let err = ProcessPayment(payments.clone())
            .handle(request(json!({"total_amount": 100.01})), &command())
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Payment declined"));
        assert_eq!(payments.captured_count().await, 1);
    }

    #[tokio::test]
    async fn test_decline_all() {
        let payments = PaymentParticipant::new(None);
        payments.set_decline_all(true).await;

        let err = ProcessPayment(payments)
            .handle(request(json!({"total_amount": 1.0})), &command())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Payment declined");
    }

    #[tokio::test]
    async fn test_refund_is_idempotent() {
        let payments = PaymentParticipant::new(None);
        let charged = ProcessPayment(payments.clone())
            .handle(request(json!({"total_amount": 25.0})), &command())
            .await
            .unwrap();

        let mut refund = Payload::new();
        refund.insert("original_response".into(), Value::Object(charged));

        let first = RefundPayment(payments.clone()).handle(refund.clone(), &command()).await.unwrap();
        let second = RefundPayment(payments.clone()).handle(refund, &command()).await.unwrap();

        assert_eq!(first["already_refunded"], false);
        assert_eq!(second["already_refunded"], true);
        assert_eq!(first["refunded_cents"], 2500);
        assert_eq!(payments.captured_count().await, 0);
    }
}
