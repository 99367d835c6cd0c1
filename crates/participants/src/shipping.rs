//! Shipping participant.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::Payload;
use dispatcher::{CommandDispatcher, CommandHandler, HandlerError};
use event_bus::CommandEnvelope;
use serde_json::json;
use tokio::sync::RwLock;

use crate::fields::{from_original, payload};

pub const SERVICE: &str = "shipping";
pub const SCHEDULE_SHIPPING: &str = "schedule_shipping";
pub const CANCEL_SHIPPING: &str = "cancel_shipping";

/// A scheduled shipment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shipment {
    pub shipment_id: String,
    pub tracking_number: String,
    pub order_id: Option<String>,
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct Dispatch {
    shipments: HashMap<String, Shipment>,
    next_id: u32,
    fail_on_schedule: bool,
}

#[derive(Clone, Default)]
pub struct ShippingParticipant {
    state: Arc<RwLock<Dispatch>>,
}

impl ShippingParticipant {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, dispatcher: &mut CommandDispatcher) {
        dispatcher.register_command(SCHEDULE_SHIPPING, ScheduleShipping(self.clone()));
        dispatcher.register_command(CANCEL_SHIPPING, CancelShipping(self.clone()));
    }

    /// Makes every following schedule request fail.
    pub async fn set_fail_on_schedule(&self, fail: bool) {
        self.state.write().await.fail_on_schedule = fail;
    }

    pub async fn shipment(&self, shipment_id: &str) -> Option<Shipment> {
        self.state.read().await.shipments.get(shipment_id).cloned()
    }

    /// Returns the number of shipments not cancelled.
    pub async fn active_count(&self) -> usize {
        self.state
            .read()
            .await
            .shipments
            .values()
            .filter(|s| !s.cancelled)
            .count()
    }
}

struct ScheduleShipping(ShippingParticipant);

#[async_trait]
impl CommandHandler for ScheduleShipping {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let order_id = request
            .get("order_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        let mut state = self.0.state.write().await;
        if state.fail_on_schedule {
            return Err(HandlerError::rejected("No carrier available"));
        }

        state.next_id += 1;
        let shipment_id = format!("SHP-{:06}", state.next_id);
        let tracking = uuid::Uuid::new_v4().simple().to_string().to_uppercase();
        let tracking_number = format!("TRK{}", &tracking[..12]);
        state.shipments.insert(
            shipment_id.clone(),
            Shipment {
                shipment_id: shipment_id.clone(),
                tracking_number: tracking_number.clone(),
                order_id,
                cancelled: false,
            },
        );
        tracing::info!(%shipment_id, %tracking_number, "shipment scheduled");

        Ok(payload([
            ("shipment_id", json!(shipment_id)),
            ("tracking_number", json!(tracking_number)),
        ]))
    }
}

struct CancelShipping(ShippingParticipant);

#[async_trait]
impl CommandHandler for CancelShipping {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let shipment_id =
            from_original(&request, "shipment_id").ok_or_else(|| HandlerError::missing("shipment_id"))?;

        let mut state = self.0.state.write().await;
        let Some(shipment) = state.shipments.get_mut(&shipment_id) else {
            return Err(HandlerError::rejected(format!("Shipment {shipment_id} not found")));
        };
        shipment.cancelled = true;

        Ok(payload([
            ("shipment_id", json!(shipment_id)),
            ("shipping_cancelled", json!(true)),
        ]))
    }
}
