//! Inventory participant: stock levels and reservations.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use common::Payload;
use dispatcher::{CommandDispatcher, CommandHandler, EventHandler, HandlerError};
use event_bus::{CommandEnvelope, DomainEventEnvelope};
use serde_json::{Value, json};
use tokio::sync::RwLock;

use crate::fields::{from_original, payload, require_str};
use crate::order::ORDER_CANCELLED;

pub const SERVICE: &str = "inventory";
pub const RESERVE_INVENTORY: &str = "reserve_inventory";
pub const RELEASE_INVENTORY: &str = "release_inventory";

/// A line of a reservation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedItem {
    pub product_id: String,
    pub quantity: u32,
}

/// Stock held for one order.
#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: String,
    pub order_id: Option<String>,
    pub items: Vec<ReservedItem>,
}

#[derive(Debug, Default)]
struct Warehouse {
    stock: HashMap<String, u32>,
    default_stock: u32,
    reservations: HashMap<String, Reservation>,
    next_id: u32,
}

impl Warehouse {
    fn available(&self, product_id: &str) -> u32 {
        self.stock
            .get(product_id)
            .copied()
            .unwrap_or(self.default_stock)
    }

    /// Puts the reservation's stock back. Nothing changes if any product
    /// would overflow.
    fn restock(&mut self, reservation: &Reservation) -> Result<(), HandlerError> {
        let mut restocked: HashMap<&str, u32> = HashMap::new();
        for item in &reservation.items {
            let product_id = item.product_id.as_str();
            let current = restocked
                .get(product_id)
                .copied()
                .unwrap_or_else(|| self.available(product_id));
            let next = current
                .checked_add(item.quantity)
                .ok_or_else(|| HandlerError::rejected(format!("Stock of {product_id} would overflow")))?;
            restocked.insert(product_id, next);
        }
        for (product_id, quantity) in restocked {
            self.stock.insert(product_id.to_string(), quantity);
        }
        Ok(())
    }
}

/// In-memory inventory participant.
///
/// Products never stocked explicitly start with `default_stock` units.
#[derive(Clone)]
pub struct InventoryParticipant {
    warehouse: Arc<RwLock<Warehouse>>,
}

impl InventoryParticipant {
    pub fn new(default_stock: u32) -> Self {
        Self {
            warehouse: Arc::new(RwLock::new(Warehouse {
                default_stock,
                ..Warehouse::default()
            })),
        }
    }

    /// Registers the inventory commands and the `order_cancelled` reaction.
    ///
    /// The dispatcher must also be subscribed to the order service's events.
    pub fn register(&self, dispatcher: &mut CommandDispatcher) {
        dispatcher.register_command(RESERVE_INVENTORY, ReserveInventory(self.clone()));
        dispatcher.register_command(RELEASE_INVENTORY, ReleaseInventory(self.clone()));
        dispatcher.register_event(ORDER_CANCELLED, ReleaseOnOrderCancelled(self.clone()));
    }

    /// Sets the available quantity of `product_id`.
    pub async fn set_stock(&self, product_id: impl Into<String>, quantity: u32) {
        self.warehouse
            .write()
            .await
            .stock
            .insert(product_id.into(), quantity);
    }

    /// Returns the available quantity of `product_id`.
    pub async fn stock(&self, product_id: &str) -> u32 {
        self.warehouse.read().await.available(product_id)
    }

    /// Returns the number of active reservations.
    pub async fn reservation_count(&self) -> usize {
        self.warehouse.read().await.reservations.len()
    }

    /// Returns the reservation, if still active.
    pub async fn reservation(&self, reservation_id: &str) -> Option<Reservation> {
        self.warehouse
            .read()
            .await
            .reservations
            .get(reservation_id)
            .cloned()
    }

    /// Releases the reservation and puts its stock back. Returns false if it
    /// was not active. A reservation whose stock cannot be put back stays active.
    pub async fn release(&self, reservation_id: &str) -> Result<bool, HandlerError> {
        let mut warehouse = self.warehouse.write().await;
        let Some(reservation) = warehouse.reservations.remove(reservation_id) else {
            return Ok(false);
        };
        if let Err(e) = warehouse.restock(&reservation) {
            warehouse
                .reservations
                .insert(reservation_id.to_string(), reservation);
            return Err(e);
        }
        Ok(true)
    }

    /// Releases every active reservation held for `order_id`.
    pub async fn release_for_order(&self, order_id: &str) -> Vec<String> {
        let mut warehouse = self.warehouse.write().await;
        let ids: Vec<String> = warehouse
            .reservations
            .values()
            .filter(|r| r.order_id.as_deref() == Some(order_id))
            .map(|r| r.reservation_id.clone())
            .collect();
        let mut released = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(reservation) = warehouse.reservations.remove(&id) else {
                continue;
            };
            match warehouse.restock(&reservation) {
                Ok(()) => released.push(id),
                Err(e) => {
                    tracing::warn!(reservation_id = %id, error = %e, "keeping reservation");
                    warehouse.reservations.insert(id, reservation);
                }
            }
        }
        released
    }
}

fn parse_items(request: &Payload) -> Result<Vec<ReservedItem>, HandlerError> {
    let Some(Value::Array(items)) = request.get("items") else {
        return Err(HandlerError::missing("items"));
    };
    if items.is_empty() {
        return Err(HandlerError::rejected("Nothing to reserve"));
    }
    items
        .iter()
        .map(|item| {
            let product_id = item
                .get("product_id")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::missing("items[].product_id"))?;
            let quantity = item
                .get("quantity")
                .and_then(Value::as_u64)
                .unwrap_or(1);
            let quantity = u32::try_from(quantity)
                .map_err(|_| HandlerError::InvalidPayload(format!("quantity {quantity} is too large")))?;
            Ok(ReservedItem {
                product_id: product_id.to_string(),
                quantity,
            })
        })
        .collect()
}

struct ReserveInventory(InventoryParticipant);

#[async_trait]
impl CommandHandler for ReserveInventory {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let items = parse_items(&request)?;
        let order_id = request
            .get("order_id")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut warehouse = self.0.warehouse.write().await;

        // All or nothing: check every line before touching stock.
        let mut wanted: HashMap<&str, u32> = HashMap::new();
        for item in &items {
            let total = wanted.entry(item.product_id.as_str()).or_default();
            *total = total.checked_add(item.quantity).ok_or_else(|| {
                HandlerError::rejected(format!("Requested quantity of {} is too large", item.product_id))
            })?;
        }
        for (product_id, quantity) in &wanted {
            let available = warehouse.available(product_id);
            if available < *quantity {
                return Err(HandlerError::rejected(format!(
                    "Insufficient stock for {product_id}: requested {quantity}, available {available}"
                )));
            }
        }
        for (product_id, quantity) in wanted {
            let available = warehouse.available(product_id);
            warehouse
                .stock
                .insert(product_id.to_string(), available - quantity);
        }

        warehouse.next_id += 1;
        let reservation_id = format!("RES-{:04}", warehouse.next_id);
        let reserved: Vec<Value> = items
            .iter()
            .map(|item| json!({"product_id": item.product_id, "quantity": item.quantity}))
            .collect();
        warehouse.reservations.insert(
            reservation_id.clone(),
            Reservation {
                reservation_id: reservation_id.clone(),
                order_id,
                items,
            },
        );
        tracing::info!(%reservation_id, "inventory reserved");

        Ok(payload([
            ("reservation_id", json!(reservation_id)),
            ("reserved_items", Value::Array(reserved)),
        ]))
    }
}

struct ReleaseInventory(InventoryParticipant);

#[async_trait]
impl CommandHandler for ReleaseInventory {
    async fn handle(&self, request: Payload, _command: &CommandEnvelope) -> Result<Payload, HandlerError> {
        let reservation_id = from_original(&request, "reservation_id")
            .ok_or_else(|| HandlerError::missing("reservation_id"))?;
        let released = self.0.release(&reservation_id).await?;
        if !released {
            tracing::debug!(%reservation_id, "reservation already released");
        }
        Ok(payload([
            ("reservation_id", json!(reservation_id)),
            ("released", json!(released)),
        ]))
    }
}

/// Backstop for lost compensation: frees stock held for a cancelled order.
struct ReleaseOnOrderCancelled(InventoryParticipant);

#[async_trait]
impl EventHandler for ReleaseOnOrderCancelled {
    async fn handle(&self, event: &DomainEventEnvelope) -> Result<(), HandlerError> {
        let order_id = require_str(&event.event_data, "order_id").unwrap_or(event.aggregate_id.as_str());
        let released = self.0.release_for_order(order_id).await;
        if !released.is_empty() {
            tracing::info!(%order_id, ?released, "released reservations of cancelled order");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::CorrelationId;

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
    async fn test_reserve_and_release_restores_stock() {
        let inventory = InventoryParticipant::new(0);
        inventory.set_stock("SKU-1", 5).await;

        let reserved = ReserveInventory(inventory.clone())
            .handle(
                request(json!({"order_id": "ORD-1", "items": [{"product_id": "SKU-1", "quantity": 3}]})),
                &command(),
            )
            .await
            .unwrap();
        assert_eq!(reserved["reservation_id"], "RES-0001");
        assert_eq!(inventory.stock("SKU-1").await, 2);

        let mut release = Payload::new();
        release.insert("original_response".into(), Value::Object(reserved));
        let result = ReleaseInventory(inventory.clone())
            .handle(release.clone(), &command())
            .await
            .unwrap();
        assert_eq!(result["released"], true);
        assert_eq!(inventory.stock("SKU-1").await, 5);

        let again = ReleaseInventory(inventory.clone())
            .handle(release, &command())
            .await
            .unwrap();
        assert_eq!(again["released"], false);
        assert_eq!(inventory.stock("SKU-1").await, 5);
    }

    #[tokio::test]
    async fn test_insufficient_stock_leaves_stock_untouched() {
        let inventory = InventoryParticipant::new(0);
        inventory.set_stock("SKU-1", 10).await;
        inventory.set_stock("SKU-2", 1).await;

        let err = ReserveInventory(inventory.clone())
            .handle(
                request(json!({"items": [
                    {"product_id": "SKU-1", "quantity": 4},
                    {"product_id": "SKU-2", "quantity": 2}
                ]})),
                &command(),
            )
            .await
            .unwrap_err();

        assert!(err.to_string().starts_with("Insufficient stock for SKU-2"));
        assert_eq!(inventory.stock("SKU-1").await, 10);
        assert_eq!(inventory.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn test_default_stock_applies_to_unknown_products() {
        let inventory = InventoryParticipant::new(100);
        assert_eq!(inventory.stock("anything").await, 100);

        ReserveInventory(inventory.clone())
            .handle(request(json!({"items": [{"product_id": "anything"}]})), &command())
            .await
            .unwrap();
        assert_eq!(inventory.stock("anything").await, 99);
    }

    #[tokio::test]
    async fn test_order_cancelled_releases_its_reservations() {
        let inventory = InventoryParticipant::new(10);
        for order in ["ORD-1", "ORD-2"] {
            ReserveInventory(inventory.clone())
                .handle(
                    request(json!({"order_id": order, "items": [{"product_id": "SKU-1", "quantity": 2}]})),
                    &command(),
                )
                .await
                .unwrap();
        }
        assert_eq!(inventory.stock("SKU-1").await, 6);

        let mut data = Payload::new();
        data.insert("order_id".into(), json!("ORD-1"));
        let event = DomainEventEnvelope::new(ORDER_CANCELLED, "ORD-1", "order", data, "order");
        ReleaseOnOrderCancelled(inventory.clone()).handle(&event).await.unwrap();

        assert_eq!(inventory.reservation_count().await, 1);
        assert_eq!(inventory.stock("SKU-1").await, 8);
    }

    #[tokio::test]
    async fn test_quantity_overflow_is_rejected() {
        let inventory = InventoryParticipant::new(u32::MAX);

        let err = ReserveInventory(inventory.clone())
            .handle(
                request(json!({"items": [
                    {"product_id": "SKU-1", "quantity": u32::MAX},
                    {"product_id": "SKU-1", "quantity": 1}
                ]})),
                &command(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
        assert_eq!(inventory.stock("SKU-1").await, u32::MAX);
        assert_eq!(inventory.reservation_count().await, 0);
    }

    #[tokio::test]
    async fn test_release_that_would_overflow_keeps_reservation() {
        let inventory = InventoryParticipant::new(10);
        let reserved = ReserveInventory(inventory.clone())
            .handle(
                request(json!({"items": [{"product_id": "SKU-1", "quantity": 5}]})),
                &command(),
            )
            .await
            .unwrap();
        let reservation_id = reserved["reservation_id"].as_str().unwrap().to_string();
        inventory.set_stock("SKU-1", u32::MAX).await;

        let err = inventory.release(&reservation_id).await.unwrap_err();
        assert!(matches!(err, HandlerError::Rejected(_)));
        assert_eq!(inventory.stock("SKU-1").await, u32::MAX);
        assert!(inventory.reservation(&reservation_id).await.is_some());
    }
}
