//! In-memory saga participants.
//!
//! Each participant keeps its state in memory and serves its commands
//! through its own [`CommandDispatcher`]. Business rules are deliberately
//! small: enough to succeed, reject and compensate.

mod fields;
pub mod inventory;
pub mod notification;
pub mod order;
pub mod payment;
pub mod shipping;

use std::sync::Arc;

use dispatcher::{CommandDispatcher, DispatcherHandle};
use event_bus::{BusConfig, BusError, EventBusClient, MessageBus};

pub use inventory::InventoryParticipant;
pub use notification::NotificationParticipant;
pub use order::OrderParticipant;
pub use payment::PaymentParticipant;
pub use shipping::ShippingParticipant;

/// Settings shared by the participants started with [`spawn_all`].
#[derive(Debug, Clone)]
pub struct ParticipantsConfig {
    /// Largest single charge the payment participant accepts.
    pub payment_limit_cents: Option<u64>,

    /// Stock of every product not stocked explicitly.
    pub default_stock: u32,
}

impl Default for ParticipantsConfig {
    fn default() -> Self {
        Self {
            payment_limit_cents: None,
            default_stock: 100,
        }
    }
}

impl ParticipantsConfig {
    pub fn with_payment_limit_cents(mut self, limit: u64) -> Self {
        self.payment_limit_cents = Some(limit);
        self
    }

    pub fn with_default_stock(mut self, stock: u32) -> Self {
        self.default_stock = stock;
        self
    }
}

/// The five running participants.
///
/// The state handles are exposed for inspection and failure injection.
pub struct Participants {
    pub order: OrderParticipant,
    pub inventory: InventoryParticipant,
    pub payment: PaymentParticipant,
    pub shipping: ShippingParticipant,
    pub notification: NotificationParticipant,
    clients: Vec<Arc<EventBusClient>>,
    handles: Vec<DispatcherHandle>,
}

impl Participants {
    /// Returns true while every participant's bus client is healthy.
    pub fn is_healthy(&self) -> bool {
        self.clients.iter().all(|client| client.is_healthy())
    }

    /// Stops every dispatcher and bus client.
    pub async fn shutdown(self) {
        for handle in self.handles {
            handle.shutdown().await;
        }
        for client in self.clients {
            client.shutdown().await;
        }
    }
}

/// Connects, wires and starts the order, inventory, payment, shipping and
/// notification participants on `bus`.
#[tracing::instrument(skip_all)]
pub async fn spawn_all(bus: Arc<dyn MessageBus>, config: ParticipantsConfig) -> Result<Participants, BusError> {
    let mut clients = Vec::with_capacity(5);
    let mut dispatchers = Vec::with_capacity(5);

    let order_client = connect(&bus, order::SERVICE, &mut clients).await?;
    let order = OrderParticipant::new(order_client.clone());
    let mut dispatcher = CommandDispatcher::new(order_client);
    order.register(&mut dispatcher);
    dispatchers.push(dispatcher);

    let inventory = InventoryParticipant::new(config.default_stock);
    let mut dispatcher = CommandDispatcher::new(connect(&bus, inventory::SERVICE, &mut clients).await?);
    inventory.register(&mut dispatcher);
    dispatcher.subscribe_to(order::SERVICE);
    dispatchers.push(dispatcher);

    let payment = PaymentParticipant::new(config.payment_limit_cents);
    let mut dispatcher = CommandDispatcher::new(connect(&bus, payment::SERVICE, &mut clients).await?);
    payment.register(&mut dispatcher);
    dispatchers.push(dispatcher);

    let shipping = ShippingParticipant::new();
    let mut dispatcher = CommandDispatcher::new(connect(&bus, shipping::SERVICE, &mut clients).await?);
    shipping.register(&mut dispatcher);
    dispatchers.push(dispatcher);

    let notification = NotificationParticipant::new();
    let mut dispatcher = CommandDispatcher::new(connect(&bus, notification::SERVICE, &mut clients).await?);
    notification.register(&mut dispatcher);
    dispatchers.push(dispatcher);

    let mut handles = Vec::with_capacity(dispatchers.len());
    for dispatcher in dispatchers {
        handles.push(Arc::new(dispatcher).start().await?);
    }
    tracing::info!(participants = handles.len(), "participants started");

    Ok(Participants {
        order,
        inventory,
        payment,
        shipping,
        notification,
        clients,
        handles,
    })
}

async fn connect(
    bus: &Arc<dyn MessageBus>,
    service: &str,
    clients: &mut Vec<Arc<EventBusClient>>,
) -> Result<Arc<EventBusClient>, BusError> {
    let client = Arc::new(EventBusClient::connect(bus.clone(), BusConfig::new(service)).await?);
    clients.push(client.clone());
    Ok(client)
}
