//! Participants driven through the bus the way the coordinator drives them.

use std::sync::Arc;
use std::time::Duration;

use common::Payload;
use event_bus::{BusConfig, BusError, EventBusClient, InMemoryBus, command_topic};
use participants::{ParticipantsConfig, spawn_all};
use serde_json::{Value, json};

const TIMEOUT: Duration = Duration::from_secs(2);

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

async fn coordinator(bus: &InMemoryBus) -> EventBusClient {
    EventBusClient::connect(Arc::new(bus.clone()), BusConfig::new("saga_coordinator"))
        .await
        .unwrap()
}

#[tokio::test]
async fn test_order_cancellation_releases_inventory_through_events() {
    let bus = InMemoryBus::new();
    let participants = spawn_all(Arc::new(bus.clone()), ParticipantsConfig::default())
        .await
        .unwrap();
    participants.inventory.set_stock("SKU-1", 4).await;
    let client = coordinator(&bus).await;

    let order = client
        .send_command(
            &command_topic("order"),
            "create_order",
            payload(json!({"customer_id": "c-1", "items": [{"product_id": "SKU-1", "quantity": 3}], "total_amount": 30.0})),
            None,
            TIMEOUT,
        )
        .await
        .unwrap();
    let order_id = order["order_id"].as_str().unwrap().to_string();

    client
        .send_command(
            &command_topic("inventory"),
            "reserve_inventory",
            payload(json!({"order_id": order_id, "items": [{"product_id": "SKU-1", "quantity": 3}]})),
            None,
            TIMEOUT,
        )
        .await
        .unwrap();
    assert_eq!(participants.inventory.stock("SKU-1").await, 1);

    // Cancel the order without ever sending release_inventory.
    client
        .send_command(
            &command_topic("order"),
            "cancel_order",
            payload(json!({"order_id": order_id})),
            None,
            TIMEOUT,
        )
        .await
        .unwrap();

    for _ in 0..100 {
        if participants.inventory.reservation_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(participants.inventory.reservation_count().await, 0);
    assert_eq!(participants.inventory.stock("SKU-1").await, 4);

    participants.shutdown().await;
}

#[tokio::test]
async fn test_payment_limit_from_config() {
    let bus = InMemoryBus::new();
    let participants = spawn_all(
        Arc::new(bus.clone()),
        ParticipantsConfig::default().with_payment_limit_cents(5_000),
    )
    .await
    .unwrap();
    let client = coordinator(&bus).await;

    let err = client
        .send_command(
            &command_topic("payment"),
            "process_payment",
            payload(json!({"total_amount": 60.0})),
            None,
            TIMEOUT,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Remote { ref service, .. } if service == "payment"));
    assert_eq!(participants.payment.captured_count().await, 0);
}

#[tokio::test]
async fn test_every_participant_answers_health_check() {
    let bus = InMemoryBus::new();
    let participants = spawn_all(Arc::new(bus.clone()), ParticipantsConfig::default())
        .await
        .unwrap();
    let client = coordinator(&bus).await;

    for service in ["order", "inventory", "payment", "shipping", "notification"] {
        let health = client
            .send_command(&command_topic(service), "health_check", Payload::new(), None, TIMEOUT)
            .await
            .unwrap();
        assert_eq!(health["service"], service);
        assert_eq!(health["status"], "healthy");
    }
    assert!(participants.is_healthy());
}
