//! Integration tests for correlated request/reply over the in-memory bus.

use std::sync::Arc;
use std::time::Duration;

use common::{Payload, SagaId};
use event_bus::{
    BusConfig, BusError, CommandEnvelope, EventBusClient, InMemoryBus, MessageBus, ReplyEnvelope,
};
use serde_json::{Value, json};

fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected object"),
    }
}

async fn connect(bus: &InMemoryBus) -> Arc<EventBusClient> {
    Arc::new(
        EventBusClient::connect(Arc::new(bus.clone()), BusConfig::new("saga_coordinator"))
            .await
            .unwrap(),
    )
}

/// Replies to each command after `delay`, echoing `product_id` back.
async fn spawn_delayed_responder(bus: &InMemoryBus, topic: &str, delay: Duration) {
    let mut sub = bus.subscribe(topic, "inventory").await.unwrap();
    let bus = bus.clone();
    tokio::spawn(async move {
        while let Some(record) = sub.recv().await {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let command: CommandEnvelope = serde_json::from_value(record.payload).unwrap();
                let mut result = Payload::new();
                result.insert(
                    "product_id".to_string(),
                    command.payload["product_id"].clone(),
                );
                let reply = ReplyEnvelope::success(&command, "inventory", result);
                bus.publish(&command.reply_topic, None, serde_json::to_value(reply).unwrap())
                    .await
                    .unwrap();
            });
        }
    });
}

#[tokio::test(start_paused = true)]
async fn test_no_reply_times_out_after_two_seconds() {
    let bus = InMemoryBus::new();
    let client = connect(&bus).await;

    let started = tokio::time::Instant::now();
    let err = client
        .send_command(
            "inventory_commands",
            "reserve_inventory",
            Payload::new(),
            Some(SagaId::new()),
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();

    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_secs(3));

    match err {
        BusError::Timeout { correlation_id, command, .. } => {
            assert_eq!(command, "reserve_inventory");
            assert!(!client.has_pending(correlation_id));
        }
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_is_dropped_silently() {
    let bus = InMemoryBus::new();
    spawn_delayed_responder(&bus, "inventory_commands", Duration::from_secs(5)).await;
    let client = connect(&bus).await;

    let err = client
        .send_command(
            "inventory_commands",
            "reserve_inventory",
            payload(json!({"product_id": "SKU-1"})),
            None,
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, BusError::Timeout { .. }));

    // Let the late reply arrive; the listener must drop it and stay healthy.
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(bus.record_count(client.reply_topic()).await, 1);
    assert_eq!(client.pending_count(), 0);
    assert!(client.is_healthy());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_never_cross_talk() {
    let bus = InMemoryBus::new();
    spawn_delayed_responder(&bus, "inventory_commands", Duration::from_millis(20)).await;
    let client = connect(&bus).await;

    let mut calls = Vec::new();
    for n in 0..20 {
        let client = client.clone();
        calls.push(tokio::spawn(async move {
            let product = format!("SKU-{n}");
            let result = client
                .send_command(
                    "inventory_commands",
                    "reserve_inventory",
                    payload(json!({"product_id": product})),
                    Some(SagaId::new()),
                    Duration::from_secs(5),
                )
                .await
                .unwrap();
            (product, result)
        }));
    }

    for call in calls {
        let (product, result) = call.await.unwrap();
        assert_eq!(result["product_id"], json!(product));
    }
    assert_eq!(client.pending_count(), 0);
}

#[tokio::test]
async fn test_two_clients_have_isolated_reply_topics() {
    let bus = InMemoryBus::new();
    spawn_delayed_responder(&bus, "inventory_commands", Duration::from_millis(1)).await;
    let a = connect(&bus).await;
    let b = connect(&bus).await;

    let (ra, rb) = tokio::join!(
        a.send_command(
            "inventory_commands",
            "reserve_inventory",
            payload(json!({"product_id": "A"})),
            None,
            Duration::from_secs(2),
        ),
        b.send_command(
            "inventory_commands",
            "reserve_inventory",
            payload(json!({"product_id": "B"})),
            None,
            Duration::from_secs(2),
        ),
    );

    assert_eq!(ra.unwrap()["product_id"], "A");
    assert_eq!(rb.unwrap()["product_id"], "B");
    assert_eq!(bus.record_count(a.reply_topic()).await, 1);
    assert_eq!(bus.record_count(b.reply_topic()).await, 1);
}
