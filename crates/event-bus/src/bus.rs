use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;

/// A message as stored and delivered by the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusRecord {
    /// The topic the message was published to.
    pub topic: String,

    /// Partition the message landed in (derived from `key`).
    pub partition: usize,

    /// Position of the message inside its partition.
    pub offset: u64,

    /// Partitioning key. Messages sharing a key are delivered in publish order.
    pub key: Option<String>,

    /// The message body.
    pub payload: serde_json::Value,

    /// When the bus accepted the message.
    pub published_at: DateTime<Utc>,
}

/// A live subscription to one topic on behalf of one consumer group member.
#[derive(Debug)]
pub struct Subscription {
    topic: String,
    receiver: mpsc::UnboundedReceiver<BusRecord>,
}

impl Subscription {
    /// Wraps the receiving half of a delivery channel.
    pub fn new(topic: impl Into<String>, receiver: mpsc::UnboundedReceiver<BusRecord>) -> Self {
        Self {
            topic: topic.into(),
            receiver,
        }
    }

    /// Returns the subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Waits for the next record. Returns `None` once the bus closes the subscription.
    pub async fn recv(&mut self) -> Option<BusRecord> {
        self.receiver.recv().await
    }
}

/// Core trait for publish/subscribe transports.
///
/// Delivery is at-least-once from the caller's point of view: consumers must
/// tolerate duplicates and messages nobody is waiting for any more.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Publishes a message to `topic`, partitioned by `key`.
    ///
    /// Returns the record as stored by the bus.
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        message: serde_json::Value,
    ) -> Result<BusRecord>;

    /// Joins consumer group `group` on `topic`.
    ///
    /// Every group receives every record; inside a group each record goes to
    /// exactly one member, chosen by partition.
    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription>;
}
