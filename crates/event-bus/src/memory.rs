use std::collections::{HashMap, VecDeque};
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{RwLock, mpsc};

use crate::{BusRecord, MessageBus, Result, Subscription};

/// Default number of partitions per topic.
pub const DEFAULT_PARTITIONS: usize = 4;

/// Suggested per-partition retention cap for long-lived buses.
pub const DEFAULT_RETAINED_RECORDS: usize = 10_000;

/// One partition's log. Offsets keep counting after old records are evicted.
#[derive(Clone, Default)]
struct PartitionLog {
    records: VecDeque<BusRecord>,
    next_offset: u64,
}

impl PartitionLog {
    fn append(&mut self, record: BusRecord, retention: Option<usize>) {
        self.records.push_back(record);
        self.next_offset += 1;
        if let Some(max) = retention {
            while self.records.len() > max {
                self.records.pop_front();
            }
        }
    }
}

#[derive(Default)]
struct TopicState {
    partitions: Vec<PartitionLog>,
    groups: HashMap<String, Vec<mpsc::UnboundedSender<BusRecord>>>,
    round_robin: usize,
}

impl TopicState {
    fn new(partition_count: usize) -> Self {
        Self {
            partitions: vec![PartitionLog::default(); partition_count],
            ..Default::default()
        }
    }
}

/// In-memory publish/subscribe bus for tests and single-process deployments.
///
/// Topics are partitioned logs. Each consumer group gets every record; inside
/// a group the member is picked by partition, so records with the same key
/// always reach the same member in publish order.
///
/// Without a retention cap every record is kept for inspection; a long-lived
/// bus should be built with [`InMemoryBus::with_retention`].
#[derive(Clone)]
pub struct InMemoryBus {
    topics: Arc<RwLock<HashMap<String, TopicState>>>,
    partition_count: usize,
    retention: Option<usize>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBus {
    /// Creates a bus with [`DEFAULT_PARTITIONS`] partitions per topic.
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// Creates a bus with the given number of partitions per topic (at least one).
    pub fn with_partitions(partition_count: usize) -> Self {
        Self {
            topics: Arc::new(RwLock::new(HashMap::new())),
            partition_count: partition_count.max(1),
            retention: None,
        }
    }

    /// Keeps at most `max_records` records per partition, evicting the oldest.
    /// Delivery to subscribers is unaffected.
    pub fn with_retention(mut self, max_records: usize) -> Self {
        self.retention = Some(max_records);
        self
    }

    /// Returns the number of partitions per topic.
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Returns every retained record of `topic`, ordered by partition then offset.
    pub async fn records(&self, topic: &str) -> Vec<BusRecord> {
        let topics = self.topics.read().await;
        topics
            .get(topic)
            .map(|t| {
                t.partitions
                    .iter()
                    .flat_map(|log| log.records.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Returns the number of retained records of `topic`.
    pub async fn record_count(&self, topic: &str) -> usize {
        let topics = self.topics.read().await;
        topics
            .get(topic)
            .map(|t| t.partitions.iter().map(|log| log.records.len()).sum())
            .unwrap_or(0)
    }

    /// Returns the names of all topics that have seen a publish or a subscribe.
    pub async fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drops every subscription on `topic`. Subscribers observe end-of-stream.
    pub async fn close_topic(&self, topic: &str) {
        if let Some(state) = self.topics.write().await.get_mut(topic) {
            state.groups.clear();
        }
    }

    fn partition_for(&self, key: Option<&str>, round_robin: &mut usize) -> usize {
        match key {
            Some(key) => {
                let mut hasher = DefaultHasher::new();
                key.hash(&mut hasher);
                (hasher.finish() % self.partition_count as u64) as usize
            }
            None => {
                let partition = *round_robin % self.partition_count;
                *round_robin = round_robin.wrapping_add(1);
                partition
            }
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(
        &self,
        topic: &str,
        key: Option<&str>,
        message: serde_json::Value,
    ) -> Result<BusRecord> {
        let mut topics = self.topics.write().await;
        let partition_count = self.partition_count;
        let state = topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(partition_count));

        let partition = self.partition_for(key, &mut state.round_robin);
        let record = BusRecord {
            topic: topic.to_string(),
            partition,
            offset: state.partitions[partition].next_offset,
            key: key.map(str::to_string),
            payload: message,
            published_at: Utc::now(),
        };
        state.partitions[partition].append(record.clone(), self.retention);

        for (group, members) in state.groups.iter_mut() {
            members.retain(|tx| !tx.is_closed());
            if members.is_empty() {
                continue;
            }
            let member = &members[partition % members.len()];
            if member.send(record.clone()).is_err() {
                tracing::debug!(%topic, %group, "member went away during delivery");
            }
        }

        metrics::counter!("bus_records_published_total").increment(1);
        Ok(record)
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<Subscription> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut topics = self.topics.write().await;
        let partition_count = self.partition_count;
        topics
            .entry(topic.to_string())
            .or_insert_with(|| TopicState::new(partition_count))
            .groups
            .entry(group.to_string())
            .or_default()
            .push(tx);

        tracing::debug!(%topic, %group, "subscribed");
        Ok(Subscription::new(topic, rx))
    }
}
