//! Pending-reply table and the supervised reply listener.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use common::CorrelationId;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::{BusRecord, MessageBus, ReplyEnvelope, Result, Subscription};

type Slots = HashMap<CorrelationId, oneshot::Sender<ReplyEnvelope>>;

/// Correlation id -> waiting caller. Owned by one client; every slot is
/// removed exactly once, by the reply, the timeout or the caller going away.
#[derive(Clone, Default)]
pub struct PendingReplies {
    slots: Arc<Mutex<Slots>>,
}

impl PendingReplies {
    fn lock(&self) -> MutexGuard<'_, Slots> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a slot for `correlation_id`.
    pub(crate) fn register(&self, correlation_id: CorrelationId) -> PendingSlot {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(correlation_id, tx);
        PendingSlot {
            correlation_id,
            receiver: rx,
            table: self.clone(),
        }
    }

    /// Hands `reply` to its waiting caller. Returns false when nobody waits for it.
    pub fn resolve(&self, reply: ReplyEnvelope) -> bool {
        let Some(correlation_id) = reply.correlation_id else {
            return false;
        };
        // Remove and send under one lock so a racing timeout sees either the
        // slot or the delivered value, never neither.
        let mut slots = self.lock();
        match slots.remove(&correlation_id) {
            Some(tx) => tx.send(reply).is_ok(),
            None => false,
        }
    }

    /// Removes a slot. Returns true if it was still present.
    pub fn remove(&self, correlation_id: CorrelationId) -> bool {
        self.lock().remove(&correlation_id).is_some()
    }

    /// Returns true if a caller is still waiting on `correlation_id`.
    pub fn contains(&self, correlation_id: CorrelationId) -> bool {
        self.lock().contains_key(&correlation_id)
    }

    /// Returns the number of outstanding calls.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if no call is outstanding.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Drops every slot; their callers observe a closed channel.
    pub(crate) fn close_all(&self) -> usize {
        let mut slots = self.lock();
        let count = slots.len();
        slots.clear();
        count
    }
}

/// Why waiting on a slot ended without a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SlotError {
    TimedOut,
    Closed,
}

/// The caller's half of a pending call. Dropping it frees the slot.
pub(crate) struct PendingSlot {
    correlation_id: CorrelationId,
    receiver: oneshot::Receiver<ReplyEnvelope>,
    table: PendingReplies,
}

impl PendingSlot {
    /// Waits for the reply or for `timeout` to elapse.
    pub(crate) async fn wait(mut self, timeout: Duration) -> std::result::Result<ReplyEnvelope, SlotError> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SlotError::Closed),
            Err(_) => {
                if self.table.remove(self.correlation_id) {
                    return Err(SlotError::TimedOut);
                }
                // The listener won the race; its value is already in the channel.
                self.receiver.try_recv().map_err(|_| SlotError::TimedOut)
            }
        }
    }
}

impl Drop for PendingSlot {
    fn drop(&mut self) {
        self.table.remove(self.correlation_id);
    }
}

/// Where and how the listener subscribes.
#[derive(Debug, Clone)]
pub(crate) struct ListenerSettings {
    pub topic: String,
    pub group: String,
    pub max_restarts: u32,
    pub backoff: Duration,
}

enum ListenerExit {
    Shutdown,
    /// The subscription ended; carries whether it delivered anything first.
    Closed { delivered: bool },
}

/// Handle to the long-lived task draining a client's reply topic.
pub struct ReplyListener {
    shutdown: watch::Sender<bool>,
    healthy: Arc<AtomicBool>,
    restarts: Arc<AtomicU32>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ReplyListener {
    /// Subscribes to the reply topic and spawns the supervised listener.
    ///
    /// The first subscription is made before returning so no reply published
    /// after `start` can be missed.
    pub(crate) async fn start(
        bus: Arc<dyn MessageBus>,
        settings: ListenerSettings,
        pending: PendingReplies,
    ) -> Result<Self> {
        let subscription = bus.subscribe(&settings.topic, &settings.group).await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let healthy = Arc::new(AtomicBool::new(true));
        let restarts = Arc::new(AtomicU32::new(0));

        tracing::info!(topic = %settings.topic, "reply listener started");
        let task = tokio::spawn(supervise(
            bus,
            settings,
            pending,
            subscription,
            shutdown_rx,
            healthy.clone(),
            restarts.clone(),
        ));

        Ok(Self {
            shutdown: shutdown_tx,
            healthy,
            restarts,
            task: Mutex::new(Some(task)),
        })
    }

    /// Returns false once the listener gave up resubscribing.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Returns how many consecutive resubscriptions happened without a record
    /// arriving in between.
    pub fn restart_count(&self) -> u32 {
        self.restarts.load(Ordering::SeqCst)
    }

    /// Stops the listener and waits for its task to finish.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "reply listener task ended abnormally");
        }
    }
}

async fn supervise(
    bus: Arc<dyn MessageBus>,
    settings: ListenerSettings,
    pending: PendingReplies,
    mut subscription: Subscription,
    mut shutdown_rx: watch::Receiver<bool>,
    healthy: Arc<AtomicBool>,
    restarts: Arc<AtomicU32>,
) {
    loop {
        match drain(&mut subscription, &pending, &mut shutdown_rx).await {
            ListenerExit::Shutdown => {
                tracing::debug!(topic = %settings.topic, "reply listener stopped");
                return;
            }
            // A subscription that worked earns back the full restart budget.
            ListenerExit::Closed { delivered: true } => restarts.store(0, Ordering::SeqCst),
            ListenerExit::Closed { delivered: false } => {}
        }

        loop {
            if restarts.load(Ordering::SeqCst) >= settings.max_restarts {
                healthy.store(false, Ordering::SeqCst);
                tracing::error!(
                    topic = %settings.topic,
                    restarts = settings.max_restarts,
                    "reply listener exhausted its restarts, client marked unhealthy"
                );
                return;
            }
            let attempt = restarts.fetch_add(1, Ordering::SeqCst) + 1;
            tracing::warn!(topic = %settings.topic, attempt, "reply listener lost its subscription");

            tokio::select! {
                _ = tokio::time::sleep(settings.backoff) => {}
                _ = shutdown_rx.changed() => return,
            }

            match bus.subscribe(&settings.topic, &settings.group).await {
                Ok(fresh) => {
                    subscription = fresh;
                    break;
                }
                Err(e) => tracing::warn!(error = %e, "resubscribing reply listener failed"),
            }
        }
    }
}

async fn drain(
    subscription: &mut Subscription,
    pending: &PendingReplies,
    shutdown_rx: &mut watch::Receiver<bool>,
) -> ListenerExit {
    let mut delivered = false;
    loop {
        if *shutdown_rx.borrow() {
            return ListenerExit::Shutdown;
        }
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    return ListenerExit::Shutdown;
                }
            }
            record = subscription.recv() => match record {
                Some(record) => {
                    delivered = true;
                    deliver(record, pending);
                }
                None => return ListenerExit::Closed { delivered },
            }
        }
    }
}

fn deliver(record: BusRecord, pending: &PendingReplies) {
    let reply: ReplyEnvelope = match serde_json::from_value(record.payload) {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(topic = %record.topic, error = %e, "dropping malformed reply");
            metrics::counter!("bus_replies_dropped_total").increment(1);
            return;
        }
    };

    let correlation_id = reply.correlation_id;
    if pending.resolve(reply) {
        tracing::debug!(?correlation_id, "reply delivered");
    } else {
        // Usually a reply that arrived after its caller timed out.
        tracing::debug!(?correlation_id, "no caller waiting for reply, dropping");
        metrics::counter!("bus_replies_dropped_total").increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::InMemoryBus;
    use crate::envelope::ReplyStatus;
    use common::Payload;

    fn reply_for(correlation_id: CorrelationId) -> ReplyEnvelope {
        ReplyEnvelope {
            correlation_id: Some(correlation_id),
            saga_id: None,
            service: "inventory".to_string(),
            command: Some("reserve_inventory".to_string()),
            status: ReplyStatus::Success,
            payload: Some(Payload::new()),
            error: None,
            timestamp: 0.0,
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_resolve_delivers_once() {
        let pending = PendingReplies::default();
        let id = CorrelationId::new();
        let slot = pending.register(id);

        assert!(pending.resolve(reply_for(id)));
        assert!(!pending.resolve(reply_for(id)));

        let reply = slot.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reply.correlation_id, Some(id));
        assert!(pending.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_slot() {
        let pending = PendingReplies::default();
        let id = CorrelationId::new();
        let slot = pending.register(id);

        let result = slot.wait(Duration::from_secs(2)).await;
        assert_eq!(result.unwrap_err(), SlotError::TimedOut);
        assert!(!pending.contains(id));

        // A late reply finds nobody waiting.
        assert!(!pending.resolve(reply_for(id)));
    }

    #[tokio::test]
    async fn test_dropping_slot_frees_it() {
        let pending = PendingReplies::default();
        let id = CorrelationId::new();
        drop(pending.register(id));
        assert!(!pending.contains(id));
    }

    #[tokio::test]
    async fn test_close_all_wakes_callers() {
        let pending = PendingReplies::default();
        let slot = pending.register(CorrelationId::new());
        assert_eq!(pending.close_all(), 1);
        assert_eq!(
            slot.wait(Duration::from_secs(1)).await.unwrap_err(),
            SlotError::Closed
        );
    }

    fn settings(max_restarts: u32) -> ListenerSettings {
        ListenerSettings {
            topic: "test_replies".to_string(),
            group: "test".to_string(),
            max_restarts,
            backoff: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_listener_routes_replies() {
        let bus = InMemoryBus::new();
        let pending = PendingReplies::default();
        let listener = ReplyListener::start(Arc::new(bus.clone()), settings(1), pending.clone())
            .await
            .unwrap();

        let id = CorrelationId::new();
        let slot = pending.register(id);
        bus.publish(
            "test_replies",
            None,
            serde_json::to_value(reply_for(id)).unwrap(),
        )
        .await
        .unwrap();

        assert!(slot.wait(Duration::from_secs(1)).await.is_ok());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_drops_garbage_and_keeps_running() {
        let bus = InMemoryBus::new();
        let pending = PendingReplies::default();
        let listener = ReplyListener::start(Arc::new(bus.clone()), settings(1), pending.clone())
            .await
            .unwrap();

        bus.publish("test_replies", None, serde_json::json!({"garbage": true}))
            .await
            .unwrap();

        let id = CorrelationId::new();
        let slot = pending.register(id);
        bus.publish(
            "test_replies",
            None,
            serde_json::to_value(reply_for(id)).unwrap(),
        )
        .await
        .unwrap();
        assert!(slot.wait(Duration::from_secs(1)).await.is_ok());
        assert!(listener.is_healthy());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_resubscribes_after_topic_closed() {
        let bus = InMemoryBus::new();
        let pending = PendingReplies::default();
        let listener = ReplyListener::start(Arc::new(bus.clone()), settings(3), pending.clone())
            .await
            .unwrap();

        bus.close_topic("test_replies").await;
        wait_until(|| listener.restart_count() == 1).await;
        // Give the supervisor a moment to finish resubscribing.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let id = CorrelationId::new();
        let slot = pending.register(id);
        bus.publish(
            "test_replies",
            None,
            serde_json::to_value(reply_for(id)).unwrap(),
        )
        .await
        .unwrap();

        assert!(slot.wait(Duration::from_secs(1)).await.is_ok());
        assert!(listener.is_healthy());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_restart_budget_resets_after_delivery() {
        let bus = InMemoryBus::new();
        let pending = PendingReplies::default();
        let listener = ReplyListener::start(Arc::new(bus.clone()), settings(1), pending.clone())
            .await
            .unwrap();

        // Two separate outages, each followed by a working subscription.
        for round in 0..2 {
            bus.close_topic("test_replies").await;
            wait_until(|| listener.restart_count() == 1).await;
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert!(listener.is_healthy(), "unhealthy after outage {round}");

            let id = CorrelationId::new();
            let slot = pending.register(id);
            bus.publish(
                "test_replies",
                None,
                serde_json::to_value(reply_for(id)).unwrap(),
            )
            .await
            .unwrap();
            assert!(slot.wait(Duration::from_secs(1)).await.is_ok());
        }

        // Two outages back to back, with nothing delivered between them,
        // exhaust the budget.
        bus.close_topic("test_replies").await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(listener.is_healthy());
        bus.close_topic("test_replies").await;
        wait_until(|| !listener.is_healthy()).await;
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_marked_unhealthy_without_restart_budget() {
        let bus = InMemoryBus::new();
        let listener = ReplyListener::start(
            Arc::new(bus.clone()),
            settings(0),
            PendingReplies::default(),
        )
        .await
        .unwrap();

        bus.close_topic("test_replies").await;
        wait_until(|| !listener.is_healthy()).await;
        listener.shutdown().await;
    }
}
