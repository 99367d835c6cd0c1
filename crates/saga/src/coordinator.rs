//! Saga coordinator: runs order sagas and keeps them queryable.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::SagaId;
use event_bus::{CommandSender, DomainEventPublisher};
use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tracing::Instrument;

use crate::error::{Result, SagaError};
use crate::order_saga::{OrderRequest, OrderSaga, OrderSagaResult};
use crate::saga::{AbortHandle, DEFAULT_STEP_TIMEOUT, SagaSnapshot};
use crate::state::SagaStatus;

/// Coordinator tuning.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Reply timeout of every saga step.
    pub step_timeout: Duration,

    /// How long `abort` waits for compensation to finish.
    pub abort_wait: Duration,

    /// Terminal sagas beyond this count are forgotten, oldest first.
    pub max_retained_sagas: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            step_timeout: DEFAULT_STEP_TIMEOUT,
            abort_wait: Duration::from_secs(10),
            max_retained_sagas: 1000,
        }
    }
}

impl CoordinatorConfig {
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    pub fn with_abort_wait(mut self, wait: Duration) -> Self {
        self.abort_wait = wait;
        self
    }

    pub fn with_max_retained_sagas(mut self, max: usize) -> Self {
        self.max_retained_sagas = max;
        self
    }
}

/// One row of the saga list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SagaSummary {
    pub saga_id: SagaId,
    pub saga_type: String,
    pub status: SagaStatus,
    pub order_id: Option<String>,
    pub steps_total: usize,
    pub steps_completed: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&SagaSnapshot> for SagaSummary {
    fn from(snapshot: &SagaSnapshot) -> Self {
        Self {
            saga_id: snapshot.saga_id,
            saga_type: snapshot.saga_type.clone(),
            status: snapshot.status,
            order_id: snapshot
                .context
                .get("order_id")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            steps_total: snapshot.steps.len(),
            steps_completed: snapshot.steps_completed(),
            created_at: snapshot.created_at,
            updated_at: snapshot.updated_at,
        }
    }
}

/// Coordinator counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatistics {
    pub sagas_started: u64,
    pub sagas_completed: u64,
    pub sagas_aborted: u64,
    pub sagas_in_flight: usize,
    pub sagas_retained: usize,
}

struct SagaEntry {
    snapshots: watch::Receiver<SagaSnapshot>,
    abort: AbortHandle,
}

impl SagaEntry {
    fn current(&self) -> SagaSnapshot {
        self.snapshots.borrow().clone()
    }
}

#[derive(Default)]
struct Counters {
    started: AtomicU64,
    completed: AtomicU64,
    aborted: AtomicU64,
}

impl Counters {
    fn record_outcome(&self, status: SagaStatus) {
        match status {
            SagaStatus::Completed => self.completed.fetch_add(1, Ordering::Relaxed),
            _ => self.aborted.fetch_add(1, Ordering::Relaxed),
        };
    }
}

type SagaTable = RwLock<HashMap<SagaId, SagaEntry>>;

/// Starts order sagas and tracks every saga in memory.
///
/// Nothing is persisted: a restart forgets every saga, including the ones
/// still running.
pub struct SagaCoordinator {
    sender: Arc<dyn CommandSender>,
    publisher: Option<Arc<dyn DomainEventPublisher>>,
    config: CoordinatorConfig,
    sagas: Arc<SagaTable>,
    counters: Arc<Counters>,
}

impl SagaCoordinator {
    /// Creates a coordinator sending commands through `sender`.
    pub fn new(sender: Arc<dyn CommandSender>, config: CoordinatorConfig) -> Self {
        Self {
            sender,
            publisher: None,
            config,
            sagas: Arc::new(RwLock::new(HashMap::new())),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Publishes saga lifecycle events through `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<dyn DomainEventPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Runs an order saga to completion.
    ///
    /// The saga runs on its own task, so it finishes (and compensates) even
    /// if the caller stops waiting. The task also keeps the saga table and
    /// counters up to date. The saga is queryable while it runs.
    #[tracing::instrument(skip(self, request), fields(customer_id = %request.customer_id))]
    pub async fn start_order(&self, request: OrderRequest) -> Result<OrderSagaResult> {
        request.validate().map_err(SagaError::InvalidRequest)?;

        let mut saga = OrderSaga::new(self.sender.clone(), &request).with_step_timeout(self.config.step_timeout);
        if let Some(publisher) = &self.publisher {
            saga = saga.with_publisher(publisher.clone());
        }
        let saga_id = saga.saga().id();

        let entry = SagaEntry {
            snapshots: saga.saga().subscribe(),
            abort: saga.saga().abort_handle(),
        };

        let sagas = self.sagas.clone();
        let counters = self.counters.clone();
        let max_retained = self.config.max_retained_sagas;
        let task = tokio::spawn(
            async move {
                track(&sagas, saga_id, entry, max_retained).await;
                counters.started.fetch_add(1, Ordering::Relaxed);

                let result = saga.process_order().await;
                if let Ok(result) = &result {
                    counters.record_outcome(result.status);
                }
                result
            }
            .instrument(tracing::Span::current()),
        );

        task.await.map_err(|e| {
            tracing::error!(%saga_id, error = %e, "saga task failed");
            SagaError::Terminated(saga_id)
        })?
    }

    /// Returns the latest snapshot of a saga.
    pub async fn get(&self, saga_id: SagaId) -> Result<SagaSnapshot> {
        self.sagas
            .read()
            .await
            .get(&saga_id)
            .map(SagaEntry::current)
            .ok_or(SagaError::NotFound(saga_id))
    }

    /// Lists every retained saga, oldest first.
    pub async fn list(&self) -> Vec<SagaSummary> {
        let sagas = self.sagas.read().await;
        let mut summaries: Vec<SagaSummary> = sagas
            .values()
            .map(|entry| SagaSummary::from(&*entry.snapshots.borrow()))
            .collect();
        summaries.sort_by_key(|summary| summary.created_at);
        summaries
    }

    /// Forces compensation of an in-flight saga and waits until it is terminal.
    ///
    /// The saga stops at its next step boundary. Fails with
    /// [`SagaError::InvalidState`] if it already finished, and with
    /// [`SagaError::AbortTimeout`] if compensation outlasts `abort_wait`.
    #[tracing::instrument(skip(self))]
    pub async fn abort(&self, saga_id: SagaId) -> Result<SagaSnapshot> {
        let mut snapshots = {
            let sagas = self.sagas.read().await;
            let entry = sagas.get(&saga_id).ok_or(SagaError::NotFound(saga_id))?;
            let status = entry.snapshots.borrow().status;
            if status.is_terminal() {
                return Err(SagaError::InvalidState {
                    operation: "abort",
                    status,
                });
            }
            entry.abort.abort();
            entry.snapshots.clone()
        };
        tracing::info!("abort requested");

        let terminal = tokio::time::timeout(self.config.abort_wait, async {
            snapshots
                .wait_for(|snapshot| snapshot.status.is_terminal())
                .await
                .map(|snapshot| snapshot.clone())
        })
        .await;

        match terminal {
            Ok(Ok(snapshot)) => Ok(snapshot),
            // The saga task is gone; its last snapshot is final.
            Ok(Err(_)) => Ok(snapshots.borrow().clone()),
            Err(_) => Err(SagaError::AbortTimeout {
                saga_id,
                waited: self.config.abort_wait,
            }),
        }
    }

    /// Returns the coordinator counters.
    pub async fn statistics(&self) -> CoordinatorStatistics {
        let sagas = self.sagas.read().await;
        let in_flight = sagas
            .values()
            .filter(|entry| !entry.snapshots.borrow().status.is_terminal())
            .count();
        CoordinatorStatistics {
            sagas_started: self.counters.started.load(Ordering::Relaxed),
            sagas_completed: self.counters.completed.load(Ordering::Relaxed),
            sagas_aborted: self.counters.aborted.load(Ordering::Relaxed),
            sagas_in_flight: in_flight,
            sagas_retained: sagas.len(),
        }
    }
}

async fn track(sagas: &SagaTable, saga_id: SagaId, entry: SagaEntry, max_retained: usize) {
    let mut sagas = sagas.write().await;
    sagas.insert(saga_id, entry);

    let excess = sagas.len().saturating_sub(max_retained);
    if excess == 0 {
        return;
    }
    let mut terminal: Vec<(DateTime<Utc>, SagaId)> = sagas
        .iter()
        .filter_map(|(id, entry)| {
            let snapshot = entry.snapshots.borrow();
            snapshot
                .status
                .is_terminal()
                .then_some((snapshot.updated_at, *id))
        })
        .collect();
    terminal.sort();
    for (_, id) in terminal.into_iter().take(excess) {
        sagas.remove(&id);
    }
    tracing::debug!(retained = sagas.len(), "evicted finished sagas");
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::Payload;
    use event_bus::BusError;
    use serde_json::json;
    use tokio::sync::Notify;

    /// Answers every command, blocking `process_payment` until released.
    #[derive(Default)]
    struct GatedSender {
        gate: Notify,
        gated: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl CommandSender for GatedSender {
        async fn send_command(
            &self,
            _topic: &str,
            command: &str,
            _payload: Payload,
            _saga_id: Option<SagaId>,
            _timeout: Duration,
        ) -> event_bus::Result<Payload> {
            if command == "process_payment" && self.gated.load(Ordering::SeqCst) {
                self.gate.notified().await;
            }
            if command == "schedule_shipping" {
                return Err(BusError::Remote {
                    service: "shipping".into(),
                    command: command.into(),
                    message: "No carrier available".into(),
                });
            }
            let mut reply = Payload::new();
            if command == "create_order" {
                reply.insert("order_id".into(), json!("ORD-1"));
            }
            Ok(reply)
        }
    }

    fn request() -> OrderRequest {
        serde_json::from_value(json!({
            "customer_id": "c-1",
            "items": [{"product_id": "SKU-1", "quantity": 1}],
            "total_amount": 10.0
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_start_order_tracks_saga() {
        let coordinator = SagaCoordinator::new(Arc::new(GatedSender::default()), CoordinatorConfig::default());

        let result = coordinator.start_order(request()).await.unwrap();
        assert_eq!(result.status, SagaStatus::Aborted);
        assert_eq!(result.order_id.as_deref(), Some("ORD-1"));
        assert!(result.message.contains("No carrier available"));

        let snapshot = coordinator.get(result.saga_id).await.unwrap();
        assert_eq!(snapshot.failed_step_index, Some(3));

        let list = coordinator.list().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].steps_total, 5);
        assert_eq!(list[0].steps_completed, 3);

        let stats = coordinator.statistics().await;
        assert_eq!(stats.sagas_started, 1);
        assert_eq!(stats.sagas_aborted, 1);
        assert_eq!(stats.sagas_in_flight, 0);
    }

    #[tokio::test]
    async fn test_invalid_request_is_refused() {
        let coordinator = SagaCoordinator::new(Arc::new(GatedSender::default()), CoordinatorConfig::default());
        let mut bad = request();
        bad.items.clear();

        assert!(matches!(
            coordinator.start_order(bad).await,
            Err(SagaError::InvalidRequest(_))
        ));
        assert!(coordinator.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_saga() {
        let coordinator = SagaCoordinator::new(Arc::new(GatedSender::default()), CoordinatorConfig::default());
        assert!(matches!(
            coordinator.get(SagaId::new()).await,
            Err(SagaError::NotFound(_))
        ));
        assert!(matches!(
            coordinator.abort(SagaId::new()).await,
            Err(SagaError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_abort_in_flight_saga() {
        let sender = Arc::new(GatedSender::default());
        sender.gated.store(true, Ordering::SeqCst);
        let coordinator = Arc::new(SagaCoordinator::new(sender.clone(), CoordinatorConfig::default()));

        let running = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.start_order(request()).await })
        };

        // Wait until the saga is parked on payment.
        let saga_id = loop {
            if let Some(summary) = coordinator.list().await.first()
                && summary.steps_completed == 2
            {
                break summary.saga_id;
            }
            tokio::task::yield_now().await;
        };

        let aborting = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.abort(saga_id).await })
        };
        while !coordinator.sagas.read().await[&saga_id].abort.is_requested() {
            tokio::task::yield_now().await;
        }
        sender.gate.notify_one();

        let snapshot = aborting.await.unwrap().unwrap();
        assert_eq!(snapshot.status, SagaStatus::Aborted);
        assert_eq!(snapshot.failed_step_index, Some(3));
        assert_eq!(snapshot.error.as_deref(), Some(crate::saga::ABORTED_BY_REQUEST));

        let result = running.await.unwrap().unwrap();
        assert_eq!(result.status, SagaStatus::Aborted);

        assert!(matches!(
            coordinator.abort(saga_id).await,
            Err(SagaError::InvalidState { status: SagaStatus::Aborted, .. })
        ));
    }

    #[tokio::test]
    async fn test_counters_survive_dropped_caller() {
        let sender = Arc::new(GatedSender::default());
        sender.gated.store(true, Ordering::SeqCst);
        let coordinator = Arc::new(SagaCoordinator::new(sender.clone(), CoordinatorConfig::default()));

        let caller = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move { coordinator.start_order(request()).await })
        };

        let saga_id = loop {
            if let Some(summary) = coordinator.list().await.first()
                && summary.steps_completed == 2
            {
                break summary.saga_id;
            }
            tokio::task::yield_now().await;
        };

        // The client goes away while payment is pending.
        caller.abort();
        assert!(caller.await.unwrap_err().is_cancelled());
        sender.gate.notify_one();

        while !coordinator.get(saga_id).await.unwrap().status.is_terminal() {
            tokio::task::yield_now().await;
        }
        let stats = loop {
            let stats = coordinator.statistics().await;
            if stats.sagas_completed + stats.sagas_aborted == 1 {
                break stats;
            }
            tokio::task::yield_now().await;
        };
        assert_eq!(stats.sagas_started, 1);
        assert_eq!(stats.sagas_aborted, 1);
        assert_eq!(stats.sagas_in_flight, 0);
    }

    #[tokio::test]
    async fn test_retention_evicts_oldest_finished_sagas() {
        let coordinator = SagaCoordinator::new(
            Arc::new(GatedSender::default()),
            CoordinatorConfig::default().with_max_retained_sagas(2),
        );

        let first = coordinator.start_order(request()).await.unwrap();
        let second = coordinator.start_order(request()).await.unwrap();
        let third = coordinator.start_order(request()).await.unwrap();

        assert!(coordinator.get(first.saga_id).await.is_err());
        assert!(coordinator.get(second.saga_id).await.is_ok());
        assert!(coordinator.get(third.saga_id).await.is_ok());
        assert_eq!(coordinator.statistics().await.sagas_started, 3);
    }
}
