//! Offline operation queue service.
//!
//! Local mutations are persisted in the `_offline_queue` collection and
//! drained through an [`OperationExecutor`] once the device is online.
//! Ordering, dependency eligibility and retry accounting come from
//! `tether_engine::queue`; this module adds persistence, connectivity
//! tracking and the drain loop itself.
//!
//! Operations execute strictly one at a time. A drain pass runs to the end
//! once started; going offline mid-pass only affects the next pass.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_engine::{
    order_for_drain, DrainPass, DrainReport, EnqueueOptions, FlatRetry, OperationId,
    OperationKind, QueuedOperation, RetryPolicy, Timestamp,
};

use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::{SubscriberRegistry, Subscription};
use crate::executor::{validate_payload, OperationExecutor};
use crate::now_millis;
use crate::store::{self, LocalStore, QUEUE_COLLECTION};

/// Queue tuning.
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Retry budget applied by [`OfflineQueue::default_options`]
    pub max_retries: u32,
    /// Pause between two executed operations
    pub drain_delay: Duration,
    /// Wait after coming online before the automatic drain
    pub settle_delay: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for QueueOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            drain_delay: config.drain_delay,
            settle_delay: config.settle_delay,
        }
    }
}

/// Connectivity and backlog as seen by the queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineStatus {
    pub is_online: bool,
    pub has_pending_changes: bool,
    pub pending_items_count: usize,
    pub failed_items_count: usize,
    pub last_sync_attempt: Option<Timestamp>,
    pub sync_in_progress: bool,
}

/// What [`OfflineQueue::submit`] did with a mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Executed immediately
    Executed,
    /// Persisted for a later drain
    Queued(OperationId),
}

/// Durable queue of pending mutations.
pub struct OfflineQueue {
    store: Arc<dyn LocalStore>,
    executor: Arc<dyn OperationExecutor>,
    retry_policy: Arc<dyn RetryPolicy>,
    options: QueueOptions,
    online: AtomicBool,
    draining: AtomicBool,
    /// Zero until the first drain attempt
    last_sync_attempt: AtomicU64,
    last_enqueued_at: AtomicU64,
    /// Bumped on every connectivity change; stale scheduled drains compare against it
    generation: AtomicU64,
    /// Executed operations whose queue entry could not be removed yet
    unremoved: DashSet<OperationId>,
    listeners: SubscriberRegistry<OfflineStatus>,
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl OfflineQueue {
    /// Create a queue that starts online with flat retries.
    pub fn new(
        store: Arc<dyn LocalStore>,
        executor: Arc<dyn OperationExecutor>,
        options: QueueOptions,
    ) -> Self {
        Self {
            store,
            executor,
            retry_policy: Arc::new(FlatRetry),
            options,
            online: AtomicBool::new(true),
            draining: AtomicBool::new(false),
            last_sync_attempt: AtomicU64::new(0),
            last_enqueued_at: AtomicU64::new(0),
            generation: AtomicU64::new(0),
            unremoved: DashSet::new(),
            listeners: SubscriberRegistry::new(),
        }
    }

    /// Replace the retry timing policy.
    pub fn with_retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Enqueue options carrying the configured retry budget.
    pub fn default_options(&self) -> EnqueueOptions {
        EnqueueOptions::default().with_max_retries(self.options.max_retries)
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Persist a mutation for a later drain. Never waits on connectivity.
    pub async fn enqueue(
        &self,
        kind: OperationKind,
        collection: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<OperationId> {
        validate_payload(kind, &payload)?;

        let id = format!("op-{}", uuid::Uuid::new_v4());
        let op = QueuedOperation::new(
            id.clone(),
            kind,
            collection,
            payload,
            self.next_enqueue_time(),
            options,
        );
        store::put_typed(self.store.as_ref(), QUEUE_COLLECTION, &op.id, &op).await?;

        tracing::debug!(
            op_id = %op.id,
            collection = %op.collection,
            kind = ?op.kind,
            priority = ?op.priority,
            "Operation queued"
        );
        self.notify_status().await;

        Ok(id)
    }

    /// Execute a mutation now if online, queueing it when offline or when
    /// the immediate attempt fails.
    pub async fn submit(
        &self,
        kind: OperationKind,
        collection: &str,
        payload: Value,
        options: EnqueueOptions,
    ) -> Result<SubmitOutcome> {
        validate_payload(kind, &payload)?;

        if self.is_online() {
            let immediate = QueuedOperation::new(
                "op-immediate",
                kind,
                collection,
                payload.clone(),
                now_millis(),
                options.clone(),
            );
            match self.executor.execute(&immediate).await {
                Ok(()) => return Ok(SubmitOutcome::Executed),
                Err(e) => {
                    tracing::warn!(
                        collection = %collection,
                        error = %e,
                        "Immediate execution failed; queueing"
                    );
                }
            }
        }

        let id = self.enqueue(kind, collection, payload, options).await?;
        Ok(SubmitOutcome::Queued(id))
    }

    /// Process every eligible pending operation once.
    ///
    /// Returns zeros without touching the queue when offline or when another
    /// drain is already running. Failures of a single operation, including
    /// store errors while recording its outcome, are counted and logged and
    /// never end the pass early.
    pub async fn drain(&self) -> Result<DrainReport> {
        if !self.is_online() {
            tracing::debug!("Skipping drain while offline");
            return Ok(DrainReport::default());
        }
        if self
            .draining
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Drain already in progress");
            return Ok(DrainReport::default());
        }
        let guard = DrainGuard(&self.draining);

        let started = now_millis();
        self.last_sync_attempt.store(started, Ordering::SeqCst);
        self.notify_status().await;

        let operations = self.load_operations().await?;
        let (leftover, operations): (Vec<_>, Vec<_>) = operations
            .into_iter()
            .partition(|op| self.unremoved.contains(&op.id));
        let ordered = order_for_drain(operations);
        let mut pass = DrainPass::new(&ordered);
        let mut report = DrainReport::default();
        let mut executed_any = false;

        for op in leftover {
            self.remove_executed(&op.id).await;
        }

        tracing::info!(eligible = ordered.len(), "Draining offline queue");

        for mut op in ordered {
            if !pass.is_eligible(&op) {
                tracing::debug!(op_id = %op.id, "Dependencies pending; skipping");
                report.skipped += 1;
                continue;
            }
            let now = now_millis();
            if !self.retry_policy.is_due(&op, now) {
                tracing::debug!(op_id = %op.id, retry_count = op.retry_count, "Retry not due");
                report.skipped += 1;
                continue;
            }

            if executed_any && !self.options.drain_delay.is_zero() {
                tokio::time::sleep(self.options.drain_delay).await;
            }
            executed_any = true;

            match self.executor.execute(&op).await {
                Ok(()) => {
                    tracing::debug!(op_id = %op.id, collection = %op.collection, "Operation applied");
                    self.unremoved.insert(op.id.clone());
                    self.remove_executed(&op.id).await;
                    pass.mark_completed(op.id);
                    report.processed += 1;
                }
                Err(e) => {
                    let terminal = op.record_failure(e.to_string(), now_millis());
                    if let Err(store_err) =
                        store::put_typed(self.store.as_ref(), QUEUE_COLLECTION, &op.id, &op).await
                    {
                        tracing::warn!(
                            op_id = %op.id,
                            error = %store_err,
                            "Could not record operation failure"
                        );
                    }
                    if terminal {
                        tracing::warn!(
                            op_id = %op.id,
                            retries = op.retry_count,
                            error = %e,
                            "Operation exhausted its retries"
                        );
                        report.failed += 1;
                    } else {
                        tracing::warn!(
                            op_id = %op.id,
                            retry_count = op.retry_count,
                            max_retries = op.max_retries,
                            error = %e,
                            "Operation failed; will retry"
                        );
                        report.skipped += 1;
                    }
                }
            }
        }

        tracing::info!(
            processed = report.processed,
            failed = report.failed,
            skipped = report.skipped,
            "Drain complete"
        );

        drop(guard);
        self.notify_status().await;
        Ok(report)
    }

    /// Record a connectivity change.
    ///
    /// Going online schedules a drain after the settle delay; a newer
    /// change before then cancels it. Going offline only flips the flag.
    pub async fn set_online(self: &Arc<Self>, online: bool) {
        let previous = self.online.swap(online, Ordering::SeqCst);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        if online {
            let queue = Arc::clone(self);
            let settle = self.options.settle_delay;
            tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                if queue.generation.load(Ordering::SeqCst) != generation || !queue.is_online() {
                    return;
                }
                if let Err(e) = queue.drain().await {
                    tracing::error!(error = %e, "Scheduled drain failed");
                }
            });
        }

        if previous != online {
            tracing::info!(online, "Connectivity changed");
            self.notify_status().await;
        }
    }

    /// Cancel any drain scheduled by a connectivity change.
    pub fn cancel_scheduled_drain(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    pub async fn get_status(&self) -> Result<OfflineStatus> {
        let operations = self.load_operations().await?;
        let operations: Vec<&QueuedOperation> = operations
            .iter()
            .filter(|op| !self.unremoved.contains(&op.id))
            .collect();
        let failed = operations.iter().filter(|op| op.is_terminal()).count();
        let pending = operations.len() - failed;
        let last = self.last_sync_attempt.load(Ordering::SeqCst);

        Ok(OfflineStatus {
            is_online: self.is_online(),
            has_pending_changes: pending > 0,
            pending_items_count: pending,
            failed_items_count: failed,
            last_sync_attempt: (last > 0).then_some(last),
            sync_in_progress: self.is_draining(),
        })
    }

    /// Non-terminal operations in drain order.
    pub async fn pending(&self) -> Result<Vec<QueuedOperation>> {
        let mut operations = self.load_operations().await?;
        operations.retain(|op| !self.unremoved.contains(&op.id));
        Ok(order_for_drain(operations))
    }

    /// Operations that exhausted their retries.
    pub async fn failed(&self) -> Result<Vec<QueuedOperation>> {
        let operations = self.load_operations().await?;
        Ok(operations.into_iter().filter(|op| op.is_terminal()).collect())
    }

    /// Drop every queued operation, terminal ones included.
    pub async fn clear(&self) -> Result<usize> {
        let removed = self.store.clear(QUEUE_COLLECTION).await?;
        self.unremoved.clear();
        tracing::info!(removed, "Offline queue cleared");
        self.notify_status().await;
        Ok(removed)
    }

    /// Make every terminal operation retryable again.
    pub async fn retry_failed(&self) -> Result<usize> {
        let mut reset = 0;
        for mut op in self.failed().await? {
            op.reset();
            store::put_typed(self.store.as_ref(), QUEUE_COLLECTION, &op.id, &op).await?;
            reset += 1;
        }
        if reset > 0 {
            tracing::info!(reset, "Failed operations reset for retry");
            self.notify_status().await;
        }
        Ok(reset)
    }

    /// Subscribe to connectivity and backlog changes.
    pub fn on_offline_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&OfflineStatus) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Every stored operation. Entries that no longer decode are logged and left out.
    async fn load_operations(&self) -> Result<Vec<QueuedOperation>> {
        let values = self.store.get_all(QUEUE_COLLECTION).await?;
        let mut operations = Vec::with_capacity(values.len());
        for value in values {
            match serde_json::from_value::<QueuedOperation>(value) {
                Ok(op) => operations.push(op),
                Err(e) => tracing::warn!(error = %e, "Ignoring unreadable queue entry"),
            }
        }
        Ok(operations)
    }

    /// Remove the queue entry of an executed operation. On failure the id
    /// stays in `unremoved` so later passes retry the removal instead of
    /// running the operation again.
    async fn remove_executed(&self, id: &str) {
        match self.store.delete(QUEUE_COLLECTION, id).await {
            Ok(_) => {
                self.unremoved.remove(id);
            }
            Err(e) => tracing::warn!(
                op_id = %id,
                error = %e,
                "Executed operation could not be removed from the queue"
            ),
        }
    }

    async fn notify_status(&self) {
        if self.listeners.is_empty() {
            return;
        }
        match self.get_status().await {
            Ok(status) => {
                self.listeners.notify(&status);
            }
            Err(e) => tracing::warn!(error = %e, "Could not compute offline status"),
        }
    }

    /// Strictly increasing enqueue time so FIFO order survives same-millisecond enqueues.
    fn next_enqueue_time(&self) -> Timestamp {
        let now = now_millis();
        let mut current = self.last_enqueued_at.load(Ordering::SeqCst);
        loop {
            let next = now.max(current + 1);
            match self.last_enqueued_at.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }
}
