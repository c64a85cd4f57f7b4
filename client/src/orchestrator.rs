//! Sync orchestrator.
//!
//! Runs full sync cycles over the mirror, incremental and queue services,
//! aggregates their status for the UI layer, and owns the background tasks
//! (auto-sync timer and mirror change listener).
//!
//! All cycles on a device go through one in-progress guard. A step that
//! fails or panics is recorded in the cycle's `errors` and the remaining
//! steps still run.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_engine::{
    record, ConflictResolver, DrainReport, IncrementalChanges, Resolution, Timestamp,
};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::events::{SubscriberRegistry, Subscription};
use crate::executor::OperationExecutor;
use crate::incremental::{CollectionSyncStatus, IncrementalSyncManager, IncrementalSyncStatus};
use crate::mirror::{
    MirrorChange, MirrorStatus, MirrorStore, MirrorSyncReport, RemoteMirrorSync, SNAPSHOT_KEY,
};
use crate::now_millis;
use crate::queue::{OfflineQueue, OfflineStatus, QueueOptions};
use crate::store::LocalStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    pub auto_sync: bool,
    pub auto_sync_interval: Duration,
    /// Pull when another device publishes to the mirror
    pub listen_to_mirror: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for OrchestratorOptions {
    fn from(config: &SyncConfig) -> Self {
        Self {
            auto_sync: config.auto_sync,
            auto_sync_interval: config.auto_sync_interval,
            listen_to_mirror: true,
        }
    }
}

/// The steps of a full sync cycle, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStep {
    Mirror,
    Incremental,
    Offline,
}

impl std::fmt::Display for SyncStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncStep::Mirror => write!(f, "mirror"),
            SyncStep::Incremental => write!(f, "incremental"),
            SyncStep::Offline => write!(f, "offline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepError {
    pub step: SyncStep,
    pub message: String,
}

/// Result of [`SyncOrchestrator::sync_all`]. A step's field is `None` when
/// that step failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncAllResult {
    pub success: bool,
    pub mirror: Option<MirrorSyncReport>,
    pub incremental: Option<IncrementalSyncStatus>,
    pub offline: Option<DrainReport>,
    pub errors: Vec<StepError>,
}

/// Aggregate status, computed on every call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub is_online: bool,
    pub sync_in_progress: bool,
    pub auto_sync: bool,
    pub last_sync: Option<Timestamp>,
    pub last_errors: Vec<StepError>,
    pub collections: Vec<CollectionSyncStatus>,
    pub offline: OfflineStatus,
    pub mirror: MirrorStatus,
    pub unresolved_conflicts: usize,
}

/// What [`SyncOrchestrator::reset_sync`] removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetReport {
    pub operations_cleared: usize,
    pub conflicts_cleared: usize,
    pub checkpoints_reset: usize,
}

struct ActiveGuard<'a>(&'a AtomicUsize);

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct SyncOrchestrator {
    store: Arc<dyn LocalStore>,
    queue: Arc<OfflineQueue>,
    incremental: Arc<IncrementalSyncManager>,
    mirror: Arc<RemoteMirrorSync>,
    options: Mutex<OrchestratorOptions>,
    active: AtomicUsize,
    /// Zero until the first clean cycle
    last_sync: AtomicU64,
    last_errors: Mutex<Vec<StepError>>,
    listeners: SubscriberRegistry<SyncStatus>,
    timer: Mutex<Option<JoinHandle<()>>>,
    mirror_listener: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    pub fn new(
        store: Arc<dyn LocalStore>,
        queue: Arc<OfflineQueue>,
        incremental: Arc<IncrementalSyncManager>,
        mirror: Arc<RemoteMirrorSync>,
        options: OrchestratorOptions,
    ) -> Self {
        Self {
            store,
            queue,
            incremental,
            mirror,
            options: Mutex::new(options),
            active: AtomicUsize::new(0),
            last_sync: AtomicU64::new(0),
            last_errors: Mutex::new(Vec::new()),
            listeners: SubscriberRegistry::new(),
            timer: Mutex::new(None),
            mirror_listener: Mutex::new(None),
        }
    }

    /// Wire every service from a configuration.
    pub fn from_config(
        config: &SyncConfig,
        store: Arc<dyn LocalStore>,
        mirror_store: Arc<dyn MirrorStore>,
        executor: Arc<dyn OperationExecutor>,
    ) -> Self {
        let resolver = Arc::new(Mutex::new(ConflictResolver::new(config.conflict_strategy)));
        let incremental = Arc::new(IncrementalSyncManager::new(
            Arc::clone(&store),
            resolver,
            config.collections.clone(),
            config.batch_size,
        ));
        let queue = Arc::new(OfflineQueue::new(
            Arc::clone(&store),
            executor,
            QueueOptions::from(config),
        ));
        let mirror = Arc::new(RemoteMirrorSync::new(
            mirror_store,
            Arc::clone(&store),
            Arc::clone(&incremental),
            config.device_id.clone(),
        ));
        Self::new(store, queue, incremental, mirror, OrchestratorOptions::from(config))
    }

    pub fn queue(&self) -> &Arc<OfflineQueue> {
        &self.queue
    }

    pub fn incremental(&self) -> &Arc<IncrementalSyncManager> {
        &self.incremental
    }

    pub fn mirror(&self) -> &Arc<RemoteMirrorSync> {
        &self.mirror
    }

    pub fn resolver(&self) -> &Arc<Mutex<ConflictResolver>> {
        self.incremental.resolver()
    }

    pub fn is_syncing(&self) -> bool {
        self.active.load(Ordering::SeqCst) > 0
    }

    /// Run mirror sync, incremental status refresh and queue drain.
    ///
    /// Fails with [`SyncError::SyncInProgress`] if a cycle is already
    /// running, unless `force` is set. Step failures never fail the call.
    pub async fn sync_all(&self, force: bool) -> Result<SyncAllResult> {
        let guard = self.begin(force)?;
        tracing::info!(force, "Sync cycle started");
        self.notify_status().await;

        let mut errors = Vec::new();
        let mirror = run_step(SyncStep::Mirror, self.mirror.sync(), &mut errors).await;
        let incremental = run_step(
            SyncStep::Incremental,
            self.incremental.get_sync_status(),
            &mut errors,
        )
        .await;
        let offline = run_step(SyncStep::Offline, self.queue.drain(), &mut errors).await;

        let success = errors.is_empty();
        if success {
            self.last_sync.store(now_millis(), Ordering::SeqCst);
        }
        *self.last_errors.lock().await = errors.clone();

        tracing::info!(success, errors = errors.len(), "Sync cycle finished");
        drop(guard);
        self.notify_status().await;

        Ok(SyncAllResult {
            success,
            mirror,
            incremental,
            offline,
            errors,
        })
    }

    /// Run only the incremental path for one collection.
    pub async fn sync_collection(&self, collection: &str, force: bool) -> Result<IncrementalChanges> {
        let guard = self.begin(force)?;
        let result = self.incremental.sync_collection(collection).await;
        drop(guard);
        self.notify_status().await;
        result
    }

    /// Record a connectivity change; coming online schedules a queue drain.
    pub async fn set_online(&self, online: bool) {
        self.queue.set_online(online).await;
        self.notify_status().await;
    }

    pub async fn get_status(&self) -> Result<SyncStatus> {
        let offline = self.queue.get_status().await?;
        let incremental = self.incremental.get_sync_status().await?;
        let mirror = self.mirror.status().await;
        let unresolved_conflicts = self.resolver().lock().await.unresolved_count();
        let last = self.last_sync.load(Ordering::SeqCst);

        Ok(SyncStatus {
            is_online: offline.is_online,
            sync_in_progress: self.is_syncing(),
            auto_sync: self.options.lock().await.auto_sync,
            last_sync: (last > 0).then_some(last),
            last_errors: self.last_errors.lock().await.clone(),
            collections: incremental.collections,
            offline,
            mirror,
            unresolved_conflicts,
        })
    }

    pub fn on_status_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&SyncStatus) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    /// Resolve a conflict and write the outcome into the local record.
    ///
    /// [`Resolution::Manual`] leaves the conflict open and returns `None`.
    pub async fn resolve_conflict(&self, id: &str, resolution: Resolution) -> Result<Option<Value>> {
        let now = now_millis();
        let (value, key, field) = {
            let mut resolver = self.resolver().lock().await;
            let value = resolver.resolve_conflict(id, resolution, now)?;
            let conflict = resolver
                .get(id)
                .ok_or_else(|| tether_engine::Error::ConflictNotFound(id.to_string()))?;
            (value, conflict.collection_key.clone(), conflict.field.clone())
        };

        if let Some(value) = &value {
            self.write_back(&key, &field, value.clone(), now).await?;
        }
        self.notify_status().await;
        Ok(value)
    }

    /// Complete a conflict with a value chosen outside the resolver.
    pub async fn resolve_conflict_with_value(&self, id: &str, value: Value) -> Result<Value> {
        let now = now_millis();
        let (key, field) = {
            let mut resolver = self.resolver().lock().await;
            resolver.resolve_with_value(id, value.clone(), now)?;
            let conflict = resolver
                .get(id)
                .ok_or_else(|| tether_engine::Error::ConflictNotFound(id.to_string()))?;
            (conflict.collection_key.clone(), conflict.field.clone())
        };

        self.write_back(&key, &field, value.clone(), now).await?;
        self.notify_status().await;
        Ok(value)
    }

    /// Start over: clear the mirror copy, the queue, resolved conflicts and
    /// every checkpoint. Irreversible without a backup.
    pub async fn reset_sync(&self) -> Result<ResetReport> {
        let guard = self.begin(false)?;

        self.mirror.clear().await?;
        let operations_cleared = self.queue.clear().await?;
        let conflicts_cleared = self.resolver().lock().await.clear_resolved_conflicts();
        let checkpoints_reset = self.incremental.reset_all_checkpoints().await?;
        self.last_sync.store(0, Ordering::SeqCst);
        self.last_errors.lock().await.clear();

        tracing::warn!(
            operations_cleared,
            conflicts_cleared,
            checkpoints_reset,
            "Sync state reset"
        );
        drop(guard);
        self.notify_status().await;

        Ok(ResetReport {
            operations_cleared,
            conflicts_cleared,
            checkpoints_reset,
        })
    }

    /// Arm the auto-sync timer and the mirror listener per the current options.
    pub async fn start(self: &Arc<Self>) {
        self.rearm_timer().await;

        let listen = self.options.lock().await.listen_to_mirror;
        let mut listener = self.mirror_listener.lock().await;
        if let Some(handle) = listener.take() {
            handle.abort();
        }
        if listen {
            *listener = Some(spawn_mirror_listener(
                Arc::downgrade(self),
                self.mirror.changes(),
            ));
        }
    }

    /// Replace the options and rearm the timer.
    pub async fn set_options(self: &Arc<Self>, options: OrchestratorOptions) {
        *self.options.lock().await = options;
        self.rearm_timer().await;
    }

    pub async fn stop_auto_sync(&self) {
        if let Some(handle) = self.timer.lock().await.take() {
            handle.abort();
            tracing::info!("Auto-sync stopped");
        }
    }

    /// Stop background tasks and drop subscribers.
    pub async fn shutdown(&self) {
        self.stop_auto_sync().await;
        if let Some(handle) = self.mirror_listener.lock().await.take() {
            handle.abort();
        }
        self.queue.cancel_scheduled_drain();
        self.listeners.clear();
        tracing::info!("Sync orchestrator shut down");
    }

    fn begin(&self, force: bool) -> Result<ActiveGuard<'_>> {
        let previous = self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(&self.active);
        if previous > 0 && !force {
            tracing::debug!("Sync already in progress; rejecting");
            return Err(SyncError::SyncInProgress);
        }
        Ok(guard)
    }

    async fn rearm_timer(self: &Arc<Self>) {
        let options = self.options.lock().await.clone();
        let mut timer = self.timer.lock().await;
        if let Some(handle) = timer.take() {
            handle.abort();
        }
        if options.auto_sync {
            tracing::info!(
                interval_secs = options.auto_sync_interval.as_secs(),
                "Auto-sync armed"
            );
            *timer = Some(spawn_auto_sync(
                Arc::downgrade(self),
                options.auto_sync_interval,
            ));
        }
    }

    async fn write_back(&self, key: &str, field: &str, value: Value, now: Timestamp) -> Result<()> {
        let (collection, id) = record::split_collection_key(key)
            .ok_or_else(|| SyncError::BadRequest(format!("malformed record key {key}")))?;

        let Some(mut local) = self.store.get_by_key(&collection, &id).await? else {
            tracing::warn!(key = %key, "Resolved conflict for a record that no longer exists");
            return Ok(());
        };
        if let Some(fields) = local.as_object_mut() {
            fields.insert(field.to_string(), value);
        }
        record::touch(&mut local, now);
        self.store.put(&collection, &local).await?;
        tracing::debug!(key = %key, field = %field, "Conflict resolution written back");
        Ok(())
    }

    async fn notify_status(&self) {
        if self.listeners.is_empty() {
            return;
        }
        match self.get_status().await {
            Ok(status) => {
                self.listeners.notify(&status);
            }
            Err(e) => tracing::warn!(error = %e, "Could not compute sync status"),
        }
    }
}

/// Await one step, turning errors and panics into a [`StepError`].
async fn run_step<T, F>(step: SyncStep, future: F, errors: &mut Vec<StepError>) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match AssertUnwindSafe(future).catch_unwind().await {
        Ok(Ok(value)) => Some(value),
        Ok(Err(e)) => {
            tracing::warn!(step = %step, error = %e, "Sync step failed");
            errors.push(StepError {
                step,
                message: e.to_string(),
            });
            None
        }
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            tracing::error!(step = %step, panic = %message, "Sync step panicked");
            errors.push(StepError { step, message });
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "step panicked".to_string()
    }
}

fn spawn_auto_sync(orchestrator: Weak<SyncOrchestrator>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            if !orchestrator.queue.is_online() || orchestrator.is_syncing() {
                tracing::debug!("Auto-sync tick skipped");
                continue;
            }
            match orchestrator.sync_all(false).await {
                Ok(result) => tracing::debug!(success = result.success, "Auto-sync completed"),
                Err(SyncError::SyncInProgress) => {}
                Err(e) => tracing::warn!(error = %e, "Auto-sync failed"),
            }
        }
    })
}

fn spawn_mirror_listener(
    orchestrator: Weak<SyncOrchestrator>,
    mut changes: broadcast::Receiver<MirrorChange>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let change = match changes.recv().await {
                Ok(change) => change,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "Mirror listener lagged");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => break,
            };
            if change.key != SNAPSHOT_KEY {
                continue;
            }
            let Some(orchestrator) = orchestrator.upgrade() else {
                break;
            };
            if !orchestrator.queue.is_online() {
                continue;
            }
            let Ok(guard) = orchestrator.begin(false) else {
                tracing::debug!("Mirror change during sync; next cycle will pick it up");
                continue;
            };
            let pulled = orchestrator.mirror.pull().await;
            drop(guard);
            match pulled {
                Ok(Some(report)) => {
                    tracing::info!(applied = report.applied, "Merged mirror change");
                    orchestrator.notify_status().await;
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Mirror change pull failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::StoreExecutor;
    use crate::mirror::MemoryMirror;
    use crate::store::MemoryStore;
    use serde_json::json;
    use tether_engine::ConflictStrategy;

    fn config(strategy: ConflictStrategy) -> SyncConfig {
        SyncConfig {
            device_id: "laptop".into(),
            collections: vec!["meetings".into()],
            conflict_strategy: strategy,
            drain_delay: Duration::ZERO,
            ..SyncConfig::default()
        }
    }

    fn orchestrator(strategy: ConflictStrategy) -> (Arc<MemoryStore>, Arc<MemoryMirror>, Arc<SyncOrchestrator>) {
        let store = Arc::new(MemoryStore::new());
        let mirror = Arc::new(MemoryMirror::new());
        let executor = Arc::new(StoreExecutor::new(store.clone()));
        let orchestrator = Arc::new(SyncOrchestrator::from_config(
            &config(strategy),
            store.clone(),
            mirror.clone(),
            executor,
        ));
        (store, mirror, orchestrator)
    }

    #[tokio::test]
    async fn clean_cycle_reports_every_step() {
        let (_store, _mirror, orchestrator) = orchestrator(ConflictStrategy::SmartMerge);
        let result = orchestrator.sync_all(false).await.unwrap();

        assert!(result.success);
        assert!(result.mirror.unwrap().enabled);
        assert_eq!(result.incremental.unwrap().collections.len(), 1);
        assert_eq!(result.offline, Some(DrainReport::default()));
        assert!(orchestrator.get_status().await.unwrap().last_sync.is_some());
    }

    #[tokio::test]
    async fn concurrent_cycle_is_rejected_unless_forced() {
        let (_store, _mirror, orchestrator) = orchestrator(ConflictStrategy::SmartMerge);
        let guard = orchestrator.begin(false).unwrap();

        assert!(matches!(
            orchestrator.sync_all(false).await,
            Err(SyncError::SyncInProgress)
        ));
        assert!(orchestrator.sync_all(true).await.is_ok());

        drop(guard);
        assert!(!orchestrator.is_syncing());
    }

    #[tokio::test]
    async fn mirror_failure_does_not_block_queue() {
        let (store, mirror, orchestrator) = orchestrator(ConflictStrategy::SmartMerge);
        orchestrator
            .queue()
            .enqueue(
                tether_engine::OperationKind::Create,
                "meetings",
                json!({"id": "m-1"}),
                Default::default(),
            )
            .await
            .unwrap();
        mirror.set_failing(true);

        let result = orchestrator.sync_all(false).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].step, SyncStep::Mirror);
        assert_eq!(result.offline.unwrap().processed, 1);
        assert!(store.get_by_key("meetings", "m-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn resolved_conflict_is_written_back() {
        let (store, _mirror, orchestrator) = orchestrator(ConflictStrategy::Manual);
        store
            .put("meetings", &json!({"id": "m-1", "title": "Mine"}))
            .await
            .unwrap();

        let conflict_id = {
            let mut resolver = orchestrator.resolver().lock().await;
            let conflicts = resolver.detect_conflicts(
                &json!({"id": "m-1", "title": "Mine"}),
                &json!({"id": "m-1", "title": "Theirs"}),
                "meetings:m-1",
                1,
            );
            conflicts[0].id.clone()
        };

        assert_eq!(
            orchestrator
                .resolve_conflict(&conflict_id, Resolution::Manual)
                .await
                .unwrap(),
            None
        );
        let value = orchestrator
            .resolve_conflict(&conflict_id, Resolution::Remote)
            .await
            .unwrap();
        assert_eq!(value, Some(json!("Theirs")));

        let stored = store.get_by_key("meetings", "m-1").await.unwrap().unwrap();
        assert_eq!(stored["title"], json!("Theirs"));
        assert!(orchestrator
            .resolve_conflict(&conflict_id, Resolution::Local)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reset_clears_sync_state() {
        let (store, mirror, orchestrator) = orchestrator(ConflictStrategy::SmartMerge);
        store.put("meetings", &json!({"id": "m-1"})).await.unwrap();
        orchestrator.set_online(false).await;
        orchestrator
            .queue()
            .enqueue(
                tether_engine::OperationKind::Update,
                "meetings",
                json!({"id": "m-1"}),
                Default::default(),
            )
            .await
            .unwrap();
        orchestrator.sync_collection("meetings", false).await.unwrap();
        orchestrator.mirror().push().await.unwrap();

        let report = orchestrator.reset_sync().await.unwrap();
        assert_eq!(report.operations_cleared, 1);
        assert_eq!(report.checkpoints_reset, 1);
        assert!(mirror.is_empty());

        let changes = orchestrator
            .incremental()
            .get_incremental_changes("meetings")
            .await
            .unwrap();
        assert_eq!(changes.created.len(), 1);
    }

    #[tokio::test]
    async fn panicking_subscriber_does_not_break_sync() {
        let (_store, _mirror, orchestrator) = orchestrator(ConflictStrategy::SmartMerge);
        let _sub = orchestrator.on_status_change(|_| panic!("ui bug"));
        assert!(orchestrator.sync_all(false).await.unwrap().success);
    }

    fn errors_are_fatal() -> bool {
        true
    }

    #[tokio::test]
    async fn panicking_step_is_reported() {
        let mut errors = Vec::new();
        let result: Option<()> = run_step(
            SyncStep::Offline,
            async {
                if errors_are_fatal() {
                    panic!("executor exploded");
                }
                Ok(())
            },
            &mut errors,
        )
        .await;
        assert!(result.is_none());
        assert_eq!(errors[0].message, "executor exploded");
    }

    #[tokio::test(start_paused = true)]
    async fn auto_sync_fires_on_interval() {
        let (_store, _mirror, orchestrator) = orchestrator(ConflictStrategy::SmartMerge);
        orchestrator
            .set_options(OrchestratorOptions {
                auto_sync: true,
                auto_sync_interval: Duration::from_secs(60),
                listen_to_mirror: false,
            })
            .await;

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(orchestrator.get_status().await.unwrap().last_sync.is_none());

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(orchestrator.get_status().await.unwrap().last_sync.is_some());

        orchestrator.shutdown().await;
    }
}
