//! Incremental sync manager.
//!
//! Keeps one [`SyncCheckpoint`] per collection in `_sync_checkpoints` and
//! uses it to compute and apply deltas. Remote records pass through the
//! shared [`ConflictResolver`] before they touch the local store.

use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_engine::conflict::diff_fields;
use tether_engine::{
    compute_changes, deep_equal, record, ApplyReport, ConflictResolver, DeepEquality,
    IncrementalChanges, SyncCheckpoint, Timestamp,
};
use tokio::sync::Mutex;

use crate::error::{Result, SyncError};
use crate::now_millis;
use crate::store::{self, LocalStore, CHECKPOINT_COLLECTION};

/// Sync state of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CollectionState {
    Synced,
    Pending,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSyncStatus {
    pub name: String,
    pub last_sync: Option<Timestamp>,
    pub pending_changes: usize,
    pub status: CollectionState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalSyncStatus {
    pub collections: Vec<CollectionSyncStatus>,
}

enum Applied {
    Applied,
    Skipped,
    Failed,
}

/// What merging a remote record produced.
enum Merged {
    /// Write this record
    Changed(Value),
    /// Local already matches
    Unchanged,
    /// Remote is an older or already merged version
    Stale,
    /// A conflict awaits manual resolution
    Deferred,
}

/// Checkpoint tracking and delta application.
pub struct IncrementalSyncManager {
    store: Arc<dyn LocalStore>,
    resolver: Arc<Mutex<ConflictResolver>>,
    collections: Vec<String>,
    batch_size: usize,
    /// Last failure per collection, cleared by the next successful sync
    errors: DashMap<String, String>,
}

impl IncrementalSyncManager {
    pub fn new(
        store: Arc<dyn LocalStore>,
        resolver: Arc<Mutex<ConflictResolver>>,
        collections: Vec<String>,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            resolver,
            collections,
            batch_size: batch_size.max(1),
            errors: DashMap::new(),
        }
    }

    /// Collections reported by [`Self::get_sync_status`].
    pub fn collections(&self) -> &[String] {
        &self.collections
    }

    pub fn resolver(&self) -> &Arc<Mutex<ConflictResolver>> {
        &self.resolver
    }

    pub async fn load_checkpoint(&self, collection: &str) -> Result<Option<SyncCheckpoint>> {
        store::get_typed(self.store.as_ref(), CHECKPOINT_COLLECTION, collection).await
    }

    /// Persist a checkpoint, replacing the collection's previous one.
    pub async fn commit_checkpoint(&self, checkpoint: &SyncCheckpoint) -> Result<()> {
        store::put_typed(
            self.store.as_ref(),
            CHECKPOINT_COLLECTION,
            &checkpoint.collection,
            checkpoint,
        )
        .await?;
        tracing::debug!(
            collection = %checkpoint.collection,
            version = checkpoint.last_sync_version,
            records = checkpoint.record_count,
            "Checkpoint committed"
        );
        Ok(())
    }

    /// Delta of a collection since its checkpoint. Reads only.
    pub async fn get_incremental_changes(&self, collection: &str) -> Result<IncrementalChanges> {
        if record::is_internal_collection(collection) {
            return Err(SyncError::BadRequest(format!(
                "{collection} is an internal collection"
            )));
        }
        let records = self.store.get_all(collection).await?;
        let checkpoint = self.load_checkpoint(collection).await?;
        Ok(compute_changes(
            collection,
            &records,
            checkpoint.as_ref(),
            now_millis(),
        )?)
    }

    /// Apply a change set received from elsewhere.
    ///
    /// Every created, updated and deleted entry lands in exactly one of the
    /// report's counters. Work is split into `batch_size` chunks with a
    /// yield between them. The checkpoint advances when nothing failed.
    pub async fn apply_incremental_changes(
        &self,
        changes: &IncrementalChanges,
    ) -> Result<ApplyReport> {
        let collection = changes.collection.as_str();
        if record::is_internal_collection(collection) {
            return Err(SyncError::BadRequest(format!(
                "{collection} is an internal collection"
            )));
        }

        let mut report = ApplyReport::default();
        let upserts: Vec<&Value> = changes.created.iter().chain(&changes.updated).collect();

        for chunk in upserts.chunks(self.batch_size) {
            for remote in chunk {
                match self.apply_record(collection, remote).await {
                    Applied::Applied => report.applied += 1,
                    Applied::Skipped => report.skipped += 1,
                    Applied::Failed => report.failed += 1,
                }
            }
            tokio::task::yield_now().await;
        }

        for chunk in changes.deleted.chunks(self.batch_size) {
            for id in chunk {
                match self.store.delete(collection, id).await {
                    Ok(true) => report.applied += 1,
                    Ok(false) => report.skipped += 1,
                    Err(e) => {
                        tracing::warn!(collection = %collection, record_id = %id, error = %e, "Delete failed");
                        report.failed += 1;
                    }
                }
            }
            tokio::task::yield_now().await;
        }

        if report.failed == 0 {
            self.advance_checkpoint(collection).await?;
            self.errors.remove(collection);
        } else {
            self.errors.insert(
                collection.to_string(),
                format!("{} records failed to apply", report.failed),
            );
        }

        tracing::info!(
            collection = %collection,
            applied = report.applied,
            failed = report.failed,
            skipped = report.skipped,
            "Applied incremental changes"
        );
        Ok(report)
    }

    /// Compute the local delta and commit the checkpoint it produces.
    pub async fn sync_collection(&self, collection: &str) -> Result<IncrementalChanges> {
        let result = async {
            let changes = self.get_incremental_changes(collection).await?;
            self.commit_checkpoint(&changes.checkpoint).await?;
            Ok::<_, SyncError>(changes)
        }
        .await;

        match &result {
            Ok(changes) => {
                self.errors.remove(collection);
                tracing::info!(
                    collection = %collection,
                    created = changes.created.len(),
                    updated = changes.updated.len(),
                    deleted = changes.deleted.len(),
                    "Collection synced"
                );
            }
            Err(e) => {
                self.errors.insert(collection.to_string(), e.to_string());
                tracing::warn!(collection = %collection, error = %e, "Collection sync failed");
            }
        }
        result
    }

    pub async fn get_sync_status(&self) -> Result<IncrementalSyncStatus> {
        let mut collections = Vec::with_capacity(self.collections.len());

        for name in &self.collections {
            let status = match self.get_incremental_changes(name).await {
                Ok(changes) => {
                    let last_sync = self
                        .load_checkpoint(name)
                        .await?
                        .map(|cp| cp.last_sync_timestamp);
                    let pending = changes.total();
                    let error = self.errors.get(name).map(|e| e.value().clone());
                    let state = match (&error, pending) {
                        (Some(_), _) => CollectionState::Error,
                        (None, 0) => CollectionState::Synced,
                        (None, _) => CollectionState::Pending,
                    };
                    CollectionSyncStatus {
                        name: name.clone(),
                        last_sync,
                        pending_changes: pending,
                        status: state,
                        error,
                    }
                }
                Err(e) => CollectionSyncStatus {
                    name: name.clone(),
                    last_sync: None,
                    pending_changes: 0,
                    status: CollectionState::Error,
                    error: Some(e.to_string()),
                },
            };
            collections.push(status);
        }

        Ok(IncrementalSyncStatus { collections })
    }

    /// Forget a collection's checkpoint so the next delta is a full resync.
    pub async fn reset_checkpoint(&self, collection: &str) -> Result<bool> {
        let removed = self.store.delete(CHECKPOINT_COLLECTION, collection).await?;
        self.errors.remove(collection);
        tracing::info!(collection = %collection, removed, "Checkpoint reset");
        Ok(removed)
    }

    /// Forget every checkpoint.
    pub async fn reset_all_checkpoints(&self) -> Result<usize> {
        let removed = self.store.clear(CHECKPOINT_COLLECTION).await?;
        self.errors.clear();
        Ok(removed)
    }

    async fn advance_checkpoint(&self, collection: &str) -> Result<()> {
        let records = self.store.get_all(collection).await?;
        let base = self
            .load_checkpoint(collection)
            .await?
            .unwrap_or_else(|| SyncCheckpoint::initial(collection));
        let next = base.advance(&records, now_millis())?;
        self.commit_checkpoint(&next).await
    }

    async fn apply_record(&self, collection: &str, remote: &Value) -> Applied {
        let Some(id) = record::record_id(remote) else {
            tracing::warn!(collection = %collection, "Remote record without id");
            return Applied::Failed;
        };

        let local = match self.store.get_by_key(collection, id).await {
            Ok(local) => local,
            Err(e) => {
                tracing::warn!(collection = %collection, record_id = %id, error = %e, "Lookup failed");
                return Applied::Failed;
            }
        };

        let merged = match local {
            None => Merged::Changed(remote.clone()),
            Some(local) => match self.merge(collection, id, &local, remote).await {
                Ok(merged) => merged,
                Err(e) => {
                    tracing::warn!(collection = %collection, record_id = %id, error = %e, "Merge failed");
                    return Applied::Failed;
                }
            },
        };

        let record = match merged {
            Merged::Changed(record) => record,
            Merged::Unchanged => return Applied::Applied,
            Merged::Stale | Merged::Deferred => return Applied::Skipped,
        };

        match self.store.put(collection, &record).await {
            Ok(()) => Applied::Applied,
            Err(e) => {
                tracing::warn!(collection = %collection, record_id = %id, error = %e, "Write failed");
                Applied::Failed
            }
        }
    }

    /// Merge a remote record into its local counterpart.
    ///
    /// A remote version whose marker is not newer than the local one has
    /// already been seen and is not compared again. The merged record keeps
    /// the later of the two markers; it is stamped with the current time
    /// only when neither side carries one.
    async fn merge(
        &self,
        collection: &str,
        id: &str,
        local: &Value,
        remote: &Value,
    ) -> Result<Merged> {
        let key = record::collection_key(collection, id);
        let marker = record::latest_modified(local, remote);

        if let (Some(ours), Some(theirs)) = (record::modified_at(local), record::modified_at(remote)) {
            if theirs <= ours {
                if diff_fields(local, remote, &DeepEquality).is_empty() {
                    return Ok(Merged::Unchanged);
                }
                tracing::debug!(key = %key, "Remote version is not newer; skipping");
                return Ok(Merged::Stale);
            }
        }

        let now = now_millis();
        let mut resolver = self.resolver.lock().await;
        let conflicts = resolver.detect_conflicts(local, remote, &key, now);

        let mut merged = local.clone();
        let mut deferred = 0;
        for conflict in &conflicts {
            match resolver.auto_resolve(&conflict.id, now)? {
                Some(value) => {
                    if let Some(fields) = merged.as_object_mut() {
                        fields.insert(conflict.field.clone(), value);
                    }
                }
                None => deferred += 1,
            }
        }
        drop(resolver);

        if deferred > 0 {
            tracing::info!(
                key = %key,
                deferred,
                "Conflicts left for manual resolution"
            );
            return Ok(Merged::Deferred);
        }
        if !conflicts.is_empty() {
            tracing::debug!(key = %key, fields = conflicts.len(), "Conflicts auto-resolved");
        }

        match marker {
            Some(ts) => record::touch(&mut merged, ts),
            None if !conflicts.is_empty() => record::touch(&mut merged, now),
            None => {}
        }

        if deep_equal(&merged, local) {
            Ok(Merged::Unchanged)
        } else {
            Ok(Merged::Changed(merged))
        }
    }
}
