//! Snapshot push/pull against the remote mirror.
//!
//! The whole user dataset travels as one [`MirrorSnapshot`] stored under
//! [`SNAPSHOT_KEY`]. Pulling merges a newer snapshot from another device
//! through the incremental sync manager, so remote values meet the same
//! conflict handling as any other delta.
//!
//! Deletions travel as tombstones. Each device remembers, per collection,
//! the ids it has exchanged with the mirror. An exchanged id that is gone
//! locally was deleted here: the next push lists it under `deleted`, and
//! pulls do not bring it back in the meantime.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tether_engine::{
    integrity, record, ApplyReport, IncrementalChanges, RecordId, SyncCheckpoint, Timestamp,
};
use tokio::sync::{broadcast, Mutex};

use super::{MirrorChange, MirrorStore};
use crate::error::{Result, SyncError};
use crate::incremental::IncrementalSyncManager;
use crate::now_millis;
use crate::store::{self, LocalStore, MIRROR_COLLECTION};

/// Mirror key holding the latest snapshot.
pub const SNAPSHOT_KEY: &str = "tether:snapshot";

/// Serialized copy of every synced collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSnapshot {
    pub device_id: String,
    pub timestamp: Timestamp,
    pub checksum: String,
    pub collections: BTreeMap<String, Vec<Value>>,
    /// Ids deleted on the publishing device since its previous push
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub deleted: BTreeMap<String, Vec<RecordId>>,
}

impl MirrorSnapshot {
    pub fn new(
        device_id: impl Into<String>,
        timestamp: Timestamp,
        collections: BTreeMap<String, Vec<Value>>,
        deleted: BTreeMap<String, Vec<RecordId>>,
    ) -> Result<Self> {
        let checksum = snapshot_checksum(&collections, &deleted)?;
        Ok(Self {
            device_id: device_id.into(),
            timestamp,
            checksum,
            collections,
            deleted,
        })
    }

    pub fn verify(&self) -> Result<()> {
        let actual = snapshot_checksum(&self.collections, &self.deleted)?;
        integrity::verify(&self.checksum, &actual)
            .map_err(|e| SyncError::Integrity(format!("mirror snapshot: {e}")))
    }

    pub fn record_count(&self) -> usize {
        self.collections.values().map(Vec::len).sum()
    }

    pub fn tombstone_count(&self) -> usize {
        self.deleted.values().map(Vec::len).sum()
    }
}

fn snapshot_checksum(
    collections: &BTreeMap<String, Vec<Value>>,
    deleted: &BTreeMap<String, Vec<RecordId>>,
) -> Result<String> {
    let value = if deleted.is_empty() {
        serde_json::to_value(collections)?
    } else {
        serde_json::json!({ "collections": collections, "deleted": deleted })
    };
    Ok(integrity::checksum_value(&value)?)
}

fn ids_of(records: &[Value]) -> BTreeSet<RecordId> {
    records
        .iter()
        .filter_map(record::record_id)
        .map(str::to_string)
        .collect()
}

/// Ids of one collection this device has exchanged with the mirror.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ExchangedIds {
    ids: BTreeSet<RecordId>,
}

/// Mirror sync state for status reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorStatus {
    /// False when the mirror backend is unavailable
    pub enabled: bool,
    pub device_id: String,
    pub last_push: Option<Timestamp>,
    pub last_pull: Option<Timestamp>,
    /// Timestamp of the newest foreign snapshot merged so far
    pub last_remote_snapshot: Option<Timestamp>,
    pub last_source_device: Option<String>,
    pub last_error: Option<String>,
}

/// Result of one pull-then-push cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorSyncReport {
    pub enabled: bool,
    /// Records written to the mirror
    pub pushed: usize,
    /// Outcome of merging a foreign snapshot, if one was pulled
    pub pulled: Option<ApplyReport>,
}

#[derive(Debug, Default)]
struct MirrorState {
    last_push: Option<Timestamp>,
    last_pull: Option<Timestamp>,
    last_remote_snapshot: Option<Timestamp>,
    last_remote_checksum: Option<String>,
    last_source_device: Option<String>,
    last_error: Option<String>,
}

/// Pushes and pulls whole-dataset snapshots.
pub struct RemoteMirrorSync {
    mirror: Arc<dyn MirrorStore>,
    store: Arc<dyn LocalStore>,
    incremental: Arc<IncrementalSyncManager>,
    device_id: String,
    collections: Vec<String>,
    state: Mutex<MirrorState>,
}

impl RemoteMirrorSync {
    pub fn new(
        mirror: Arc<dyn MirrorStore>,
        store: Arc<dyn LocalStore>,
        incremental: Arc<IncrementalSyncManager>,
        device_id: impl Into<String>,
    ) -> Self {
        let collections = incremental
            .collections()
            .iter()
            .filter(|name| !record::is_internal_collection(name))
            .cloned()
            .collect();
        Self {
            mirror,
            store,
            incremental,
            device_id: device_id.into(),
            collections,
            state: Mutex::new(MirrorState::default()),
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Mirror change notifications.
    pub fn changes(&self) -> broadcast::Receiver<MirrorChange> {
        self.mirror.subscribe()
    }

    /// Publish the local dataset. Returns the number of records written.
    pub async fn push(&self) -> Result<usize> {
        let result = self.push_inner().await;
        self.record_outcome(&result).await;
        result
    }

    /// Merge the mirror's snapshot if another device published a newer one.
    pub async fn pull(&self) -> Result<Option<ApplyReport>> {
        let result = self.pull_inner().await;
        self.record_outcome(&result).await;
        result
    }

    /// Pull then push. Reports `enabled: false` instead of failing when the
    /// mirror is unavailable.
    pub async fn sync(&self) -> Result<MirrorSyncReport> {
        if !self.mirror.is_available().await {
            tracing::debug!("Remote mirror unavailable; skipping");
            return Ok(MirrorSyncReport::default());
        }

        let pulled = self.pull().await?;
        let pushed = self.push().await?;
        Ok(MirrorSyncReport {
            enabled: true,
            pushed,
            pulled,
        })
    }

    /// Remove the synced copy from the mirror and forget what was exchanged.
    pub async fn clear(&self) -> Result<()> {
        self.store.clear(MIRROR_COLLECTION).await?;
        *self.state.lock().await = MirrorState::default();
        if !self.mirror.is_available().await {
            return Ok(());
        }
        self.mirror.clear().await?;
        tracing::info!("Remote mirror cleared");
        Ok(())
    }

    pub async fn status(&self) -> MirrorStatus {
        let enabled = self.mirror.is_available().await;
        let state = self.state.lock().await;
        MirrorStatus {
            enabled,
            device_id: self.device_id.clone(),
            last_push: state.last_push,
            last_pull: state.last_pull,
            last_remote_snapshot: state.last_remote_snapshot,
            last_source_device: state.last_source_device.clone(),
            last_error: state.last_error.clone(),
        }
    }

    async fn push_inner(&self) -> Result<usize> {
        if !self.mirror.is_available().await {
            return Err(SyncError::MirrorUnavailable);
        }

        let mut collections = BTreeMap::new();
        let mut deleted = BTreeMap::new();
        let mut exchanged = Vec::with_capacity(self.collections.len());
        for name in &self.collections {
            let records = self.store.get_all(name).await?;
            let present = ids_of(&records);
            let gone: Vec<RecordId> = self
                .load_exchanged(name)
                .await?
                .difference(&present)
                .cloned()
                .collect();
            if !gone.is_empty() {
                deleted.insert(name.clone(), gone);
            }
            collections.insert(name.clone(), records);
            exchanged.push((name, present));
        }

        let now = now_millis();
        let snapshot = MirrorSnapshot::new(self.device_id.clone(), now, collections, deleted)?;
        let count = snapshot.record_count();
        self.mirror
            .set(SNAPSHOT_KEY, serde_json::to_value(&snapshot)?)
            .await?;

        for (name, ids) in exchanged {
            self.save_exchanged(name, ids).await?;
        }

        self.state.lock().await.last_push = Some(now);
        tracing::info!(
            records = count,
            tombstones = snapshot.tombstone_count(),
            "Pushed snapshot to remote mirror"
        );
        Ok(count)
    }

    async fn pull_inner(&self) -> Result<Option<ApplyReport>> {
        if !self.mirror.is_available().await {
            return Err(SyncError::MirrorUnavailable);
        }

        let Some(value) = self.mirror.get(SNAPSHOT_KEY).await? else {
            tracing::debug!("Remote mirror is empty");
            return Ok(None);
        };
        let snapshot: MirrorSnapshot = serde_json::from_value(value)?;

        if snapshot.device_id == self.device_id {
            return Ok(None);
        }
        {
            let state = self.state.lock().await;
            let seen = state.last_remote_snapshot.unwrap_or(0);
            let same = state.last_remote_checksum.as_deref() == Some(snapshot.checksum.as_str());
            if state.last_remote_snapshot.is_some()
                && (snapshot.timestamp < seen || (snapshot.timestamp == seen && same))
            {
                return Ok(None);
            }
        }
        snapshot.verify()?;

        let names: BTreeSet<&String> = snapshot
            .collections
            .keys()
            .chain(snapshot.deleted.keys())
            .collect();

        let mut report = ApplyReport::default();
        for name in names {
            if record::is_internal_collection(name) || !self.collections.contains(name) {
                tracing::debug!(collection = %name, "Ignoring unsynced collection in snapshot");
                continue;
            }
            report.absorb(self.merge_collection(name, &snapshot).await?);
        }

        let mut state = self.state.lock().await;
        state.last_pull = Some(now_millis());
        state.last_remote_snapshot = Some(snapshot.timestamp);
        state.last_remote_checksum = Some(snapshot.checksum.clone());
        state.last_source_device = Some(snapshot.device_id.clone());
        drop(state);

        tracing::info!(
            source = %snapshot.device_id,
            applied = report.applied,
            skipped = report.skipped,
            failed = report.failed,
            "Pulled snapshot from remote mirror"
        );
        Ok(Some(report))
    }

    /// Merge one collection of a foreign snapshot.
    ///
    /// Records this device deleted since its last push are withheld and
    /// counted as skipped. Tombstones become deletes.
    async fn merge_collection(&self, name: &str, snapshot: &MirrorSnapshot) -> Result<ApplyReport> {
        let mut exchanged = self.load_exchanged(name).await?;
        let local = ids_of(&self.store.get_all(name).await?);
        let deleted_here: BTreeSet<RecordId> = exchanged.difference(&local).cloned().collect();

        let records = snapshot.collections.get(name).map(Vec::as_slice).unwrap_or(&[]);
        let (withheld, incoming): (Vec<&Value>, Vec<&Value>) = records
            .iter()
            .partition(|r| record::record_id(r).is_some_and(|id| deleted_here.contains(id)));
        let tombstones = snapshot.deleted.get(name).cloned().unwrap_or_default();

        let mut changes = IncrementalChanges::empty(SyncCheckpoint::initial(name));
        changes.created = incoming.into_iter().cloned().collect();
        changes.deleted = tombstones.clone();

        let mut report = self.incremental.apply_incremental_changes(&changes).await?;
        report.skipped += withheld.len();
        if !withheld.is_empty() {
            tracing::debug!(
                collection = %name,
                withheld = withheld.len(),
                "Withheld records deleted locally"
            );
        }

        let present = ids_of(&self.store.get_all(name).await?);
        exchanged.extend(
            ids_of(&changes.created)
                .into_iter()
                .filter(|id| present.contains(id)),
        );
        for id in &tombstones {
            exchanged.remove(id);
        }
        self.save_exchanged(name, exchanged).await?;

        Ok(report)
    }

    async fn load_exchanged(&self, collection: &str) -> Result<BTreeSet<RecordId>> {
        let entry: Option<ExchangedIds> =
            store::get_typed(self.store.as_ref(), MIRROR_COLLECTION, collection).await?;
        Ok(entry.map(|e| e.ids).unwrap_or_default())
    }

    async fn save_exchanged(&self, collection: &str, ids: BTreeSet<RecordId>) -> Result<()> {
        store::put_typed(
            self.store.as_ref(),
            MIRROR_COLLECTION,
            collection,
            &ExchangedIds { ids },
        )
        .await
    }

    async fn record_outcome<T>(&self, result: &Result<T>) {
        let mut state = self.state.lock().await;
        match result {
            Ok(_) => state.last_error = None,
            Err(e) => {
                tracing::warn!(error = %e, "Remote mirror sync failed");
                state.last_error = Some(e.to_string());
            }
        }
    }
}
