//! Per-collection sync checkpoints and incremental change sets.
//!
//! A checkpoint remembers when a collection was last synchronized and which
//! record ids existed at that point. Comparing the current records against
//! it yields the created/updated/deleted partition that has to travel.

use crate::{error::Result, integrity, record, CollectionName, RecordId, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;

/// Marker of the last synchronized state of one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCheckpoint {
    pub collection: CollectionName,
    /// Milliseconds since epoch; never moves backwards
    pub last_sync_timestamp: Timestamp,
    pub last_sync_version: u64,
    pub record_count: usize,
    pub checksum: String,
    /// Ids present when the checkpoint was taken
    #[serde(default)]
    pub known_ids: BTreeSet<RecordId>,
}

impl SyncCheckpoint {
    /// A checkpoint that covers nothing.
    pub fn initial(collection: impl Into<CollectionName>) -> Self {
        Self {
            collection: collection.into(),
            last_sync_timestamp: 0,
            last_sync_version: 0,
            record_count: 0,
            checksum: integrity::checksum_bytes(b""),
            known_ids: BTreeSet::new(),
        }
    }

    /// The checkpoint that would describe `records` as synchronized at `now`.
    pub fn advance(&self, records: &[Value], now: Timestamp) -> Result<Self> {
        let known_ids: BTreeSet<RecordId> = records
            .iter()
            .filter_map(record::record_id)
            .map(str::to_string)
            .collect();

        Ok(Self {
            collection: self.collection.clone(),
            last_sync_timestamp: self.last_sync_timestamp.max(now),
            last_sync_version: self.last_sync_version + 1,
            record_count: known_ids.len(),
            checksum: integrity::checksum_records(records)?,
            known_ids,
        })
    }

    pub fn covers(&self, id: &str) -> bool {
        self.known_ids.contains(id)
    }
}

/// The delta of one collection relative to its checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncrementalChanges {
    pub collection: CollectionName,
    pub created: Vec<Value>,
    pub updated: Vec<Value>,
    pub deleted: Vec<RecordId>,
    /// The checkpoint that committing this delta produces
    pub checkpoint: SyncCheckpoint,
}

impl IncrementalChanges {
    /// An empty change set for a collection.
    pub fn empty(checkpoint: SyncCheckpoint) -> Self {
        Self {
            collection: checkpoint.collection.clone(),
            created: Vec::new(),
            updated: Vec::new(),
            deleted: Vec::new(),
            checkpoint,
        }
    }

    pub fn total(&self) -> usize {
        self.created.len() + self.updated.len() + self.deleted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

/// Partition `records` against `checkpoint`.
///
/// - `created`: ids the checkpoint does not cover (all of them without a checkpoint)
/// - `updated`: covered ids whose modification marker is newer than the checkpoint
/// - `deleted`: covered ids no longer present
///
/// Records without an id cannot be tracked and are ignored. Output is
/// ordered by id.
pub fn compute_changes(
    collection: &str,
    records: &[Value],
    checkpoint: Option<&SyncCheckpoint>,
    now: Timestamp,
) -> Result<IncrementalChanges> {
    let base = checkpoint
        .cloned()
        .unwrap_or_else(|| SyncCheckpoint::initial(collection));

    let mut tracked: Vec<&Value> = records
        .iter()
        .filter(|r| record::record_id(r).is_some())
        .collect();
    tracked.sort_by(|a, b| record::record_id(a).cmp(&record::record_id(b)));

    let mut created = Vec::new();
    let mut updated = Vec::new();
    let mut present: BTreeSet<&str> = BTreeSet::new();

    for item in tracked {
        let Some(id) = record::record_id(item) else {
            continue;
        };
        present.insert(id);

        match checkpoint {
            Some(cp) if cp.covers(id) => {
                if record::modified_at(item).is_some_and(|ts| ts > cp.last_sync_timestamp) {
                    updated.push(item.clone());
                }
            }
            _ => created.push(item.clone()),
        }
    }

    let deleted: Vec<RecordId> = checkpoint
        .map(|cp| {
            cp.known_ids
                .iter()
                .filter(|id| !present.contains(id.as_str()))
                .cloned()
                .collect()
        })
        .unwrap_or_default();

    Ok(IncrementalChanges {
        collection: collection.to_string(),
        created,
        updated,
        deleted,
        checkpoint: base.advance(records, now)?,
    })
}

/// Outcome of applying a change set.
///
/// `applied + failed + skipped` always equals the size of the change set.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReport {
    pub applied: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl ApplyReport {
    pub fn total(&self) -> usize {
        self.applied + self.failed + self.skipped
    }

    pub fn absorb(&mut self, other: ApplyReport) {
        self.applied += other.applied;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}
