//! Offline operation queue model.
//!
//! Mutations made while offline are captured as [`QueuedOperation`]s and
//! drained later. This module holds the pure parts of draining: the drain
//! order, dependency eligibility within one pass, retry accounting, and the
//! [`RetryPolicy`] seam. Persistence and execution live with the caller.

use crate::{record, CollectionName, OperationId, Timestamp};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

/// Default retry budget for a queued operation.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// The kind of mutation an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Update,
    Delete,
}

/// Drain priority. Higher priorities drain first.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
}

/// Lifecycle of a queued operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueItemStatus {
    /// Waiting for a drain pass
    #[default]
    Pending,
    /// Retry budget exhausted; excluded from draining
    Failed,
}

/// Options accepted when enqueueing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOptions {
    pub priority: Priority,
    pub depends_on: BTreeSet<OperationId>,
    pub max_retries: u32,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            priority: Priority::default(),
            depends_on: BTreeSet::new(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl EnqueueOptions {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn depends_on(mut self, id: impl Into<OperationId>) -> Self {
        self.depends_on.insert(id.into());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// A pending mutation waiting to be executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedOperation {
    pub id: OperationId,
    pub kind: OperationKind,
    pub collection: CollectionName,
    pub payload: serde_json::Value,
    pub enqueued_at: Timestamp,
    pub retry_count: u32,
    pub max_retries: u32,
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: BTreeSet<OperationId>,
    #[serde(default)]
    pub status: QueueItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempt_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl QueuedOperation {
    /// Create a new pending operation. A retry budget of zero is raised to one.
    pub fn new(
        id: impl Into<OperationId>,
        kind: OperationKind,
        collection: impl Into<CollectionName>,
        payload: serde_json::Value,
        enqueued_at: Timestamp,
        options: EnqueueOptions,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            collection: collection.into(),
            payload,
            enqueued_at,
            retry_count: 0,
            max_retries: options.max_retries.max(1),
            priority: options.priority,
            depends_on: options.depends_on,
            status: QueueItemStatus::Pending,
            last_attempt_at: None,
            last_error: None,
        }
    }

    /// The record this operation targets, if the payload names one.
    pub fn record_id(&self) -> Option<&str> {
        record::record_id(&self.payload)
    }

    /// Whether the operation has exhausted its retry budget.
    pub fn is_terminal(&self) -> bool {
        self.status == QueueItemStatus::Failed || self.retry_count >= self.max_retries
    }

    /// Account for a failed attempt.
    ///
    /// Returns `true` when this failure made the operation terminal.
    pub fn record_failure(&mut self, error: impl Into<String>, now: Timestamp) -> bool {
        self.retry_count = (self.retry_count + 1).min(self.max_retries);
        self.last_attempt_at = Some(now);
        self.last_error = Some(error.into());
        if self.retry_count >= self.max_retries {
            self.status = QueueItemStatus::Failed;
            true
        } else {
            false
        }
    }

    /// Make a terminal operation retryable again.
    pub fn reset(&mut self) {
        self.retry_count = 0;
        self.status = QueueItemStatus::Pending;
        self.last_error = None;
    }
}

/// Drain order: priority descending, then oldest first, then id.
pub fn drain_order(a: &QueuedOperation, b: &QueuedOperation) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.enqueued_at.cmp(&b.enqueued_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Select the non-terminal operations and sort them for draining.
pub fn order_for_drain(operations: Vec<QueuedOperation>) -> Vec<QueuedOperation> {
    let mut pending: Vec<_> = operations
        .into_iter()
        .filter(|op| !op.is_terminal())
        .collect();
    pending.sort_by(drain_order);
    pending
}

/// Tracks dependency satisfaction during one drain pass.
///
/// A dependency is satisfied when it is absent from the snapshot the pass
/// started with, or when it completed earlier in the same pass.
#[derive(Debug, Clone, Default)]
pub struct DrainPass {
    queued: HashSet<OperationId>,
    completed: HashSet<OperationId>,
}

impl DrainPass {
    pub fn new<'a>(snapshot: impl IntoIterator<Item = &'a QueuedOperation>) -> Self {
        Self {
            queued: snapshot.into_iter().map(|op| op.id.clone()).collect(),
            completed: HashSet::new(),
        }
    }

    pub fn is_eligible(&self, op: &QueuedOperation) -> bool {
        op.depends_on
            .iter()
            .all(|dep| !self.queued.contains(dep) || self.completed.contains(dep))
    }

    pub fn mark_completed(&mut self, id: impl Into<OperationId>) {
        self.completed.insert(id.into());
    }
}

/// Counters returned by a drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub processed: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Decides when a previously failed operation may run again.
///
/// Only the timing of retries is delegated; the retry budget and drain
/// order stay with the queue.
pub trait RetryPolicy: Send + Sync {
    fn is_due(&self, op: &QueuedOperation, now: Timestamp) -> bool;
}

/// Retry on the very next drain pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlatRetry;

impl RetryPolicy for FlatRetry {
    fn is_due(&self, _op: &QueuedOperation, _now: Timestamp) -> bool {
        true
    }
}

/// Wait `base * 2^(retries - 1)` after a failure, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    pub base_ms: u64,
    pub max_ms: u64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_ms: 1_000,
            max_ms: 5 * 60 * 1_000,
        }
    }
}

impl ExponentialBackoff {
    pub fn delay_for(&self, retry_count: u32) -> u64 {
        if retry_count == 0 {
            return 0;
        }
        let exponent = (retry_count - 1).min(32);
        self.base_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_ms)
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn is_due(&self, op: &QueuedOperation, now: Timestamp) -> bool {
        match op.last_attempt_at {
            Some(last) if op.retry_count > 0 => {
                now >= last.saturating_add(self.delay_for(op.retry_count))
            }
            _ => true,
        }
    }
}
