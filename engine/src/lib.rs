//! # Tether Engine
//!
//! The deterministic core of an offline-first sync client.
//!
//! This crate holds every decision the sync client makes that does not
//! require IO: which fields of two record versions conflict and how they
//! merge, in which order queued mutations drain, what changed in a
//! collection since its last checkpoint, and how backups are framed and
//! checksummed. The same inputs always produce the same outputs.
//!
//! ## Design Principles
//!
//! - **No IO**: stores, networks and clocks belong to the caller
//! - **Explicit time**: every timestamp is passed in (milliseconds since epoch)
//! - **Testable**: pure logic, no mocks needed
//!
//! ## Core Concepts
//!
//! ### Records
//!
//! Records are JSON objects identified by their `id` field and stamped with
//! an `updatedAt` modification marker. Fields starting with `_` are internal
//! metadata. Neither the identity, the marker nor internal fields take part
//! in conflict detection. See [`record`].
//!
//! ### Conflicts
//!
//! The [`ConflictResolver`] compares two versions of a record field by field
//! and registers a [`SyncConflict`] for each divergence. Conflicts are
//! resolved explicitly ([`Resolution`]) or by policy ([`ConflictStrategy`]).
//!
//! ### Offline queue
//!
//! [`QueuedOperation`]s drain by priority, then age. Dependencies gate
//! eligibility within a pass ([`DrainPass`]) and a [`RetryPolicy`] decides
//! when failures may run again.
//!
//! ### Checkpoints
//!
//! A [`SyncCheckpoint`] per collection lets [`compute_changes`] report only
//! the records created, updated or deleted since the last sync.
//!
//! ## Quick Start
//!
//! ```rust
//! use tether_engine::{ConflictResolver, ConflictStrategy, Resolution};
//! use serde_json::json;
//!
//! let mut resolver = ConflictResolver::new(ConflictStrategy::SmartMerge);
//!
//! let local = json!({"id": "m-1", "title": "Standup", "tags": ["daily"]});
//! let remote = json!({"id": "m-1", "title": "Standup", "tags": ["team"]});
//!
//! let conflicts = resolver.detect_conflicts(&local, &remote, "meetings:m-1", 1706745600000);
//! assert_eq!(conflicts.len(), 1);
//!
//! let merged = resolver
//!     .resolve_conflict(&conflicts[0].id, Resolution::Merge, 1706745601000)
//!     .unwrap();
//! assert_eq!(merged, Some(json!(["daily", "team"])));
//! ```
//!
//! ## Backups
//!
//! [`BackupDocument`] is the on-disk backup format: a `metadata` header and
//! a `data` body keyed by collection, with a SHA-256 checksum of the body.

pub mod backup;
pub mod checkpoint;
pub mod conflict;
pub mod error;
pub mod integrity;
pub mod queue;
pub mod record;

// Re-export main types at crate root
pub use backup::{BackupDocument, BackupHeader, BackupMetadata, BACKUP_FORMAT_VERSION};
pub use checkpoint::{compute_changes, ApplyReport, IncrementalChanges, SyncCheckpoint};
pub use conflict::{
    deep_equal, merge_values, ConflictResolver, ConflictStats, ConflictStrategy, DeepEquality,
    FieldComparator, Resolution, Side, SyncConflict,
};
pub use error::Error;
pub use queue::{
    order_for_drain, DrainPass, DrainReport, EnqueueOptions, ExponentialBackoff, FlatRetry,
    OperationKind, Priority, QueueItemStatus, QueuedOperation, RetryPolicy,
};
pub use record::IndexRange;

/// Type aliases for clarity
pub type RecordId = String;
pub type CollectionName = String;
pub type OperationId = String;
pub type ConflictId = String;
pub type Timestamp = u64;
