//! Tether client - offline-first sync services for a single device.
//!
//! The services here wrap the pure `tether-engine` logic with storage,
//! scheduling and notifications:
//!
//! - [`OfflineQueue`]: durable queue of local mutations, drained when online
//! - [`IncrementalSyncManager`]: per-collection checkpoints and delta apply
//! - [`RemoteMirrorSync`]: snapshot push/pull against a [`MirrorStore`]
//! - [`BackupManager`]: export, verify and restore of the local dataset
//! - [`SyncOrchestrator`]: runs full sync cycles and aggregates status
//!
//! Every service is constructed explicitly and shared through `Arc`. The
//! host owns one set per device session and calls
//! [`SyncOrchestrator::shutdown`] to stop background timers.

pub mod backup;
pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod executor;
pub mod incremental;
pub mod mirror;
pub mod orchestrator;
pub mod queue;
pub mod store;

pub use backup::{
    BackupArtifact, BackupManager, BackupOptions, BackupStats, RestoreOptions, RestoreReport,
};
pub use config::{ConfigError, SyncConfig};
pub use db::SqliteStore;
pub use error::{Result, SyncError};
pub use events::{SubscriberRegistry, Subscription};
pub use executor::{OperationExecutor, StoreExecutor};
pub use incremental::{
    CollectionState, CollectionSyncStatus, IncrementalSyncManager, IncrementalSyncStatus,
};
pub use mirror::{
    MemoryMirror, MirrorChange, MirrorSnapshot, MirrorStatus, MirrorStore, MirrorSyncReport,
    RemoteMirrorSync,
};
pub use orchestrator::{
    OrchestratorOptions, ResetReport, StepError, SyncAllResult, SyncOrchestrator, SyncStatus,
    SyncStep,
};
pub use queue::{OfflineQueue, OfflineStatus, QueueOptions, SubmitOutcome};
pub use store::{LocalStore, MemoryStore};

use tether_engine::Timestamp;

/// Current wall-clock time in milliseconds since the Unix epoch.
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis().max(0) as Timestamp
}
